//! Best-effort readability repair for inline colors.
//!
//! Luminance is the plain mean of the RGB channels. This is deliberately not a
//! WCAG computation; when in doubt the foreground is forced.

use std::sync::LazyLock;

use regex::{Captures, Regex};

pub(super) const DARK_TEXT: &str = "#1a1a1a";
pub(super) const LIGHT_TEXT: &str = "#f5f5f5";

const DARK_BELOW: f32 = 0.4;

static STYLE_ATTR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)\bstyle\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap());

static COLOR_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)#[0-9a-f]{3,8}\b|rgba?\([^)]*\)|[a-z]+").unwrap());

static OPEN_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(super::markup::OPEN_TAG_PATTERN).unwrap());

static LEGACY_COLOR_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(bgcolor|color)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>"']+))"#).unwrap()
});

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Tone {
    Light,
    Dark,
}

/// Literals known to produce unreadable text, matched verbatim on legacy
/// `bgcolor`/`color` attributes.
const LOW_CONTRAST_LITERALS: &[(&str, Tone)] = &[
    ("white", Tone::Light),
    ("#fff", Tone::Light),
    ("#ffffff", Tone::Light),
    ("#fefefe", Tone::Light),
    ("#fafafa", Tone::Light),
    ("#f5f5f5", Tone::Light),
    ("#eee", Tone::Light),
    ("#eeeeee", Tone::Light),
    ("snow", Tone::Light),
    ("ivory", Tone::Light),
    ("whitesmoke", Tone::Light),
    ("ghostwhite", Tone::Light),
    ("lightyellow", Tone::Light),
    ("black", Tone::Dark),
    ("#000", Tone::Dark),
    ("#000000", Tone::Dark),
    ("#111", Tone::Dark),
    ("#111111", Tone::Dark),
    ("#222", Tone::Dark),
    ("#222222", Tone::Dark),
    ("#333", Tone::Dark),
    ("#333333", Tone::Dark),
];

const NAMED_COLORS: &[(&str, (u8, u8, u8))] = &[
    ("black", (0, 0, 0)),
    ("white", (255, 255, 255)),
    ("red", (255, 0, 0)),
    ("green", (0, 128, 0)),
    ("lime", (0, 255, 0)),
    ("blue", (0, 0, 255)),
    ("yellow", (255, 255, 0)),
    ("cyan", (0, 255, 255)),
    ("aqua", (0, 255, 255)),
    ("magenta", (255, 0, 255)),
    ("fuchsia", (255, 0, 255)),
    ("gray", (128, 128, 128)),
    ("grey", (128, 128, 128)),
    ("silver", (192, 192, 192)),
    ("maroon", (128, 0, 0)),
    ("olive", (128, 128, 0)),
    ("navy", (0, 0, 128)),
    ("purple", (128, 0, 128)),
    ("teal", (0, 128, 128)),
    ("orange", (255, 165, 0)),
    ("pink", (255, 192, 203)),
    ("brown", (165, 42, 42)),
    ("gold", (255, 215, 0)),
    ("beige", (245, 245, 220)),
    ("ivory", (255, 255, 240)),
    ("snow", (255, 250, 250)),
    ("linen", (250, 240, 230)),
    ("azure", (240, 255, 255)),
    ("lavender", (230, 230, 250)),
    ("honeydew", (240, 255, 240)),
    ("mintcream", (245, 255, 250)),
    ("aliceblue", (240, 248, 255)),
    ("ghostwhite", (248, 248, 255)),
    ("whitesmoke", (245, 245, 245)),
    ("lightyellow", (255, 255, 224)),
    ("lightgray", (211, 211, 211)),
    ("lightgrey", (211, 211, 211)),
    ("gainsboro", (220, 220, 220)),
    ("darkgray", (169, 169, 169)),
    ("darkgrey", (169, 169, 169)),
    ("dimgray", (105, 105, 105)),
    ("dimgrey", (105, 105, 105)),
    ("darkslategray", (47, 79, 79)),
    ("darkblue", (0, 0, 139)),
    ("darkgreen", (0, 100, 0)),
    ("darkred", (139, 0, 0)),
    ("midnightblue", (25, 25, 112)),
    ("indigo", (75, 0, 130)),
];

pub(super) fn repair(input: &str) -> String {
    let out = STYLE_ATTR.replace_all(input, |caps: &Captures| {
        let whole = &caps[0];
        let Some(inner) = caps.get(1).or_else(|| caps.get(2)) else {
            return whole.to_string();
        };
        let Some(rewritten) = repair_declarations(inner.as_str()) else {
            return whole.to_string();
        };
        let offset = caps.get(0).map_or(0, |m| m.start());
        let (start, end) = (inner.start() - offset, inner.end() - offset);
        format!("{}{}{}", &whole[..start], rewritten, &whole[end..])
    });
    OPEN_TAG
        .replace_all(&out, |caps: &Captures| repair_legacy_attrs(&caps[0]))
        .into_owned()
}

/// Returns rewritten declarations, or `None` when the pair is readable.
fn repair_declarations(decls: &str) -> Option<String> {
    let mut background = None;
    let mut foreground = None;
    for decl in decls.split(';') {
        let Some((prop, value)) = decl.split_once(':') else {
            continue;
        };
        match prop.trim().to_ascii_lowercase().as_str() {
            "background" | "background-color" => background = first_color(value).map(luminance),
            "color" => foreground = first_color(value).map(luminance),
            _ => {}
        }
    }

    let forced = decide(tone_of(background?), foreground.map(tone_of))?;
    let mut replaced = false;
    let mut parts: Vec<String> = decls
        .split(';')
        .map(|decl| match decl.split_once(':') {
            Some((prop, _)) if prop.trim().eq_ignore_ascii_case("color") => {
                replaced = true;
                format!("{prop}:{forced}")
            }
            _ => decl.to_string(),
        })
        .collect();
    if !replaced {
        if parts.last().is_some_and(|p| p.trim().is_empty()) {
            parts.pop();
        }
        parts.push(format!("color:{forced}"));
    }
    Some(parts.join(";"))
}

fn repair_legacy_attrs(tag: &str) -> String {
    let mut background = None;
    let mut foreground = None;
    let mut color_value = None;
    for caps in LEGACY_COLOR_ATTR.captures_iter(tag) {
        let Some(value) = caps.get(2).or_else(|| caps.get(3)).or_else(|| caps.get(4)) else {
            continue;
        };
        let tone = known_literal(value.as_str());
        if caps[1].eq_ignore_ascii_case("bgcolor") {
            background = tone;
        } else {
            foreground = tone;
            color_value = Some(value.range());
        }
    }

    let Some(forced) = background.and_then(|bg| decide(bg, foreground)) else {
        return tag.to_string();
    };
    match color_value {
        Some(range) => format!("{}{}{}", &tag[..range.start], forced, &tag[range.end..]),
        None if !STYLE_ATTR.is_match(tag) => {
            let at = if tag.ends_with("/>") { tag.len() - 2 } else { tag.len() - 1 };
            format!("{} style=\"color:{forced}\"{}", tag[..at].trim_end(), &tag[at..])
        }
        None => tag.to_string(),
    }
}

/// Light backgrounds get dark text unless the text is already dark;
/// dark backgrounds get light text only when the text is dark too.
fn decide(background: Tone, foreground: Option<Tone>) -> Option<&'static str> {
    match (background, foreground) {
        (Tone::Light, None | Some(Tone::Light)) => Some(DARK_TEXT),
        (Tone::Dark, Some(Tone::Dark)) => Some(LIGHT_TEXT),
        _ => None,
    }
}

/// Mid-range luminance counts as light so that pale-on-pale pairs are caught.
fn tone_of(luminance: f32) -> Tone {
    if luminance >= DARK_BELOW {
        Tone::Light
    } else {
        Tone::Dark
    }
}

fn known_literal(value: &str) -> Option<Tone> {
    let value = value.trim();
    LOW_CONTRAST_LITERALS
        .iter()
        .find(|(literal, _)| literal.eq_ignore_ascii_case(value))
        .map(|(_, tone)| *tone)
}

fn luminance((r, g, b): (u8, u8, u8)) -> f32 {
    (f32::from(r) + f32::from(g) + f32::from(b)) / 3.0 / 255.0
}

fn first_color(value: &str) -> Option<(u8, u8, u8)> {
    COLOR_TOKEN.find_iter(value).find_map(|m| parse_color(m.as_str()))
}

/// Parse hex, `rgb()`/`rgba()` and named colors. Fully transparent colors yield `None`.
fn parse_color(token: &str) -> Option<(u8, u8, u8)> {
    let token = token.trim().to_ascii_lowercase();
    if let Some(hex) = token.strip_prefix('#') {
        return parse_hex(hex);
    }
    if let Some(args) = token
        .strip_prefix("rgba(")
        .or_else(|| token.strip_prefix("rgb("))
        .and_then(|rest| rest.strip_suffix(')'))
    {
        return parse_rgb_args(args);
    }
    NAMED_COLORS
        .iter()
        .find(|(name, _)| *name == token)
        .map(|(_, rgb)| *rgb)
}

fn parse_hex(hex: &str) -> Option<(u8, u8, u8)> {
    let digits: Vec<u8> = hex
        .chars()
        .map(|c| c.to_digit(16).map(|d| d as u8))
        .collect::<Option<_>>()?;
    let (rgb, alpha) = match digits.len() {
        3 | 4 => {
            let expand = |d: u8| d * 17;
            (
                (expand(digits[0]), expand(digits[1]), expand(digits[2])),
                digits.get(3).map(|a| expand(*a)),
            )
        }
        6 | 8 => {
            let pair = |i: usize| digits[i] * 16 + digits[i + 1];
            ((pair(0), pair(2), pair(4)), (digits.len() == 8).then(|| pair(6)))
        }
        _ => return None,
    };
    if alpha == Some(0) {
        return None;
    }
    Some(rgb)
}

fn parse_rgb_args(args: &str) -> Option<(u8, u8, u8)> {
    let values: Vec<&str> = args
        .split(|c: char| c == ',' || c == '/' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .collect();
    if values.len() < 3 {
        return None;
    }
    let channel = |raw: &str| -> Option<u8> {
        let v = match raw.strip_suffix('%') {
            Some(pct) => pct.parse::<f32>().ok()? * 2.55,
            None => raw.parse::<f32>().ok()?,
        };
        Some(v.clamp(0.0, 255.0).round() as u8)
    };
    if let Some(alpha) = values.get(3) {
        let a = match alpha.strip_suffix('%') {
            Some(pct) => pct.parse::<f32>().ok()? / 100.0,
            None => alpha.parse::<f32>().ok()?,
        };
        if a <= 0.0 {
            return None;
        }
    }
    Some((channel(values[0])?, channel(values[1])?, channel(values[2])?))
}
