use std::sync::LazyLock;

use regex::{Captures, Regex};

/// Elements removed together with everything between their tags.
const BLOCKED_ELEMENTS: [&str; 5] = ["script", "style", "iframe", "object", "embed"];

/// Per-element patterns: full element, then any stray open or close tag left behind.
/// The regex crate has no backreferences, so each tag gets its own pair.
static ELEMENT_PATTERNS: LazyLock<Vec<(Regex, Regex)>> = LazyLock::new(|| {
    BLOCKED_ELEMENTS
        .iter()
        .map(|tag| {
            let element = Regex::new(&format!(r"(?is)<{tag}\b[^>]*>.*?</{tag}\s*>")).unwrap();
            let stray = Regex::new(&format!(r"(?i)</?{tag}\b[^>]*>")).unwrap();
            (element, stray)
        })
        .collect()
});

static STYLESHEET_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<link\b[^>]*\bstylesheet\b[^>]*>").unwrap());

/// Any `>` inside a quoted attribute value belongs to the tag.
pub(super) const OPEN_TAG_PATTERN: &str = r#"<[A-Za-z](?:"[^"]*"|'[^']*'|[^>])*>"#;

static OPEN_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(OPEN_TAG_PATTERN).unwrap());

/// Browsers accept `/` as well as whitespace before an attribute name.
static EVENT_HANDLER_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)[\s/]+on[a-z]+\s*=\s*(?:"[^"]*"|'[^']*'|[^\s>]+)"#).unwrap()
});

/// Openers that survived every removal pass are escaped so they render as text.
static BLOCKED_OPENER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<(/?(?:script|style|iframe|object|embed)\b)").unwrap());

const MAX_REMOVAL_PASSES: usize = 8;

static JAVASCRIPT_URI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)javascript\s*:").unwrap());

/// Drop embedded/executable content and neutralize script entry points.
pub(super) fn strip_active_content(input: &str) -> String {
    let mut out = input.to_string();
    // Removing a tag can join its neighbours into a new one, so repeat until stable.
    for _ in 0..MAX_REMOVAL_PASSES {
        let before = out.len();
        for (element, stray) in ELEMENT_PATTERNS.iter() {
            out = element.replace_all(&out, "").into_owned();
            out = stray.replace_all(&out, "").into_owned();
        }
        if out.len() == before {
            break;
        }
    }
    let out = BLOCKED_OPENER.replace_all(&out, "&lt;$1");
    let out = STYLESHEET_LINK.replace_all(&out, "");
    let out = OPEN_TAG.replace_all(&out, |caps: &Captures| {
        EVENT_HANDLER_ATTR.replace_all(&caps[0], "").into_owned()
    });
    JAVASCRIPT_URI.replace_all(&out, "blocked:").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removes_blocked_elements_with_content() {
        let input = "a<style>p{color:red}</style>b<iframe src=\"x\">inner</iframe>c\
                     <object data=\"y\"><param></object>d<SCRIPT type=\"text/javascript\">\nalert(1)\n</SCRIPT>e";
        assert_eq!(strip_active_content(input), "abcde");
    }

    #[test]
    fn removes_unclosed_and_self_closing_tags() {
        assert_eq!(strip_active_content(r#"x<embed src="a.swf"/>y<script src="evil.js">"#), "xy");
    }

    #[test]
    fn removes_stylesheet_links_only() {
        let input = r#"<link rel="stylesheet" href="https://cdn/x.css"><link rel="icon" href="a.ico">ok"#;
        assert_eq!(strip_active_content(input), r#"<link rel="icon" href="a.ico">ok"#);
    }

    #[test]
    fn strips_event_handlers_inside_tags() {
        assert_eq!(
            strip_active_content(r#"<img src="a.png" onerror="steal()" ONLOAD='x()' onclick=go>"#),
            r#"<img src="a.png">"#
        );
    }

    #[test]
    fn nested_fragments_cannot_rebuild_a_script() {
        assert_eq!(strip_active_content("<scr<script>ipt>alert(1)</scr<script>ipt>"), "");
        let out = strip_active_content("<sc<scr<script>ipt>ript>x");
        assert!(!out.to_ascii_lowercase().contains("<script"), "got: {out}");
    }

    #[test]
    fn leftover_openers_are_escaped() {
        assert_eq!(strip_active_content("text <script src=x"), "text &lt;script src=x");
        assert_eq!(strip_active_content("a </IFRAME b"), "a &lt;/IFRAME b");
    }

    #[test]
    fn slash_separated_handlers_are_stripped() {
        assert_eq!(strip_active_content("<svg/onload=alert(1)>"), "<svg>");
    }

    #[test]
    fn quoted_angle_bracket_does_not_end_the_tag() {
        assert_eq!(
            strip_active_content(r#"<img alt=">" onerror="alert(1)" src=x>"#),
            r#"<img alt=">" src=x>"#
        );
    }

    #[test]
    fn leaves_prose_that_looks_like_handlers() {
        let text = "turn onload = fast when ready";
        assert_eq!(strip_active_content(text), text);
    }

    #[test]
    fn neutralizes_javascript_uris() {
        let out = strip_active_content(r#"<a href="JavaScript :alert(1)">x</a>"#);
        assert_eq!(out, r#"<a href="blocked:alert(1)">x</a>"#);
    }

    #[test]
    fn script_like_names_are_not_blocked() {
        let text = "<scripture>verse</scripture>";
        assert_eq!(strip_active_content(text), text);
    }
}
