use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};
use tracing::warn;

use sidecar_core::{Addon, TriggerConfig, TriggerMode, TriggerType};

/// Add-ons split by trigger mode.
#[derive(Debug, Default, Clone)]
pub struct Classified {
    pub auto: Vec<Addon>,
    pub trigger: Vec<Addon>,
    pub manual: Vec<Addon>,
}

impl Classified {
    pub fn len(&self) -> usize {
        self.auto.len() + self.trigger.len() + self.manual.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Partition add-ons by trigger mode in one pass. Unrecognized modes land in `auto`.
pub fn classify(addons: &[Addon]) -> Classified {
    let mut out = Classified::default();
    for addon in addons {
        match addon.trigger_mode {
            TriggerMode::Trigger => out.trigger.push(addon.clone()),
            TriggerMode::Manual => out.manual.push(addon.clone()),
            TriggerMode::Auto | TriggerMode::Unknown => out.auto.push(addon.clone()),
        }
    }
    out
}

/// Whether `text` satisfies an add-on's trigger configuration.
///
/// Keywords are case-insensitive substrings. Regex patterns are compiled
/// case-insensitively after inline flags are stripped; patterns that fail to
/// compile are skipped.
pub fn matches(text: &str, config: Option<&TriggerConfig>) -> bool {
    let Some(config) = config else {
        return false;
    };
    if text.is_empty() || config.triggers.is_empty() {
        return false;
    }
    match config.trigger_type {
        TriggerType::Keyword => {
            let haystack = text.to_lowercase();
            config
                .triggers
                .iter()
                .map(|t| t.trim())
                .filter(|t| !t.is_empty())
                .any(|t| haystack.contains(&t.to_lowercase()))
        }
        TriggerType::Regex => config
            .triggers
            .iter()
            .filter_map(|pattern| compile(pattern))
            .any(|re| re.is_match(text)),
    }
}

static SLASH_DELIMITED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/(.*)/[gimsuyd]*$").unwrap());

static FLAG_GROUP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\(\?[a-zA-Z]+\)").unwrap());

/// Remove flag syntax that trigger authors sometimes embed: `/pattern/gi`
/// delimiters and bare flag groups such as `(?i)`. Scoped groups like
/// `(?i:...)` and `(?:...)` are left alone.
pub fn strip_inline_flags(pattern: &str) -> String {
    let trimmed = pattern.trim();
    let body = SLASH_DELIMITED
        .captures(trimmed)
        .and_then(|c| c.get(1))
        .map_or(trimmed, |m| m.as_str());
    FLAG_GROUP.replace_all(body, "").into_owned()
}

fn compile(pattern: &str) -> Option<Regex> {
    let stripped = strip_inline_flags(pattern);
    if stripped.is_empty() {
        return None;
    }
    match RegexBuilder::new(&stripped).case_insensitive(true).build() {
        Ok(re) => Some(re),
        Err(e) => {
            warn!(pattern, error = %e, "skipping trigger pattern that does not compile");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyword(triggers: &[&str]) -> TriggerConfig {
        TriggerConfig {
            trigger_type: TriggerType::Keyword,
            triggers: triggers.iter().map(|t| (*t).to_string()).collect(),
        }
    }

    fn regex(triggers: &[&str]) -> TriggerConfig {
        TriggerConfig {
            trigger_type: TriggerType::Regex,
            triggers: triggers.iter().map(|t| (*t).to_string()).collect(),
        }
    }

    #[test]
    fn classify_partitions_every_addon() {
        let addons = vec![
            Addon::new("a", "A"),
            Addon::new("t", "T").with_trigger(TriggerType::Keyword, &["x"]),
            Addon::new("m", "M").with_mode(TriggerMode::Manual),
            Addon::new("u", "U").with_mode(TriggerMode::Unknown),
            Addon::new("d", "D").disabled(),
        ];
        let out = classify(&addons);
        assert_eq!(out.len(), addons.len());
        let ids = |v: &[Addon]| v.iter().map(|a| a.id.to_string()).collect::<Vec<_>>();
        assert_eq!(ids(&out.auto), vec!["a", "u", "d"]);
        assert_eq!(ids(&out.trigger), vec!["t"]);
        assert_eq!(ids(&out.manual), vec!["m"]);
    }

    #[test]
    fn classify_empty_input() {
        assert!(classify(&[]).is_empty());
    }

    #[test]
    fn keyword_is_case_insensitive_substring() {
        assert!(matches("Hello world", Some(&keyword(&["hello"]))));
        assert!(!matches("Hello", Some(&keyword(&["goodbye"]))));
        assert!(matches("it is RAINING", Some(&keyword(&["snow", "rain"]))));
    }

    #[test]
    fn empty_inputs_never_match() {
        assert!(!matches("", Some(&keyword(&["a"]))));
        assert!(!matches("abc", Some(&keyword(&[]))));
        assert!(!matches("abc", None));
        assert!(!matches("abc", Some(&keyword(&["", "  "]))));
    }

    #[test]
    fn regex_matches_case_insensitively() {
        assert!(matches("Roll a D20 please", Some(&regex(&[r"\bd\d+\b"]))));
        assert!(!matches("no dice here", Some(&regex(&[r"\bd\d+\b"]))));
    }

    #[test]
    fn bad_pattern_is_skipped_not_fatal() {
        assert!(matches("weather report", Some(&regex(&["(unclosed", "weather"]))));
        assert!(!matches("weather report", Some(&regex(&["(unclosed"]))));
    }

    #[test]
    fn inline_flags_are_stripped() {
        assert_eq!(strip_inline_flags("(?i)hello"), "hello");
        assert_eq!(strip_inline_flags("/hel+o/gi"), "hel+o");
        assert_eq!(strip_inline_flags("a(?im)b"), "ab");
        assert_eq!(strip_inline_flags("(?:x|y)(?i:z)"), "(?:x|y)(?i:z)");
        assert_eq!(strip_inline_flags("a/b"), "a/b");
        assert_eq!(strip_inline_flags("/home/user"), "/home/user");
        assert_eq!(strip_inline_flags("/x/y/"), "x/y");
        assert!(matches("HELLO there", Some(&regex(&["/hello/i"]))));
    }
}
