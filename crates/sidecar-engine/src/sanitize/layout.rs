use std::sync::LazyLock;

use regex::Regex;

static ESCAPING_POSITION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)position\s*:\s*(?:fixed|absolute)\b").unwrap());

static Z_INDEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)z-index\s*:\s*[^;"'>]*;?"#).unwrap());

static VIEWPORT_LENGTH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)-?\d+(?:\.\d+)?\s*(?:vw|vh|vmin|vmax|dvh|svh|lvh)\b").unwrap());

/// Keep injected markup inside its container: no fixed/absolute positioning,
/// no stacking order, no viewport-sized boxes.
pub(super) fn contain(input: &str) -> String {
    let out = ESCAPING_POSITION.replace_all(input, "position: relative");
    let out = Z_INDEX.replace_all(&out, "");
    VIEWPORT_LENGTH.replace_all(&out, "100%").into_owned()
}
