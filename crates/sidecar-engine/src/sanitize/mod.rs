//! Transform applied to every model response before it is stored or rendered.
//!
//! Model output is treated as semi-hostile markup. The pipeline is pure and
//! total: any input produces a string, and no stage can fail.

mod contrast;
mod fence;
mod layout;
mod markup;

/// Make raw model text safe to persist and render.
///
/// Stages, in order: unwrap a single enclosing code fence, pin layout so
/// markup cannot escape its container, drop active content, repair
/// unreadable color pairs.
pub fn sanitize(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }
    let text = fence::strip_enclosing_fence(raw);
    let text = layout::contain(text);
    let text = markup::strip_active_content(&text);
    contrast::repair(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_is_removed_with_content() {
        assert_eq!(sanitize("<script>x</script>Hi"), "Hi");
    }

    #[test]
    fn rebuilt_script_and_hidden_handlers_do_not_survive() {
        assert_eq!(sanitize("<scr<script>ipt>alert(1)</scr<script>ipt>"), "");
        assert_eq!(sanitize("<svg/onload=alert(1)>"), "<svg>");
        let out = sanitize(r#"<img alt=">" onerror="alert(1)" src=x>"#);
        assert!(!out.contains("onerror"), "got: {out}");
    }

    #[test]
    fn white_on_white_gets_dark_foreground() {
        let out = sanitize(r#"<div style="color:white;background:white">x</div>"#);
        assert!(out.starts_with("<div style=\""), "got: {out}");
        assert!(out.ends_with(">x</div>"), "got: {out}");
        assert!(out.contains(&format!("color:{}", contrast::DARK_TEXT)), "got: {out}");
        assert!(out.contains("background:white"), "got: {out}");
    }

    #[test]
    fn empty_input_is_empty_output() {
        assert_eq!(sanitize(""), "");
    }

    #[test]
    fn plain_text_passes_through() {
        let text = "The mood is **calm**. Nothing else to report.";
        assert_eq!(sanitize(text), text);
    }

    #[test]
    fn fenced_html_is_unwrapped_then_cleaned() {
        let raw = "```html\n<div style=\"position:fixed;z-index:999\" onclick=\"steal()\">hi</div>\n```";
        let out = sanitize(raw);
        assert_eq!(out, r#"<div style="position: relative;">hi</div>"#);
    }

    #[test]
    fn is_deterministic() {
        let raw = r#"<p style="background:#fff">a</p><iframe src="x"></iframe><a href="javascript:go()">b</a>"#;
        assert_eq!(sanitize(raw), sanitize(raw));
    }
}
