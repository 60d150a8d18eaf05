const FENCE: &str = "```";

/// Unwrap the payload if the whole of it is one fenced code block.
/// Anything else, including several fences, is returned untouched.
pub(super) fn strip_enclosing_fence(input: &str) -> &str {
    let trimmed = input.trim();
    let Some(body) = trimmed
        .strip_prefix(FENCE)
        .and_then(|rest| rest.strip_suffix(FENCE))
    else {
        return input;
    };
    // The info string (e.g. `html`) runs to the first newline.
    let Some(newline) = body.find('\n') else {
        return input;
    };
    let (info, inner) = body.split_at(newline);
    if info.contains(FENCE) || inner.contains(FENCE) {
        return input;
    }
    inner.trim_start_matches('\n').trim_end_matches(['\n', '\r'])
}
