use std::borrow::Cow;

/// Escape `& < > " '` for HTML output. Returns the input unchanged when
/// nothing needs escaping.
#[must_use]
pub fn escape_html(input: &str) -> Cow<'_, str> {
    let first = input.find(['&', '<', '>', '"', '\'']);
    let Some(first) = first else {
        return Cow::Borrowed(input);
    };

    let mut out = String::with_capacity(input.len() + 8);
    out.push_str(&input[..first]);
    for ch in input[first..].chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    Cow::Owned(out)
}
