//! Voice templates: SSML documents with a single `{{.}}` slot for the spoken text.

use crate::error::{Result, SayerError};

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// Substitutes the escaped `text` into the template's placeholder.
///
/// The placeholder is `{{.}}` or `{{text}}`, spaces inside the braces allowed.
/// Templates are checked here, at request time, so a bad one only fails the
/// roles that use it.
pub fn render(template: &str, text: &str) -> Result<String> {
    let (start, end) = find_placeholder(template)?;
    let escaped = escape(text);

    let mut out = String::with_capacity(template.len() + escaped.len());
    out.push_str(&template[..start]);
    out.push_str(&escaped);
    out.push_str(&template[end..]);
    Ok(out)
}

fn find_placeholder(template: &str) -> Result<(usize, usize)> {
    let start = template
        .find(OPEN)
        .ok_or_else(|| SayerError::Template("no {{.}} placeholder".to_string()))?;
    let inner_start = start + OPEN.len();
    let inner_len = template[inner_start..]
        .find(CLOSE)
        .ok_or_else(|| SayerError::Template("unterminated placeholder".to_string()))?;
    let end = inner_start + inner_len + CLOSE.len();

    let name = template[inner_start..inner_start + inner_len].trim();
    if name != "." && name != "text" {
        return Err(SayerError::Template(format!(
            "unknown placeholder {{{{{}}}}}",
            name
        )));
    }
    if template[end..].contains(OPEN) {
        return Err(SayerError::Template(
            "more than one placeholder".to_string(),
        ));
    }
    Ok((start, end))
}

/// HTML/XML escaping of `& < > ' "`.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&#39;"),
            '"' => out.push_str("&#34;"),
            _ => out.push(c),
        }
    }
    out
}
