//! Filename sanitization and `{{ placeholder }}` template rendering.

use std::collections::HashMap;

/// Replace characters that are invalid in filenames on any supported
/// platform with underscores.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|ch| {
            if matches!(ch, '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|') {
                '_'
            } else {
                ch
            }
        })
        .collect()
}

/// Render a `{{ key }}` template against the given values.
///
/// Placeholders tolerate inner whitespace (`{{title}}`, `{{ title }}`).
/// Unknown placeholders render as an empty string. Path separators inside
/// the template are preserved; separators inside substituted values are not.
pub fn render_template(template: &str, values: &HashMap<&str, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim();
                if let Some(value) = values.get(key) {
                    out.push_str(&sanitize_filename(value));
                }
                rest = &after[end + 2..];
            }
            None => {
                // Unterminated placeholder, emit literally
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
