//! Credential log sanitization. Values that might hold a username, password, or other
//! secret are wrapped in [`Masked`] before they reach a log line, so the compiler — not code
//! review — is what stops a raw credential from leaking into `tracing` output.

use std::fmt;

/// A string that renders masked whenever it is displayed, e.g. in a `tracing` field.
pub struct Masked<'a>(pub &'a str);

impl fmt::Display for Masked<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&mask(self.0))
    }
}

impl fmt::Debug for Masked<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// First-char + asterisks + last-char masking.
pub fn mask(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    match chars.len() {
        0 => "[empty]".to_string(),
        1 => "*".to_string(),
        2 => format!("{}*", chars[0]),
        n => {
            let stars: String = std::iter::repeat('*').take(n - 2).collect();
            format!("{}{}{}", chars[0], stars, chars[n - 1])
        }
    }
}
