//! LDIF content records (RFC 2849), enough to seed the directory.
//!
//! Supports comments, folded lines, `attr: value` and base64
//! `attr:: value`. Change records and URL values (`attr:< url`) are
//! rejected.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::directory::DirectoryEntry;
use crate::{Error, Result};

/// Parse LDIF text into entries, in file order.
///
/// # Errors
///
/// Returns `Error::Config` naming the line of the first malformed record.
pub fn parse(text: &str) -> Result<Vec<DirectoryEntry>> {
    let mut entries = Vec::new();
    let mut current: Option<DirectoryEntry> = None;

    for (lineno, line) in unfold(text) {
        if line.is_empty() {
            entries.extend(current.take());
            continue;
        }
        if line.starts_with('#') {
            continue;
        }

        let (attr, value) = split_attr(&line)
            .map_err(|msg| Error::Config(format!("LDIF line {lineno}: {msg}")))?;

        match current.as_mut() {
            None if attr.eq_ignore_ascii_case("version") => {}
            None if attr.eq_ignore_ascii_case("dn") => {
                current = Some(DirectoryEntry::new(value));
            }
            None => {
                return Err(Error::Config(format!(
                    "LDIF line {lineno}: record must start with dn, found '{attr}'"
                )));
            }
            Some(_) if attr.eq_ignore_ascii_case("changetype") => {
                return Err(Error::Config(format!(
                    "LDIF line {lineno}: change records are not supported"
                )));
            }
            Some(entry) => entry.push(attr, value),
        }
    }
    entries.extend(current);
    Ok(entries)
}

/// Join continuation lines, keeping the number of each logical line's
/// first physical line.
fn unfold(text: &str) -> Vec<(usize, String)> {
    let mut lines: Vec<(usize, String)> = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let raw = raw.strip_suffix('\r').unwrap_or(raw);
        if let Some(rest) = raw.strip_prefix(' ') {
            if let Some((_, last)) = lines.last_mut() {
                if !last.is_empty() {
                    last.push_str(rest);
                    continue;
                }
            }
        }
        lines.push((idx + 1, raw.to_string()));
    }
    lines
}

fn split_attr(line: &str) -> std::result::Result<(String, String), String> {
    let (attr, rest) = line
        .split_once(':')
        .ok_or_else(|| "expected 'attribute: value'".to_string())?;
    let attr = attr.trim().to_string();
    if attr.is_empty() {
        return Err("empty attribute name".to_string());
    }

    if let Some(encoded) = rest.strip_prefix(':') {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| format!("invalid base64 for '{attr}': {e}"))?;
        let value = String::from_utf8(bytes)
            .map_err(|_| format!("base64 value of '{attr}' is not UTF-8"))?;
        return Ok((attr, value));
    }
    if rest.starts_with('<') {
        return Err(format!("URL value for '{attr}' is not supported"));
    }
    Ok((attr, rest.trim_start().to_string()))
}
