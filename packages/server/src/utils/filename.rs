use std::fmt::Write;

/// Why a client-supplied original filename was rejected.
#[derive(Debug, PartialEq, Eq)]
pub enum FilenameError {
    /// Filename is empty or whitespace-only.
    Empty,
    /// Filename contains control characters (CR, LF, NUL, etc.).
    ControlCharacter,
}

impl FilenameError {
    /// Returns a human-readable error message.
    pub fn message(&self) -> &'static str {
        match self {
            Self::Empty => "Original filename cannot be empty",
            Self::ControlCharacter => {
                "Invalid original filename: control characters are not allowed"
            }
        }
    }
}

/// Validates a display filename supplied by a client.
///
/// Separators and dots are allowed since the value is never used to build a
/// filesystem path. Control characters are rejected because the name can end
/// up in response headers.
pub fn validate_original_filename(filename: &str) -> Result<&str, FilenameError> {
    let trimmed = filename.trim();

    if trimmed.is_empty() {
        return Err(FilenameError::Empty);
    }

    if trimmed.chars().any(char::is_control) {
        return Err(FilenameError::ControlCharacter);
    }

    Ok(trimmed)
}

/// RFC 3986 unreserved characters, safe anywhere in a URL path segment.
fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"-._~".contains(&b)
}

/// RFC 5987 `attr-char`, allowed unescaped in an extended header parameter.
fn is_attr_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$&+-.^_`|~".contains(&b)
}

fn percent_encode(input: &str, keep: impl Fn(u8) -> bool) -> String {
    let mut out = String::with_capacity(input.len());
    for b in input.bytes() {
        if keep(b) {
            out.push(char::from(b));
        } else {
            let _ = write!(out, "%{b:02X}");
        }
    }
    out
}

/// Percent-encodes each `/`-separated segment of a reference path for use in a URL.
/// Empty segments are dropped.
pub fn encode_path_segments(ref_path: &str) -> String {
    ref_path
        .split(['/', '\\'])
        .filter(|segment| !segment.is_empty())
        .map(|segment| percent_encode(segment, is_unreserved))
        .collect::<Vec<_>>()
        .join("/")
}

/// Builds the inline `Content-Disposition` value for a download of `ref_path`.
///
/// The quoted `filename` keeps the printable ASCII of the reference path minus
/// quote, semicolon and backslash (`download` if nothing is left). The exact
/// path travels in `filename*`.
pub fn content_disposition_value(ref_path: &str) -> String {
    let mut quoted: String = ref_path
        .chars()
        .filter(|c| c.is_ascii_graphic() && !matches!(c, '"' | ';' | '\\'))
        .collect();
    if quoted.is_empty() {
        quoted.push_str("download");
    }

    format!(
        "inline; filename=\"{quoted}\"; filename*=UTF-8''{}",
        percent_encode(ref_path, is_attr_char)
    )
}
