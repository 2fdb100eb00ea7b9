use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

const SYMBOLS: &[u8; 3] = b"rwx";

/// POSIX permission bits applied to directories created by the store.
///
/// Parsed from the symbolic form (`rwxr-x---`) or from octal (`750`).
#[derive(Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct DirMode(u32);

impl DirMode {
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits & 0o777)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Apply the mode to an existing directory. No-op on non-Unix targets.
    pub async fn apply(&self, path: &Path) -> std::io::Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(self.0)).await
        }
        #[cfg(not(unix))]
        {
            let _ = path;
            Ok(())
        }
    }
}

impl Default for DirMode {
    /// `rwxr-x---`
    fn default() -> Self {
        Self(0o750)
    }
}

impl FromStr for DirMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        if (3..=4).contains(&s.len()) && s.bytes().all(|b| (b'0'..=b'7').contains(&b)) {
            let bits = u32::from_str_radix(s, 8).map_err(|e| e.to_string())?;
            if bits > 0o777 {
                return Err(format!("mode {s} sets bits outside rwxrwxrwx"));
            }
            return Ok(Self(bits));
        }

        if s.len() != 9 {
            return Err(format!(
                "expected a 9-character mode like 'rwxr-x---' or octal like '750', got '{s}'"
            ));
        }

        let mut bits = 0;
        for (i, c) in s.bytes().enumerate() {
            if c == SYMBOLS[i % 3] {
                bits |= 1 << (8 - i);
            } else if c != b'-' {
                return Err(format!(
                    "invalid permission character '{}' at position {}",
                    c as char,
                    i + 1
                ));
            }
        }
        Ok(Self(bits))
    }
}

impl TryFrom<String> for DirMode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for DirMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..9 {
            let c = if self.0 & (1 << (8 - i)) != 0 {
                SYMBOLS[i % 3] as char
            } else {
                '-'
            };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for DirMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DirMode({self})")
    }
}
