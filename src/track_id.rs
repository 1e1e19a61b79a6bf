//! 128-bit identifier of the track the server wants played.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

const TEXT_LEN: usize = 36;
const HYPHENS: [usize; 4] = [8, 13, 18, 23];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackId(Uuid);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid track id {0:?}")]
pub struct InvalidTrackId(pub String);

impl TrackId {
    /// All-zero id, meaning "no track".
    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    /// Fresh random id with version 4 / variant bits set.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for TrackId {
    fn default() -> Self {
        Self::nil()
    }
}

impl FromStr for TrackId {
    type Err = InvalidTrackId;

    /// Accepts only the 36-character hyphenated form. The bytes are kept
    /// as sent, version and variant bits included.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        let shape_ok = bytes.len() == TEXT_LEN
            && bytes.iter().enumerate().all(|(i, b)| {
                if HYPHENS.contains(&i) {
                    *b == b'-'
                } else {
                    b.is_ascii_hexdigit()
                }
            });
        if !shape_ok {
            return Err(InvalidTrackId(s.to_string()));
        }
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| InvalidTrackId(s.to_string()))
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}
