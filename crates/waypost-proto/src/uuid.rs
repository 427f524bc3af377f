//! Fixed 16-byte identifier used for edges and beacons.

use std::{fmt, str::FromStr};

use crate::error::ProtocolError;

/// A 16-byte identifier with a lowercase `8-4-4-4-12` canonical text form.
///
/// Identifiers carry no semantics; the bytes are opaque. Parsing accepts the
/// canonical hyphenated form and bare 32-character hex (the form edge
/// configuration uses).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Uuid([u8; 16]);

impl Uuid {
    /// Wrap raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// The raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        for (i, byte) in b.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                write!(f, "-")?;
            }
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uuid({self})")
    }
}

impl FromStr for Uuid {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || ProtocolError::MalformedUuid(s.to_string());

        let compact: String = match s.len() {
            32 => s.to_string(),
            36 => {
                let bytes = s.as_bytes();
                if bytes[8] != b'-' || bytes[13] != b'-' || bytes[18] != b'-' || bytes[23] != b'-' {
                    return Err(malformed());
                }
                s.chars().filter(|c| *c != '-').collect()
            },
            _ => return Err(malformed()),
        };

        if compact.len() != 32 || !compact.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(malformed());
        }

        let mut out = [0u8; 16];
        for (i, chunk) in compact.as_bytes().chunks_exact(2).enumerate() {
            let pair = std::str::from_utf8(chunk).map_err(|_| malformed())?;
            out[i] = u8::from_str_radix(pair, 16).map_err(|_| malformed())?;
        }
        Ok(Self(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_lowercase_hyphenated() {
        let mut bytes = [0u8; 16];
        bytes[0] = 0xAB;
        bytes[15] = 0x01;
        let uuid = Uuid::from_bytes(bytes);
        assert_eq!(uuid.to_string(), "ab000000-0000-0000-0000-000000000001");
    }

    #[test]
    fn parses_bare_hex() {
        let uuid: Uuid = "00112233445566778899aabbccddeeff".parse().unwrap();
        assert_eq!(uuid.to_string(), "00112233-4455-6677-8899-aabbccddeeff");
    }

    #[test]
    fn parses_canonical_form() {
        let text = "5a5a5a5a-5a5a-5a5a-5a5a-5a5a5a5a5a5a";
        let uuid: Uuid = text.parse().unwrap();
        assert_eq!(uuid.to_string(), text);
    }

    #[test]
    fn round_trips_through_text() {
        let uuid = Uuid::from_bytes([0x7b; 16]);
        let parsed: Uuid = uuid.to_string().parse().unwrap();
        assert_eq!(uuid, parsed);
    }

    #[test]
    fn rejects_bad_input() {
        assert!("".parse::<Uuid>().is_err());
        assert!("00112233".parse::<Uuid>().is_err());
        // Right length, wrong hyphen positions
        assert!("0011223-34455-6677-8899-aabbccddeeff".parse::<Uuid>().is_err());
        // Non-hex characters
        assert!("zz112233445566778899aabbccddeeff".parse::<Uuid>().is_err());
        // Uppercase is accepted, normalized to lowercase on display
        let uuid: Uuid = "00112233445566778899AABBCCDDEEFF".parse().unwrap();
        assert_eq!(uuid.to_string(), "00112233-4455-6677-8899-aabbccddeeff");
    }
}
