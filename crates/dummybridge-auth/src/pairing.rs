//! Pairing code generation
//!
//! Codes are shown to a human on one device and typed into a web page on
//! another, so they avoid characters that are easy to misread (`0`/`O`,
//! `1`/`I`/`L`) and are split into two groups for transcription.

use rand::Rng;
use std::fmt;
use std::str::FromStr;

/// Symbols a pairing code is drawn from
pub const CODE_ALPHABET: &[u8] = b"23456789ABCDEFGHJKMNPQRSTUVWXYZ";

/// Symbols per group
pub const CODE_GROUP_LEN: usize = 5;

/// Separator between the two groups
pub const CODE_SEPARATOR: char = '-';

/// A short, human-typable correlation code in `XXXXX-XXXXX` form
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PairingCode(String);

impl PairingCode {
    /// Generate a fresh random code
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut code = String::with_capacity(CODE_GROUP_LEN * 2 + 1);
        for i in 0..CODE_GROUP_LEN * 2 {
            if i == CODE_GROUP_LEN {
                code.push(CODE_SEPARATOR);
            }
            let idx = rng.gen_range(0..CODE_ALPHABET.len());
            code.push(CODE_ALPHABET[idx] as char);
        }
        Self(code)
    }

    /// Normalize user input into a code.
    ///
    /// Case, whitespace and the separator position are forgiven; anything
    /// outside the alphabet or of the wrong length is rejected.
    pub fn parse(input: &str) -> Option<Self> {
        let symbols: Vec<char> = input
            .chars()
            .filter(|c| !c.is_whitespace() && *c != CODE_SEPARATOR)
            .map(|c| c.to_ascii_uppercase())
            .collect();

        if symbols.len() != CODE_GROUP_LEN * 2 {
            return None;
        }
        if !symbols
            .iter()
            .all(|c| c.is_ascii() && CODE_ALPHABET.contains(&(*c as u8)))
        {
            return None;
        }

        let mut code: String = symbols[..CODE_GROUP_LEN].iter().collect();
        code.push(CODE_SEPARATOR);
        code.extend(&symbols[CODE_GROUP_LEN..]);
        Some(Self(code))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PairingCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PairingCode {
    type Err = InvalidPairingCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or(InvalidPairingCode)
    }
}

/// Returned when a string is not a well-formed pairing code
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Invalid pairing code")]
pub struct InvalidPairingCode;

/// Map a raw request ID to the broker correlation ID.
///
/// Well-formed pairing codes are normalized; any other ID is used verbatim.
pub fn correlation_id(raw: &str) -> String {
    PairingCode::parse(raw)
        .map(|code| code.0)
        .unwrap_or_else(|| raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn is_well_formed(code: &str) -> bool {
        let groups: Vec<&str> = code.split(CODE_SEPARATOR).collect();
        groups.len() == 2
            && groups.iter().all(|g| {
                g.len() == CODE_GROUP_LEN && g.bytes().all(|b| CODE_ALPHABET.contains(&b))
            })
    }

    #[test]
    fn test_alphabet_has_no_confusables() {
        for c in b"01OIL" {
            assert!(!CODE_ALPHABET.contains(c), "{} in alphabet", *c as char);
        }
        let unique: HashSet<_> = CODE_ALPHABET.iter().collect();
        assert_eq!(unique.len(), CODE_ALPHABET.len());
    }

    #[test]
    fn test_entropy_floor() {
        let bits = (CODE_GROUP_LEN * 2) as f64 * (CODE_ALPHABET.len() as f64).log2();
        assert!(bits >= 40.0, "only {bits} bits");
    }

    #[test]
    fn test_generated_codes_unique_and_well_formed() {
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let code = PairingCode::generate();
            assert!(is_well_formed(code.as_str()), "bad code {code}");
            assert!(seen.insert(code), "duplicate code");
        }
    }

    #[test]
    fn test_parse_normalizes_input() {
        let code = PairingCode::parse(" ab3kx 9q2rz ").unwrap();
        assert_eq!(code.as_str(), "AB3KX-9Q2RZ");
        assert_eq!("AB3KX9Q2RZ".parse::<PairingCode>().unwrap(), code);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(PairingCode::parse("AB3K-9Q2R").is_none());
        assert!(PairingCode::parse("AB0KX-9Q2RZ").is_none());
        assert!(PairingCode::parse("ABIKX-9Q2RZ").is_none());
        assert!(PairingCode::parse("ABÄKX-9Q2RZ").is_none());
        assert!("".parse::<PairingCode>().is_err());
    }

    #[test]
    fn test_correlation_id_passthrough() {
        assert_eq!(correlation_id("ab3kx-9q2rz"), "AB3KX-9Q2RZ");
        assert_eq!(correlation_id("request-42"), "request-42");
    }
}
