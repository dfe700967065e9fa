//! RFC 4013 SASLprep profile, applied to usernames and passwords before the
//! SCRAM exchange.
//!
//! The character tables come from [`stringprep::tables`] (RFC 3454 appendix
//! data); the profile logic lives here because the driver runs in
//! "stored string" mode and classifies failures precisely.
use std::fmt;

use stringprep::tables;
use unicode_normalization::UnicodeNormalization;

/// An error applying the SASLprep profile.
#[derive(PartialEq, Eq)]
pub enum SaslprepError {
    /// The prepared output would contain a prohibited code point.
    ProhibitedOutput(char),
    /// The string mixes right-to-left and left-to-right characters, or does
    /// not start and end with RandALCat characters (RFC 3454 §6).
    ProhibitedBidirectionalString(String),
    /// Stored-string mode rejects code points unassigned in Unicode 3.2.
    UnassignedCodePoint(char),
}

impl std::error::Error for SaslprepError { }

impl fmt::Display for SaslprepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProhibitedOutput(c) => {
                write!(f, "prohibited character U+{:04X}", *c as u32)
            }
            Self::ProhibitedBidirectionalString(s) => {
                write!(f, "prohibited bidirectional string {s:?}")
            }
            Self::UnassignedCodePoint(c) => {
                write!(f, "unassigned code point U+{:04X}", *c as u32)
            }
        }
    }
}

impl fmt::Debug for SaslprepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// Prepare `input` per RFC 4013 in stored-string mode.
pub fn saslprep(input: &str) -> Result<String, SaslprepError> {
    // 2.1 mapping: B.1 to nothing, C.1.2 to U+0020
    let mapped = input.chars().filter_map(|c| {
        if tables::commonly_mapped_to_nothing(c) {
            None
        } else if tables::non_ascii_space_character(c) {
            Some(' ')
        } else {
            Some(c)
        }
    });

    // 2.2 normalization: NFKC
    let output: String = mapped.nfkc().collect();

    // 2.3 prohibited output
    for c in output.chars() {
        if prohibited(c) {
            return Err(SaslprepError::ProhibitedOutput(c));
        }
    }

    // 2.4 bidirectional characters, RFC 3454 §6
    if output.chars().any(tables::bidi_r_or_al) {
        let mut chars = output.chars();
        let first = chars.next().unwrap();
        let last = chars.next_back().unwrap_or(first);
        if output.chars().any(tables::bidi_l)
            || !tables::bidi_r_or_al(first)
            || !tables::bidi_r_or_al(last)
        {
            return Err(SaslprepError::ProhibitedBidirectionalString(output));
        }
    }

    // 2.5 unassigned code points
    for c in output.chars() {
        if tables::unassigned_code_point(c) {
            return Err(SaslprepError::UnassignedCodePoint(c));
        }
    }

    Ok(output)
}

/// RFC 4013 §2.3. ASCII space (C.1.1) stays allowed; non-ASCII spaces were
/// already mapped to U+0020 and anything NFKC reintroduced is rejected here.
fn prohibited(c: char) -> bool {
    tables::non_ascii_space_character(c)          // C.1.2
        || tables::ascii_control_character(c)     // C.2.1
        || tables::non_ascii_control_character(c) // C.2.2
        || tables::private_use(c)                 // C.3
        || tables::non_character_code_point(c)    // C.4
        || tables::surrogate_code(c)              // C.5
        || tables::inappropriate_for_plain_text(c) // C.6
        || tables::inappropriate_for_canonical_representation(c) // C.7
        || tables::change_display_properties_or_deprecated(c) // C.8
        || tables::tagging_character(c)           // C.9
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn passthrough() {
        assert_eq!(saslprep("user").unwrap(), "user");
        assert_eq!(saslprep("p e n c i l").unwrap(), "p e n c i l");
    }

    #[test]
    fn maps_to_nothing() {
        // soft hyphen is B.1
        assert_eq!(saslprep("I\u{00AD}X").unwrap(), "IX");
    }

    #[test]
    fn maps_non_ascii_space() {
        assert_eq!(saslprep("a\u{00A0}b").unwrap(), "a b");
        assert_eq!(saslprep("a\u{2003}b").unwrap(), "a b");
    }

    #[test]
    fn nfkc() {
        // U+2168 ROMAN NUMERAL NINE
        assert_eq!(saslprep("\u{2168}").unwrap(), "IX");
        assert_eq!(saslprep("\u{FF21}\u{FF22}").unwrap(), "AB");
    }

    #[test]
    fn prohibited_control() {
        assert_eq!(
            saslprep("bad\u{0007}"),
            Err(SaslprepError::ProhibitedOutput('\u{0007}'))
        );
        assert_eq!(
            saslprep("bad\u{200E}"),
            Err(SaslprepError::ProhibitedOutput('\u{200E}'))
        );
    }

    #[test]
    fn bidi_rules() {
        // all RandALCat is fine
        assert_eq!(saslprep("\u{05D0}\u{05D1}").unwrap(), "\u{05D0}\u{05D1}");
        // RandALCat mixed with LCat is prohibited
        assert!(matches!(
            saslprep("\u{05D0}a\u{05D1}"),
            Err(SaslprepError::ProhibitedBidirectionalString(_))
        ));
        // RandALCat must be first and last
        assert!(matches!(
            saslprep("\u{05D0}1"),
            Err(SaslprepError::ProhibitedBidirectionalString(_))
        ));
    }

    #[test]
    fn unassigned_rejected() {
        assert_eq!(
            saslprep("x\u{0378}"),
            Err(SaslprepError::UnassignedCodePoint('\u{0378}'))
        );
    }

    #[test]
    fn idempotent() {
        for input in [
            "user",
            "pencil",
            "I\u{00AD}X",
            "a\u{00A0}b",
            "\u{2168}",
            "\u{05D0}\u{05D1}",
            "mixed ascii 42",
        ] {
            let once = saslprep(input).unwrap();
            assert_eq!(saslprep(&once).unwrap(), once);
        }
    }
}
