//! Domain types shared across the gateway: callsigns, destinations,
//! conversation keys.
//!
//! Callsign matching is deliberately split into three patterns with
//! different strictness:
//!
//! - the *target* pattern requires at least one letter and one digit so that
//!   bare command words ("MSG", "POS", "ON") are never mistaken for a target,
//! - the *destination* pattern is the looser shape the radio accepts,
//! - the *strict* pattern is the amateur-radio callsign form used where a
//!   real station must be named (`!ctcping`, `!kb`).

use nutype::nutype;
use once_cell::sync::Lazy;
use regex::Regex;

/// Destination shape the radio accepts: 2-8 alphanumerics plus optional SSID.
static DEST_CALLSIGN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z0-9]{2,8}(-\d{1,2})?$").expect("static pattern"));

/// Target extraction shape, without the lookaheads of the documented
/// pattern; the letter+digit requirement is checked separately.
static TARGET_SHAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z0-9]{3,8}(-\d{1,2})?$").expect("static pattern"));

/// Strict amateur callsign: 1-2 letters, digit, 1-3 letters, optional SSID.
static STRICT_CALLSIGN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z]{1,2}[0-9][A-Z]{1,3}(-\d{1,2})?$").expect("static pattern"));

/// The operator's own callsign, normalized to uppercase at the boundary.
#[nutype(
    sanitize(trim, uppercase),
    validate(not_empty, len_char_max = 12),
    derive(Clone, Debug, Display, PartialEq, Eq, Hash, AsRef, Deref, Serialize, Deserialize)
)]
pub struct Callsign(String);

impl Callsign {
    /// Base callsign with any SSID suffix stripped (`DK5EN-12` → `DK5EN`).
    pub fn base(&self) -> &str {
        base_callsign(self.as_ref())
    }
}

/// Strip the SSID suffix from a callsign.
pub fn base_callsign(call: &str) -> &str {
    call.split('-').next().unwrap_or(call)
}

/// Classified message destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Direct message to a station
    Station(String),
    /// Numeric group 1-99999
    Group(u32),
    /// The literal `TEST` group
    Test,
    /// `*` or `ALL` broadcast
    Broadcast,
    /// Anything else (empty, malformed)
    Invalid(String),
}

impl Destination {
    /// Classify an already-uppercased destination string.
    pub fn classify(dst: &str) -> Self {
        match dst {
            "" => Destination::Invalid(String::new()),
            "*" | "ALL" => Destination::Broadcast,
            "TEST" => Destination::Test,
            _ => {
                if let Ok(num) = dst.parse::<u32>() {
                    if (1..=99_999).contains(&num) {
                        return Destination::Group(num);
                    }
                    return Destination::Invalid(dst.to_string());
                }
                if DEST_CALLSIGN_RE.is_match(dst) {
                    Destination::Station(dst.to_string())
                } else {
                    Destination::Invalid(dst.to_string())
                }
            }
        }
    }

    /// True for numeric groups and the `TEST` group.
    pub fn is_group(&self) -> bool {
        matches!(self, Destination::Group(_) | Destination::Test)
    }

    /// True for destinations the radio can actually deliver to.
    pub fn is_valid(&self) -> bool {
        !matches!(
            self,
            Destination::Broadcast | Destination::Invalid(_)
        )
    }
}

/// Check whether `dst` names a group (`TEST` or numeric 1-99999).
pub fn is_group(dst: &str) -> bool {
    Destination::classify(dst).is_group()
}

/// Target-callsign test: destination shape plus at least one letter AND one
/// digit anywhere in the token (SSID digits count).
pub fn is_target_callsign(token: &str) -> bool {
    TARGET_SHAPE_RE.is_match(token)
        && token.chars().any(|c| c.is_ascii_alphabetic())
        && token.chars().any(|c| c.is_ascii_digit())
}

/// Strict callsign test used where a real station must be named.
pub fn is_strict_callsign(call: &str) -> bool {
    STRICT_CALLSIGN_RE.is_match(call)
}

/// Derive the symmetric conversation key for a message.
///
/// Groups, `TEST` and `*` keep the destination as-is; direct messages use
/// the sorted pair of base callsigns joined with `<>` so both directions of
/// a DM land in the same thread.
pub fn conversation_key(src: &str, dst: &str) -> String {
    match Destination::classify(dst) {
        Destination::Group(_) | Destination::Test | Destination::Broadcast => dst.to_string(),
        _ => {
            let mut pair = [base_callsign(src), base_callsign(dst)];
            pair.sort_unstable();
            format!("{}<>{}", pair[0], pair[1])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_uppercase_and_trim_when_creating_callsign() {
        let call = Callsign::try_new("  dk5en-1 ").unwrap();
        assert_eq!(call.as_ref(), "DK5EN-1");
        assert_eq!(call.base(), "DK5EN");
    }

    #[test]
    fn test_should_reject_empty_callsign() {
        assert!(Callsign::try_new("   ").is_err());
    }

    #[test]
    fn test_should_classify_numeric_groups() {
        assert_eq!(Destination::classify("20"), Destination::Group(20));
        assert_eq!(Destination::classify("99999"), Destination::Group(99_999));
        assert!(matches!(
            Destination::classify("100000"),
            Destination::Invalid(_)
        ));
        assert!(matches!(Destination::classify("0"), Destination::Invalid(_)));
    }

    #[test]
    fn test_should_classify_special_destinations() {
        assert_eq!(Destination::classify("TEST"), Destination::Test);
        assert_eq!(Destination::classify("*"), Destination::Broadcast);
        assert_eq!(Destination::classify("ALL"), Destination::Broadcast);
        assert!(matches!(Destination::classify(""), Destination::Invalid(_)));
    }

    #[test]
    fn test_should_reject_command_words_as_targets() {
        // The letter+digit requirement rejects bare words and bare numbers.
        assert!(!is_target_callsign("MSG"));
        assert!(!is_target_callsign("POS"));
        assert!(!is_target_callsign("ON"));
        assert!(!is_target_callsign("24"));
        assert!(is_target_callsign("DK5EN-1"));
        assert!(is_target_callsign("OE5HWN-12"));
        // SSID digit satisfies the digit requirement
        assert!(is_target_callsign("ABC-1"));
    }

    #[test]
    fn test_should_match_strict_callsigns_only() {
        assert!(is_strict_callsign("DK5EN-1"));
        assert!(is_strict_callsign("OE5HWN"));
        assert!(!is_strict_callsign("20"));
        assert!(!is_strict_callsign("DK5EN5EN"));
    }

    #[test]
    fn test_should_build_symmetric_conversation_key_for_dms() {
        let a = conversation_key("DK5EN-1", "OE5HWN-12");
        let b = conversation_key("OE5HWN-3", "DK5EN-99");
        assert_eq!(a, "DK5EN<>OE5HWN");
        assert_eq!(a, b, "DM key must not depend on direction or SSID");
    }

    #[test]
    fn test_should_keep_group_destination_as_conversation_key() {
        assert_eq!(conversation_key("DK5EN-1", "20"), "20");
        assert_eq!(conversation_key("DK5EN-1", "TEST"), "TEST");
        assert_eq!(conversation_key("DK5EN-1", "*"), "*");
    }
}
