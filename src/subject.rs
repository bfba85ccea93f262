use crate::config::ConfigError;
use chrono::{DateTime, Timelike};
use chrono_tz::Tz;
use lazy_static::lazy_static;
use regex::{Captures, Regex};

lazy_static! {
    static ref LEADING_DIGITS: Regex = Regex::new(r"^\D*(\d+)").unwrap();
    static ref ALL_DIGITS: Regex = Regex::new(r"^\d+$").unwrap();
    static ref HHMM: Regex = Regex::new(r"^\d{4}$").unwrap();
}

const REQUIRED_GROUPS: [&str; 4] = ["entrant", "bonus", "odo", "time"];

/// A configured claim pattern. Patterns either name their captures
/// (`entrant`, `bonus`, `odo`, `time`, optional `extra`) or supply them
/// positionally in that order.
#[derive(Debug, Clone)]
pub struct ClaimPattern {
    regex: Regex,
    named: bool,
}

/// Raw tokens captured from a subject line. Absent groups are empty.
#[derive(Debug, Default, Clone, PartialEq)]
struct Tokens<'t> {
    entrant: &'t str,
    bonus: &'t str,
    odo: &'t str,
    time: &'t str,
    extra: &'t str,
}

impl ClaimPattern {
    pub fn compile(name: &'static str, pattern: &str) -> Result<Self, ConfigError> {
        let regex = Regex::new(pattern).map_err(|source| ConfigError::Pattern { name, source })?;
        let names: Vec<&str> = regex.capture_names().flatten().collect();
        let named = !names.is_empty();
        if named {
            if let Some(group) = REQUIRED_GROUPS.iter().find(|g| !names.contains(g)) {
                return Err(ConfigError::MissingGroup { name, group });
            }
        } else {
            // captures_len includes the implicit whole-match group
            let explicit = regex.captures_len() - 1;
            if explicit < REQUIRED_GROUPS.len() {
                return Err(ConfigError::MissingGroup {
                    name,
                    group: REQUIRED_GROUPS[explicit],
                });
            }
        }
        Ok(ClaimPattern { regex, named })
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }

    fn tokens<'t>(&self, text: &'t str) -> Option<Tokens<'t>> {
        let caps = self.regex.captures(text)?;
        Some(Tokens {
            entrant: self.group(&caps, "entrant", 1),
            bonus: self.group(&caps, "bonus", 2),
            odo: self.group(&caps, "odo", 3),
            time: self.group(&caps, "time", 4),
            extra: self.group(&caps, "extra", 5),
        })
    }

    fn group<'t>(&self, caps: &Captures<'t>, name: &str, index: usize) -> &'t str {
        let m = if self.named {
            caps.name(name)
        } else {
            caps.get(index)
        };
        m.map(|m| m.as_str()).unwrap_or("")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    Lenient,
    Strict,
}

/// The structured reading of one claim subject.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedClaim {
    pub ok: bool,
    pub entrant_id: i64,
    pub bonus_id: String,
    pub odometer: i64,
    pub odometer_valid: bool,
    /// Set only when the time token was a full timestamp.
    pub claim_time: Option<DateTime<Tz>>,
    pub hhmm: String,
    pub time_valid: bool,
    pub hour: u32,
    pub minute: u32,
    pub extra: String,
}

#[derive(Debug, Clone)]
pub struct SubjectParser {
    lenient: ClaimPattern,
    strict: ClaimPattern,
    tz: Tz,
}

impl SubjectParser {
    pub fn new(lenient: &str, strict: &str, tz: Tz) -> Result<Self, ConfigError> {
        Ok(SubjectParser {
            lenient: ClaimPattern::compile("subject", lenient)?,
            strict: ClaimPattern::compile("strict", strict)?,
            tz,
        })
    }

    pub fn lenient_pattern(&self) -> &ClaimPattern {
        &self.lenient
    }

    pub fn parse(&self, text: &str, mode: ParseMode) -> ParsedClaim {
        let pattern = match mode {
            ParseMode::Lenient => &self.lenient,
            ParseMode::Strict => &self.strict,
        };
        let mut claim = ParsedClaim::default();
        let tokens = match pattern.tokens(text) {
            Some(tokens) => tokens,
            None => return claim,
        };

        claim.entrant_id = entrant_number(tokens.entrant);
        claim.bonus_id = tokens.bonus.to_uppercase();
        if tokens.odo.is_empty() || tokens.time.is_empty() {
            // Strict parses need every field; lenient ones keep entrant/bonus
            return claim;
        }

        let odometer = if ALL_DIGITS.is_match(tokens.odo) {
            tokens.odo.parse::<i64>().ok()
        } else {
            None
        };
        claim.odometer_valid = odometer.is_some();
        claim.odometer = odometer.unwrap_or(0);

        match DateTime::parse_from_rfc3339(tokens.time) {
            Ok(stamp) => {
                // hour and minute stay as typed; the instant is kept separately
                claim.hhmm = tokens.time.to_string();
                claim.hour = stamp.hour();
                claim.minute = stamp.minute();
                claim.time_valid = true;
                claim.claim_time = Some(stamp.with_timezone(&self.tz));
            }
            Err(_) => {
                let digits: String = tokens
                    .time
                    .chars()
                    .filter(|c| *c != ':' && *c != '.')
                    .collect();
                let digits = format!("{digits:0>4}");
                let value: u32 = digits.parse().unwrap_or(u32::MAX);
                claim.hour = value / 100;
                claim.minute = value % 100;
                claim.time_valid = HHMM.is_match(&digits) && claim.hour < 24 && claim.minute < 60;
                claim.hhmm = digits;
            }
        }

        claim.extra = tokens.extra.to_string();
        claim.ok = claim.time_valid;
        claim
    }
}

/// Organisers decorate rider numbers ("a01", "1A"); only the first digit run counts.
pub fn entrant_number(token: &str) -> i64 {
    LEADING_DIGITS
        .captures(token)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_STRICT_PATTERN, DEFAULT_SUBJECT_PATTERN};

    fn parser() -> SubjectParser {
        SubjectParser::new(
            DEFAULT_SUBJECT_PATTERN,
            DEFAULT_STRICT_PATTERN,
            chrono_tz::Europe::London,
        )
        .unwrap()
    }

    #[test]
    fn test_subject_table() {
        let cases = [
            ("1 2 3 1234", true, true),
            ("01 bb 12345 930", true, false),
            ("01 02", false, false),
            ("bob 02 1234 1234", true, false),
            ("bob bob 1234 12:34", true, false),
            ("1 Ba,1234,12:34", false, false),
            ("a01 bac 12345 3.17", true, false),
            ("A1 BB1 123.456 0440", false, false),
            ("1A BB1 123456 0440", true, false),
            ("01 13 2345 1712 bollox and stuff", true, true),
            ("Fwd: 1 23b 27 1234", true, false),
            ("Fwd: 1 23b 27 1234 some old bollox", true, false),
            (
                "Fwd: 1 23b 27 2023-02-01T07:15:00+03:00 some old bollox",
                true,
                false,
            ),
        ];
        let p = parser();
        for (subject, lenient, strict) in cases {
            assert_eq!(
                p.parse(subject, ParseMode::Lenient).ok,
                lenient,
                "lenient {subject}"
            );
            assert_eq!(
                p.parse(subject, ParseMode::Strict).ok,
                strict,
                "strict {subject}"
            );
        }
    }

    #[test]
    fn test_simple_claim() {
        let claim = parser().parse("1 2 3 1234", ParseMode::Lenient);
        assert!(claim.ok);
        assert_eq!(claim.entrant_id, 1);
        assert_eq!(claim.bonus_id, "2");
        assert_eq!(claim.odometer, 3);
        assert!(claim.odometer_valid);
        assert_eq!((claim.hour, claim.minute), (12, 34));
        assert_eq!(claim.hhmm, "1234");
        assert!(claim.claim_time.is_none());
    }

    #[test]
    fn test_too_few_fields() {
        let claim = parser().parse("01 02", ParseMode::Lenient);
        assert!(!claim.ok);
    }

    #[test]
    fn test_out_of_range_minute() {
        let p = parser();
        let claim = p.parse("1A BB1 123456 20099", ParseMode::Lenient);
        assert!(!claim.ok);
        assert!(!claim.time_valid);
        assert_eq!(claim.entrant_id, 1);
        assert_eq!(claim.bonus_id, "BB1");

        let claim = p.parse("7 XY 1000 1260 extra words", ParseMode::Lenient);
        assert!(!claim.ok);
        assert_eq!(claim.minute, 60);

        let claim = p.parse("7 XY 1000 2400", ParseMode::Lenient);
        assert!(!claim.ok);
    }

    #[test]
    fn test_four_digit_times_roundtrip() {
        let p = parser();
        for hh in 0..24 {
            for mm in [0, 7, 30, 59] {
                let typed = format!("{hh:02}{mm:02}");
                let claim = p.parse(&format!("12 B7 5000 {typed}"), ParseMode::Lenient);
                assert!(claim.ok, "{typed}");
                assert_eq!(format!("{:04}", claim.hour * 100 + claim.minute), typed);
            }
        }
    }

    #[test]
    fn test_decorations_and_extra() {
        let claim = parser().parse(
            "Fwd: 1 23b 27 1234 some old bollox",
            ParseMode::Lenient,
        );
        assert!(claim.ok);
        assert_eq!(claim.entrant_id, 1);
        assert_eq!(claim.bonus_id, "23B");
        assert_eq!(claim.extra, "some old bollox");

        let claim = parser().parse("a01 bac 12345 3.17", ParseMode::Lenient);
        assert_eq!(claim.entrant_id, 1);
        assert_eq!(claim.hhmm, "0317");
        assert_eq!((claim.hour, claim.minute), (3, 17));
    }

    #[test]
    fn test_full_timestamp_token() {
        let claim = parser().parse(
            "1 23b 27 2023-02-01T07:15:00+03:00",
            ParseMode::Lenient,
        );
        assert!(claim.ok);
        let stamp = claim.claim_time.unwrap();
        // 04:15 UTC, London is on GMT in February
        assert_eq!((stamp.hour(), stamp.minute()), (4, 15));
        assert_eq!((claim.hour, claim.minute), (7, 15));
    }

    #[test]
    fn test_overflowing_odometer_is_invalid() {
        let claim = parser().parse("1 AB 99999999999999999999 1234", ParseMode::Lenient);
        assert!(claim.ok);
        assert!(!claim.odometer_valid);
        assert_eq!(claim.odometer, 0);
    }

    #[test]
    fn test_non_digit_odometer_keeps_claim() {
        let p = SubjectParser::new(
            r"(\d+)\s+(\w+)\s+(\S+)\s+(\d{4})",
            DEFAULT_STRICT_PATTERN,
            chrono_tz::UTC,
        )
        .unwrap();
        let claim = p.parse("5 AB 12k 0930", ParseMode::Lenient);
        assert!(claim.ok);
        assert!(!claim.odometer_valid);
        assert_eq!(claim.odometer, 0);
    }

    #[test]
    fn test_pattern_validation() {
        assert!(matches!(
            ClaimPattern::compile("subject", r"(?P<entrant>\d+) (?P<bonus>\w+) (?P<odo>\d+)"),
            Err(ConfigError::MissingGroup { group: "time", .. })
        ));
        assert!(matches!(
            ClaimPattern::compile("strict", r"(\d+) (\w+)"),
            Err(ConfigError::MissingGroup { group: "odo", .. })
        ));
        assert!(ClaimPattern::compile("strict", r"(\d+) (\w+) (\d+) (\d+)").is_ok());
        assert!(matches!(
            ClaimPattern::compile("subject", r"(\d+"),
            Err(ConfigError::Pattern { .. })
        ));
    }

    #[test]
    fn test_entrant_number() {
        assert_eq!(entrant_number("a01"), 1);
        assert_eq!(entrant_number("1A"), 1);
        assert_eq!(entrant_number("#123x4"), 123);
        assert_eq!(entrant_number("bob"), 0);
    }
}
