use ebc_fetch::config::{DEFAULT_STRICT_PATTERN, DEFAULT_SUBJECT_PATTERN};
use ebc_fetch::{ParseMode, SubjectParser};

fn main() {
    let subjects: Vec<String> = std::env::args().skip(1).collect();
    let subjects = if subjects.is_empty() {
        vec![
            "1 2 3 1234".to_string(),
            "Fwd: 1 23b 27 1234 some old bollox".to_string(),
            "1A BB1 123456 20099".to_string(),
        ]
    } else {
        subjects
    };

    let parser = match SubjectParser::new(
        DEFAULT_SUBJECT_PATTERN,
        DEFAULT_STRICT_PATTERN,
        chrono_tz::UTC,
    ) {
        Ok(parser) => parser,
        Err(e) => {
            eprintln!("Bad default pattern: {e}");
            std::process::exit(1);
        }
    };

    for subject in &subjects {
        let lenient = parser.parse(subject, ParseMode::Lenient);
        let strict = parser.parse(subject, ParseMode::Strict);
        println!("Subject: '{subject}'");
        println!("  lenient ok={} strict ok={}", lenient.ok, strict.ok);
        println!(
            "  entrant={} bonus={} odo={} ({}) hhmm='{}' {:02}:{:02} extra='{}'",
            lenient.entrant_id,
            lenient.bonus_id,
            lenient.odometer,
            if lenient.odometer_valid { "ok" } else { "bad" },
            lenient.hhmm,
            lenient.hour,
            lenient.minute,
            lenient.extra
        );
    }
}
