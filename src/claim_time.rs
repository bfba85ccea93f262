use crate::config::ConfigError;
use crate::store::{ScoreStore, StoreError};
use crate::subject::ParsedClaim;
use chrono::{
    DateTime, Duration, LocalResult, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc,
};
use chrono_tz::Tz;
use log::debug;

/// Format used by the rally parameters table for start/finish.
const RALLY_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M";

#[derive(Debug, Clone, PartialEq)]
pub struct RallyWindow {
    pub title: String,
    pub start: DateTime<Tz>,
    pub finish: DateTime<Tz>,
    pub tz: Tz,
}

impl RallyWindow {
    pub fn new(title: &str, start: &str, finish: &str, tz_name: &str) -> Result<Self, ConfigError> {
        let tz: Tz = tz_name
            .trim()
            .parse()
            .map_err(|_| ConfigError::Timezone(tz_name.to_string()))?;
        let naive = |text: &str| {
            parse_config_time(text).ok_or_else(|| ConfigError::BadTime(text.to_string()))
        };
        Ok(RallyWindow {
            title: title.to_string(),
            start: localize(tz, naive(start)?),
            finish: localize(tz, naive(finish)?),
            tz,
        })
    }

    pub fn is_single_day(&self) -> bool {
        self.start.date_naive() == self.finish.date_naive()
    }

    /// UTC offset at the start of the rally, e.g. `+01:00`.
    pub fn offset_string(&self) -> String {
        self.start.format("%:z").to_string()
    }
}

/// Interprets a wall-clock time in `tz`. Times repeated by a DST change take
/// the earlier instant; times skipped by one move forward an hour.
pub fn localize(tz: Tz, naive: NaiveDateTime) -> DateTime<Tz> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(t) => t,
        LocalResult::Ambiguous(earlier, _) => earlier,
        LocalResult::None => tz
            .from_local_datetime(&(naive + Duration::hours(1)))
            .earliest()
            .unwrap_or_else(|| tz.from_utc_datetime(&naive)),
    }
}

/// Offset-qualified ISO-8601, the wire format for every stored timestamp.
pub fn stamp(t: &DateTime<Tz>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, false)
}

/// Accepts the date forms found in configuration and rally parameters.
pub fn parse_config_time(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(text) {
        return Some(t.naive_local());
    }
    for format in [RALLY_TIME_FORMAT, "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(text, format) {
            return Some(t);
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Parses an RFC 2822 header date (or one of the plain forms some relays
/// emit) into the rally timezone.
pub fn parse_mail_time(text: &str, tz: Tz) -> Option<DateTime<Tz>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(secs) = mailparse::dateparse(text) {
        if let Some(t) = Utc.timestamp_opt(secs, 0).single() {
            return Some(t.with_timezone(&tz));
        }
    }
    if let Ok(t) = DateTime::parse_from_rfc2822(text) {
        return Some(t.with_timezone(&tz));
    }
    parse_config_time(text).map(|naive| localize(tz, naive))
}

/// Earliest of the server's internal date and every `Received`/`X-Received`
/// stamp (the part after the final `;`).
pub fn earliest_transit(internal: DateTime<Tz>, received: &[String], tz: Tz) -> DateTime<Tz> {
    received
        .iter()
        .filter_map(|header| header.rsplit(';').next())
        .filter_map(|when| parse_mail_time(when, tz))
        .fold(internal, |earliest, t| if t < earliest { t } else { earliest })
}

/// Turns a claim's bare time of day into an absolute timestamp.
#[derive(Debug, Clone)]
pub struct ClaimTimeResolver {
    window: RallyWindow,
}

impl ClaimTimeResolver {
    pub fn new(window: RallyWindow) -> Self {
        ClaimTimeResolver { window }
    }

    /// Date comes from the rally itself when it lasts one day, otherwise from
    /// the send time. A result more than an hour after sending is a claim
    /// from late the previous evening and moves back a day, except on the
    /// rally's first day.
    pub fn resolve(&self, hour: u32, minute: u32, sent: &DateTime<Tz>) -> DateTime<Tz> {
        let tz = self.window.tz;
        let date = if self.window.is_single_day() {
            self.window.start.date_naive()
        } else {
            sent.with_timezone(&tz).date_naive()
        };
        let Some(naive) = date.and_hms_opt(hour, minute, 0) else {
            return sent.with_timezone(&tz);
        };
        let candidate = localize(tz, naive);
        if candidate.signed_duration_since(*sent) > Duration::hours(1)
            && candidate.date_naive() != self.window.start.date_naive()
        {
            let previous = naive - Duration::days(1);
            return localize(tz, previous);
        }
        candidate
    }

    /// Full timestamps typed by the rider win; a resend of an already stored
    /// claim reuses that claim's timestamp; otherwise compute one.
    pub fn resolve_claim(
        &self,
        claim: &ParsedClaim,
        sent: &DateTime<Tz>,
        store: &ScoreStore,
    ) -> Result<DateTime<Tz>, StoreError> {
        if let Some(t) = claim.claim_time {
            return Ok(t);
        }
        let prior = store.prior_claim_time(
            claim.entrant_id,
            &claim.bonus_id,
            claim.odometer,
            claim.hour,
            claim.minute,
        )?;
        if let Some(text) = prior {
            if let Ok(t) = DateTime::parse_from_rfc3339(&text) {
                debug!(
                    "Entrant {} bonus {} is a resend, reusing {text}",
                    claim.entrant_id, claim.bonus_id
                );
                return Ok(t.with_timezone(&self.window.tz));
            }
        }
        Ok(self.resolve(claim.hour, claim.minute, sent))
    }
}
