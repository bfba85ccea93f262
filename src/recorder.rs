use crate::claim_time::stamp;
use crate::mailbox::Uid;
use crate::outcome::ClaimOutcome;
use crate::store::{ScoreStore, StoreError};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use log::info;

/// One `ebclaims` row. Timestamps are already in their stored text form.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimRecord {
    pub logged_at: String,
    pub sent_at: String,
    pub entrant_id: i64,
    pub bonus_id: String,
    pub odometer: i64,
    pub received_at: String,
    pub email_id: Uid,
    pub claim_hour: u32,
    pub claim_minute: u32,
    pub claim_time: String,
    pub subject: String,
    pub extra: String,
    pub strict_ok: bool,
    /// Empty when no photo carried a timestamp.
    pub photo_time: String,
    pub first_time: String,
    pub photo_ids: String,
}

impl ClaimRecord {
    pub fn from_outcome(outcome: &ClaimOutcome, logged_at: &DateTime<Tz>) -> Self {
        ClaimRecord {
            logged_at: stamp(logged_at),
            sent_at: stamp(&outcome.sent_at),
            entrant_id: outcome.claim.entrant_id,
            bonus_id: outcome.claim.bonus_id.clone(),
            odometer: outcome.claim.odometer,
            received_at: stamp(&outcome.received_at),
            email_id: outcome.email_id,
            claim_hour: outcome.claim.hour,
            claim_minute: outcome.claim.minute,
            claim_time: stamp(&outcome.claim_time),
            subject: outcome.subject.clone(),
            extra: outcome.claim.extra.clone(),
            strict_ok: outcome.strict_ok,
            photo_time: outcome.photo_time.as_ref().map(stamp).unwrap_or_default(),
            first_time: stamp(&outcome.first_seen),
            photo_ids: outcome.photo_ids.clone(),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_test(claim: &crate::subject::ParsedClaim, claim_time: &DateTime<Tz>) -> Self {
        ClaimRecord {
            logged_at: stamp(claim_time),
            sent_at: stamp(claim_time),
            entrant_id: claim.entrant_id,
            bonus_id: claim.bonus_id.clone(),
            odometer: claim.odometer,
            received_at: stamp(claim_time),
            email_id: 1,
            claim_hour: claim.hour,
            claim_minute: claim.minute,
            claim_time: stamp(claim_time),
            subject: String::new(),
            extra: claim.extra.clone(),
            strict_ok: false,
            photo_time: String::new(),
            first_time: stamp(claim_time),
            photo_ids: String::new(),
        }
    }
}

/// Writes accepted claims. A failed insert is reported, never swallowed, so
/// the message can be offered again.
#[derive(Debug, Clone)]
pub struct ClaimRecorder {
    tz: Tz,
}

impl ClaimRecorder {
    pub fn new(tz: Tz) -> Self {
        ClaimRecorder { tz }
    }

    pub fn record(&self, store: &ScoreStore, outcome: &ClaimOutcome) -> Result<i64, StoreError> {
        let now = Utc::now().with_timezone(&self.tz);
        self.record_at(store, outcome, &now)
    }

    pub fn record_at(
        &self,
        store: &ScoreStore,
        outcome: &ClaimOutcome,
        logged_at: &DateTime<Tz>,
    ) -> Result<i64, StoreError> {
        let record = ClaimRecord::from_outcome(outcome, logged_at);
        let id = store.insert_claim(&record)?;
        info!("Claiming #{} [ {} ]", outcome.email_id, outcome.subject);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::tests::good_outcome;
    use crate::store::tests::seeded;

    #[test]
    fn test_record_fields() {
        let outcome = good_outcome();
        let record = ClaimRecord::from_outcome(&outcome, &outcome.sent_at);
        assert_eq!(record.claim_time, "2024-06-02T09:58:00+01:00");
        assert_eq!(record.sent_at, "2024-06-02T10:05:00+01:00");
        assert_eq!(record.photo_time, "");
        assert_eq!((record.claim_hour, record.claim_minute), (9, 58));
        assert_eq!(record.photo_ids, "3");
        assert!(record.strict_ok);
    }

    #[test]
    fn test_record_inserts_row() {
        let store = seeded();
        let outcome = good_outcome();
        let recorder = ClaimRecorder::new(chrono_tz::Europe::London);
        recorder.record(&store, &outcome).unwrap();
        assert_eq!(store.count("ebclaims"), 1);
        let (subject, email_id): (String, u32) = store
            .connection()
            .query_row("SELECT Subject, EmailID FROM ebclaims", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!(subject, "1 AB 12000 0958");
        assert_eq!(email_id, 17);
    }

    #[test]
    fn test_record_failure_is_reported() {
        let store = seeded();
        store.connection().execute_batch("DROP TABLE ebclaims").unwrap();
        let recorder = ClaimRecorder::new(chrono_tz::Europe::London);
        assert!(recorder.record(&store, &good_outcome()).is_err());
    }
}
