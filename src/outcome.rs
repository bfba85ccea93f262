use crate::mailbox::Uid;
use crate::subject::ParsedClaim;
use chrono::DateTime;
use chrono_tz::Tz;

/// Everything learned about one claim message. Feeds both the stored claim
/// row and the test-mode reply.
#[derive(Debug, Clone)]
pub struct ClaimOutcome {
    pub email_id: Uid,
    pub claim: ParsedClaim,
    /// Subject as claimed, possibly taken from the body.
    pub subject: String,
    pub subject_from_body: bool,
    /// Whether the lenient pattern recognised the subject at all.
    pub subject_matches: bool,
    pub strict_ok: bool,
    pub from: String,
    pub from_address: String,
    pub entrant_known: bool,
    pub address_authorized: bool,
    pub bonus_known: bool,
    pub bonus_description: String,
    /// Negative when some photos could not be stored.
    pub photo_count: i64,
    pub photo_ids: String,
    pub photo_time: Option<DateTime<Tz>>,
    pub claim_time: DateTime<Tz>,
    /// Date header, or the server's internal date when there is none.
    pub sent_at: DateTime<Tz>,
    pub received_at: DateTime<Tz>,
    pub first_seen: DateTime<Tz>,
}

impl ClaimOutcome {
    pub fn claim_is_good(&self, match_email: bool) -> bool {
        self.claim.ok
            && self.claim.time_valid
            && self.entrant_known
            && (self.address_authorized || !match_email)
            && self.bonus_known
    }

    pub fn photos_acceptable(&self, max_extra_photos: usize) -> bool {
        self.photo_count > 0 && self.photo_count <= 1 + max_extra_photos as i64
    }

    pub fn is_perfect(&self, match_email: bool, max_extra_photos: usize) -> bool {
        self.claim_is_good(match_email) && self.photos_acceptable(max_extra_photos)
    }
}
