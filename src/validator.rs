use crate::store::{ScoreStore, StoreError};
use log::{debug, info};

/// Result of the entrant lookup. The two flags are independent: test mode
/// answers unauthorized senders, live mode never records them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntrantCheck {
    pub known: bool,
    pub authorized: bool,
    pub rider_name: String,
}

#[derive(Debug, Clone)]
pub struct EntrantBonusValidator {
    match_email: bool,
    test_mode: bool,
    monitored_address: String,
}

impl EntrantBonusValidator {
    pub fn new(match_email: bool, test_mode: bool, monitored_address: &str) -> Self {
        EntrantBonusValidator {
            match_email,
            test_mode,
            monitored_address: monitored_address.to_string(),
        }
    }

    pub fn check_entrant(
        &self,
        store: &ScoreStore,
        entrant_id: i64,
        from_address: &str,
    ) -> Result<EntrantCheck, StoreError> {
        let contacts = match store.entrant_contacts(entrant_id)? {
            Some(contacts) if entrant_id > 0 => contacts,
            _ => {
                debug!("No such entrant {entrant_id}");
                return Ok(EntrantCheck::default());
            }
        };

        let authorized = if self.is_monitored(from_address) {
            true
        } else if !self.match_email && !self.test_mode {
            true
        } else if self.test_mode && !self.match_email {
            // Rehearsals only care that the sender is registered for the rally
            address_matches(from_address, &store.all_entrant_emails()?)
        } else {
            address_matches(from_address, &contacts.emails)
        };

        if !authorized {
            info!(
                "Received from {from_address} for rider {} <{}>, address not registered",
                contacts.rider_name,
                contacts.emails.join(",")
            );
        }

        Ok(EntrantCheck {
            known: true,
            authorized: authorized && !contacts.rider_name.trim().is_empty(),
            rider_name: contacts.rider_name,
        })
    }

    /// Description of a standard bonus; empty means unrecognized.
    pub fn check_bonus(&self, store: &ScoreStore, bonus_id: &str) -> Result<String, StoreError> {
        store.bonus_description(bonus_id)
    }

    fn is_monitored(&self, from_address: &str) -> bool {
        !self.monitored_address.is_empty()
            && from_address.eq_ignore_ascii_case(&self.monitored_address)
    }
}

/// Exact (case-insensitive) match, falling back to comparing only the part
/// before the `@` so aliases of the same account pass.
pub fn address_matches(from: &str, known: &[String]) -> bool {
    let from = from.trim();
    if from.is_empty() {
        return false;
    }
    let from_local = local_part(from);
    known.iter().any(|candidate| {
        let candidate = candidate.trim();
        candidate.eq_ignore_ascii_case(from)
            || (!from_local.is_empty() && local_part(candidate).eq_ignore_ascii_case(from_local))
    })
}

fn local_part(address: &str) -> &str {
    address.split('@').next().unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::seeded;

    #[test]
    fn test_exact_match() {
        let store = seeded();
        let v = EntrantBonusValidator::new(true, false, "claims@rally.example");
        let check = v.check_entrant(&store, 1, "Rider1@Gmail.com").unwrap();
        assert!(check.known);
        assert!(check.authorized);
        assert_eq!(check.rider_name, "Ann Rider");
    }

    #[test]
    fn test_local_part_fallback() {
        let store = seeded();
        let v = EntrantBonusValidator::new(true, false, "claims@rally.example");
        let check = v.check_entrant(&store, 1, "rider1@work.com").unwrap();
        assert!(check.known);
        assert!(check.authorized);
    }

    #[test]
    fn test_stranger_is_known_but_unauthorized() {
        let store = seeded();
        let v = EntrantBonusValidator::new(true, false, "claims@rally.example");
        let check = v.check_entrant(&store, 1, "someone@else.com").unwrap();
        assert!(check.known);
        assert!(!check.authorized);
    }

    #[test]
    fn test_team_mate_address() {
        let store = seeded();
        let v = EntrantBonusValidator::new(true, false, "claims@rally.example");
        assert!(v.check_entrant(&store, 3, "bob@example.com").unwrap().authorized);
    }

    #[test]
    fn test_monitored_address_always_authorized() {
        let store = seeded();
        let v = EntrantBonusValidator::new(true, false, "claims@rally.example");
        assert!(v.check_entrant(&store, 1, "CLAIMS@rally.example").unwrap().authorized);
    }

    #[test]
    fn test_matching_disabled() {
        let store = seeded();
        let v = EntrantBonusValidator::new(false, false, "claims@rally.example");
        assert!(v.check_entrant(&store, 1, "anyone@anywhere.com").unwrap().authorized);
        // Test mode without matching accepts any registered rider's address
        let v = EntrantBonusValidator::new(false, true, "claims@rally.example");
        assert!(v.check_entrant(&store, 1, "cat@example.net").unwrap().authorized);
        assert!(!v.check_entrant(&store, 1, "anyone@anywhere.com").unwrap().authorized);
    }

    #[test]
    fn test_unknown_entrant() {
        let store = seeded();
        let v = EntrantBonusValidator::new(false, false, "claims@rally.example");
        let check = v.check_entrant(&store, 99, "rider1@gmail.com").unwrap();
        assert_eq!(check, EntrantCheck::default());
        assert!(!v.check_entrant(&store, 0, "rider1@gmail.com").unwrap().known);
    }

    #[test]
    fn test_nameless_entrant_never_authorized() {
        let store = seeded();
        let v = EntrantBonusValidator::new(true, false, "claims@rally.example");
        let check = v.check_entrant(&store, 4, "ghost@example.com").unwrap();
        assert!(check.known);
        assert!(!check.authorized);
    }

    #[test]
    fn test_bonus_lookup() {
        let store = seeded();
        let v = EntrantBonusValidator::new(true, false, "");
        assert_eq!(v.check_bonus(&store, "AB").unwrap(), "Abbey ruins");
        assert!(v.check_bonus(&store, "NOPE").unwrap().is_empty());
    }

    #[test]
    fn test_address_matches() {
        let known = vec!["rider1@gmail.com".to_string()];
        assert!(address_matches("rider1@work.com", &known));
        assert!(address_matches("RIDER1@GMAIL.COM", &known));
        assert!(!address_matches("rider2@gmail.com", &known));
        assert!(!address_matches("", &known));
    }
}
