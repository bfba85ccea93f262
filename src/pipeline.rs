use crate::attachments::{AttachmentProcessor, ImageConverter};
use crate::claim_time::{earliest_transit, ClaimTimeResolver, RallyWindow};
use crate::config::{Config, ConfigError};
use crate::mailbox::FetchedMessage;
use crate::message::ClaimEmail;
use crate::outcome::ClaimOutcome;
use crate::recorder::ClaimRecorder;
use crate::responder::{render, DiagnosticResponder};
use crate::store::{ScoreStore, StoreError};
use crate::subject::{ParseMode, SubjectParser};
use crate::validator::EntrantBonusValidator;
use chrono::Utc;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};

/// What happened to a message that went through cleanly.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Accepted { claim_id: i64 },
    /// Test mode: a diagnostic reply was produced instead of a claim.
    Responded,
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("not a claim: {0}")]
    ParseRejection(String),
    #[error("rejected: {0}")]
    AuthorizationRejection(String),
    #[error("photos not stored: {0}")]
    AttachmentFailure(String),
    #[error("database: {0}")]
    PersistenceFailure(#[from] StoreError),
    #[error("fetch failed: {0}")]
    FetchStreamFailure(String),
    #[error("flag update failed: {0}")]
    AcknowledgeFailure(String),
}

impl IngestError {
    /// Retryable messages are released for the next cycle; the rest are
    /// left flagged for a human.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IngestError::AttachmentFailure(_)
                | IngestError::PersistenceFailure(_)
                | IngestError::FetchStreamFailure(_)
        )
    }
}

/// Runs one message through parse, timing, validation, photos and
/// recording (or the test-mode reply).
pub struct Ingestor {
    config: Config,
    window: RallyWindow,
    parser: SubjectParser,
    resolver: ClaimTimeResolver,
    validator: EntrantBonusValidator,
    photos: AttachmentProcessor,
    recorder: ClaimRecorder,
    store: ScoreStore,
    responder: Box<dyn DiagnosticResponder>,
    image_root: PathBuf,
}

impl Ingestor {
    pub fn new(
        config: Config,
        window: RallyWindow,
        store: ScoreStore,
        image_root: &Path,
        responder: Box<dyn DiagnosticResponder>,
    ) -> Result<Self, ConfigError> {
        let tz = window.tz;
        Ok(Ingestor {
            parser: SubjectParser::new(&config.subject_pattern, &config.strict_pattern, tz)?,
            resolver: ClaimTimeResolver::new(window.clone()),
            validator: EntrantBonusValidator::new(config.match_email, config.test_mode, &config.login),
            photos: build_photos(&config, image_root, tz),
            recorder: ClaimRecorder::new(tz),
            config,
            window,
            store,
            responder,
            image_root: image_root.to_path_buf(),
        })
    }

    /// Swaps in fresh settings between cycles. On error nothing changes.
    pub fn reconfigure(
        &mut self,
        config: Config,
        window: RallyWindow,
        responder: Box<dyn DiagnosticResponder>,
    ) -> Result<(), ConfigError> {
        let tz = window.tz;
        self.parser = SubjectParser::new(&config.subject_pattern, &config.strict_pattern, tz)?;
        self.resolver = ClaimTimeResolver::new(window.clone());
        self.validator =
            EntrantBonusValidator::new(config.match_email, config.test_mode, &config.login);
        self.photos = build_photos(&config, &self.image_root, tz);
        self.recorder = ClaimRecorder::new(tz);
        self.responder = responder;
        self.config = config;
        self.window = window;
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn window(&self) -> &RallyWindow {
        &self.window
    }

    pub fn store(&self) -> &ScoreStore {
        &self.store
    }

    pub fn process(&self, message: &FetchedMessage) -> Result<Disposition, IngestError> {
        let uid = message.uid;
        let tz = self.window.tz;
        let raw = message
            .body
            .as_deref()
            .ok_or_else(|| IngestError::FetchStreamFailure("server returned no body".to_string()))?;

        if let Some(dir) = self.config.trap_dir() {
            let path = dir.join(format!("{uid}.eml"));
            if let Err(e) = std::fs::write(&path, raw) {
                warn!("Can't trap message {uid} to {}: {e}", path.display());
            }
        }

        let email = ClaimEmail::parse(raw, tz)
            .map_err(|e| IngestError::ParseRejection(format!("unreadable MIME: {e}")))?;

        let mut subject = email.subject.clone();
        let mut subject_from_body = false;
        let mut claim = self.parser.parse(&subject, ParseMode::Lenient);
        if subject.is_empty() && self.config.allow_body {
            debug!("Message {uid}: no subject, parsing body");
            let from_body = self.parser.parse(&email.text_body, ParseMode::Lenient);
            if from_body.ok {
                subject = email.text_body.clone();
                subject_from_body = true;
                claim = from_body;
            }
        }
        info!("{uid} [ {subject} ] from {}", email.from_address);

        if !claim.ok && !self.config.test_mode {
            return Err(IngestError::ParseRejection(subject));
        }

        let received_at = message
            .internal_date
            .map(|d| d.with_timezone(&tz))
            .unwrap_or_else(|| Utc::now().with_timezone(&tz));
        let sent_at = email.date.unwrap_or(received_at);

        let claim_time = self.resolver.resolve_claim(&claim, &sent_at, &self.store)?;
        let entrant = self
            .validator
            .check_entrant(&self.store, claim.entrant_id, &email.from_address)?;
        let bonus_description = self.validator.check_bonus(&self.store, &claim.bonus_id)?;
        debug!(
            "Message {uid}: entrant {} known={} authorized={} bonus {} '{}'",
            claim.entrant_id, entrant.known, entrant.authorized, claim.bonus_id, bonus_description
        );

        if !self.config.test_mode && !(entrant.known && entrant.authorized) {
            return Err(IngestError::AuthorizationRejection(format!(
                "{} is not registered for entrant {} (known={})",
                email.from_address, claim.entrant_id, entrant.known
            )));
        }

        let strict_ok =
            self.config.check_strict && self.parser.parse(&subject, ParseMode::Strict).ok;
        let photos = self
            .photos
            .process(&self.store, &email, claim.entrant_id, &claim.bonus_id, uid);
        if !photos.all_ok && !self.config.test_mode {
            return Err(IngestError::AttachmentFailure(format!(
                "{} of {} stored",
                photos.ids.len(),
                photos.count
            )));
        }

        let outcome = ClaimOutcome {
            email_id: uid,
            subject_matches: self.parser.lenient_pattern().is_match(&subject),
            subject,
            subject_from_body,
            strict_ok,
            from: email.from.clone(),
            from_address: email.from_address.clone(),
            entrant_known: entrant.known,
            address_authorized: entrant.authorized,
            bonus_known: !bonus_description.is_empty(),
            bonus_description,
            photo_count: photos.signed_count(),
            photo_ids: photos.id_list(),
            photo_time: photos.latest,
            claim_time,
            sent_at,
            received_at,
            first_seen: earliest_transit(received_at, &email.received, tz),
            claim,
        };

        if self.config.test_mode {
            let reply = render(&outcome, &self.config, &self.window);
            match self.responder.send(&reply) {
                Ok(()) => info!("Sent test response to {}", reply.to),
                Err(e) => warn!("Can't send test response to {}: {e:#}", reply.to),
            }
            return Ok(Disposition::Responded);
        }

        let claim_id = self.recorder.record(&self.store, &outcome)?;
        Ok(Disposition::Accepted { claim_id })
    }
}

fn build_photos(config: &Config, image_root: &Path, tz: chrono_tz::Tz) -> AttachmentProcessor {
    let converter = if config.convert_heic && !config.heic_converter.is_empty() {
        Some(ImageConverter::new(&config.heic_converter))
    } else {
        None
    };
    AttachmentProcessor::new(image_root, &config.image_folder, converter, tz, config.test_mode)
}
