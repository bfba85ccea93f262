use crate::mailbox::{FetchedMessage, Mailbox, MailboxConnector, SearchCriteria, Uid};
use crate::pipeline::{Disposition, IngestError, Ingestor};
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Attempts per flag update before giving up on a set of messages.
pub const MAX_ACK_ATTEMPTS: usize = 10;

const DEALT_WITH_FLAGS: [&str; 1] = ["\\Flagged"];
const RETRY_FLAGS: [&str; 0] = [];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub requested: usize,
    pub seen: usize,
    pub accepted: Vec<Uid>,
    /// Left unread and flagged for manual handling.
    pub dealt_with: Vec<Uid>,
    /// Released so the next search offers them again.
    pub skipped: Vec<Uid>,
    pub stream_error: Option<String>,
    pub ack_error: Option<String>,
}

/// Per-cycle bookkeeping of which UIDs were handled and how.
#[derive(Debug, Clone)]
pub struct FetchCycle {
    batch: Vec<Uid>,
    current_uid: Option<Uid>,
    last_good_uid: Option<Uid>,
    handled: HashSet<Uid>,
    report: CycleReport,
}

impl FetchCycle {
    pub fn new(mut batch: Vec<Uid>) -> Self {
        batch.sort_unstable();
        batch.dedup();
        FetchCycle {
            report: CycleReport {
                requested: batch.len(),
                ..CycleReport::default()
            },
            batch,
            current_uid: None,
            last_good_uid: None,
            handled: HashSet::new(),
        }
    }

    pub fn current_uid(&self) -> Option<Uid> {
        self.current_uid
    }

    pub fn last_good_uid(&self) -> Option<Uid> {
        self.last_good_uid
    }

    pub fn begin(&mut self, uid: Uid) {
        self.current_uid = Some(uid);
        self.report.seen += 1;
    }

    pub fn record(&mut self, uid: Uid, result: &Result<Disposition, IngestError>) {
        if !self.handled.insert(uid) {
            return;
        }
        match result {
            Ok(Disposition::Accepted { .. }) => {
                self.report.accepted.push(uid);
                self.last_good_uid = Some(uid);
            }
            Ok(Disposition::Responded) => self.report.accepted.push(uid),
            Err(e) if e.is_retryable() => self.report.skipped.push(uid),
            Err(_) => self.report.dealt_with.push(uid),
        }
    }

    /// After the fetch stream dies nobody knows which of the remaining UIDs
    /// were delivered, so every one not yet handled is released for retry.
    /// Delivery is in ascending order, making these the UIDs after
    /// `last_good_uid`. Duplicates on the next cycle hit resend detection.
    pub fn recover(&mut self, cause: &str) {
        let pending: Vec<Uid> = self
            .batch
            .iter()
            .copied()
            .filter(|uid| !self.handled.contains(uid))
            .collect();
        for uid in pending {
            if self.last_good_uid.is_some_and(|good| uid < good) {
                warn!("Message {uid} was skipped by the server, releasing it too");
            }
            debug!("Releasing {uid} after stream failure");
            self.handled.insert(uid);
            self.report.skipped.push(uid);
        }
        self.report.stream_error = Some(cause.to_string());
    }

    pub fn finish(self) -> CycleReport {
        self.report
    }
}

/// Stop request shared between the signal listener and the polling loop.
/// The loop only looks at it between cycles, so a running cycle always
/// reaches its acknowledgement.
#[derive(Debug)]
pub struct ShutdownSignal {
    tx: watch::Sender<bool>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        ShutdownSignal { tx }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_requested(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once a stop has been requested, immediately if it already was.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|stop| *stop).await;
    }

    /// Installs the Ctrl-C handler now, so an interrupt during the first
    /// cycle is caught as well.
    pub fn listen_for_ctrl_c(self: &Arc<Self>) {
        let signal = Arc::clone(self);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Interrupted, stopping after the current cycle");
                    signal.trigger();
                }
                Err(e) => warn!("Can't listen for Ctrl-C: {e}"),
            }
        });
    }
}

fn blocking_failure(e: tokio::task::JoinError) -> IngestError {
    IngestError::FetchStreamFailure(format!("mailbox worker died: {e}"))
}

/// Search, stream and process one batch, then acknowledge it. Never fails:
/// problems end up in the report and the log.
pub async fn run_cycle(
    connector: Arc<dyn MailboxConnector>,
    ingestor: &Ingestor,
    criteria: SearchCriteria,
) -> CycleReport {
    let max_fetch = ingestor.config().max_fetch;
    let test_mode = ingestor.config().test_mode;

    let search_connector = connector.clone();
    let searched = tokio::task::spawn_blocking(move || {
        let mut mailbox = search_connector.connect()?;
        let uids = mailbox.search(&criteria)?;
        Ok::<_, crate::mailbox::MailboxError>((mailbox, uids))
    })
    .await
    .map_err(blocking_failure)
    .and_then(|r| r.map_err(|e| IngestError::FetchStreamFailure(e.to_string())));

    let (mut mailbox, mut uids) = match searched {
        Ok(found) => found,
        Err(e) => {
            warn!("Mailbox search failed: {e}");
            return CycleReport {
                stream_error: Some(e.to_string()),
                ..CycleReport::default()
            };
        }
    };

    if max_fetch > 0 && uids.len() > max_fetch {
        uids.truncate(max_fetch);
    }
    if uids.is_empty() {
        mailbox.logout();
        return CycleReport::default();
    }
    info!("Fetching {} message(s)", uids.len());

    let mut cycle = FetchCycle::new(uids.clone());
    let (tx, mut rx) = mpsc::channel::<FetchedMessage>(uids.len() + 1);
    let worker = tokio::task::spawn_blocking(move || {
        let result = mailbox.fetch(&uids, &mut |message| tx.blocking_send(message).is_ok());
        (mailbox, result)
    });

    while let Some(message) = rx.recv().await {
        let uid = message.uid;
        cycle.begin(uid);
        debug!("Considering msg #{}={uid}", cycle.report.seen);
        let result = ingestor.process(&message);
        match &result {
            Ok(Disposition::Accepted { claim_id }) => debug!("{uid} stored as claim {claim_id}"),
            Ok(Disposition::Responded) => {}
            Err(e) if e.is_retryable() => warn!("{uid} will be retried: {e}"),
            Err(e) => info!("{uid} left for manual handling: {e}"),
        }
        cycle.record(uid, &result);
    }

    let session = match worker.await {
        Ok((mailbox, Ok(()))) => Some(mailbox),
        Ok((mailbox, Err(e))) => {
            fail_stream(&mut cycle, &e.to_string());
            Some(mailbox)
        }
        Err(e) => {
            fail_stream(&mut cycle, &blocking_failure(e).to_string());
            None
        }
    };

    let mut report = cycle.finish();
    let ack_connector = connector.clone();
    let ack_report = report.clone();
    let acked = tokio::task::spawn_blocking(move || {
        acknowledge(ack_connector.as_ref(), session, &ack_report, test_mode)
    })
    .await
    .map_err(|e| IngestError::AcknowledgeFailure(e.to_string()))
    .and_then(|r| r);
    if let Err(e) = acked {
        report.ack_error = Some(e.to_string());
    }
    report
}

fn fail_stream(cycle: &mut FetchCycle, cause: &str) {
    error!(
        "Fetch stream failed at msg={} ({} / {}), last claim {}: {cause}",
        cycle.current_uid().map_or("-".to_string(), |u| u.to_string()),
        cycle.report.seen,
        cycle.report.requested,
        cycle.last_good_uid().map_or("-".to_string(), |u| u.to_string()),
    );
    cycle.recover(cause);
}

/// Applies the batch's flag changes: dealt-with messages become unread and
/// flagged, skipped ones have their flags cleared. Test mode leaves the
/// mailbox alone. Each set gets up to `MAX_ACK_ATTEMPTS`, reconnecting
/// after a failure.
pub fn acknowledge(
    connector: &dyn MailboxConnector,
    mut session: Option<Box<dyn Mailbox>>,
    report: &CycleReport,
    test_mode: bool,
) -> Result<(), IngestError> {
    let mut abandoned = Vec::new();
    if !test_mode {
        let sets: [(&[Uid], &[&str], &str); 2] = [
            (&report.dealt_with, &DEALT_WITH_FLAGS, "leaving unread"),
            (&report.skipped, &RETRY_FLAGS, "releasing for retry"),
        ];
        for (uids, flags, label) in sets {
            if uids.is_empty() {
                continue;
            }
            debug!("{label} {}", crate::mailbox::format_uid_set(uids));
            if !apply_flags(connector, &mut session, uids, flags) {
                error!(
                    "Giving up {label} {} after {MAX_ACK_ATTEMPTS} attempts",
                    crate::mailbox::format_uid_set(uids)
                );
                abandoned.push(crate::mailbox::format_uid_set(uids));
            }
        }
    }
    if let Some(mut mailbox) = session {
        mailbox.logout();
    }
    if abandoned.is_empty() {
        Ok(())
    } else {
        Err(IngestError::AcknowledgeFailure(abandoned.join(" ")))
    }
}

fn apply_flags(
    connector: &dyn MailboxConnector,
    session: &mut Option<Box<dyn Mailbox>>,
    uids: &[Uid],
    flags: &[&str],
) -> bool {
    for attempt in 1..=MAX_ACK_ATTEMPTS {
        let mut mailbox = match session.take() {
            Some(mailbox) => mailbox,
            None => match connector.connect() {
                Ok(mailbox) => mailbox,
                Err(e) => {
                    warn!("Flag update attempt {attempt}: can't connect: {e}");
                    continue;
                }
            },
        };
        match mailbox.set_flags(uids, flags) {
            Ok(()) => {
                *session = Some(mailbox);
                return true;
            }
            Err(e) => {
                warn!("Flag update attempt {attempt} failed: {e}");
                mailbox.logout();
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::mailbox::MailboxError;
    use crate::message::tests::claim_mail;
    use crate::pipeline::tests::{fetched, ingestor, Outbox};
    use crate::store::StoreError;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Script {
        inbox: Vec<(Uid, Vec<u8>)>,
        fail_after: Option<usize>,
        connect_failures: usize,
        flag_failures: usize,
        connects: usize,
        flag_calls: Vec<(Vec<Uid>, Vec<String>)>,
    }

    #[derive(Clone, Default)]
    struct ScriptedConnector(Arc<Mutex<Script>>);

    struct ScriptedMailbox(Arc<Mutex<Script>>);

    impl MailboxConnector for ScriptedConnector {
        fn connect(&self) -> Result<Box<dyn Mailbox>, MailboxError> {
            let mut script = self.0.lock().unwrap();
            script.connects += 1;
            if script.connect_failures > 0 {
                script.connect_failures -= 1;
                return Err(MailboxError::Other("connection refused".to_string()));
            }
            Ok(Box::new(ScriptedMailbox(self.0.clone())))
        }
    }

    impl Mailbox for ScriptedMailbox {
        fn search(&mut self, _criteria: &SearchCriteria) -> Result<Vec<Uid>, MailboxError> {
            Ok(self.0.lock().unwrap().inbox.iter().map(|(uid, _)| *uid).collect())
        }

        fn fetch(
            &mut self,
            uids: &[Uid],
            deliver: &mut dyn FnMut(FetchedMessage) -> bool,
        ) -> Result<(), MailboxError> {
            let (messages, fail_after) = {
                let script = self.0.lock().unwrap();
                let messages: Vec<_> = script
                    .inbox
                    .iter()
                    .filter(|(uid, _)| uids.contains(uid))
                    .cloned()
                    .collect();
                (messages, script.fail_after)
            };
            for (n, (uid, raw)) in messages.into_iter().enumerate() {
                if fail_after == Some(n) {
                    return Err(MailboxError::Other("connection reset".to_string()));
                }
                if !deliver(fetched(uid, raw)) {
                    break;
                }
            }
            Ok(())
        }

        fn set_flags(&mut self, uids: &[Uid], flags: &[&str]) -> Result<(), MailboxError> {
            let mut script = self.0.lock().unwrap();
            if script.flag_failures > 0 {
                script.flag_failures -= 1;
                return Err(MailboxError::Other("NO STORE failed".to_string()));
            }
            script
                .flag_calls
                .push((uids.to_vec(), flags.iter().map(|f| f.to_string()).collect()));
            Ok(())
        }

        fn logout(&mut self) {}
    }

    fn inbox(count: u32) -> Vec<(Uid, Vec<u8>)> {
        (1..=count)
            .map(|uid| {
                (
                    uid,
                    claim_mail("rider1@gmail.com", &format!("1 AB {} 09{uid:02}", 12000 + uid), &[]),
                )
            })
            .collect()
    }

    fn retry() -> Result<Disposition, IngestError> {
        Err(IngestError::PersistenceFailure(StoreError::NoRallyParams))
    }

    #[test]
    fn test_recovery_after_last_good() {
        let mut cycle = FetchCycle::new((1..=10).collect());
        for uid in 1..=5 {
            cycle.begin(uid);
            cycle.record(uid, &Ok(Disposition::Accepted { claim_id: uid as i64 }));
        }
        assert_eq!(cycle.last_good_uid(), Some(5));
        cycle.recover("connection reset");
        let report = cycle.finish();
        assert_eq!(report.accepted, vec![1, 2, 3, 4, 5]);
        assert_eq!(report.skipped, vec![6, 7, 8, 9, 10]);
        assert!(report.dealt_with.is_empty());
        assert_eq!(report.stream_error.as_deref(), Some("connection reset"));
    }

    #[test]
    fn test_recovery_keeps_classifications() {
        let mut cycle = FetchCycle::new(vec![11, 12, 13, 14, 15, 16]);
        cycle.begin(11);
        cycle.record(11, &Ok(Disposition::Accepted { claim_id: 1 }));
        cycle.begin(12);
        cycle.record(12, &Err(IngestError::ParseRejection("hello".to_string())));
        cycle.begin(13);
        cycle.record(13, &retry());
        cycle.begin(14);
        cycle.record(14, &Ok(Disposition::Accepted { claim_id: 2 }));
        assert_eq!(cycle.current_uid(), Some(14));
        cycle.recover("EOF");
        let report = cycle.finish();
        assert_eq!(report.accepted, vec![11, 14]);
        assert_eq!(report.dealt_with, vec![12]);
        assert_eq!(report.skipped, vec![13, 15, 16]);
        assert_eq!(report.seen, 4);
        assert_eq!(report.requested, 6);
    }

    #[test]
    fn test_failure_before_any_claim_releases_whole_batch() {
        let mut cycle = FetchCycle::new(vec![3, 1, 2]);
        cycle.recover("timeout");
        assert_eq!(cycle.finish().skipped, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_stream_failure_mid_batch() {
        let dir = tempfile::tempdir().unwrap();
        let ing = ingestor(dir.path(), Config::default(), Outbox::default());
        let script = ScriptedConnector::default();
        {
            let mut s = script.0.lock().unwrap();
            s.inbox = inbox(10);
            s.fail_after = Some(5);
        }
        let report = run_cycle(Arc::new(script.clone()), &ing, SearchCriteria::default()).await;
        assert_eq!(report.accepted, vec![1, 2, 3, 4, 5]);
        assert_eq!(report.skipped, vec![6, 7, 8, 9, 10]);
        assert!(report.stream_error.is_some());
        assert!(report.ack_error.is_none());
        assert_eq!(ing.store().count("ebclaims"), 5);

        let s = script.0.lock().unwrap();
        assert_eq!(s.flag_calls, vec![(vec![6, 7, 8, 9, 10], Vec::<String>::new())]);
    }

    #[tokio::test]
    async fn test_mixed_batch_flags() {
        let dir = tempfile::tempdir().unwrap();
        let ing = ingestor(dir.path(), Config::default(), Outbox::default());
        let script = ScriptedConnector::default();
        {
            let mut s = script.0.lock().unwrap();
            s.inbox = inbox(2);
            s.inbox.push((3, claim_mail("rider1@gmail.com", "hello marshal", &[])));
            s.inbox.push((4, claim_mail("nobody@else.com", "1 AB 100 1000", &[])));
        }
        let report = run_cycle(Arc::new(script.clone()), &ing, SearchCriteria::default()).await;
        assert_eq!(report.accepted, vec![1, 2]);
        assert_eq!(report.dealt_with, vec![3, 4]);
        assert!(report.skipped.is_empty());
        assert!(report.stream_error.is_none());

        let s = script.0.lock().unwrap();
        assert_eq!(
            s.flag_calls,
            vec![(vec![3, 4], vec!["\\Flagged".to_string()])]
        );
    }

    #[tokio::test]
    async fn test_max_fetch_caps_batch() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            max_fetch: 3,
            ..Config::default()
        };
        let ing = ingestor(dir.path(), config, Outbox::default());
        let script = ScriptedConnector::default();
        script.0.lock().unwrap().inbox = inbox(8);
        let report = run_cycle(Arc::new(script), &ing, SearchCriteria::default()).await;
        assert_eq!(report.requested, 3);
        assert_eq!(report.accepted, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_search_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let ing = ingestor(dir.path(), Config::default(), Outbox::default());
        let script = ScriptedConnector::default();
        script.0.lock().unwrap().connect_failures = 1;
        let report = run_cycle(Arc::new(script), &ing, SearchCriteria::default()).await;
        assert!(report.stream_error.is_some());
        assert_eq!(report.requested, 0);
    }

    #[tokio::test]
    async fn test_test_mode_leaves_flags_alone() {
        let dir = tempfile::tempdir().unwrap();
        let outbox = Outbox::default();
        let config = Config {
            test_mode: true,
            ..Config::default()
        };
        let ing = ingestor(dir.path(), config, outbox.clone());
        let script = ScriptedConnector::default();
        script.0.lock().unwrap().inbox = inbox(2);
        let report = run_cycle(Arc::new(script.clone()), &ing, SearchCriteria::default()).await;
        assert_eq!(report.accepted, vec![1, 2]);
        assert!(script.0.lock().unwrap().flag_calls.is_empty());
        assert_eq!(outbox.0.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_acknowledge_retries_then_succeeds() {
        let script = ScriptedConnector::default();
        script.0.lock().unwrap().flag_failures = 3;
        let report = CycleReport {
            skipped: vec![7, 8],
            ..CycleReport::default()
        };
        assert!(acknowledge(&script, None, &report, false).is_ok());
        let s = script.0.lock().unwrap();
        assert_eq!(s.connects, 4);
        assert_eq!(s.flag_calls.len(), 1);
    }

    #[test]
    fn test_acknowledge_gives_up() {
        let script = ScriptedConnector::default();
        script.0.lock().unwrap().flag_failures = 100;
        let report = CycleReport {
            dealt_with: vec![3],
            skipped: vec![7, 8],
            ..CycleReport::default()
        };
        let err = acknowledge(&script, None, &report, false).unwrap_err();
        assert!(matches!(err, IngestError::AcknowledgeFailure(_)));
        let s = script.0.lock().unwrap();
        assert_eq!(s.connects, 2 * MAX_ACK_ATTEMPTS);
        assert!(s.flag_calls.is_empty());
    }

    #[test]
    fn test_acknowledge_survives_connect_failures() {
        let script = ScriptedConnector::default();
        script.0.lock().unwrap().connect_failures = 2;
        let report = CycleReport {
            dealt_with: vec![3],
            ..CycleReport::default()
        };
        assert!(acknowledge(&script, None, &report, false).is_ok());
        assert_eq!(script.0.lock().unwrap().connects, 3);
    }

    #[tokio::test]
    async fn test_shutdown_signal() {
        let signal = Arc::new(ShutdownSignal::new());
        assert!(!signal.is_requested());

        let waiter = Arc::clone(&signal);
        let handle = tokio::spawn(async move { waiter.wait().await });
        tokio::task::yield_now().await;
        assert!(!handle.is_finished());

        signal.trigger();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(signal.is_requested());
        // Requests made before anyone waits are not lost.
        tokio::time::timeout(std::time::Duration::from_secs(1), signal.wait())
            .await
            .unwrap();
    }
}
