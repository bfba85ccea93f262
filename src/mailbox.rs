use chrono::{DateTime, FixedOffset, NaiveDate};
use log::debug;

pub type Uid = u32;

type ImapSession = imap::Session<native_tls::TlsStream<std::net::TcpStream>>;

/// Messages requested per FETCH command.
const FETCH_CHUNK: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("TLS setup failed: {0}")]
    Tls(#[from] native_tls::Error),
    #[error("IMAP error: {0}")]
    Imap(#[from] imap::Error),
    #[error("login to {server} failed: {source}")]
    Login { server: String, source: imap::Error },
    #[error("{0}")]
    Other(String),
}

/// Server-side selection of candidate claim messages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchCriteria {
    pub without_flags: Vec<String>,
    pub sent_since: Option<NaiveDate>,
    pub sent_before: Option<NaiveDate>,
}

impl SearchCriteria {
    pub fn to_query(&self) -> String {
        let mut terms: Vec<String> = self
            .without_flags
            .iter()
            .map(|flag| match flag.to_ascii_lowercase().as_str() {
                "\\seen" => "UNSEEN".to_string(),
                "\\flagged" => "UNFLAGGED".to_string(),
                "\\answered" => "UNANSWERED".to_string(),
                "\\deleted" => "UNDELETED".to_string(),
                "\\draft" => "UNDRAFT".to_string(),
                _ => format!("UNKEYWORD {flag}"),
            })
            .collect();
        if let Some(date) = self.sent_since {
            terms.push(format!("SENTSINCE {}", imap_date(date)));
        }
        if let Some(date) = self.sent_before {
            terms.push(format!("SENTBEFORE {}", imap_date(date)));
        }
        if terms.is_empty() {
            "ALL".to_string()
        } else {
            terms.join(" ")
        }
    }
}

fn imap_date(date: NaiveDate) -> String {
    date.format("%-d-%b-%Y").to_string()
}

/// Compact IMAP sequence set, e.g. `1:3,7,9:10`.
pub fn format_uid_set(uids: &[Uid]) -> String {
    let mut sorted = uids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut parts = Vec::new();
    let mut iter = sorted.into_iter().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end += 1;
            iter.next();
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{start}:{end}"));
        }
    }
    parts.join(",")
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchedMessage {
    pub uid: Uid,
    pub internal_date: Option<DateTime<FixedOffset>>,
    /// Full RFC 822 text; absent if the server returned no body.
    pub body: Option<Vec<u8>>,
}

/// One logged-in session on the claims inbox.
pub trait Mailbox: Send {
    fn search(&mut self, criteria: &SearchCriteria) -> Result<Vec<Uid>, MailboxError>;

    /// Hands each message to `deliver` as it arrives. Stops early when
    /// `deliver` returns false.
    fn fetch(
        &mut self,
        uids: &[Uid],
        deliver: &mut dyn FnMut(FetchedMessage) -> bool,
    ) -> Result<(), MailboxError>;

    /// Replaces the flags on `uids`; an empty list clears them.
    fn set_flags(&mut self, uids: &[Uid], flags: &[&str]) -> Result<(), MailboxError>;

    fn logout(&mut self);
}

pub trait MailboxConnector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn Mailbox>, MailboxError>;
}

#[derive(Debug, Clone)]
pub struct ImapConnector {
    host: String,
    port: u16,
    login: String,
    password: String,
}

impl ImapConnector {
    pub fn new(host: &str, port: u16, login: &str, password: &str) -> Self {
        ImapConnector {
            host: host.to_string(),
            port,
            login: login.to_string(),
            password: password.to_string(),
        }
    }
}

impl MailboxConnector for ImapConnector {
    fn connect(&self) -> Result<Box<dyn Mailbox>, MailboxError> {
        let tls = native_tls::TlsConnector::builder().build()?;
        let client = imap::connect((self.host.as_str(), self.port), self.host.as_str(), &tls)?;
        let mut session = client
            .login(&self.login, &self.password)
            .map_err(|(source, _)| MailboxError::Login {
                server: self.host.clone(),
                source,
            })?;
        session.select("INBOX")?;
        debug!("Connected to {}:{} as {}", self.host, self.port, self.login);
        Ok(Box::new(ImapMailbox { session }))
    }
}

pub struct ImapMailbox {
    session: ImapSession,
}

impl Mailbox for ImapMailbox {
    fn search(&mut self, criteria: &SearchCriteria) -> Result<Vec<Uid>, MailboxError> {
        let query = criteria.to_query();
        debug!("UID SEARCH {query}");
        let mut uids: Vec<Uid> = self.session.uid_search(&query)?.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    fn fetch(
        &mut self,
        uids: &[Uid],
        deliver: &mut dyn FnMut(FetchedMessage) -> bool,
    ) -> Result<(), MailboxError> {
        for chunk in uids.chunks(FETCH_CHUNK) {
            // RFC822 marks the messages \Seen
            let fetches = self
                .session
                .uid_fetch(format_uid_set(chunk), "(UID RFC822 INTERNALDATE)")?;
            for fetch in fetches.iter() {
                let Some(uid) = fetch.uid else {
                    continue;
                };
                let message = FetchedMessage {
                    uid,
                    internal_date: fetch.internal_date(),
                    body: fetch.body().map(|b| b.to_vec()),
                };
                if !deliver(message) {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn set_flags(&mut self, uids: &[Uid], flags: &[&str]) -> Result<(), MailboxError> {
        if uids.is_empty() {
            return Ok(());
        }
        let query = format!("FLAGS.SILENT ({})", flags.join(" "));
        self.session.uid_store(format_uid_set(uids), &query)?;
        Ok(())
    }

    fn logout(&mut self) {
        if let Err(e) = self.session.logout() {
            debug!("Logout failed: {e}");
        }
    }
}
