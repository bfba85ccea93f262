use crate::recorder::ClaimRecord;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("no rally parameters in database")]
    NoRallyParams,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RallyParams {
    pub title: String,
    pub start: String,
    pub finish: String,
    pub timezone: String,
}

/// Name and known addresses for an entrant and any team mates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntrantContacts {
    pub rider_name: String,
    pub emails: Vec<String>,
}

/// The scoring database shared with the rest of the rally software.
pub struct ScoreStore {
    conn: Connection,
}

impl ScoreStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        // The scoring UI writes to the same file
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(ScoreStore { conn })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Ok(ScoreStore {
            conn: Connection::open_in_memory()?,
        })
    }

    /// Creates the tables this tool touches when they are missing.
    pub fn ensure_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS rallyparams (
                RallyTitle TEXT,
                StartTime TEXT,
                FinishTime TEXT,
                LocalTZ TEXT,
                ebcsettings TEXT DEFAULT '',
                EmailParams TEXT DEFAULT ''
            );
            CREATE TABLE IF NOT EXISTS entrants (
                EntrantID INTEGER PRIMARY KEY,
                RiderName TEXT,
                Email TEXT,
                TeamID INTEGER DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS bonuses (
                BonusID TEXT PRIMARY KEY,
                BriefDesc TEXT,
                Points INTEGER DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS ebclaims (
                LoggedAt TEXT,
                DateTime TEXT,
                EntrantID INTEGER,
                BonusID TEXT,
                OdoReading INTEGER,
                FinalTime TEXT,
                EmailID INTEGER,
                ClaimHH INTEGER,
                ClaimMM INTEGER,
                ClaimTime TEXT,
                Subject TEXT,
                ExtraField TEXT,
                StrictOk INTEGER,
                AttachmentTime TEXT,
                FirstTime TEXT,
                PhotoID TEXT
            );
            CREATE TABLE IF NOT EXISTS ebcphotos (
                EntrantID INTEGER,
                BonusID TEXT,
                EmailID INTEGER,
                Image TEXT
            );",
        )?;
        Ok(())
    }

    pub fn rally_params(&self) -> Result<RallyParams, StoreError> {
        self.conn
            .query_row(
                "SELECT RallyTitle, StartTime, FinishTime, LocalTZ FROM rallyparams LIMIT 1",
                [],
                |row| {
                    Ok(RallyParams {
                        title: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                        start: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                        finish: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                        timezone: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                    })
                },
            )
            .optional()?
            .ok_or(StoreError::NoRallyParams)
    }

    /// Replaces the single rallyparams row.
    pub fn save_rally_params(
        &self,
        params: &RallyParams,
        settings_yaml: &str,
        email_json: &str,
    ) -> Result<(), StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM rallyparams", [])?;
        tx.execute(
            "INSERT INTO rallyparams (RallyTitle, StartTime, FinishTime, LocalTZ, ebcsettings, EmailParams)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                params.title,
                params.start,
                params.finish,
                params.timezone,
                settings_yaml,
                email_json
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// The settings YAML document and the SMTP parameters JSON.
    pub fn load_settings(&self) -> Result<(String, String), StoreError> {
        self.conn
            .query_row(
                "SELECT ebcsettings, EmailParams FROM rallyparams LIMIT 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                        row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    ))
                },
            )
            .optional()?
            .ok_or(StoreError::NoRallyParams)
    }

    /// Looks up an entrant and, for team members, every team mate's
    /// addresses. The entrant's own row supplies the rider name.
    pub fn entrant_contacts(&self, entrant_id: i64) -> Result<Option<EntrantContacts>, StoreError> {
        let team: i64 = self
            .conn
            .query_row(
                "SELECT TeamID FROM entrants WHERE EntrantID = ?1",
                params![entrant_id],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?
            .flatten()
            .unwrap_or(0);

        let mut stmt = self.conn.prepare(
            "SELECT RiderName, Email FROM entrants
             WHERE EntrantID = ?1 OR (?2 > 0 AND TeamID = ?2)
             ORDER BY EntrantID <> ?1, EntrantID",
        )?;
        let rows = stmt.query_map(params![entrant_id, team], |row| {
            Ok((
                row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                row.get::<_, Option<String>>(1)?.unwrap_or_default(),
            ))
        })?;

        let mut contacts: Option<EntrantContacts> = None;
        for row in rows {
            let (name, email) = row?;
            let entry = contacts.get_or_insert_with(|| EntrantContacts {
                rider_name: name,
                emails: Vec::new(),
            });
            entry.emails.extend(split_addresses(&email));
        }
        Ok(contacts)
    }

    pub fn all_entrant_emails(&self) -> Result<Vec<String>, StoreError> {
        let mut stmt = self.conn.prepare("SELECT Email FROM entrants")?;
        let rows = stmt.query_map([], |row| row.get::<_, Option<String>>(0))?;
        let mut emails = Vec::new();
        for row in rows {
            if let Some(email) = row? {
                emails.extend(split_addresses(&email));
            }
        }
        Ok(emails)
    }

    /// Empty when the bonus is not in the standard bonus table.
    pub fn bonus_description(&self, bonus_id: &str) -> Result<String, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT BriefDesc FROM bonuses WHERE BonusID = ?1",
                params![bonus_id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten()
            .unwrap_or_default())
    }

    /// Claim time of the earliest stored claim with the same fields.
    pub fn prior_claim_time(
        &self,
        entrant_id: i64,
        bonus_id: &str,
        odometer: i64,
        hour: u32,
        minute: u32,
    ) -> Result<Option<String>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT ClaimTime FROM ebclaims
                 WHERE EntrantID = ?1 AND BonusID = ?2 AND OdoReading = ?3
                   AND ClaimHH = ?4 AND ClaimMM = ?5
                 ORDER BY ClaimTime, DateTime
                 LIMIT 1",
                params![entrant_id, bonus_id, odometer, hour, minute],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten())
    }

    pub fn insert_claim(&self, claim: &ClaimRecord) -> Result<i64, StoreError> {
        self.conn.execute(
            "INSERT INTO ebclaims (LoggedAt, DateTime, EntrantID, BonusID, OdoReading,
                FinalTime, EmailID, ClaimHH, ClaimMM, ClaimTime, Subject, ExtraField,
                StrictOk, AttachmentTime, FirstTime, PhotoID)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                claim.logged_at,
                claim.sent_at,
                claim.entrant_id,
                claim.bonus_id,
                claim.odometer,
                claim.received_at,
                claim.email_id,
                claim.claim_hour,
                claim.claim_minute,
                claim.claim_time,
                claim.subject,
                claim.extra,
                claim.strict_ok,
                claim.photo_time,
                claim.first_time,
                claim.photo_ids,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Opens the per-photo transaction and inserts the row that supplies
    /// the photo id. Dropping the result without committing rolls back.
    pub fn begin_photo(
        &self,
        entrant_id: i64,
        bonus_id: &str,
        email_id: u32,
    ) -> Result<PhotoTransaction<'_>, StoreError> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO ebcphotos (EntrantID, BonusID, EmailID) VALUES (?1, ?2, ?3)",
            params![entrant_id, bonus_id, email_id],
        )?;
        let photo_id = tx.last_insert_rowid();
        Ok(PhotoTransaction { tx, photo_id })
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    #[cfg(test)]
    pub(crate) fn count(&self, table: &str) -> i64 {
        self.conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .unwrap()
    }
}

pub struct PhotoTransaction<'a> {
    tx: Transaction<'a>,
    photo_id: i64,
}

impl PhotoTransaction<'_> {
    pub fn photo_id(&self) -> i64 {
        self.photo_id
    }

    pub fn commit(self, image_path: &str) -> Result<(), StoreError> {
        self.tx.execute(
            "UPDATE ebcphotos SET Image = ?1 WHERE rowid = ?2",
            params![image_path, self.photo_id],
        )?;
        self.tx.commit()?;
        Ok(())
    }
}

/// Entrant email columns may hold several comma or semicolon separated
/// addresses, with or without display names.
pub fn split_addresses(field: &str) -> Vec<String> {
    let mut out = Vec::new();
    for piece in field.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        match mailparse::addrparse(piece) {
            Ok(list) if !list.is_empty() => {
                for addr in list.iter() {
                    match addr {
                        mailparse::MailAddr::Single(info) => out.push(info.addr.clone()),
                        mailparse::MailAddr::Group(group) => {
                            out.extend(group.addrs.iter().map(|info| info.addr.clone()))
                        }
                    }
                }
            }
            _ => out.extend(
                piece
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
            ),
        }
    }
    out
}
