use crate::store::ScoreStore;
use chrono::NaiveDate;
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_SUBJECT_PATTERN: &str = r"(?i)\b(?P<entrant>\w+)\s+(?P<bonus>\w+)\s+(?P<odo>\d+)\s+(?P<time>\d{4}-\d\d-\d\dT\S+|[\d:.]+)(?:\s+(?P<extra>.*))?$";
pub const DEFAULT_STRICT_PATTERN: &str = r"(?i)^(?P<entrant>\d+)\s+(?P<bonus>\w+)\s+(?P<odo>\d+)\s+(?P<time>\d{4})(?:\s+(?P<extra>.*))?$";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid settings YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid email parameters JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{name} pattern does not compile: {source}")]
    Pattern {
        name: &'static str,
        source: regex::Error,
    },
    #[error("{name} pattern has no '{group}' capture")]
    MissingGroup {
        name: &'static str,
        group: &'static str,
    },
    #[error("unknown timezone '{0}'")]
    Timezone(String),
    #[error("cannot interpret '{0}' as a date/time")]
    BadTime(String),
    #[error("rally settings unavailable: {0}")]
    Store(String),
}

/// SMTP account used for test-mode replies. Stored as JSON in
/// `rallyparams.EmailParams`, hence the PascalCase keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpSettings {
    #[serde(rename = "Port")]
    pub port: u16,
    #[serde(rename = "Host")]
    pub host: String,
    #[serde(rename = "Username")]
    pub username: String,
    #[serde(rename = "Password")]
    pub password: String,
    #[serde(rename = "CertName")]
    pub cert_name: String,
}

impl SmtpSettings {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        if text.trim().is_empty() {
            return Ok(SmtpSettings::default());
        }
        Ok(serde_json::from_str(text)?)
    }
}

/// Wording of the test-mode diagnostic reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestResponseText {
    #[serde(rename = "TestModeLiteral")]
    pub literal: String,
    #[serde(rename = "TestResponseSubject")]
    pub subject: String,
    #[serde(rename = "TestResponseGood")]
    pub good: String,
    #[serde(rename = "TestResponseBad")]
    pub bad: String,
    #[serde(rename = "TestResponseAdvice")]
    pub advice: String,
    #[serde(rename = "TestResponseBCC")]
    pub bcc: String,
    #[serde(rename = "TestResponseBadEmail")]
    pub bad_email: String,
    #[serde(rename = "TestResponseGoodEmail")]
    pub good_email: String,
}

impl Default for TestResponseText {
    fn default() -> Self {
        TestResponseText {
            literal: "TEST MODE".to_string(),
            subject: String::new(),
            good: "Your claim looks good".to_string(),
            bad: "There is a problem with your claim".to_string(),
            advice: String::new(),
            bcc: String::new(),
            bad_email: "this address is not registered for the rally".to_string(),
            good_email: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `host:port` of the IMAP server.
    #[serde(rename = "imapserver")]
    pub imap_server: String,
    pub login: String,
    pub password: String,
    #[serde(rename = "notbefore", skip_serializing_if = "Option::is_none")]
    pub not_before: Option<String>,
    #[serde(rename = "notafter", skip_serializing_if = "Option::is_none")]
    pub not_after: Option<String>,
    #[serde(rename = "subject")]
    pub subject_pattern: String,
    #[serde(rename = "strict")]
    pub strict_pattern: String,
    #[serde(rename = "selectflags")]
    pub select_flags: Vec<String>,
    #[serde(rename = "checkstrict")]
    pub check_strict: bool,
    #[serde(rename = "sleepseconds")]
    pub sleep_seconds: u64,
    #[serde(rename = "imagefolder")]
    pub image_folder: String,
    #[serde(rename = "matchemail")]
    pub match_email: bool,
    #[serde(rename = "heic2jpg")]
    pub heic_converter: String,
    #[serde(rename = "convertheic2jpg")]
    pub convert_heic: bool,
    #[serde(rename = "dontrun")]
    pub dont_run: bool,
    #[serde(rename = "allowbody")]
    pub allow_body: bool,
    #[serde(rename = "trapmails")]
    pub trap_mails: bool,
    #[serde(rename = "trappath")]
    pub trap_path: String,
    #[serde(rename = "testmode")]
    pub test_mode: bool,
    pub verbose: bool,
    #[serde(rename = "MaxFetch")]
    pub max_fetch: usize,
    #[serde(rename = "MaxExtraPhotos")]
    pub max_extra_photos: usize,
    #[serde(flatten)]
    pub test_response: TestResponseText,
    /// Only present in file-based configs; the database keeps these in
    /// `rallyparams.EmailParams`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smtp: Option<SmtpSettings>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            imap_server: String::new(),
            login: String::new(),
            password: String::new(),
            not_before: None,
            not_after: None,
            subject_pattern: DEFAULT_SUBJECT_PATTERN.to_string(),
            strict_pattern: DEFAULT_STRICT_PATTERN.to_string(),
            select_flags: vec!["\\Seen".to_string(), "\\Flagged".to_string()],
            check_strict: true,
            sleep_seconds: 10,
            image_folder: "images/ebcimg".to_string(),
            match_email: true,
            heic_converter: "heic2jpg".to_string(),
            convert_heic: true,
            dont_run: false,
            allow_body: true,
            trap_mails: false,
            trap_path: String::new(),
            test_mode: false,
            verbose: false,
            max_fetch: 0,
            max_extra_photos: 0,
            test_response: TestResponseText::default(),
            smtp: None,
        }
    }
}

impl Config {
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        if text.trim().is_empty() {
            return Ok(Config::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Ok(Self::from_yaml(&content)?)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Fetching only happens when not switched off and the IMAP account is
    /// fully specified.
    pub fn monitoring_enabled(&self) -> bool {
        !self.dont_run
            && !self.imap_server.is_empty()
            && !self.login.is_empty()
            && !self.password.is_empty()
    }

    /// Logging ceiling for the command-line level `base`: `verbose` raises
    /// it to debug, and clearing it again drops back to `base`.
    pub fn log_level(&self, base: LevelFilter) -> LevelFilter {
        if self.verbose {
            base.max(LevelFilter::Debug)
        } else {
            base
        }
    }

    /// Splits `imapserver` into host and port, defaulting to IMAPS.
    pub fn imap_endpoint(&self) -> (String, u16) {
        match self.imap_server.rsplit_once(':') {
            Some((host, port)) => match port.parse() {
                Ok(port) => (host.to_string(), port),
                Err(_) => (self.imap_server.clone(), 993),
            },
            None => (self.imap_server.clone(), 993),
        }
    }

    /// SENTSINCE / SENTBEFORE bounds for the mailbox search.
    pub fn sent_bounds(&self) -> Result<(Option<NaiveDate>, Option<NaiveDate>), ConfigError> {
        let parse = |value: &Option<String>| -> Result<Option<NaiveDate>, ConfigError> {
            match value.as_deref().map(str::trim) {
                None | Some("") => Ok(None),
                Some(text) => crate::claim_time::parse_config_time(text)
                    .map(|t| Some(t.date()))
                    .ok_or_else(|| ConfigError::BadTime(text.to_string())),
            }
        };
        Ok((parse(&self.not_before)?, parse(&self.not_after)?))
    }

    pub fn trap_dir(&self) -> Option<PathBuf> {
        if self.trap_mails && !self.trap_path.is_empty() {
            Some(PathBuf::from(&self.trap_path))
        } else {
            None
        }
    }

    /// Catches mistakes that would otherwise surface in the middle of a cycle.
    pub fn validate(&self) -> Result<(), ConfigError> {
        crate::subject::ClaimPattern::compile("subject", &self.subject_pattern)?;
        crate::subject::ClaimPattern::compile("strict", &self.strict_pattern)?;
        self.sent_bounds()?;
        Ok(())
    }
}

/// Where the settings live. Files are read as-is; the database variant reads
/// the YAML document and SMTP JSON stored alongside the rally parameters.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    File(PathBuf),
    Database,
}

impl ConfigSource {
    pub fn load(&self, store: &ScoreStore) -> Result<Config, ConfigError> {
        let config = match self {
            ConfigSource::File(path) => {
                let content =
                    std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                        path: path.display().to_string(),
                        source,
                    })?;
                Config::from_yaml(&content)?
            }
            ConfigSource::Database => {
                let (yaml, json) = store
                    .load_settings()
                    .map_err(|e| ConfigError::Store(e.to_string()))?;
                let mut config = Config::from_yaml(&yaml)?;
                config.smtp = Some(SmtpSettings::from_json(&json)?);
                config
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn describe(&self) -> String {
        match self {
            ConfigSource::File(path) => path.display().to_string(),
            ConfigSource::Database => "database".to_string(),
        }
    }
}

/// Photos are stored relative to the directory holding the score database.
pub fn database_root(db_path: &Path) -> PathBuf {
    match db_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(!config.monitoring_enabled());
    }

    #[test]
    fn test_yaml_keys() {
        let yaml = r#"
imapserver: imap.example.com:993
login: claims@example.com
password: secret
notbefore: 2024-06-01T00:00:00Z
matchemail: false
MaxFetch: 25
MaxExtraPhotos: 2
TestResponseGood: All good
testmode: true
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert!(config.monitoring_enabled());
        assert_eq!(
            config.imap_endpoint(),
            ("imap.example.com".to_string(), 993)
        );
        assert!(!config.match_email);
        assert_eq!(config.max_fetch, 25);
        assert_eq!(config.max_extra_photos, 2);
        assert_eq!(config.test_response.good, "All good");
        assert_eq!(config.test_response.literal, "TEST MODE");
        assert!(config.test_mode);
        assert_eq!(config.subject_pattern, DEFAULT_SUBJECT_PATTERN);

        let (since, before) = config.sent_bounds().unwrap();
        assert_eq!(since, NaiveDate::from_ymd_opt(2024, 6, 1));
        assert_eq!(before, None);
    }

    #[test]
    fn test_verbose_raises_and_restores_log_level() {
        let mut config = Config::default();
        assert_eq!(config.log_level(LevelFilter::Info), LevelFilter::Info);
        assert_eq!(config.log_level(LevelFilter::Warn), LevelFilter::Warn);
        config.verbose = true;
        assert_eq!(config.log_level(LevelFilter::Info), LevelFilter::Debug);
        assert_eq!(config.log_level(LevelFilter::Warn), LevelFilter::Debug);
        assert_eq!(config.log_level(LevelFilter::Trace), LevelFilter::Trace);
        config.verbose = false;
        assert_eq!(config.log_level(LevelFilter::Info), LevelFilter::Info);
    }

    #[test]
    fn test_dontrun_disables_monitoring() {
        let mut config = Config {
            imap_server: "imap.example.com".to_string(),
            login: "a".to_string(),
            password: "b".to_string(),
            ..Config::default()
        };
        assert!(config.monitoring_enabled());
        config.dont_run = true;
        assert!(!config.monitoring_enabled());
    }

    #[test]
    fn test_bad_pattern_fails_validation() {
        let config = Config {
            subject_pattern: r"(\d+".to_string(),
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Pattern { name: "subject", .. })
        ));
    }

    #[test]
    fn test_smtp_json() {
        let smtp = SmtpSettings::from_json(
            r#"{"Port":465,"Host":"smtp.example.com","Username":"u","Password":"p","CertName":""}"#,
        )
        .unwrap();
        assert_eq!(smtp.port, 465);
        assert_eq!(smtp.host, "smtp.example.com");
        assert_eq!(SmtpSettings::from_json("").unwrap(), SmtpSettings::default());
    }

    #[test]
    fn test_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ebcfetch.yml");
        let path = path.to_str().unwrap();
        let config = Config {
            login: "claims@example.com".to_string(),
            ..Config::default()
        };
        config.to_file(path).unwrap();
        assert_eq!(Config::from_file(path).unwrap(), config);
    }

    #[test]
    fn test_database_root() {
        assert_eq!(
            database_root(Path::new("sm/ScoreMaster.db")),
            PathBuf::from("sm")
        );
        assert_eq!(database_root(Path::new("ScoreMaster.db")), PathBuf::from("."));
    }
}
