use crate::claim_time::{localize, parse_mail_time};
use crate::message::{ClaimEmail, MailPart};
use crate::store::{ScoreStore, StoreError};
use chrono::{DateTime, NaiveDate};
use chrono_tz::Tz;
use lazy_static::lazy_static;
use log::{debug, warn};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Images in any other format go through the converter when it is enabled.
pub const STANDARD_IMAGE_EXTENSION: &str = ".jpg";

lazy_static! {
    // Camera apps name files like 20210717_185053.jpg
    static ref CAMERA_NAME: Regex =
        Regex::new(r"(\d{4})(\d\d)(\d\d)_(\d\d)(\d\d)(\d\d)").unwrap();
}

#[derive(Debug, thiserror::Error)]
pub enum AttachmentError {
    #[error("image data unreadable: {0}")]
    Unreadable(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("cannot write {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
    #[error("converter {program} failed: {detail}")]
    Converter { program: String, detail: String },
}

/// Outcome of storing a message's photos.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhotoReport {
    pub all_ok: bool,
    pub count: usize,
    pub ids: Vec<i64>,
    pub latest: Option<DateTime<Tz>>,
}

impl PhotoReport {
    pub fn id_list(&self) -> String {
        self.ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Photo count, negated when some photo could not be stored.
    pub fn signed_count(&self) -> i64 {
        let count = self.count as i64;
        if self.all_ok {
            count
        } else {
            -count
        }
    }
}

/// External program invoked as `program input output`.
#[derive(Debug, Clone)]
pub struct ImageConverter {
    program: String,
}

impl ImageConverter {
    pub fn new(program: &str) -> Self {
        ImageConverter {
            program: program.to_string(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn convert(&self, input: &Path, output: &Path) -> Result<(), AttachmentError> {
        let failed = |detail: String| AttachmentError::Converter {
            program: self.program.clone(),
            detail,
        };
        let status = Command::new(&self.program)
            .arg(input)
            .arg(output)
            .status()
            .map_err(|e| failed(e.to_string()))?;
        if !status.success() {
            return Err(failed(status.to_string()));
        }
        if !output.exists() {
            return Err(failed(format!("{} was not created", output.display())));
        }
        Ok(())
    }

    /// Whether the program can be started at all.
    pub fn probe(&self) -> bool {
        Command::new(&self.program).output().is_ok()
    }
}

/// Files written during a photo transaction. Anything not kept is removed
/// when this goes out of scope, so a rolled-back row never leaves a file.
#[derive(Debug, Default)]
struct StagedFiles {
    paths: Vec<PathBuf>,
    kept: bool,
}

impl StagedFiles {
    fn write(&mut self, path: &Path, bytes: &[u8]) -> Result<(), AttachmentError> {
        self.track(path);
        std::fs::write(path, bytes).map_err(|source| AttachmentError::Write {
            path: path.display().to_string(),
            source,
        })
    }

    fn track(&mut self, path: &Path) {
        self.paths.push(path.to_path_buf());
    }

    fn keep(mut self) {
        self.kept = true;
    }
}

impl Drop for StagedFiles {
    fn drop(&mut self) {
        if self.kept {
            return;
        }
        for path in &self.paths {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(path) {
                    warn!("Can't remove staged image {}: {e}", path.display());
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct AttachmentProcessor {
    image_root: PathBuf,
    image_folder: String,
    converter: Option<ImageConverter>,
    tz: Tz,
    test_mode: bool,
}

impl AttachmentProcessor {
    /// `image_root` is the database directory; `image_folder` is relative
    /// to it and is what gets stored in the photo row.
    pub fn new(
        image_root: &Path,
        image_folder: &str,
        converter: Option<ImageConverter>,
        tz: Tz,
        test_mode: bool,
    ) -> Self {
        AttachmentProcessor {
            image_root: image_root.to_path_buf(),
            image_folder: image_folder.to_string(),
            converter,
            tz,
            test_mode,
        }
    }

    pub fn image_dir(&self) -> PathBuf {
        self.image_root.join(&self.image_folder)
    }

    /// Stores attachments then embedded images, stopping at the first one
    /// that fails. In test mode photos are counted and timed but not stored.
    pub fn process(
        &self,
        store: &ScoreStore,
        email: &ClaimEmail,
        entrant_id: i64,
        bonus_id: &str,
        email_id: u32,
    ) -> PhotoReport {
        let parts: Vec<&MailPart> = email.attachments.iter().chain(&email.embedded).collect();
        let mut report = PhotoReport {
            all_ok: true,
            count: parts.len(),
            ids: Vec::new(),
            latest: parts
                .iter()
                .filter_map(|part| photo_time(&part.filename, &part.disposition_params, self.tz))
                .max(),
        };

        for part in parts {
            let bytes = match &part.data {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Message {email_id}: attachment {} unreadable: {e}", part.filename);
                    report.all_ok = false;
                    break;
                }
            };
            debug!(
                "Message {email_id}: image {} of {} bytes",
                part.filename,
                bytes.len()
            );
            if self.test_mode {
                continue;
            }
            match self.store_photo(store, entrant_id, bonus_id, email_id, part, bytes) {
                Ok(id) => report.ids.push(id),
                Err(e) => {
                    warn!("Message {email_id}: can't store photo: {e}");
                    report.all_ok = false;
                    break;
                }
            }
        }
        report
    }

    fn store_photo(
        &self,
        store: &ScoreStore,
        entrant_id: i64,
        bonus_id: &str,
        email_id: u32,
        part: &MailPart,
        bytes: &[u8],
    ) -> Result<i64, AttachmentError> {
        let photo = store.begin_photo(entrant_id, bonus_id, email_id)?;
        let id = photo.photo_id();
        let ext = image_extension(part);
        let dir = self.image_dir();

        let mut staged = StagedFiles::default();
        let mut name = image_filename(id, entrant_id, bonus_id, &ext);
        let written = dir.join(&name);
        staged.write(&written, bytes)?;

        if let Some(converter) = &self.converter {
            if !is_standard_extension(&ext) {
                name = image_filename(id, entrant_id, bonus_id, STANDARD_IMAGE_EXTENSION);
                let target = dir.join(&name);
                staged.track(&target);
                debug!(
                    "Converting {} to {}",
                    written.display(),
                    target.display()
                );
                converter.convert(&written, &target)?;
            }
        }

        let relative = Path::new(&self.image_folder).join(&name);
        photo.commit(&relative.to_string_lossy())?;
        staged.keep();
        Ok(id)
    }
}

pub fn image_filename(photo_id: i64, entrant_id: i64, bonus_id: &str, ext: &str) -> String {
    format!("img-{entrant_id}-{bonus_id}-{photo_id}{ext}")
}

fn is_standard_extension(ext: &str) -> bool {
    ext.eq_ignore_ascii_case(STANDARD_IMAGE_EXTENSION) || ext.eq_ignore_ascii_case(".jpeg")
}

/// Extension with its dot, from the filename or failing that the MIME type.
fn image_extension(part: &MailPart) -> String {
    let name = part.filename.replace('"', "");
    if let Some(ext) = Path::new(&name).extension() {
        return format!(".{}", ext.to_string_lossy());
    }
    match part.content_type.as_str() {
        "image/png" => ".png",
        "image/gif" => ".gif",
        "image/heic" => ".heic",
        "image/heif" => ".heif",
        "image/webp" => ".webp",
        _ => STANDARD_IMAGE_EXTENSION,
    }
    .to_string()
}

/// When a photo was taken: a camera-style timestamp in the filename (rally
/// local time), else the disposition's modification or creation date.
pub fn photo_time(
    filename: &str,
    disposition_params: &std::collections::BTreeMap<String, String>,
    tz: Tz,
) -> Option<DateTime<Tz>> {
    if let Some(caps) = CAMERA_NAME.captures(filename) {
        let n = |i: usize| caps[i].parse::<u32>().unwrap_or(u32::MAX);
        let naive = NaiveDate::from_ymd_opt(caps[1].parse().unwrap_or(0), n(2), n(3))
            .and_then(|d| d.and_hms_opt(n(4), n(5), n(6)));
        if let Some(naive) = naive {
            return Some(localize(tz, naive));
        }
    }
    ["modification-date", "creation-date"]
        .iter()
        .filter_map(|key| disposition_params.get(*key))
        .find_map(|value| parse_mail_time(value.trim_matches('"'), tz))
}
