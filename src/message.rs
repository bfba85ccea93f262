use crate::claim_time::parse_mail_time;
use chrono::DateTime;
use chrono_tz::Tz;
use mailparse::{DispositionType, MailHeaderMap, ParsedMail};
use std::collections::BTreeMap;

const IMAGE_EXTENSIONS: [&str; 7] = ["jpg", "jpeg", "png", "gif", "heic", "heif", "webp"];

/// One image carried by a message, either as an attachment or inline.
#[derive(Debug, Clone)]
pub struct MailPart {
    pub filename: String,
    pub content_type: String,
    /// Content-Disposition parameters, keys lower-cased.
    pub disposition_params: BTreeMap<String, String>,
    /// Decoded bytes, or why they could not be decoded.
    pub data: Result<Vec<u8>, String>,
}

/// The parts of a claim email the pipeline looks at.
#[derive(Debug, Clone, Default)]
pub struct ClaimEmail {
    pub subject: String,
    pub from: String,
    pub from_address: String,
    pub date: Option<DateTime<Tz>>,
    pub text_body: String,
    pub received: Vec<String>,
    pub attachments: Vec<MailPart>,
    pub embedded: Vec<MailPart>,
}

impl ClaimEmail {
    pub fn parse(raw: &[u8], tz: Tz) -> Result<Self, mailparse::MailParseError> {
        let mail = mailparse::parse_mail(raw)?;
        let headers = &mail.headers;

        let from = headers.get_first_value("From").unwrap_or_default();
        let mut received = headers.get_all_values("Received");
        received.extend(headers.get_all_values("X-Received"));

        let mut email = ClaimEmail {
            subject: headers
                .get_first_value("Subject")
                .unwrap_or_default()
                .trim()
                .to_string(),
            from_address: first_address(&from),
            from,
            date: headers
                .get_first_value("Date")
                .and_then(|d| parse_mail_time(&d, tz)),
            received,
            ..ClaimEmail::default()
        };
        email.collect(&mail);
        Ok(email)
    }

    fn collect(&mut self, part: &ParsedMail) {
        if !part.subparts.is_empty() {
            for sub in &part.subparts {
                self.collect(sub);
            }
            return;
        }

        let mimetype = part.ctype.mimetype.to_ascii_lowercase();
        let disposition = part.get_content_disposition();
        let filename = disposition
            .params
            .get("filename")
            .or_else(|| part.ctype.params.get("name"))
            .cloned()
            .unwrap_or_default();

        if is_image(&mimetype, &filename) {
            let image = MailPart {
                filename,
                content_type: mimetype,
                disposition_params: disposition
                    .params
                    .iter()
                    .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
                    .collect(),
                data: part.get_body_raw().map_err(|e| e.to_string()),
            };
            match disposition.disposition {
                DispositionType::Attachment => self.attachments.push(image),
                _ => self.embedded.push(image),
            }
            return;
        }

        if mimetype == "text/plain" && self.text_body.is_empty() {
            if let Ok(body) = part.get_body() {
                self.text_body = body.trim().to_string();
            }
        }
    }
}

fn is_image(mimetype: &str, filename: &str) -> bool {
    if mimetype.starts_with("image/") {
        return true;
    }
    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    IMAGE_EXTENSIONS.contains(&ext.as_str())
}

/// Bare address of the first mailbox in a From-style header.
pub fn first_address(header: &str) -> String {
    if let Ok(list) = mailparse::addrparse(header) {
        for addr in list.iter() {
            match addr {
                mailparse::MailAddr::Single(info) => return info.addr.clone(),
                mailparse::MailAddr::Group(group) => {
                    if let Some(info) = group.addrs.first() {
                        return info.addr.clone();
                    }
                }
            }
        }
    }
    header.trim().trim_matches(|c| c == '<' || c == '>').to_string()
}
