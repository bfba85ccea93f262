use crate::claim_time::{stamp, RallyWindow};
use crate::config::{Config, SmtpSettings};
use crate::outcome::ClaimOutcome;
use anyhow::{bail, Context};
use lettre::message::header::ContentType;
use lettre::message::Mailbox as Address;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{Message, SmtpTransport, Transport};
use std::fmt::Write;
use std::time::Duration;

const STYLE_YES: &str = " font-size: large; color: lightgreen; ";
const STYLE_NO: &str = " font-size: x-large; color: red; ";
const STYLE_LABEL: &str = " text-align: right; padding-right: 1em; ";

/// A composed test-mode reply.
#[derive(Debug, Clone, PartialEq)]
pub struct TestResponse {
    pub to: String,
    pub bcc: Option<String>,
    pub from: String,
    pub subject: String,
    pub html: String,
}

/// Delivers test-mode replies to whoever sent the claim.
pub trait DiagnosticResponder: Send {
    fn send(&self, reply: &TestResponse) -> anyhow::Result<()>;
}

pub struct SmtpResponder {
    smtp: SmtpSettings,
}

impl SmtpResponder {
    pub fn new(smtp: SmtpSettings) -> Self {
        SmtpResponder { smtp }
    }
}

impl DiagnosticResponder for SmtpResponder {
    fn send(&self, reply: &TestResponse) -> anyhow::Result<()> {
        if self.smtp.password.is_empty() {
            bail!("no SMTP password configured");
        }
        let mut builder = Message::builder()
            .from(reply.from.parse::<Address>().context("bad From address")?)
            .to(reply.to.parse::<Address>().context("bad recipient address")?)
            .subject(reply.subject.as_str())
            .header(ContentType::TEXT_HTML);
        if let Some(bcc) = &reply.bcc {
            builder = builder.bcc(bcc.parse::<Address>().context("bad BCC address")?);
        }
        let email = builder.body(reply.html.clone())?;

        let server_name = if self.smtp.cert_name.is_empty() {
            self.smtp.host.clone()
        } else {
            self.smtp.cert_name.clone()
        };
        let mailer = SmtpTransport::builder_dangerous(self.smtp.host.as_str())
            .port(self.smtp.port)
            .tls(Tls::Wrapper(TlsParameters::new(server_name)?))
            .credentials(Credentials::new(
                self.smtp.username.clone(),
                self.smtp.password.clone(),
            ))
            .timeout(Some(Duration::from_secs(10)))
            .build();
        mailer
            .send(&email)
            .with_context(|| format!("SMTP delivery via {} failed", self.smtp.host))?;
        Ok(())
    }
}

fn yes_no(ok: bool) -> String {
    if ok {
        format!(r#" <span style="{STYLE_YES}">&#x2714;</span>"#)
    } else {
        format!(r#" <span style="{STYLE_NO}">&#x2718;</span>"#)
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn row(html: &mut String, label: &str, content: &str) {
    let _ = write!(
        html,
        r#"<tr><td style="{STYLE_LABEL}">{label}</td><td>{content}</td></tr>"#
    );
}

/// Builds the human-readable check of a test claim.
pub fn render(outcome: &ClaimOutcome, config: &Config, window: &RallyWindow) -> TestResponse {
    let text = &config.test_response;
    let max_photos = 1 + config.max_extra_photos as i64;
    let perfect = outcome.is_perfect(config.match_email, config.max_extra_photos);
    let verdict = if perfect { &text.good } else { &text.bad };

    let mut html = String::new();
    let _ = write!(
        html,
        "<p>{} [ {} (TZ={} {}) {} ]</p><table>",
        verdict,
        escape(&window.title),
        window.tz.name(),
        window.offset_string(),
        text.literal
    );

    let mut subject = escape(&outcome.subject);
    if outcome.subject_from_body {
        subject.push_str(" &#x2611;");
    }
    subject.push_str(&yes_no(outcome.subject_matches && outcome.claim.time_valid));
    row(&mut html, "Subject", &subject);

    row(
        &mut html,
        "Entrant#",
        &format!(
            "{}{}",
            outcome.claim.entrant_id,
            yes_no(outcome.entrant_known)
        ),
    );
    if outcome.entrant_known {
        let note = if outcome.address_authorized {
            &text.good_email
        } else {
            &text.bad_email
        };
        row(
            &mut html,
            "Email = Entrant Email",
            &format!("{} {}", yes_no(outcome.address_authorized), note),
        );
    }

    let bonus = if outcome.bonus_known {
        format!(
            "{} - {}{}",
            escape(&outcome.claim.bonus_id),
            escape(&outcome.bonus_description),
            yes_no(true)
        )
    } else {
        format!("{}{}", escape(&outcome.claim.bonus_id), yes_no(false))
    };
    row(&mut html, "Bonus", &bonus);

    row(
        &mut html,
        "Odo",
        &format!(
            "{}{}",
            outcome.claim.odometer,
            yes_no(outcome.claim.odometer_valid)
        ),
    );
    row(
        &mut html,
        &format!("hhmm '{}'", escape(&outcome.claim.hhmm)),
        &format!(
            "{} {} / {}",
            yes_no(outcome.claim.time_valid),
            outcome.claim_time.format("%a %b %e %H:%M:%S %Z %Y"),
            stamp(&outcome.claim_time)
        ),
    );
    if !outcome.claim.extra.is_empty() {
        row(&mut html, "&#x270D;", &escape(&outcome.claim.extra));
    }

    let mut photos = String::new();
    if outcome.photo_count > 1 {
        let _ = write!(photos, " x {} ", outcome.photo_count);
    }
    photos.push_str(&yes_no(outcome.photos_acceptable(config.max_extra_photos)));
    if outcome.photo_count > max_photos {
        let _ = write!(photos, "  (max = {max_photos})");
    }
    row(&mut html, "Photo", &photos);
    html.push_str("</table>");

    if !text.advice.is_empty() {
        let _ = write!(html, "<p>{}</p>", text.advice);
    }
    let _ = write!(
        html,
        "<p>ScoreMaster [{} v{} :]</p>",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let subject = if !text.subject.is_empty() {
        text.subject.clone()
    } else {
        format!("EBC test: {verdict}")
    };

    TestResponse {
        to: outcome.from.clone(),
        bcc: if text.bcc.is_empty() {
            None
        } else {
            Some(text.bcc.clone())
        },
        from: config.login.clone(),
        subject,
        html,
    }
}
