//! Email notification for newly discovered portal events.
//!
//! The [`Notifier`] trait is the seam the reconciliation driver talks to;
//! [`SmtpNotifier`] renders the askama templates and delivers them over
//! STARTTLS, [`LogNotifier`] only logs (dry runs).

use askama::Template;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use sapn_core::{EventBatch, EventDraft, EventType};
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_SUBJECT_PREFIX: &str = "Inovar Alert";
pub const DEFAULT_SMTP_PORT: u16 = 587;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("no email recipients configured")]
    NoRecipients,
    #[error("rendering email template: {0}")]
    Render(#[from] askama::Error),
    #[error("invalid email address: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("building email message: {0}")]
    Message(#[from] lettre::error::Error),
    #[error("smtp delivery failed: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
}

/// Operator-facing report of a cycle that could not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureNotice {
    pub message: String,
    pub details: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl FailureNotice {
    pub fn new(message: impl Into<String>, details: Option<String>) -> Self {
        Self {
            message: message.into(),
            details,
            occurred_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Delivers one message covering every event in `batch`. Success means
    /// the message was accepted for delivery.
    async fn send(&self, batch: &EventBatch) -> Result<(), NotifyError>;

    async fn send_failure(&self, notice: &FailureNotice) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub html: String,
}

struct EventRow {
    date: String,
    description: String,
}

struct EventSection {
    heading: &'static str,
    css_class: &'static str,
    events: Vec<EventRow>,
}

#[derive(Template)]
#[template(path = "alert_email.html")]
struct AlertEmailTemplate<'a> {
    title: &'a str,
    sections: Vec<EventSection>,
    generated_at: String,
}

#[derive(Template)]
#[template(path = "failure_email.html")]
struct FailureEmailTemplate<'a> {
    title: &'a str,
    message: &'a str,
    details: Option<&'a str>,
    occurred_at: String,
}

fn section_heading(event_type: EventType) -> (&'static str, &'static str) {
    match event_type {
        EventType::Absence => ("Novas Faltas", ""),
        EventType::BehaviorAlert => ("Novos Avisos de Comportamento", "alert"),
    }
}

fn event_row(draft: &EventDraft) -> EventRow {
    EventRow {
        date: draft.date.format("%d-%m-%Y").to_string(),
        description: draft.description.clone(),
    }
}

fn local_timestamp(at: DateTime<Utc>, tz: &Tz) -> String {
    at.with_timezone(tz).format("%Y-%m-%d %H:%M:%S %Z").to_string()
}

/// Subject line built from the per-type counts of new events plus the
/// number re-sent from earlier cycles, e.g.
/// `Inovar Alert - 2 Nova(s) Falta(s) e 1 Novo(s) Aviso(s)`.
pub fn alert_subject(prefix: &str, absences: usize, behavior_alerts: usize, retried: usize) -> String {
    let mut parts = Vec::new();
    if absences > 0 {
        parts.push(format!("{absences} Nova(s) Falta(s)"));
    }
    if behavior_alerts > 0 {
        parts.push(format!("{behavior_alerts} Novo(s) Aviso(s)"));
    }
    if retried > 0 {
        parts.push(format!("{retried} Evento(s) Pendente(s)"));
    }
    if parts.is_empty() {
        return format!("{prefix} - Sem novos eventos");
    }
    format!("{prefix} - {}", parts.join(" e "))
}

fn batch_subject(prefix: &str, batch: &EventBatch) -> String {
    alert_subject(
        prefix,
        batch.new_count(EventType::Absence),
        batch.new_count(EventType::BehaviorAlert),
        batch.retried_count(),
    )
}

pub fn render_alert_email(
    batch: &EventBatch,
    prefix: &str,
    tz: &Tz,
    now: DateTime<Utc>,
) -> Result<RenderedEmail, NotifyError> {
    let subject = batch_subject(prefix, batch);
    let sections = batch
        .groups()
        .map(|(event_type, drafts)| {
            let (heading, css_class) = section_heading(event_type);
            EventSection {
                heading,
                css_class,
                events: drafts.iter().map(event_row).collect(),
            }
        })
        .collect();
    let html = AlertEmailTemplate {
        title: prefix,
        sections,
        generated_at: local_timestamp(now, tz),
    }
    .render()?;
    Ok(RenderedEmail { subject, html })
}

pub fn render_failure_email(
    notice: &FailureNotice,
    prefix: &str,
    tz: &Tz,
) -> Result<RenderedEmail, NotifyError> {
    let html = FailureEmailTemplate {
        title: prefix,
        message: &notice.message,
        details: notice.details.as_deref(),
        occurred_at: local_timestamp(notice.occurred_at, tz),
    }
    .render()?;
    Ok(RenderedEmail {
        subject: format!("{prefix} - Falha na verificação"),
        html,
    })
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
    pub recipients: Vec<String>,
    pub timezone: Tz,
    pub subject_prefix: String,
}

impl SmtpConfig {
    /// Primary recipient wins; the fallback is used only when the primary is blank.
    pub fn resolve_recipients(primary: Option<&str>, fallback: Option<&str>) -> Vec<String> {
        [primary, fallback]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|s| !s.is_empty())
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|r| !r.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

pub struct SmtpNotifier {
    config: SmtpConfig,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpNotifier {
    pub fn new(config: SmtpConfig) -> Result<Self, NotifyError> {
        if config.recipients.is_empty() {
            warn!("no alert recipients configured; every delivery will fail");
        }
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)?
            .port(config.port)
            .credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ))
            .build();
        Ok(Self { config, transport })
    }

    pub fn config(&self) -> &SmtpConfig {
        &self.config
    }

    async fn deliver(&self, email: RenderedEmail) -> Result<(), NotifyError> {
        if self.config.recipients.is_empty() {
            return Err(NotifyError::NoRecipients);
        }
        let message = build_message(&self.config.from, &self.config.recipients, email)?;
        self.transport.send(message).await?;
        Ok(())
    }
}

fn build_message(
    from: &str,
    recipients: &[String],
    email: RenderedEmail,
) -> Result<Message, NotifyError> {
    let mut builder = Message::builder()
        .from(from.parse::<Mailbox>()?)
        .subject(email.subject)
        .header(ContentType::TEXT_HTML);
    for recipient in recipients {
        builder = builder.to(recipient.parse::<Mailbox>()?);
    }
    Ok(builder.body(email.html)?)
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn send(&self, batch: &EventBatch) -> Result<(), NotifyError> {
        let email = render_alert_email(
            batch,
            &self.config.subject_prefix,
            &self.config.timezone,
            Utc::now(),
        )?;
        let subject = email.subject.clone();
        self.deliver(email).await?;
        info!(
            subject = %subject,
            recipients = self.config.recipients.len(),
            events = batch.len(),
            "alert email sent"
        );
        Ok(())
    }

    async fn send_failure(&self, notice: &FailureNotice) -> Result<(), NotifyError> {
        let email = render_failure_email(notice, &self.config.subject_prefix, &self.config.timezone)?;
        self.deliver(email).await?;
        info!(message = %notice.message, "failure email sent");
        Ok(())
    }
}

/// Notifier that only logs what would have been sent.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier {
    pub subject_prefix: String,
}

impl LogNotifier {
    pub fn new() -> Self {
        Self {
            subject_prefix: DEFAULT_SUBJECT_PREFIX.to_string(),
        }
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, batch: &EventBatch) -> Result<(), NotifyError> {
        let subject = batch_subject(&self.subject_prefix, batch);
        info!(subject = %subject, events = batch.len(), "dry run, email not sent");
        for (event_type, drafts) in batch.groups() {
            for draft in drafts {
                info!(
                    event_type = %event_type,
                    event_id = %draft.event_id,
                    date = %draft.date,
                    description = %draft.description,
                    "would notify"
                );
            }
        }
        Ok(())
    }

    async fn send_failure(&self, notice: &FailureNotice) -> Result<(), NotifyError> {
        warn!(message = %notice.message, details = ?notice.details, "dry run, failure email not sent");
        Ok(())
    }
}
