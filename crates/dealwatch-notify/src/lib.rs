//! Best-effort discount alerts over SMTP.
//!
//! Delivery is store-and-forward, single attempt, and failures never escape
//! [`Notifier::notify`]: a lost alert must not block future persistence.

use async_trait::async_trait;
use dealwatch_core::DiscountRecord;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
// Re-exported so downstream Mailer implementations can name the message type
// without a direct lettre dependency.
pub use lettre::Message;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "dealwatch-notify";

const ALERT_SUBJECT: &str = "Significant Discounts Alert";

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub sender: String,
    pub password: String,
    pub server: String,
    pub port: u16,
}

impl SmtpConfig {
    pub fn from_env() -> Self {
        Self {
            sender: std::env::var("SENDER_EMAIL").unwrap_or_default(),
            password: std::env::var("SENDER_PASSWORD").unwrap_or_default(),
            server: std::env::var("SMTP_SERVER").unwrap_or_else(|_| "smtp.example.com".to_string()),
            port: std::env::var("SMTP_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(587),
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("invalid mailbox address: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("building alert message: {0}")]
    Message(#[from] lettre::error::Error),
    #[error("smtp delivery failed: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),
    #[error("{0}")]
    Other(String),
}

/// What happened to one notify attempt. Callers treat all three as success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyOutcome {
    Sent,
    Skipped,
    Failed,
}

/// Transport seam so tests can exercise delivery failure without a relay.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn deliver(&self, message: Message) -> Result<(), NotifyError>;
}

/// STARTTLS relay with credentials from [`SmtpConfig`].
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailer {
    pub fn new(config: &SmtpConfig) -> Result<Self, NotifyError> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.server)?
            .port(config.port)
            .credentials(Credentials::new(config.sender.clone(), config.password.clone()))
            .build();
        Ok(Self { transport })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn deliver(&self, message: Message) -> Result<(), NotifyError> {
        self.transport.send(message).await?;
        Ok(())
    }
}

pub struct Notifier {
    sender: String,
    mailer: Box<dyn Mailer>,
}

impl Notifier {
    pub fn new(sender: impl Into<String>, mailer: Box<dyn Mailer>) -> Self {
        Self {
            sender: sender.into(),
            mailer,
        }
    }

    /// Notifier wired to a real SMTP relay.
    pub fn smtp(config: &SmtpConfig) -> Result<Self, NotifyError> {
        Ok(Self::new(config.sender.clone(), Box::new(SmtpMailer::new(config)?)))
    }

    /// Format the flagged records and attempt one delivery.
    ///
    /// Never returns an error: failures are logged and folded into the
    /// outcome. An empty record list skips the wire entirely.
    pub async fn notify(&self, recipient: &str, records: &[DiscountRecord]) -> NotifyOutcome {
        if records.is_empty() {
            return NotifyOutcome::Skipped;
        }
        let message = match self.build_message(recipient, records) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, recipient, "could not build discount alert");
                return NotifyOutcome::Failed;
            }
        };
        match self.mailer.deliver(message).await {
            Ok(()) => {
                info!(recipient, records = records.len(), "discount alert sent");
                NotifyOutcome::Sent
            }
            Err(err) => {
                warn!(error = %err, recipient, "discount alert delivery failed");
                NotifyOutcome::Failed
            }
        }
    }

    fn build_message(&self, recipient: &str, records: &[DiscountRecord]) -> Result<Message, NotifyError> {
        Message::builder()
            .from(self.sender.parse::<Mailbox>()?)
            .to(recipient.parse::<Mailbox>()?)
            .subject(ALERT_SUBJECT)
            .header(ContentType::TEXT_HTML)
            .body(render_body(records))
            .map_err(NotifyError::from)
    }
}

fn render_body(records: &[DiscountRecord]) -> String {
    let mut body = String::from("<h2>Significant Discounts Detected</h2><ul>");
    for record in records {
        body.push_str(&format!(
            "<li>Product ID: {}, Name: {}, Price: {}, Discount: {}%</li>",
            record.id, record.name, record.price, record.discount
        ));
    }
    body.push_str("</ul><p>Thank you for using the discount tracker!</p>");
    body
}
