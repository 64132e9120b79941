//! Email delivery over SMTP (async lettre, STARTTLS relay).
//!
//! One SMTP transport per delivery; each recipient gets an individual
//! message with the report attached, so a rejected address only fails
//! that recipient.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tabreport_core::config::EmailConfig;
use tabreport_core::{ChannelKind, ReportError, Result};

use crate::{DeliveryResult, ReportChannel, ReportMessage, Transport};

pub struct EmailChannel {
    config: EmailConfig,
}

impl EmailChannel {
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }

    fn from_mailbox(&self) -> Result<Mailbox> {
        if self.config.from_address.trim().is_empty() {
            return Err(ReportError::Config("email from_address not configured".into()));
        }
        let name = self.config.display_name.as_deref().unwrap_or("TabReport");
        format!("{name} <{}>", self.config.from_address.trim())
            .parse()
            .map_err(|e| ReportError::Channel(format!("Invalid from: {e}")))
    }

    /// Build the message for one recipient.
    pub fn build_message(&self, to: &str, report: &ReportMessage) -> Result<Message> {
        let to_mailbox: Mailbox = to
            .parse()
            .map_err(|e| ReportError::Channel(format!("Invalid to '{to}': {e}")))?;
        let content_type = ContentType::parse(&report.content_type)
            .map_err(|e| ReportError::Channel(format!("Invalid content type: {e}")))?;

        let attachment =
            Attachment::new(report.filename.clone()).body(report.payload.clone(), content_type);
        let parts = MultiPart::mixed()
            .singlepart(SinglePart::plain(report.body.clone()))
            .singlepart(attachment);

        Message::builder()
            .from(self.from_mailbox()?)
            .to(to_mailbox)
            .subject(report.subject.as_str())
            .multipart(parts)
            .map_err(|e| ReportError::Channel(format!("Build email: {e}")))
    }

    fn transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>> {
        let creds = Credentials::new(self.config.username.clone(), self.config.password.clone());
        Ok(
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.config.smtp_host)
                .map_err(|e| ReportError::Channel(format!("SMTP relay: {e}")))?
                .port(self.config.smtp_port)
                .credentials(creds)
                .build(),
        )
    }
}

#[async_trait]
impl ReportChannel for EmailChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Email
    }

    async fn send(&self, report: &ReportMessage, recipients: &[String]) -> DeliveryResult {
        let mut result = DeliveryResult::new(ChannelKind::Email, Transport::Attachment);
        let mailer = match self.from_mailbox().and_then(|_| self.transport()) {
            Ok(m) => m,
            Err(e) => {
                tracing::error!("❌ Email channel unusable: {e}");
                return DeliveryResult::all_failed(ChannelKind::Email, recipients, &e.to_string());
            }
        };

        for to in recipients {
            let sent = match self.build_message(to, report) {
                Ok(message) => mailer
                    .send(message)
                    .await
                    .map(|_| ())
                    .map_err(|e| ReportError::Channel(format!("SMTP send: {e}"))),
                Err(e) => Err(e),
            };
            match sent {
                Ok(()) => {
                    tracing::info!("📤 Report {} emailed to: {to}", report.filename);
                    result.delivered.push(to.clone());
                }
                Err(e) => {
                    tracing::warn!("⚠️ Email to {to} failed: {e}");
                    result.failed.push((to.clone(), e.to_string()));
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EmailConfig {
        EmailConfig {
            enabled: true,
            from_address: "reports@example.com".into(),
            ..Default::default()
        }
    }

    fn report() -> ReportMessage {
        ReportMessage {
            payload: b"region,amount\nnorth,10\n".to_vec(),
            filename: "sales_20260101_080000.csv".into(),
            content_type: "text/csv".into(),
            subject: "Scheduled Report: Weekly sales".into(),
            body: "Please find attached the scheduled report for dataset: sales".into(),
        }
    }

    #[test]
    fn test_build_message_attaches_report() {
        let channel = EmailChannel::new(config());
        let message = channel.build_message("boss@example.com", &report()).unwrap();
        let raw = String::from_utf8_lossy(&message.formatted()).to_string();
        assert!(raw.contains("Subject: Scheduled Report: Weekly sales"));
        assert!(raw.contains("boss@example.com"));
        assert!(raw.contains("TabReport <reports@example.com>"));
        assert!(raw.contains("attachment"));
        assert!(raw.contains("sales_20260101_080000.csv"));
        assert!(raw.contains("Please find attached the scheduled report"));
    }

    #[test]
    fn test_build_message_rejects_bad_address() {
        let channel = EmailChannel::new(config());
        let err = channel.build_message("not an address", &report()).unwrap_err();
        assert!(matches!(err, ReportError::Channel(_)));
    }

    #[tokio::test]
    async fn test_missing_sender_fails_every_recipient() {
        let channel = EmailChannel::new(EmailConfig::default());
        let recipients = vec!["a@example.com".to_string(), "b@example.com".to_string()];
        let result = channel.send(&report(), &recipients).await;
        assert!(result.delivered.is_empty());
        assert_eq!(result.failed.len(), 2);
        assert!(result.failed[0].1.contains("from_address"));
    }
}
