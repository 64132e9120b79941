//! # TabReport Channels
//!
//! Delivers a rendered report to a list of recipients.
//! Every channel implements [`ReportChannel`]; a [`ChannelSet`] holds at
//! most one sender per [`ChannelKind`] and routes recipients to them.

pub mod artifacts;
pub mod email;
pub mod whatsapp;

use std::sync::Arc;

use async_trait::async_trait;
use tabreport_core::{ChannelKind, Recipient, ReportConfig, Result};

pub use artifacts::ArtifactStore;
pub use email::EmailChannel;
pub use whatsapp::WhatsAppChannel;

/// A rendered report ready for delivery.
#[derive(Debug, Clone)]
pub struct ReportMessage {
    pub payload: Vec<u8>,
    pub filename: String,
    pub content_type: String,
    pub subject: String,
    pub body: String,
}

/// How the report reached the recipients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// The file itself was attached.
    Attachment,
    /// The file was published and a link sent instead.
    Link(String),
}

/// Outcome of one channel's delivery attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryResult {
    pub channel: ChannelKind,
    pub delivered: Vec<String>,
    /// (recipient, reason)
    pub failed: Vec<(String, String)>,
    pub transport: Transport,
}

impl DeliveryResult {
    pub fn new(channel: ChannelKind, transport: Transport) -> Self {
        Self {
            channel,
            delivered: Vec::new(),
            failed: Vec::new(),
            transport,
        }
    }

    /// Every recipient failed for the same reason.
    pub fn all_failed(channel: ChannelKind, recipients: &[String], reason: &str) -> Self {
        Self {
            channel,
            delivered: Vec::new(),
            failed: recipients
                .iter()
                .map(|r| (r.clone(), reason.to_string()))
                .collect(),
            transport: Transport::Attachment,
        }
    }
}

/// A delivery mechanism.
///
/// `send` never fails as a whole: per-recipient failures are reported in
/// the result so one bad address does not block the others.
#[async_trait]
pub trait ReportChannel: Send + Sync {
    fn kind(&self) -> ChannelKind;

    async fn send(&self, report: &ReportMessage, recipients: &[String]) -> DeliveryResult;
}

/// The configured senders, at most one per channel kind.
#[derive(Clone, Default)]
pub struct ChannelSet {
    email: Option<Arc<dyn ReportChannel>>,
    whatsapp: Option<Arc<dyn ReportChannel>>,
}

impl ChannelSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel, replacing any previous one of the same kind.
    pub fn with(mut self, channel: Arc<dyn ReportChannel>) -> Self {
        match channel.kind() {
            ChannelKind::Email => self.email = Some(channel),
            ChannelKind::WhatsApp => self.whatsapp = Some(channel),
        }
        self
    }

    /// Build the senders enabled in config.
    pub fn from_config(config: &ReportConfig) -> Result<Self> {
        let mut set = Self::new();
        if config.email.enabled {
            set = set.with(Arc::new(EmailChannel::new(config.email.clone())));
            tracing::info!("📧 Email channel enabled ({})", config.email.smtp_host);
        }
        if config.whatsapp.enabled {
            let artifacts = ArtifactStore::from_config(&config.artifacts);
            set = set.with(Arc::new(WhatsAppChannel::new(
                config.whatsapp.clone(),
                Some(artifacts),
            )?));
            tracing::info!("💬 WhatsApp channel enabled");
        }
        Ok(set)
    }

    pub fn get(&self, kind: ChannelKind) -> Option<&Arc<dyn ReportChannel>> {
        match kind {
            ChannelKind::Email => self.email.as_ref(),
            ChannelKind::WhatsApp => self.whatsapp.as_ref(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.email.is_none() && self.whatsapp.is_none()
    }

    /// Route recipients to their channels and send concurrently.
    /// Recipients of an unconfigured channel are reported as failed.
    pub async fn deliver(
        &self,
        report: &ReportMessage,
        recipients: &[Recipient],
    ) -> Vec<DeliveryResult> {
        let mut sends = Vec::new();
        let mut results = Vec::new();
        for kind in [ChannelKind::Email, ChannelKind::WhatsApp] {
            let targets: Vec<String> = recipients
                .iter()
                .filter(|r| r.channel == kind)
                .map(|r| r.target.clone())
                .collect();
            if targets.is_empty() {
                continue;
            }
            match self.get(kind) {
                Some(channel) => {
                    let channel = channel.clone();
                    sends.push(async move { channel.send(report, &targets).await });
                }
                None => {
                    tracing::warn!("⚠️ {kind} channel not configured, {} recipient(s) skipped", targets.len());
                    results.push(DeliveryResult::all_failed(
                        kind,
                        &targets,
                        &format!("{kind} channel not configured"),
                    ));
                }
            }
        }
        results.extend(futures::future::join_all(sends).await);
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recording {
        kind: ChannelKind,
    }

    #[async_trait]
    impl ReportChannel for Recording {
        fn kind(&self) -> ChannelKind {
            self.kind
        }

        async fn send(&self, _report: &ReportMessage, recipients: &[String]) -> DeliveryResult {
            let mut result = DeliveryResult::new(self.kind, Transport::Attachment);
            result.delivered = recipients.to_vec();
            result
        }
    }

    fn message() -> ReportMessage {
        ReportMessage {
            payload: b"a,b\n".to_vec(),
            filename: "sales.csv".into(),
            content_type: "text/csv".into(),
            subject: "Scheduled Report: sales".into(),
            body: "attached".into(),
        }
    }

    #[tokio::test]
    async fn test_deliver_routes_by_channel() {
        let set = ChannelSet::new().with(Arc::new(Recording {
            kind: ChannelKind::Email,
        }));
        let recipients = vec![
            Recipient::email("a@example.com"),
            Recipient::whatsapp("+15550001111"),
            Recipient::email("b@example.com"),
        ];
        let results = set.deliver(&message(), &recipients).await;
        assert_eq!(results.len(), 2);

        let email = results.iter().find(|r| r.channel == ChannelKind::Email).unwrap();
        assert_eq!(email.delivered, vec!["a@example.com", "b@example.com"]);

        let wa = results.iter().find(|r| r.channel == ChannelKind::WhatsApp).unwrap();
        assert!(wa.delivered.is_empty());
        assert_eq!(wa.failed[0].0, "+15550001111");
        assert!(wa.failed[0].1.contains("not configured"));
    }

    #[test]
    fn test_from_config_disabled_is_empty() {
        let set = ChannelSet::from_config(&ReportConfig::default()).unwrap();
        assert!(set.is_empty());
    }
}
