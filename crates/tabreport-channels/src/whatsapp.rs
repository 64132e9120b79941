//! WhatsApp Business Cloud API delivery.
//!
//! Reports up to `attachment_limit_bytes` are uploaded once as media and
//! sent to each recipient as a document message. Larger reports are
//! published through the [`ArtifactStore`] and sent as a text link.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use tabreport_core::config::WhatsAppConfig;
use tabreport_core::{ChannelKind, ReportError, Result};

use crate::{ArtifactStore, DeliveryResult, ReportChannel, ReportMessage, Transport};

pub struct WhatsAppChannel {
    config: WhatsAppConfig,
    client: reqwest::Client,
    artifacts: Option<ArtifactStore>,
}

impl WhatsAppChannel {
    pub fn new(config: WhatsAppConfig, artifacts: Option<ArtifactStore>) -> Result<Self> {
        if config.access_token.is_empty() {
            return Err(ReportError::Config(
                "WhatsApp access_token not configured".into(),
            ));
        }
        if config.phone_number_id.is_empty() {
            return Err(ReportError::Config(
                "WhatsApp phone_number_id not configured".into(),
            ));
        }
        Ok(Self {
            config,
            client: reqwest::Client::new(),
            artifacts,
        })
    }

    fn endpoint(&self, resource: &str) -> String {
        format!(
            "{}/{}/{resource}",
            self.config.api_base.trim_end_matches('/'),
            self.config.phone_number_id
        )
    }

    /// Upload the report as media, returning the media id.
    async fn upload_media(&self, report: &ReportMessage) -> Result<String> {
        let part = Part::bytes(report.payload.clone())
            .file_name(report.filename.clone())
            .mime_str(&report.content_type)
            .map_err(|e| ReportError::Channel(format!("Invalid content type: {e}")))?;
        let form = Form::new()
            .text("messaging_product", "whatsapp")
            .text("type", report.content_type.clone())
            .part("file", part);

        let response = self
            .client
            .post(self.endpoint("media"))
            .bearer_auth(&self.config.access_token)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ReportError::Channel(format!("WhatsApp media upload failed: {e}")))?;
        let result = check(response).await?;

        result["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ReportError::Channel("WhatsApp media upload returned no id".into()))
    }

    /// POST one message, returning the message id.
    async fn post_message(&self, body: serde_json::Value) -> Result<String> {
        let response = self
            .client
            .post(self.endpoint("messages"))
            .bearer_auth(&self.config.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| ReportError::Channel(format!("WhatsApp API request failed: {e}")))?;
        let result = check(response).await?;
        Ok(result["messages"][0]["id"]
            .as_str()
            .unwrap_or("unknown")
            .to_string())
    }

    async fn send_document(&self, to: &str, media_id: &str, report: &ReportMessage) -> Result<String> {
        self.post_message(serde_json::json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": normalize_number(to),
            "type": "document",
            "document": {
                "id": media_id,
                "filename": report.filename,
                "caption": report.subject,
            }
        }))
        .await
    }

    async fn send_link(&self, to: &str, url: &str, report: &ReportMessage) -> Result<String> {
        self.post_message(serde_json::json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": normalize_number(to),
            "type": "text",
            "text": {
                "preview_url": true,
                "body": format!("{}\n\n{}\n{url}", report.subject, report.body),
            }
        }))
        .await
    }

    /// Decide the transport, doing the one-off upload or publish.
    async fn prepare(&self, report: &ReportMessage) -> Result<(Transport, Option<String>)> {
        if report.payload.len() <= self.config.attachment_limit_bytes {
            let media_id = self.upload_media(report).await?;
            return Ok((Transport::Attachment, Some(media_id)));
        }
        let store = self.artifacts.as_ref().ok_or_else(|| {
            ReportError::Channel(format!(
                "report is {} bytes, over the {} byte attachment limit, and no artifact store is configured",
                report.payload.len(),
                self.config.attachment_limit_bytes
            ))
        })?;
        let url = store.publish(&report.filename, &report.payload).await?;
        tracing::info!(
            "📎 {} exceeds WhatsApp attachment limit, sending link instead",
            report.filename
        );
        Ok((Transport::Link(url), None))
    }
}

async fn check(response: reqwest::Response) -> Result<serde_json::Value> {
    if !response.status().is_success() {
        let status = response.status();
        let error_text = response.text().await.unwrap_or_default();
        return Err(ReportError::Channel(format!(
            "WhatsApp API error {status}: {error_text}"
        )));
    }
    response
        .json()
        .await
        .map_err(|e| ReportError::Channel(format!("Invalid WhatsApp response: {e}")))
}

/// The Cloud API expects digits only.
fn normalize_number(number: &str) -> String {
    number.chars().filter(char::is_ascii_digit).collect()
}

#[async_trait]
impl ReportChannel for WhatsAppChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::WhatsApp
    }

    async fn send(&self, report: &ReportMessage, recipients: &[String]) -> DeliveryResult {
        let (transport, media_id) = match self.prepare(report).await {
            Ok(prepared) => prepared,
            Err(e) => {
                tracing::error!("❌ WhatsApp delivery of {} failed: {e}", report.filename);
                return DeliveryResult::all_failed(ChannelKind::WhatsApp, recipients, &e.to_string());
            }
        };

        let mut result = DeliveryResult::new(ChannelKind::WhatsApp, transport.clone());
        for to in recipients {
            let sent = match (&transport, &media_id) {
                (Transport::Link(url), _) => self.send_link(to, url, report).await,
                (Transport::Attachment, Some(id)) => self.send_document(to, id, report).await,
                (Transport::Attachment, None) => {
                    Err(ReportError::Channel("media upload missing".into()))
                }
            };
            match sent {
                Ok(msg_id) => {
                    tracing::debug!("WhatsApp message sent: {msg_id} → {to}");
                    result.delivered.push(to.clone());
                }
                Err(e) => {
                    tracing::warn!("⚠️ WhatsApp to {to} failed: {e}");
                    result.failed.push((to.clone(), e.to_string()));
                }
            }
        }
        result
    }
}
