//! Digest delivery adapters.
//!
//! The core hands over the consolidated digest, its rendered HTML + text
//! and a recipient list; retries beyond one SMTP conversation are the
//! provider's concern, not ours.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use async_trait::async_trait;
use lettre::{
    message::{Mailbox, MultiPart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use thiserror::Error;
use tracing::{info, warn};

use nightwatch_core::digest::Digest;

/// Alerts included in the webhook payload.
const WEBHOOK_TOP_ALERTS: usize = 5;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("smtp delivery failed: {0}")]
    Smtp(String),

    #[error("webhook delivery failed: {0}")]
    Webhook(String),
}

#[async_trait]
pub trait DeliveryAdapter: Send + Sync {
    /// Hand the digest to the provider. Returns a provider id for the
    /// run summary.
    async fn deliver(
        &self,
        digest: &Digest,
        digest_html: &str,
        digest_text: &str,
        recipients: &[String],
    ) -> Result<String, DeliveryError>;
}

/// No-op adapter for dry runs and tests.
pub struct NoopDelivery;

#[async_trait]
impl DeliveryAdapter for NoopDelivery {
    async fn deliver(
        &self,
        _digest: &Digest,
        _digest_html: &str,
        _digest_text: &str,
        recipients: &[String],
    ) -> Result<String, DeliveryError> {
        info!(recipients = recipients.len(), "noop delivery");
        Ok("noop".to_string())
    }
}

/// Production adapter: SMTP via `NIGHTWATCH_SMTP_*`, plus an optional
/// JSON webhook (`NIGHTWATCH_WEBHOOK_URL`) for chat notifications.
#[derive(Default)]
pub struct EnvDelivery;

#[async_trait]
impl DeliveryAdapter for EnvDelivery {
    async fn deliver(
        &self,
        digest: &Digest,
        digest_html: &str,
        digest_text: &str,
        recipients: &[String],
    ) -> Result<String, DeliveryError> {
        let mut channels: Vec<&str> = Vec::new();

        if recipients.is_empty() {
            warn!("no digest recipients configured; skipping email delivery");
        } else {
            deliver_email(digest_html, digest_text, recipients).await?;
            channels.push("smtp");
        }

        if let Ok(url) = std::env::var("NIGHTWATCH_WEBHOOK_URL") {
            if !url.trim().is_empty() {
                deliver_webhook(url.trim(), &webhook_payload(digest)).await?;
                channels.push("webhook");
            }
        }

        if channels.is_empty() {
            return Ok("unconfigured".to_string());
        }
        Ok(channels.join("+"))
    }
}

/// Structured chat payload: the counts plus the highest-ranked alerts,
/// not the whole rendered email.
fn webhook_payload(digest: &Digest) -> serde_json::Value {
    let top_alerts: Vec<serde_json::Value> = digest
        .alerts
        .iter()
        .take(WEBHOOK_TOP_ALERTS)
        .map(|alert| {
            serde_json::json!({
                "property_id": alert.property_id,
                "priority": alert.priority,
                "detector": alert.detector,
                "dimension": alert.dimension,
                "dimension_value": alert.dimension_value,
                "metric": alert.metric,
                "business_impact": alert.business_impact,
                "message": alert.message,
            })
        })
        .collect();
    serde_json::json!({
        "kind": "digest",
        "reference_date": digest.reference_date,
        "properties_analyzed": digest.properties_analyzed,
        "total_alerts": digest.total_alerts,
        "counts": digest.counts,
        "all_clear": digest.all_clear(),
        "top_alerts": top_alerts,
    })
}

fn is_valid_email(target: &str) -> bool {
    let trimmed = target.trim();
    let Some((local, domain)) = trimmed.split_once('@') else {
        return false;
    };
    !local.is_empty() && domain.contains('.') && !domain.starts_with('.')
}

fn smtp_noop_enabled() -> bool {
    std::env::var("NIGHTWATCH_SMTP_NOOP")
        .ok()
        .map(|v| {
            let trimmed = v.trim();
            trimmed.eq_ignore_ascii_case("1")
                || trimmed.eq_ignore_ascii_case("true")
                || trimmed.eq_ignore_ascii_case("yes")
        })
        .unwrap_or(false)
}

async fn deliver_email(
    digest_html: &str,
    digest_text: &str,
    recipients: &[String],
) -> Result<(), DeliveryError> {
    for recipient in recipients {
        if !is_valid_email(recipient) {
            return Err(DeliveryError::InvalidRecipient(recipient.clone()));
        }
    }

    if smtp_noop_enabled() {
        info!(
            recipients = recipients.len(),
            "SMTP noop transport enabled; marking digest as sent without network dispatch"
        );
        return Ok(());
    }

    let host = std::env::var("NIGHTWATCH_SMTP_HOST")
        .map_err(|_| DeliveryError::Smtp("smtp host is not configured".to_string()))?;
    let port = std::env::var("NIGHTWATCH_SMTP_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(587);
    let from_value = std::env::var("NIGHTWATCH_SMTP_FROM")
        .unwrap_or_else(|_| "nightwatch@localhost".to_string());
    let from: Mailbox = from_value
        .parse()
        .map_err(|_| DeliveryError::Smtp("invalid NIGHTWATCH_SMTP_FROM".to_string()))?;

    let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
        .port(port)
        .timeout(Some(Duration::from_secs(10)));
    if let (Ok(user), Ok(pass)) = (
        std::env::var("NIGHTWATCH_SMTP_USERNAME"),
        std::env::var("NIGHTWATCH_SMTP_PASSWORD"),
    ) {
        builder = builder.credentials(Credentials::new(user, pass));
    }
    let mailer = builder.build();

    for recipient in recipients {
        let to: Mailbox = recipient
            .parse()
            .map_err(|_| DeliveryError::InvalidRecipient(recipient.clone()))?;
        let email = Message::builder()
            .from(from.clone())
            .to(to)
            .subject("Nightwatch daily digest")
            .multipart(MultiPart::alternative_plain_html(
                digest_text.to_string(),
                digest_html.to_string(),
            ))
            .map_err(|e| DeliveryError::Smtp(format!("message build failed: {e}")))?;
        mailer
            .send(email)
            .await
            .map_err(|e| DeliveryError::Smtp(format!("send failed: {e}")))?;
    }
    Ok(())
}

async fn deliver_webhook(
    target: &str,
    payload: &serde_json::Value,
) -> Result<(), DeliveryError> {
    let parsed =
        url::Url::parse(target).map_err(|_| DeliveryError::Webhook("invalid url".to_string()))?;
    let scheme = parsed.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(DeliveryError::Webhook(
            "url must use http or https".to_string(),
        ));
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| DeliveryError::Webhook("url missing host".to_string()))?;
    if host.eq_ignore_ascii_case("localhost") {
        return Err(DeliveryError::Webhook(
            "target host is not allowed".to_string(),
        ));
    }
    let host_owned = host.to_string();
    let port = parsed
        .port_or_known_default()
        .ok_or_else(|| DeliveryError::Webhook("url missing port".to_string()))?;

    // Resolve up front and pin the connection to the resolved addresses so
    // a rebinding DNS entry cannot swap in an internal target after the
    // check.
    let host_for_dns = host_owned.clone();
    let resolved: Vec<SocketAddr> = tokio::task::spawn_blocking(move || {
        (host_for_dns.as_str(), port)
            .to_socket_addrs()
            .map(|iter| iter.collect::<Vec<_>>())
    })
    .await
    .map_err(|e| DeliveryError::Webhook(format!("dns task join failed: {e}")))?
    .map_err(|e| DeliveryError::Webhook(format!("dns resolve failed: {e}")))?;
    if resolved.is_empty() {
        return Err(DeliveryError::Webhook(
            "dns resolve returned no addresses".to_string(),
        ));
    }
    if resolved.iter().any(|addr| is_disallowed_ip(addr.ip())) {
        return Err(DeliveryError::Webhook(
            "target resolves to non-public address".to_string(),
        ));
    }

    let mut builder = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(3))
        .timeout(Duration::from_secs(5))
        .redirect(reqwest::redirect::Policy::none());
    if host_owned.parse::<IpAddr>().is_err() {
        for addr in &resolved {
            builder = builder.resolve(host_owned.as_str(), *addr);
        }
    }
    let client = builder
        .build()
        .map_err(|e| DeliveryError::Webhook(format!("client build failed: {e}")))?;
    let response = client
        .post(parsed)
        .json(payload)
        .send()
        .await
        .map_err(|e| DeliveryError::Webhook(format!("send failed: {e}")))?;
    if !response.status().is_success() {
        return Err(DeliveryError::Webhook(format!(
            "responded with status {}",
            response.status()
        )));
    }
    Ok(())
}

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_broadcast()
                || v4.is_unspecified()
                || v4.octets()[0] == 0
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6
                    .to_ipv4()
                    .map(|v4| {
                        v4.is_private()
                            || v4.is_loopback()
                            || v4.is_link_local()
                            || v4.is_multicast()
                            || v4.is_broadcast()
                            || v4.is_unspecified()
                            || v4.octets()[0] == 0
                    })
                    .unwrap_or(false)
        }
    }
}
