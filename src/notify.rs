//! Notification fan-out. The alert engine hands finished events to
//! [`NotifyHandle::enqueue`] and never looks at channels itself; the
//! worker task loads the channel list per event, renders the
//! channel-specific payload, and delivers to every enabled channel in
//! parallel. One channel failing does not affect the others, and a
//! failed send is only visible in the logs — the alert record is the
//! source of truth.
//!
//! Signed channels (DingTalk, Feishu) compute their HMAC immediately
//! before the request goes out; the signature embeds the send
//! timestamp.

use std::collections::HashMap;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use hmac::{Hmac, Mac};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::Sha256;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::property::{AlertConfig, PropertyStore};

type HmacSha256 = Hmac<Sha256>;

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);
const QUEUE_CAPACITY: usize = 256;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EventKind {
    AlertFiring,
    AlertResolved,
    SshLogin,
    Tamper,
}

/// A finished, self-contained notification event. Values only — no
/// references back into the alert engine.
#[derive(Clone, Debug)]
pub struct AlertEvent {
    pub kind: EventKind,
    pub agent_id: String,
    pub agent_name: String,
    pub alert_type: String,
    pub message: String,
    pub threshold: f64,
    pub value: f64,
    pub at_ms: i64,
}

impl AlertEvent {
    pub fn status(&self) -> &'static str {
        match self.kind {
            EventKind::AlertFiring => "firing",
            EventKind::AlertResolved => "resolved",
            EventKind::SshLogin | EventKind::Tamper => "event",
        }
    }
}

/// One entry of the `notification_channels` property.
#[derive(Clone, Deserialize, Serialize, Debug)]
pub struct ChannelConfig {
    #[serde(rename = "type")]
    pub channel_type: String,
    pub enabled: bool,
    #[serde(default)]
    pub config: Value,
}

#[derive(Clone)]
pub struct NotifyHandle {
    tx: mpsc::Sender<AlertEvent>,
}

impl NotifyHandle {
    /// Non-blocking enqueue. A full queue drops the event with a log
    /// line; the record is already persisted, so nothing is lost that
    /// the operator cannot see.
    pub fn enqueue(&self, event: AlertEvent) {
        if let Err(err) = self.tx.try_send(event) {
            warn!("notification queue full, dropping event: {err}");
        }
    }
}

/// Spawn the worker. The worker drains until every handle is dropped,
/// which is how shutdown finishes in-flight notifications.
pub fn spawn(props: PropertyStore) -> (NotifyHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<AlertEvent>(QUEUE_CAPACITY);
    let worker = tokio::spawn(async move {
        let client = match reqwest::Client::builder().timeout(NOTIFY_TIMEOUT).build() {
            Ok(client) => client,
            Err(err) => {
                warn!("notifier disabled, http client failed to build: {err}");
                return;
            }
        };
        while let Some(event) = rx.recv().await {
            let cfg = props.alert_config().await;
            if !event_enabled(&cfg, event.kind) {
                continue;
            }
            let channels = props.notification_channels().await;
            deliver(&client, &cfg, &channels, &event).await;
        }
    });
    (NotifyHandle { tx }, worker)
}

fn event_enabled(cfg: &AlertConfig, kind: EventKind) -> bool {
    match kind {
        EventKind::AlertFiring => cfg.notify.alert,
        EventKind::AlertResolved => cfg.notify.resolved,
        EventKind::SshLogin => cfg.notify.ssh_login,
        EventKind::Tamper => cfg.notify.tamper,
    }
}

async fn deliver(
    client: &reqwest::Client,
    cfg: &AlertConfig,
    channels: &[ChannelConfig],
    event: &AlertEvent,
) {
    let mut text = render_text(event);
    if cfg.mask_ip {
        text = mask_ips(&text);
    }

    let sends = channels.iter().filter(|c| c.enabled).map(|channel| {
        let text = text.clone();
        async move {
            if let Err(err) = send_channel(client, channel, event, &text).await {
                warn!(channel = %channel.channel_type, "notification send failed: {err}");
            } else {
                info!(channel = %channel.channel_type, alert_type = %event.alert_type, "notification sent");
            }
        }
    });
    futures_util::future::join_all(sends).await;
}

/// Plain-text rendering used by the chat channels.
pub fn render_text(event: &AlertEvent) -> String {
    match event.kind {
        EventKind::AlertFiring => format!("[firing] {}", event.message),
        EventKind::AlertResolved => format!("[resolved] {}", event.message),
        EventKind::SshLogin | EventKind::Tamper => event.message.clone(),
    }
}

async fn send_channel(
    client: &reqwest::Client,
    channel: &ChannelConfig,
    event: &AlertEvent,
    text: &str,
) -> anyhow::Result<()> {
    match channel.channel_type.as_str() {
        "dingtalk" => send_dingtalk(client, &channel.config, text).await,
        "wecom" => send_wecom(client, &channel.config, text).await,
        "feishu" => send_feishu(client, &channel.config, text).await,
        "webhook" => send_webhook(client, &channel.config, event, text).await,
        other => anyhow::bail!("unknown channel type {other}"),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatChannel {
    webhook_url: String,
    #[serde(default)]
    secret: Option<String>,
}

async fn send_dingtalk(client: &reqwest::Client, config: &Value, text: &str) -> anyhow::Result<()> {
    let cfg: ChatChannel = serde_json::from_value(config.clone())?;
    let mut url = cfg.webhook_url;
    if let Some(secret) = cfg.secret.as_deref() {
        let ts = Utc::now().timestamp_millis();
        let sign = dingtalk_sign(secret, ts)?;
        url = format!("{url}&timestamp={ts}&sign={}", urlencoding::encode(&sign));
    }
    let body = json!({ "msgtype": "text", "text": { "content": text } });
    let resp = client.post(&url).json(&body).send().await?;
    resp.error_for_status()?;
    Ok(())
}

/// DingTalk signature: HMAC-SHA256 of `"{timestamp}\n{secret}"` keyed
/// by the secret, base64 encoded (URL-encoding happens at the call
/// site where it joins the query string).
pub fn dingtalk_sign(secret: &str, timestamp_ms: i64) -> anyhow::Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|err| anyhow::anyhow!("invalid dingtalk secret: {err}"))?;
    mac.update(format!("{timestamp_ms}\n{secret}").as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

async fn send_wecom(client: &reqwest::Client, config: &Value, text: &str) -> anyhow::Result<()> {
    let cfg: ChatChannel = serde_json::from_value(config.clone())?;
    let body = json!({ "msgtype": "text", "text": { "content": text } });
    let resp = client.post(&cfg.webhook_url).json(&body).send().await?;
    resp.error_for_status()?;
    Ok(())
}

async fn send_feishu(client: &reqwest::Client, config: &Value, text: &str) -> anyhow::Result<()> {
    let cfg: ChatChannel = serde_json::from_value(config.clone())?;
    let mut body = json!({ "msg_type": "text", "content": { "text": text } });
    if let Some(secret) = cfg.secret.as_deref() {
        let ts = Utc::now().timestamp();
        body["timestamp"] = json!(ts.to_string());
        body["sign"] = json!(feishu_sign(secret, ts)?);
    }
    let resp = client.post(&cfg.webhook_url).json(&body).send().await?;
    resp.error_for_status()?;
    Ok(())
}

/// Feishu signature: HMAC-SHA256 keyed by `"{timestamp}\n{secret}"`
/// over an empty message, base64 encoded.
pub fn feishu_sign(secret: &str, timestamp_secs: i64) -> anyhow::Result<String> {
    let key = format!("{timestamp_secs}\n{secret}");
    let mac = HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|err| anyhow::anyhow!("invalid feishu secret: {err}"))?;
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookChannel {
    url: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    custom_body: Option<String>,
}

async fn send_webhook(
    client: &reqwest::Client,
    config: &Value,
    event: &AlertEvent,
    text: &str,
) -> anyhow::Result<()> {
    let cfg: WebhookChannel = serde_json::from_value(config.clone())?;
    let method = cfg.method.as_deref().unwrap_or("POST");
    let method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())?;

    let body = match cfg.custom_body.as_deref() {
        Some(template) => render_template(template, event, text),
        None => json!({
            "agent": event.agent_name,
            "type": event.alert_type,
            "status": event.status(),
            "message": text,
            "threshold": event.threshold,
            "value": event.value,
            "time": event.at_ms,
        })
        .to_string(),
    };

    let mut req = client.request(method, &cfg.url).body(body);
    for (name, value) in &cfg.headers {
        req = req.header(name, value);
    }
    let resp = req.send().await?;
    resp.error_for_status()?;
    Ok(())
}

/// Substitute `${placeholder}` tokens in a webhook body template from
/// the alert context.
pub fn render_template(template: &str, event: &AlertEvent, text: &str) -> String {
    template
        .replace("${agent}", &event.agent_name)
        .replace("${agent_id}", &event.agent_id)
        .replace("${type}", &event.alert_type)
        .replace("${status}", event.status())
        .replace("${message}", text)
        .replace("${threshold}", &format_number(event.threshold))
        .replace("${value}", &format_number(event.value))
        .replace("${time}", &event.at_ms.to_string())
}

fn format_number(v: f64) -> String {
    if v.fract() == 0.0 { format!("{v:.0}") } else { format!("{v:.2}") }
}

/// Replace the last IPv4 octet / IPv6 segment with `*`.
pub fn mask_ips(text: &str) -> String {
    let v4 = Regex::new(r"\b(\d{1,3}\.\d{1,3}\.\d{1,3})\.\d{1,3}\b");
    let v6 = Regex::new(r"\b([0-9a-fA-F]{1,4}(?::[0-9a-fA-F]{1,4}){2,6}):[0-9a-fA-F]{1,4}\b");
    let mut out = text.to_string();
    if let Ok(re) = v4 {
        out = re.replace_all(&out, "$1.*").into_owned();
    }
    if let Ok(re) = v6 {
        out = re.replace_all(&out, "$1:*").into_owned();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> AlertEvent {
        AlertEvent {
            kind: EventKind::AlertFiring,
            agent_id: "a1".into(),
            agent_name: "web-1".into(),
            alert_type: "cpu".into(),
            message: "CPU usage on web-1 is 92.5% (threshold 85%)".into(),
            threshold: 85.0,
            value: 92.5,
            at_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn template_substitutes_all_placeholders() {
        let body = render_template(
            r#"{"host":"${agent}","kind":"${type}","st":"${status}","th":${threshold},"v":${value},"at":${time}}"#,
            &event(),
            "msg",
        );
        assert_eq!(
            body,
            r#"{"host":"web-1","kind":"cpu","st":"firing","th":85,"v":92.50,"at":1700000000000}"#
        );
    }

    #[test]
    fn unknown_placeholders_are_left_alone() {
        let body = render_template("${agent} ${nope}", &event(), "m");
        assert_eq!(body, "web-1 ${nope}");
    }

    #[test]
    fn text_rendering_carries_status_prefix() {
        let mut ev = event();
        assert!(render_text(&ev).starts_with("[firing] "));
        ev.kind = EventKind::AlertResolved;
        assert!(render_text(&ev).starts_with("[resolved] "));
    }

    #[test]
    fn ipv4_mask_replaces_last_octet() {
        assert_eq!(
            mask_ips("login from 203.0.113.87 accepted"),
            "login from 203.0.113.* accepted"
        );
    }

    #[test]
    fn ipv6_mask_replaces_last_segment() {
        assert_eq!(mask_ips("peer 2001:db8:85a3:1:2:8a2e:370:7334"), "peer 2001:db8:85a3:1:2:8a2e:370:*");
    }

    #[test]
    fn non_ip_numbers_survive_masking() {
        assert_eq!(mask_ips("disk usage is 90.5% at 12:30"), "disk usage is 90.5% at 12:30");
    }

    #[test]
    fn dingtalk_sign_is_deterministic_per_timestamp() {
        let a = dingtalk_sign("secret", 1_700_000_000_000).unwrap();
        let b = dingtalk_sign("secret", 1_700_000_000_000).unwrap();
        let c = dingtalk_sign("secret", 1_700_000_000_001).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        // base64 of a 32-byte MAC
        assert_eq!(a.len(), 44);
    }

    #[test]
    fn feishu_sign_differs_from_dingtalk_scheme() {
        let ts = 1_700_000_000;
        let feishu = feishu_sign("secret", ts).unwrap();
        let ding = dingtalk_sign("secret", ts).unwrap();
        assert_ne!(feishu, ding);
        assert_eq!(feishu.len(), 44);
    }

    #[test]
    fn event_toggles_gate_kinds() {
        let mut cfg = AlertConfig::default();
        cfg.notify.resolved = false;
        assert!(event_enabled(&cfg, EventKind::AlertFiring));
        assert!(!event_enabled(&cfg, EventKind::AlertResolved));
        assert!(event_enabled(&cfg, EventKind::SshLogin));
    }
}
