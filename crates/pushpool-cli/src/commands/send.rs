use std::time::Duration;

use anyhow::{Context, bail};
use pushpool_apns::{Notification, NotificationClient};
use pushpool_core::config::parse_duration;
use pushpool_core::PushpoolConfig;
use serde_json::Value;

use super::build_manager;

pub struct SendOptions {
    pub cert: String,
    pub tokens: Vec<String>,
    pub message: String,
    pub badge: Option<u32>,
    pub sound: Option<String>,
    pub silent: bool,
    pub content_available: bool,
    pub fields: Vec<(String, Value)>,
    pub timeout: String,
}

/// Parse `key=value`; the value is JSON when it parses, a string otherwise.
pub fn parse_field(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    if key.is_empty() {
        return Err("field name must not be empty".to_string());
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn build_notification(options: &SendOptions) -> Notification {
    let mut notification = Notification::new(&options.message).content_available(options.content_available);
    if let Some(badge) = options.badge {
        notification = notification.badge(badge);
    }
    if options.silent {
        notification = notification.silent();
    } else if let Some(sound) = &options.sound {
        notification = notification.sound(sound);
    }
    for (key, value) in &options.fields {
        notification = notification.field(key, value.clone());
    }
    notification
}

pub async fn send(config: &PushpoolConfig, options: SendOptions) -> anyhow::Result<()> {
    let timeout: Duration = parse_duration(&options.timeout)
        .with_context(|| format!("invalid --timeout '{}'", options.timeout))?;
    let notification = build_notification(&options);
    let batch = options
        .tokens
        .iter()
        .map(|token| notification.build(token).with_context(|| format!("token {token}")))
        .collect::<anyhow::Result<Vec<_>>>()?;
    if batch.is_empty() {
        bail!("no device tokens given");
    }

    let manager = build_manager(config)?;
    let gateway = config.gateway_settings()?;
    let client = NotificationClient::new(manager, &gateway, &options.cert, timeout);

    match client.send(&batch).await {
        Ok(report) => {
            println!(
                "✓ Sent {} notification(s) to {} (ids {}..{})",
                report.sent,
                client.key(),
                report.first_identifier,
                report.first_identifier.wrapping_add(report.sent as u32)
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("Send failed: {e}");
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> SendOptions {
        SendOptions {
            cert: "app.pem".to_string(),
            tokens: vec![],
            message: "hello".to_string(),
            badge: None,
            sound: None,
            silent: false,
            content_available: true,
            fields: vec![],
            timeout: "10s".to_string(),
        }
    }

    fn payload(options: &SendOptions) -> Value {
        serde_json::from_slice(&build_notification(options).to_payload().unwrap()).unwrap()
    }

    #[test]
    fn parse_field_keeps_json_types() {
        assert_eq!(parse_field("n=3").unwrap(), ("n".to_string(), Value::from(3)));
        assert_eq!(parse_field("ok=true").unwrap().1, Value::Bool(true));
        assert_eq!(parse_field("name=bob").unwrap().1, Value::String("bob".to_string()));
        assert_eq!(parse_field("eq=a=b").unwrap().1, Value::String("a=b".to_string()));
    }

    #[test]
    fn parse_field_rejects_malformed() {
        assert!(parse_field("novalue").is_err());
        assert!(parse_field("=x").is_err());
    }

    #[test]
    fn silent_overrides_sound() {
        let doc = payload(&SendOptions {
            silent: true,
            ..options()
        });
        assert!(doc["aps"].get("sound").is_none());
    }

    #[test]
    fn options_flow_into_payload() {
        let doc = payload(&SendOptions {
            badge: Some(2),
            sound: Some("chime".to_string()),
            content_available: false,
            fields: vec![("game".to_string(), Value::from(7))],
            ..options()
        });
        assert_eq!(doc["aps"]["badge"], 2);
        assert_eq!(doc["aps"]["sound"], "chime");
        assert!(doc["aps"].get("content-available").is_none());
        assert_eq!(doc["game"], 7);
    }
}
