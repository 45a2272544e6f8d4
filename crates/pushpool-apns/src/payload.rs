//! Notification payload builder.
//!
//! Produces the compact JSON document the gateway expects, with custom
//! context merged at the top level next to the `aps` dictionary:
//!
//! ```text
//! {"aps":{"alert":"hi","badge":3,"content-available":1,"sound":"default"},"game":"42"}
//! ```

use bytes::Bytes;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Largest payload the gateway accepts, in bytes.
pub const MAX_PAYLOAD_LEN: usize = 256;

/// Device tokens are 32 raw bytes (64 hex characters).
pub const TOKEN_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("invalid device token: {0}")]
    InvalidToken(String),

    #[error("payload serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct Aps<'a> {
    alert: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    badge: Option<u32>,
    #[serde(rename = "content-available", skip_serializing_if = "Option::is_none")]
    content_available: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sound: Option<&'a str>,
}

/// A notification ready to be framed: binary token plus encoded payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NotificationRequest {
    pub token: [u8; TOKEN_LEN],
    pub payload: Bytes,
    /// Unix seconds after which the gateway may drop the notification; 0 means
    /// deliver once or not at all.
    pub expiry: u32,
}

/// Builder for one device notification.
#[derive(Clone, Debug)]
pub struct Notification {
    message: String,
    badge: Option<u32>,
    sound: Option<String>,
    content_available: bool,
    context: Map<String, Value>,
    expiry: u32,
}

impl Notification {
    /// Alert with the default sound and `content-available` set.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            badge: None,
            sound: Some("default".to_string()),
            content_available: true,
            context: Map::new(),
            expiry: 0,
        }
    }

    /// Set the app badge; 0 clears it.
    pub fn badge(mut self, badge: u32) -> Self {
        self.badge = Some(badge);
        self
    }

    pub fn sound(mut self, sound: impl Into<String>) -> Self {
        self.sound = Some(sound.into());
        self
    }

    /// Deliver without a sound.
    pub fn silent(mut self) -> Self {
        self.sound = None;
        self
    }

    pub fn content_available(mut self, flag: bool) -> Self {
        self.content_available = flag;
        self
    }

    /// Add a custom top-level field. An `aps` field is overwritten.
    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn context(mut self, context: Map<String, Value>) -> Self {
        self.context.extend(context);
        self
    }

    pub fn expiry(mut self, unix_secs: u32) -> Self {
        self.expiry = unix_secs;
        self
    }

    /// Encode the JSON document, enforcing [`MAX_PAYLOAD_LEN`].
    pub fn to_payload(&self) -> Result<Vec<u8>, PayloadError> {
        let aps = Aps {
            alert: &self.message,
            badge: self.badge,
            content_available: self.content_available.then_some(1),
            sound: self.sound.as_deref().filter(|s| !s.is_empty()),
        };
        let mut document = self.context.clone();
        document.insert("aps".to_string(), serde_json::to_value(aps)?);

        let payload = serde_json::to_vec(&document)?;
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(PayloadError::TooLarge {
                size: payload.len(),
                limit: MAX_PAYLOAD_LEN,
            });
        }
        Ok(payload)
    }

    /// Pair the payload with a hex device token.
    pub fn build(&self, token_hex: &str) -> Result<NotificationRequest, PayloadError> {
        let payload = self.to_payload()?;
        Ok(NotificationRequest {
            token: parse_token(token_hex)?,
            payload: Bytes::from(payload),
            expiry: self.expiry,
        })
    }
}

/// Decode a 64-character hex device token.
pub fn parse_token(token_hex: &str) -> Result<[u8; TOKEN_LEN], PayloadError> {
    let raw = hex::decode(token_hex.trim()).map_err(|e| PayloadError::InvalidToken(e.to_string()))?;
    raw.try_into().map_err(|raw: Vec<u8>| {
        PayloadError::InvalidToken(format!("expected {TOKEN_LEN} bytes, got {}", raw.len()))
    })
}
