//! pushpool-apns: push notifications over pooled gateway connections.
//!
//! ```text
//! Notification::new(msg).badge(1).build(token)   → NotificationRequest
//! NotificationClient::send(&[requests])
//!   → PoolManager::with_connection → frames out, error frame (if any) in
//! ```

pub mod client;
pub mod frame;
pub mod payload;

pub use client::{NotificationClient, SendReport};
pub use frame::{ErrorResponse, Status};
pub use payload::{MAX_PAYLOAD_LEN, Notification, NotificationRequest, PayloadError, parse_token};
