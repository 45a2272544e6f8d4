//! Gateway binary protocol.
//!
//! ```text
//! send  (command 1): u8 cmd | u32 id | u32 expiry | u16 token_len | token
//!                    | u16 payload_len | payload
//! error (command 8): u8 cmd | u8 status | u32 id
//! ```
//!
//! The gateway answers only on failure. After an error frame it closes the
//! connection, and every notification written after `id` is dropped.

use bytes::{BufMut, BytesMut};

use crate::payload::NotificationRequest;

pub const COMMAND_SEND: u8 = 1;
pub const COMMAND_ERROR: u8 = 8;
pub const ERROR_FRAME_LEN: usize = 6;

/// Status codes carried by an error frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    NoError,
    Processing,
    MissingToken,
    MissingTopic,
    MissingPayload,
    InvalidTokenSize,
    InvalidTopicSize,
    InvalidPayloadSize,
    InvalidToken,
    Shutdown,
    Unknown(u8),
}

impl Status {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::NoError,
            1 => Self::Processing,
            2 => Self::MissingToken,
            3 => Self::MissingTopic,
            4 => Self::MissingPayload,
            5 => Self::InvalidTokenSize,
            6 => Self::InvalidTopicSize,
            7 => Self::InvalidPayloadSize,
            8 => Self::InvalidToken,
            10 => Self::Shutdown,
            other => Self::Unknown(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::NoError => 0,
            Self::Processing => 1,
            Self::MissingToken => 2,
            Self::MissingTopic => 3,
            Self::MissingPayload => 4,
            Self::InvalidTokenSize => 5,
            Self::InvalidTopicSize => 6,
            Self::InvalidPayloadSize => 7,
            Self::InvalidToken => 8,
            Self::Shutdown => 10,
            Self::Unknown(code) => code,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::NoError => "no errors encountered",
            Self::Processing => "processing error",
            Self::MissingToken => "missing device token",
            Self::MissingTopic => "missing topic",
            Self::MissingPayload => "missing payload",
            Self::InvalidTokenSize => "invalid token size",
            Self::InvalidTopicSize => "invalid topic size",
            Self::InvalidPayloadSize => "invalid payload size",
            Self::InvalidToken => "invalid token",
            Self::Shutdown => "gateway shutting down",
            Self::Unknown(_) => "unknown error",
        }
    }
}

/// Decoded error-response frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ErrorResponse {
    pub status: Status,
    pub identifier: u32,
}

impl ErrorResponse {
    pub fn decode(frame: &[u8; ERROR_FRAME_LEN]) -> Option<Self> {
        if frame[0] != COMMAND_ERROR {
            return None;
        }
        Some(Self {
            status: Status::from_code(frame[1]),
            identifier: u32::from_be_bytes([frame[2], frame[3], frame[4], frame[5]]),
        })
    }
}

/// Append one send frame for `request` to `buf`.
pub fn encode_send(buf: &mut BytesMut, identifier: u32, request: &NotificationRequest) {
    buf.reserve(1 + 4 + 4 + 2 + request.token.len() + 2 + request.payload.len());
    buf.put_u8(COMMAND_SEND);
    buf.put_u32(identifier);
    buf.put_u32(request.expiry);
    buf.put_u16(request.token.len() as u16);
    buf.put_slice(&request.token);
    buf.put_u16(request.payload.len() as u16);
    buf.put_slice(&request.payload);
}
