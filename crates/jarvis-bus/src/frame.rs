//! Wire frames for the bus.
//!
//! Framing per message:
//!   [4 bytes big-endian length][JSON-encoded frame]
//!
//! Payloads are opaque bytes, base64-encoded inside the JSON envelope.
//! Max frame size: 8 MiB.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::BusError;

pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BusFrame {
    /// Client → broker: publish `payload` on `subject`.
    Pub {
        subject: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply: Option<String>,
        #[serde(with = "b64")]
        payload: Vec<u8>,
    },
    /// Client → broker: open subscription `sid` on `subject`.
    Sub {
        sid: u64,
        subject: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        queue: Option<String>,
    },
    /// Client → broker: close subscription `sid`.
    Unsub { sid: u64 },
    /// Broker → client: message delivered to subscription `sid`.
    Msg {
        sid: u64,
        subject: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply: Option<String>,
        #[serde(with = "b64")]
        payload: Vec<u8>,
    },
    Ping,
    Pong,
}

pub async fn write_frame<W>(io: &mut W, frame: &BusFrame) -> Result<(), BusError>
where
    W: AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(frame)?;
    if payload.len() > MAX_FRAME_BYTES {
        return Err(BusError::TooLarge(payload.len()));
    }
    io.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    io.write_all(&payload).await?;
    io.flush().await?;
    Ok(())
}

pub async fn read_frame<R>(io: &mut R) -> Result<BusFrame, BusError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(BusError::TooLarge(len));
    }
    let mut payload = vec![0u8; len];
    io.read_exact(&mut payload).await?;
    Ok(serde_json::from_slice(&payload)?)
}

/// Serde helper: `Vec<u8>` as standard base64.
mod b64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(serde::de::Error::custom)
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
