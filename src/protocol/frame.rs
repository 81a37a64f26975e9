//! # Wire Frames
//!
//! Every message is a big-endian `u32` length followed by that many bytes
//! of JSON. Frames larger than [`MAX_FRAME_SIZE`] are rejected before the
//! payload is read.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use super::errors::{ProtocolError, ProtocolResult};
use super::listener::RefusalReason;
use crate::master::Organization;

/// Current handshake version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest accepted frame payload.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Initiator declares who it is.
    Hello {
        protocol_version: u32,
        organization: Organization,
        #[serde(default)]
        properties: BTreeMap<String, String>,
    },
    /// Acceptor accepts the declaration and declares itself.
    Welcome {
        organization: Organization,
        #[serde(default)]
        properties: BTreeMap<String, String>,
    },
    /// Initiator accepts the acceptor.
    Confirm,
    /// Acceptor attached the channel; both sides are live.
    Ready { channel_id: Uuid },
    /// A policy decision declined the attempt.
    Refused { reason: RefusalReason },
    /// The attempt failed on a fault.
    Failed { message: String },

    Ping { nonce: u64 },
    Pong { nonce: u64 },
    Message { payload: serde_json::Value },
    Close { reason: String },
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "hello",
            Frame::Welcome { .. } => "welcome",
            Frame::Confirm => "confirm",
            Frame::Ready { .. } => "ready",
            Frame::Refused { .. } => "refused",
            Frame::Failed { .. } => "failed",
            Frame::Ping { .. } => "ping",
            Frame::Pong { .. } => "pong",
            Frame::Message { .. } => "message",
            Frame::Close { .. } => "close",
        }
    }
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> ProtocolResult<()>
where
    W: AsyncWrite + Unpin,
{
    let payload =
        serde_json::to_vec(frame).map_err(|e| ProtocolError::InvalidFrame(e.to_string()))?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R>(reader: &mut R) -> ProtocolResult<Frame>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    serde_json::from_slice(&payload).map_err(|e| ProtocolError::InvalidFrame(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_cross_a_pipe() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let hello = Frame::Hello {
            protocol_version: PROTOCOL_VERSION,
            organization: Organization::new("org0").unwrap(),
            properties: BTreeMap::from([("executors".to_string(), "4".to_string())]),
        };
        write_frame(&mut a, &hello).await.unwrap();
        write_frame(&mut a, &Frame::Confirm).await.unwrap();

        assert_eq!(read_frame(&mut b).await.unwrap(), hello);
        assert_eq!(read_frame(&mut b).await.unwrap(), Frame::Confirm);
    }

    #[tokio::test]
    async fn test_oversized_length_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32((MAX_FRAME_SIZE + 1) as u32).await.unwrap();

        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_eof_is_connection_closed() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert_eq!(
            read_frame(&mut b).await.unwrap_err(),
            ProtocolError::ConnectionClosed
        );
    }

    #[tokio::test]
    async fn test_garbage_payload_is_invalid() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32(3).await.unwrap();
        a.write_all(b"{x}").await.unwrap();
        assert!(matches!(
            read_frame(&mut b).await.unwrap_err(),
            ProtocolError::InvalidFrame(_)
        ));
    }
}
