//! Frames exchanged between ranks of the TCP process group.

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_util::{
    bytes::Bytes,
    codec::{Framed, LengthDelimitedCodec},
};

use crate::orchestra::error::{OrchestraError, Result};

/// A framed, bidirectional link to one peer.
pub type Link = Framed<TcpStream, LengthDelimitedCodec>;

/// Wraps a connected stream into a length-delimited link.
pub fn link(stream: TcpStream) -> Link {
    Framed::new(stream, LengthDelimitedCodec::new())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    Hello { rank: usize, world_size: usize },
    Welcome { world_size: usize },
    Arrive { generation: u64 },
    Release { generation: u64 },
    Reduce { generation: u64, values: Vec<f32> },
    Reduced { generation: u64, values: Vec<f32> },
    Leave { rank: usize },
    Shutdown,
}

impl Frame {
    pub fn encode(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| OrchestraError::Collective(format!("cannot encode frame: {e}")))
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        serde_json::from_slice(buf)
            .map_err(|e| OrchestraError::Collective(format!("malformed frame: {e}")))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "hello",
            Frame::Welcome { .. } => "welcome",
            Frame::Arrive { .. } => "arrive",
            Frame::Release { .. } => "release",
            Frame::Reduce { .. } => "reduce",
            Frame::Reduced { .. } => "reduced",
            Frame::Leave { .. } => "leave",
            Frame::Shutdown => "shutdown",
        }
    }
}

/// Sends `frame` through `link`.
pub async fn send(link: &mut Link, frame: &Frame) -> Result<()> {
    let bytes = frame.encode()?;
    link.send(bytes)
        .await
        .map_err(|e| OrchestraError::Collective(format!("cannot send {}: {e}", frame.kind())))
}

/// Waits for the next frame. `None` means the peer closed the connection.
pub async fn recv(link: &mut Link) -> Result<Option<Frame>> {
    match link.next().await {
        None => Ok(None),
        Some(Ok(buf)) => Frame::decode(&buf).map(Some),
        Some(Err(e)) => Err(OrchestraError::Collective(format!("receive failed: {e}"))),
    }
}
