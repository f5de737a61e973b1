//! JSON-lines frames spoken between a [`crate::remote::RemoteBus`] and a
//! [`crate::remote::BrokerServer`].
//!
//! Every frame is one JSON object tagged by `type`, terminated by `\n`.
//! `declare` and `consume` are each answered by exactly one `declared`,
//! `consuming` or `error`, in request order, so a client matches acks by
//! position. `publish`, `fetch` and `cancel` are never answered. A consumer
//! receives one `deliver` per `fetch` it sent; `cancel` forfeits any fetch
//! still outstanding.

use std::io;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::bus::Delivery;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Declare {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        durable: bool,
        exclusive: bool,
    },
    Publish {
        queue: String,
        delivery: Delivery,
    },
    Consume {
        queue: String,
    },
    /// Grants the broker one more delivery on a consumed queue.
    Fetch {
        queue: String,
    },
    Cancel {
        queue: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerFrame {
    Declared { queue: String },
    Consuming { queue: String },
    Deliver { queue: String, delivery: Delivery },
    Error { message: String },
}

/// Upper bound on one encoded frame, newline included.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Reads the next frame, skipping blank lines between frames.
///
/// `None` means the peer closed the stream between frames. A line longer
/// than [`MAX_FRAME_LEN`] is rejected before it is buffered in full.
pub async fn read_frame<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let limit = MAX_FRAME_LEN as u64 + 1;
        if (&mut *reader).take(limit).read_until(b'\n', &mut buf).await? == 0 {
            return Ok(None);
        }
        if buf.len() > MAX_FRAME_LEN {
            return Err(invalid_data(format!("frame exceeds {MAX_FRAME_LEN} bytes")));
        }

        let line = buf.trim_ascii();
        if !line.is_empty() {
            return serde_json::from_slice(line).map(Some).map_err(invalid_data);
        }
    }
}

/// Writes `frame` as one line and flushes it.
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    // Compact JSON escapes newlines inside strings, so one line is one frame.
    let mut line = serde_json::to_vec(frame).map_err(invalid_data)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}

fn invalid_data<E>(err: E) -> io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::InvalidData, err)
}
