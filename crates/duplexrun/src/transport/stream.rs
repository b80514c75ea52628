//! Length-prefixed frames over a byte stream.
//!
//! ## Wire Format
//! - Length: u32, big-endian, number of payload bytes
//! - Payload: UTF-8 text
//!
//! Works over anything `AsyncRead + AsyncWrite`: TCP, Unix sockets, pipes,
//! `tokio::io::duplex`. The medium never reconnects on its own, so no resets
//! are reported.

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::io::ReadHalf;
use tokio::io::WriteHalf;
use tokio::sync::Mutex;
use tokio::sync::watch;

use crate::transport;
use crate::transport::Transport;

/// Largest payload accepted in either direction.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const FRAME_HEADER_SIZE: usize = 4;

pub struct StreamTransport<S> {
    reader: Mutex<ReadHalf<S>>,
    writer: Mutex<Option<WriteHalf<S>>>,
    closed: watch::Sender<bool>,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(Some(writer)),
            closed: watch::Sender::new(false),
        }
    }
}

/// Reads one frame. `Ok(None)` on a clean end of stream at a frame boundary.
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> transport::Result<Option<String>> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(transport::Error::FrameTooLarge { len, max: MAX_FRAME_SIZE });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            transport::Error::ConnectionLost("Stream ended inside a frame".into())
        } else {
            e.into()
        }
    })?;

    String::from_utf8(payload)
        .map(Some)
        .map_err(|_| transport::Error::InvalidUtf8)
}

fn encode_frame(frame: &str) -> transport::Result<Vec<u8>> {
    let bytes = frame.as_bytes();
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(transport::Error::FrameTooLarge { len: bytes.len(), max: MAX_FRAME_SIZE });
    }

    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + bytes.len());
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
    Ok(buf)
}

#[async_trait::async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn send(&self, frame: &str) -> transport::Result<()> {
        let buf = encode_frame(frame)?;

        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(transport::Error::Closed);
        };

        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn recv(&self) -> transport::Result<Option<String>> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Ok(None);
        }

        let mut reader = self.reader.lock().await;
        tokio::select! {
            frame = read_frame(&mut *reader) => frame,
            _ = transport::wait_closed(&mut closed) => Ok(None),
        }
    }

    async fn close(&self) {
        self.closed.send_replace(true);

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(error = %e, "stream shutdown failed");
            }
        }
    }
}
