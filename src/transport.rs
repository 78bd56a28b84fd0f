//! Content-Length framing over a duplex byte stream.
//!
//! Every frame on the wire looks like:
//! ```text
//! Content-Length: <length>\r\n
//! \r\n
//! <payload>
//! ```
//! where `<length>` is the UTF-8 byte length of the JSON payload.

use std::io::ErrorKind;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::types::{Message, TransportError};

const CONTENT_LENGTH: &str = "Content-Length:";

/// Longest header or separator line accepted, terminator included.
const MAX_HEADER_LEN: u64 = 256;

/// Largest payload a peer may announce.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Reads and writes framed messages. Owns exactly one reader and one writer.
pub struct Transport<R, W> {
    reader: R,
    writer: W,
}

impl Transport<BufReader<tokio::io::Stdin>, tokio::io::Stdout> {
    /// Transport over the process's own stdin/stdout.
    pub fn stdio() -> Self {
        Transport::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
    }
}

impl<R, W> Transport<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Transport { reader, writer }
    }

    /// Give back the underlying streams.
    pub fn into_inner(self) -> (R, W) {
        (self.reader, self.writer)
    }

    /// Reads one frame and decodes it.
    ///
    /// Returns `Ok(None)` when the peer closed the stream before sending any
    /// byte of a new frame. A stream that ends anywhere inside a frame is
    /// [`TransportError::Truncated`].
    pub async fn receive(&mut self) -> Result<Option<Message>, TransportError> {
        let mut line = String::new();
        if self.read_header_line(&mut line).await? == 0 {
            return Ok(None);
        }
        let length = parse_content_length(&line)?;

        line.clear();
        if self.read_header_line(&mut line).await? == 0 {
            return Err(TransportError::Truncated);
        }
        if !line.trim_end_matches(['\r', '\n']).is_empty() {
            return Err(TransportError::MissingSeparator(line));
        }

        let mut body = vec![0u8; length];
        self.reader.read_exact(&mut body).await.map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => TransportError::Truncated,
            _ => TransportError::Io(e),
        })?;

        let message = serde_json::from_slice(&body).map_err(TransportError::Codec)?;
        tracing::trace!(bytes = length, "received frame");
        Ok(Some(message))
    }

    /// Reads one line of at most `MAX_HEADER_LEN` bytes.
    async fn read_header_line(&mut self, line: &mut String) -> Result<usize, TransportError> {
        let read = (&mut self.reader).take(MAX_HEADER_LEN).read_line(line).await?;
        if read as u64 == MAX_HEADER_LEN && !line.ends_with('\n') {
            return Err(TransportError::InvalidHeader(std::mem::take(line)));
        }
        Ok(read)
    }

    /// Encodes and writes one frame, then flushes.
    ///
    /// Header and payload go out in a single write so frames never interleave.
    /// A peer that has gone away surfaces as [`TransportError::Closed`].
    pub async fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        let payload = serde_json::to_vec(message).map_err(TransportError::Codec)?;
        let mut frame = format!("{CONTENT_LENGTH} {}\r\n\r\n", payload.len()).into_bytes();
        frame.extend_from_slice(&payload);

        let written = match self.writer.write_all(&frame).await {
            Ok(()) => self.writer.flush().await,
            Err(e) => Err(e),
        };
        match written {
            Ok(()) => {
                tracing::trace!(bytes = payload.len(), "sent frame");
                Ok(())
            }
            Err(e) if matches!(e.kind(), ErrorKind::BrokenPipe | ErrorKind::ConnectionReset) => {
                Err(TransportError::Closed)
            }
            Err(e) => Err(TransportError::Io(e)),
        }
    }
}

fn parse_content_length(line: &str) -> Result<usize, TransportError> {
    let header = line.trim_end_matches(['\r', '\n']);
    let value = header
        .strip_prefix(CONTENT_LENGTH)
        .ok_or_else(|| TransportError::InvalidHeader(header.into()))?
        .trim();
    match value.parse::<usize>() {
        Ok(length) if length <= MAX_FRAME_LEN => Ok(length),
        _ => Err(TransportError::InvalidContentLength(value.into())),
    }
}
