//! CR-terminated line transport for the configuration protocol.
//!
//! Lines are ASCII, terminated by a single CR (0x0D, never LF); an empty
//! line terminates a group. Writers batch a whole group into one write.

use bytes::BytesMut;
use iclaustron_core::error::{IcError, IcResult};
use iclaustron_core::protocol;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Longest accepted line, covering the widest config body line plus keys.
const MAX_LINE_LEN: usize = 4096;

/// A buffered connection speaking the CR-line protocol.
///
/// Generic over the stream so tests drive it over in-memory duplex pipes.
#[derive(Debug)]
pub struct LineConnection<S> {
    stream: S,
    rbuf: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Unpin> LineConnection<S> {
    pub fn new(stream: S) -> LineConnection<S> {
        LineConnection {
            stream,
            rbuf: BytesMut::with_capacity(4096),
        }
    }

    /// Reads one line, or `None` on a clean end-of-stream at a line
    /// boundary.
    pub async fn read_line_or_eof(&mut self) -> IcResult<Option<String>> {
        loop {
            if let Some(pos) = self.rbuf.iter().position(|&b| b == protocol::LINE_END) {
                let line = self.rbuf.split_to(pos + 1);
                let body = &line[..pos];
                if body.iter().any(|&b| b >= 0x80 || b == b'\n') {
                    return Err(IcError::protocol(line!()));
                }
                let text = std::str::from_utf8(body)
                    .map_err(|_| IcError::protocol(line!()))?;
                return Ok(Some(text.to_string()));
            }
            if self.rbuf.len() > MAX_LINE_LEN {
                return Err(IcError::protocol(line!()));
            }
            let read = self.stream.read_buf(&mut self.rbuf).await?;
            if read == 0 {
                if self.rbuf.is_empty() {
                    return Ok(None);
                }
                return Err(IcError::protocol(line!()));
            }
        }
    }

    /// Reads one line; end-of-stream is a protocol error here.
    pub async fn read_line(&mut self) -> IcResult<String> {
        self.read_line_or_eof()
            .await?
            .ok_or_else(|| IcError::protocol(line!()))
    }

    /// Reads a line and requires it to match exactly.
    pub async fn expect_line(&mut self, expected: &str) -> IcResult<()> {
        let got = self.read_line().await?;
        if got != expected {
            tracing::debug!(expected, got, "unexpected protocol line");
            return Err(IcError::protocol(line!()));
        }
        Ok(())
    }

    /// Reads the empty line that terminates a group.
    pub async fn expect_empty(&mut self) -> IcResult<()> {
        self.expect_line("").await
    }

    /// Reads a `key: <number>` line.
    pub async fn read_key_number(&mut self, key: &str) -> IcResult<u64> {
        let line = self.read_line().await?;
        protocol::match_key(&line, key)
            .and_then(protocol::parse_number)
            .ok_or_else(|| IcError::protocol(line!()))
    }

    /// Reads a `key: <value>` line, returning the value.
    pub async fn read_key_value(&mut self, key: &str) -> IcResult<String> {
        let line = self.read_line().await?;
        protocol::match_key(&line, key)
            .map(str::to_string)
            .ok_or_else(|| IcError::protocol(line!()))
    }

    /// Writes a batch of lines as one buffer, each CR-terminated.
    pub async fn write_lines(&mut self, lines: &[&str]) -> IcResult<()> {
        let mut buf = Vec::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
        for line in lines {
            buf.extend_from_slice(line.as_bytes());
            buf.push(protocol::LINE_END);
        }
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Writes a group: the lines plus the terminating empty line.
    pub async fn write_group(&mut self, lines: &[&str]) -> IcResult<()> {
        let mut all: Vec<&str> = lines.to_vec();
        all.push("");
        self.write_lines(&all).await
    }

    /// Surrenders the stream, for conversion into a message transport.
    ///
    /// Any bytes already buffered past the line protocol would be lost,
    /// so conversion at a non-boundary is an error.
    pub fn into_inner(self) -> IcResult<S> {
        if !self.rbuf.is_empty() {
            return Err(IcError::protocol(line!()));
        }
        Ok(self.stream)
    }
}
