use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Longest single line forwarded as one chunk; longer lines are split
pub const MAX_LINE_BYTES: usize = 16 * 1024;

/// Which pipe a chunk of output came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Stdout => write!(f, "stdout"),
            StreamKind::Stderr => write!(f, "stderr"),
        }
    }
}

/// One line of process output, without its trailing newline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: StreamKind,
    pub text: String,
}

impl OutputChunk {
    pub fn new(stream: StreamKind, text: impl Into<String>) -> Self {
        Self {
            stream,
            text: text.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Forward every line of `reader` to `tx` until EOF or the receiver goes away
pub(crate) async fn pump_lines<R>(reader: R, stream: StreamKind, tx: mpsc::UnboundedSender<OutputChunk>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);

    loop {
        buf.clear();
        match read_line_capped(&mut reader, &mut buf, MAX_LINE_BYTES).await {
            Ok(0) => break,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                }
                let text = String::from_utf8_lossy(&buf).into_owned();
                trace!(%stream, line = %text, "output");
                if tx.send(OutputChunk { stream, text }).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(%stream, error = %e, "Failed to read process output");
                break;
            }
        }
    }
}

/// Like `read_until(b'\n')` but never buffers more than `max` bytes
async fn read_line_capped<R>(reader: &mut R, buf: &mut Vec<u8>, max: usize) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let max = max.max(1);
    let mut read = 0;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(read);
        }
        let room = max.saturating_sub(buf.len());
        let (used, done) = match available.iter().position(|&b| b == b'\n') {
            Some(i) if i < room => {
                buf.extend_from_slice(&available[..=i]);
                (i + 1, true)
            }
            _ if available.len() < room => {
                buf.extend_from_slice(available);
                (available.len(), false)
            }
            _ => {
                buf.extend_from_slice(&available[..room]);
                (room, true)
            }
        };
        reader.consume(used);
        read += used;
        if done {
            return Ok(read);
        }
    }
}
