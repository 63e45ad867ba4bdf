use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};

/// Failure on a framed message channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Receiving half of a worker channel.
///
/// Frames are newline-delimited JSON; one frame is one message. A decode
/// failure consumes the bad line, so the caller may keep receiving.
pub struct FramedReader {
    lines: Lines<BufReader<Box<dyn AsyncRead + Send + Unpin>>>,
}

impl FramedReader {
    pub fn new(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        let boxed: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
        Self {
            lines: BufReader::new(boxed).lines(),
        }
    }

    /// Next message, or `Ok(None)` once the peer hung up.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ChannelError> {
        match self.lines.next_line().await? {
            Some(line) => Ok(Some(serde_json::from_str(&line)?)),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for FramedReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FramedReader")
    }
}

/// Sending half of a worker channel. Messages are written whole and
/// flushed immediately.
pub struct FramedWriter {
    inner: Box<dyn AsyncWrite + Send + Unpin>,
}

impl FramedWriter {
    pub fn new(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            inner: Box::new(writer),
        }
    }

    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<(), ChannelError> {
        let mut frame = serde_json::to_vec(message)?;
        frame.push(b'\n');
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

impl std::fmt::Debug for FramedWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FramedWriter")
    }
}

/// One end of a duplex worker channel.
#[derive(Debug)]
pub struct Channel {
    pub reader: FramedReader,
    pub writer: FramedWriter,
}

/// In-memory channel pair for in-process workers and tests. Same codec
/// as the subprocess transport.
pub fn duplex_pair() -> (Channel, Channel) {
    let (left, right) = tokio::io::duplex(64 * 1024);
    let (left_read, left_write) = tokio::io::split(left);
    let (right_read, right_write) = tokio::io::split(right);
    (
        Channel {
            reader: FramedReader::new(left_read),
            writer: FramedWriter::new(left_write),
        },
        Channel {
            reader: FramedReader::new(right_read),
            writer: FramedWriter::new(right_write),
        },
    )
}

/// Worker-side channel over the process's own stdin/stdout. Stdout is
/// reserved for frames; anything human-readable belongs on stderr.
pub fn stdio_channel() -> Channel {
    Channel {
        reader: FramedReader::new(tokio::io::stdin()),
        writer: FramedWriter::new(tokio::io::stdout()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::WorkerMessage;
    use crate::worker::WorkerId;

    #[tokio::test]
    async fn frames_survive_the_duplex_transport() {
        let (mut master_end, mut worker_end) = duplex_pair();

        let sent = WorkerMessage::Heartbeat {
            worker_id: WorkerId(7),
        };
        worker_end.writer.send(&sent).await.unwrap();

        let received: WorkerMessage = master_end.reader.recv().await.unwrap().unwrap();
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn bad_frame_is_an_error_but_not_fatal() {
        let (mut master_end, worker_end) = duplex_pair();

        let mut raw = worker_end.writer;
        raw.send(&"not a worker message").await.unwrap();
        raw.send(&WorkerMessage::Pong {
            worker_id: WorkerId(1),
        })
        .await
        .unwrap();

        let first = master_end.reader.recv::<WorkerMessage>().await;
        assert!(matches!(first, Err(ChannelError::Codec(_))));

        let second: WorkerMessage = master_end.reader.recv().await.unwrap().unwrap();
        assert_eq!(
            second,
            WorkerMessage::Pong {
                worker_id: WorkerId(1)
            }
        );
    }

    #[tokio::test]
    async fn eof_reads_as_none() {
        let (mut master_end, worker_end) = duplex_pair();
        drop(worker_end);
        let got = master_end.reader.recv::<WorkerMessage>().await.unwrap();
        assert!(got.is_none());
    }
}
