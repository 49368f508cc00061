use std::sync::Arc;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::envelope::MAX_LINE_BYTES;

pub type FrontendReader = Box<dyn AsyncRead + Send + Unpin>;
pub type FrontendWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A connected ACP client: the stdio peer (primary) or a socket peer.
pub struct Frontend {
    pub id: u64,
    pub primary: bool,
    writer: Mutex<FrontendWriter>,
    reader: Mutex<Option<FrontendReader>>,
    done: CancellationToken,
}

/// Pairs a raw JSON line with the frontend that sent it.
pub struct FrontendMessage {
    pub frontend: Arc<Frontend>,
    pub line: String,
}

impl Frontend {
    pub fn new(id: u64, primary: bool, reader: FrontendReader, writer: FrontendWriter) -> Arc<Self> {
        Arc::new(Self {
            id,
            primary,
            writer: Mutex::new(writer),
            reader: Mutex::new(Some(reader)),
            done: CancellationToken::new(),
        })
    }

    /// Write one JSON line plus the newline terminator. The writer mutex
    /// serializes concurrent producers; failures are logged, not propagated.
    /// Membership is only dropped when the inbound side closes.
    pub async fn send(&self, line: &str) {
        let mut writer = self.writer.lock().await;
        let result: std::io::Result<()> = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            warn!("frontend {}: write failed: {}", self.id, e);
        }
    }

    /// Completes once the inbound side of this frontend has closed.
    pub async fn closed(&self) {
        self.done.cancelled().await;
    }

    /// Read ndjson lines from the inbound stream and forward each on the
    /// proxy's merged channel. Signals done and returns when the stream ends,
    /// errors, or a line exceeds the limit.
    pub async fn read_lines(self: Arc<Self>, tx: mpsc::Sender<FrontendMessage>) {
        let reader = match self.reader.lock().await.take() {
            Some(reader) => reader,
            None => {
                warn!("frontend {}: read loop already started", self.id);
                return;
            }
        };
        let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
        while let Some(item) = lines.next().await {
            match item {
                Ok(line) => {
                    let msg = FrontendMessage {
                        frontend: self.clone(),
                        line,
                    };
                    if tx.send(msg).await.is_err() {
                        // Proxy is gone; nothing left to feed.
                        break;
                    }
                }
                Err(e) => {
                    warn!("frontend {} read error: {}", self.id, e);
                    break;
                }
            }
        }
        debug!("frontend {} disconnected", self.id);
        self.done.cancel();
    }
}
