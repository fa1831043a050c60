use bytes::Bytes;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{AppError, AppResult};

#[derive(Debug)]
enum WriteCommand {
    Frame(Bytes),
    Close,
}

/// Handle onto a connection's dedicated writer task.
///
/// Cheap to clone; every holder enqueues without blocking and the task
/// writes frames strictly FIFO, so wire-level frame boundaries are never
/// interleaved no matter how many callers send concurrently.
#[derive(Debug, Clone)]
pub struct WriterHandle {
    tx: mpsc::UnboundedSender<WriteCommand>,
    cancel: CancellationToken,
}

impl WriterHandle {
    pub fn send(&self, frame: Bytes) -> AppResult<()> {
        self.tx
            .send(WriteCommand::Frame(frame))
            .map_err(|_| AppError::NotConnected)
    }

    /// Graceful close drains everything queued ahead of it before the
    /// socket is shut down. Immediate close cancels the task out of band.
    pub fn close(&self, graceful: bool) {
        if graceful {
            let _ = self.tx.send(WriteCommand::Close);
        } else {
            self.cancel.cancel();
        }
    }
}

/// Spawns the writer task owning the write half of a connection.
pub fn spawn_writer(writer: OwnedWriteHalf) -> (WriterHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    let task = tokio::spawn(async move {
        let mut writer = BufWriter::new(writer);
        loop {
            let command = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                command = rx.recv() => command,
            };
            match command {
                Some(WriteCommand::Frame(frame)) => {
                    let written = async {
                        writer.write_all(&frame).await?;
                        writer.flush().await
                    };
                    if let Err(e) = written.await {
                        debug!("writer task stopping on write error: {}", e);
                        break;
                    }
                }
                // in-band close, or every handle dropped
                Some(WriteCommand::Close) | None => break,
            }
        }
        let _ = writer.shutdown().await;
        debug!("writer task exited");
    });

    (WriterHandle { tx, cancel }, task)
}
