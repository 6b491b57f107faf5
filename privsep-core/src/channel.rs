//! The multiplexed request/response channel, client and server halves.
//!
//! Both halves share one `UnixStream`, split into owned read/write halves so
//! writes (calls, replies, forwarded log frames) and the single background
//! reader can each own what they need without fighting over a lock across an
//! `.await`. The client side keeps a map of outstanding calls keyed by
//! correlation id; a single reader task demultiplexes replies onto the
//! matching `oneshot` sender, mirroring `comm.ClientChannel`'s reader thread
//! and `outstanding_msgs` dict.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use rmpv::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::PrivsepError;
use crate::logbridge::LogSink;
use crate::wire::{self, Envelope, Frame, FrameReader};

type CallResult = Result<Frame, PrivsepError>;
type Outstanding = Arc<SyncMutex<HashMap<Uuid, oneshot::Sender<CallResult>>>>;

async fn write_envelope(
    writer: &AsyncMutex<OwnedWriteHalf>,
    envelope: &Envelope,
) -> Result<(), PrivsepError> {
    let mut buf = bytes::BytesMut::new();
    wire::encode(envelope, &mut buf)?;
    let mut guard = writer.lock().await;
    guard
        .write_all(&buf)
        .await
        .map_err(|source| PrivsepError::Transport {
            operation: "channel write",
            source,
        })
}

/// Client-side handle to the channel: one call at a time per correlation id,
/// arbitrarily many concurrently.
pub struct ClientChannel {
    writer: Arc<AsyncMutex<OwnedWriteHalf>>,
    outstanding: Outstanding,
    reader_task: JoinHandle<()>,
}

impl ClientChannel {
    /// Wraps an already-connected stream, starts the demultiplexing reader
    /// task, and performs the PING/PONG handshake the original calls
    /// `exchange_ping`.
    pub async fn connect(
        stream: UnixStream,
        log_sink: Arc<dyn LogSink>,
    ) -> Result<Self, PrivsepError> {
        let (read_half, write_half) = stream.into_split();
        let writer = Arc::new(AsyncMutex::new(write_half));
        let outstanding: Outstanding = Arc::new(SyncMutex::new(HashMap::new()));

        let reader_task = tokio::spawn(reader_main(read_half, outstanding.clone(), log_sink));

        let channel = ClientChannel {
            writer,
            outstanding,
            reader_task,
        };

        match channel.send_recv(Frame::Ping, Some(Duration::from_secs(10))).await {
            Ok(Frame::Pong) => Ok(channel),
            Ok(other) => Err(PrivsepError::HelperUnavailable {
                detail: format!("unexpected handshake reply: {other:?}"),
            }),
            Err(e) => Err(PrivsepError::HelperUnavailable {
                detail: format!("handshake failed: {e}"),
            }),
        }
    }

    async fn send_recv(&self, frame: Frame, timeout: Option<Duration>) -> CallResult {
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.outstanding.lock().insert(id, tx);

        if let Err(e) = write_envelope(&self.writer, &Envelope::call(id, frame)).await {
            self.outstanding.lock().remove(&id);
            return Err(e);
        }

        let result = match timeout {
            Some(duration) => match tokio::time::timeout(duration, rx).await {
                Ok(inner) => inner,
                Err(_) => {
                    // Waiter owns cleanup: remove our own entry before a
                    // late reply can race us.
                    self.outstanding.lock().remove(&id);
                    return Err(PrivsepError::Timeout {
                        entry_point: String::new(),
                        timeout_ms: duration.as_millis() as u64,
                    });
                }
            },
            None => rx.await,
        };

        match result {
            Ok(call_result) => call_result,
            Err(_) => Err(PrivsepError::Transport {
                operation: "channel read",
                source: std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "privsep reader exited before replying",
                ),
            }),
        }
    }

    /// Invokes a remote entry-point and returns its value, translating
    /// `ERR` frames into [`PrivsepError::Remote`].
    pub async fn remote_call(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, PrivsepError> {
        let frame = Frame::Call {
            name: name.to_owned(),
            args,
            kwargs,
        };
        let reply = self
            .send_recv(frame, timeout)
            .await
            .map_err(|e| e.with_call_context(name, timeout.map(|d| d.as_millis() as u64).unwrap_or(0)))?;

        match reply {
            Frame::Ret { value } => Ok(value),
            Frame::Err {
                type_identifier,
                args,
            } => Err(crate::context::render_remote_error(type_identifier, args)),
            other => Err(PrivsepError::Protocol {
                detail: format!("unexpected reply to CALL: {other:?}"),
            }),
        }
    }

    /// Half-closes the write side and waits for the reader task to observe
    /// EOF, mirroring `ClientChannel.close()`.
    pub async fn close(&self) -> Result<(), PrivsepError> {
        let mut guard = self.writer.lock().await;
        guard.shutdown().await.map_err(|source| PrivsepError::Transport {
            operation: "channel shutdown",
            source,
        })
    }
}

impl Drop for ClientChannel {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

async fn reader_main(mut read_half: OwnedReadHalf, outstanding: Outstanding, log_sink: Arc<dyn LogSink>) {
    let mut reader = FrameReader::new();
    let mut buf = [0u8; 4096];

    loop {
        let envelope = match reader.try_decode() {
            Ok(Some(envelope)) => envelope,
            Ok(None) => match read_half.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    reader.feed(&buf[..n]);
                    continue;
                }
                Err(e) => {
                    tracing::warn!("privsep channel read failed: {e}");
                    break;
                }
            },
            Err(e) => {
                tracing::warn!("privsep channel protocol error: {e}");
                break;
            }
        };

        match envelope.id {
            Some(id) => {
                let sender = outstanding.lock().remove(&id);
                match sender {
                    Some(sender) => {
                        let _ = sender.send(Ok(envelope.frame));
                    }
                    None => {
                        tracing::warn!(
                            "privsep reply for unknown or already-timed-out call {id}"
                        );
                    }
                }
            }
            None => {
                if let Frame::Log { record } = envelope.frame {
                    log_sink.accept(record);
                } else {
                    tracing::warn!("ignoring unexpected out-of-band frame: {:?}", envelope.frame);
                }
            }
        }
    }

    // EOF: fail every outstanding waiter, mirroring the original's
    // "premature eof" behaviour.
    let mut outstanding = outstanding.lock();
    for (_, sender) in outstanding.drain() {
        let _ = sender.send(Err(PrivsepError::Transport {
            operation: "channel read",
            source: std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "privileged process closed the channel",
            ),
        }));
    }
}

/// Server-side (helper process) handle to the channel.
pub struct ServerChannel {
    read_half: OwnedReadHalf,
    reader: FrameReader,
    writer: ServerWriter,
}

/// Cloneable write handle shared between the daemon's main loop and its
/// background log-forwarding task.
#[derive(Clone)]
pub struct ServerWriter {
    writer: Arc<AsyncMutex<OwnedWriteHalf>>,
}

impl ServerWriter {
    pub async fn send(&self, id: Option<Uuid>, frame: Frame) -> Result<(), PrivsepError> {
        let envelope = Envelope { id, frame };
        write_envelope(&self.writer, &envelope).await
    }
}

impl ServerChannel {
    pub fn new(stream: UnixStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        ServerChannel {
            read_half,
            reader: FrameReader::new(),
            writer: ServerWriter {
                writer: Arc::new(AsyncMutex::new(write_half)),
            },
        }
    }

    pub fn writer(&self) -> ServerWriter {
        self.writer.clone()
    }

    /// Reads the next request. Returns `Ok(None)` on a clean EOF.
    pub async fn recv(&mut self) -> Result<Option<(Option<Uuid>, Frame)>, PrivsepError> {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(envelope) = self.reader.try_decode()? {
                return Ok(Some((envelope.id, envelope.frame)));
            }
            let n = self
                .read_half
                .read(&mut buf)
                .await
                .map_err(|source| PrivsepError::Transport {
                    operation: "channel read",
                    source,
                })?;
            if n == 0 {
                return Ok(None);
            }
            self.reader.feed(&buf[..n]);
        }
    }

    pub async fn send(&self, id: Option<Uuid>, frame: Frame) -> Result<(), PrivsepError> {
        self.writer.send(id, frame).await
    }
}
