// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::FrameCodec;
use crate::{AppError, AppResult};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// How long a graceful close may spend flushing queued frames before the
/// connection is destroyed.
pub(crate) const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// One accepted (or dialed) socket.
///
/// The read half belongs to whoever holds the `Connection`, normally its
/// agent. Writes go through a bounded queue drained by a dedicated writer
/// task, so they never wait on the socket. Every clone of the
/// [`ConnHandle`] can write to and close the connection.
#[derive(Debug)]
pub struct Connection {
    reader: OwnedReadHalf,
    /// bytes read but not yet decoded; survives a cancelled `read_msg`
    buffer: BytesMut,
    handle: ConnHandle,
}

/// Shared, cloneable side of a [`Connection`]: writes, close, addresses.
#[derive(Debug, Clone)]
pub struct ConnHandle {
    inner: Arc<ConnShared>,
}

#[derive(Debug)]
struct ConnShared {
    id: u64,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    codec: Arc<FrameCodec>,
    write_tx: mpsc::Sender<Bytes>,
    /// graceful close: queued frames are still flushed
    closing: CancellationToken,
    /// abrupt close: queued frames are dropped; cancels `closing` too
    destroyed: CancellationToken,
}

impl Connection {
    pub fn new(
        socket: TcpStream,
        codec: Arc<FrameCodec>,
        pending_write_num: usize,
    ) -> AppResult<Connection> {
        Connection::spawn(socket, codec, pending_write_num, None, None)
    }

    /// Wraps `socket` and starts its writer task.
    ///
    /// Cancelling `destroy_all` destroys the connection. The writer holds
    /// `shutdown_complete_tx` until it exits.
    pub(crate) fn spawn(
        socket: TcpStream,
        codec: Arc<FrameCodec>,
        pending_write_num: usize,
        destroy_all: Option<&CancellationToken>,
        shutdown_complete_tx: Option<mpsc::Sender<()>>,
    ) -> AppResult<Connection> {
        let local_addr = socket.local_addr()?;
        let remote_addr = socket.peer_addr()?;
        let (reader, writer) = socket.into_split();
        let (write_tx, write_rx) = mpsc::channel(pending_write_num.max(1));
        let destroyed =
            destroy_all.map_or_else(CancellationToken::new, CancellationToken::child_token);
        let closing = destroyed.child_token();

        let handle = ConnHandle {
            inner: Arc::new(ConnShared {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                local_addr,
                remote_addr,
                codec,
                write_tx,
                closing: closing.clone(),
                destroyed: destroyed.clone(),
            }),
        };

        let writer_task = WriterTask {
            id: handle.id(),
            writer,
            write_rx,
            closing,
            destroyed,
            _shutdown_complete_tx: shutdown_complete_tx,
        };
        tokio::spawn(writer_task.run());

        Ok(Connection {
            reader,
            buffer: BytesMut::with_capacity(4 * 1024),
            handle,
        })
    }

    /// Reads the next message.
    ///
    /// Cancel safe: a partially received frame stays buffered for the next
    /// call. Returns `ConnectionClosed` once the connection is closed. Any
    /// read or framing error closes the connection.
    pub async fn read_msg(&mut self) -> AppResult<Bytes> {
        let closing = self.handle.inner.closing.clone();
        let result = tokio::select! {
            biased;
            _ = closing.cancelled() => Err(AppError::ConnectionClosed),
            res = self.read_frame() => res,
        };
        if let Err(e) = &result {
            if !self.handle.is_closed() {
                debug!(conn = self.handle.id(), "read error, closing: {e}");
                self.handle.close();
            }
        }
        result
    }

    async fn read_frame(&mut self) -> AppResult<Bytes> {
        loop {
            if let Some(frame) = self.handle.inner.codec.decode_frame(&mut self.buffer)? {
                return Ok(frame.freeze());
            }
            if 0 == self.reader.read_buf(&mut self.buffer).await? {
                let message = if self.buffer.is_empty() {
                    "connection closed by peer"
                } else {
                    "connection closed by peer inside a frame"
                };
                return Err(io::Error::new(ErrorKind::UnexpectedEof, message).into());
            }
        }
    }

    pub fn handle(&self) -> &ConnHandle {
        &self.handle
    }
}

impl Deref for Connection {
    type Target = ConnHandle;

    fn deref(&self) -> &ConnHandle {
        &self.handle
    }
}

impl ConnHandle {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    pub fn codec(&self) -> &FrameCodec {
        &self.inner.codec
    }

    /// Queues one encoded frame without waiting.
    ///
    /// A full queue means the peer is not keeping up: the connection is
    /// destroyed and `WriteQueueFull` returned.
    pub fn write(&self, frame: Bytes) -> AppResult<()> {
        if self.is_closed() {
            return Err(AppError::ConnectionClosed);
        }
        match self.inner.write_tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(
                    conn = self.id(),
                    remote = %self.remote_addr(),
                    "close conn: write queue full"
                );
                self.destroy();
                Err(AppError::WriteQueueFull(self.id()))
            }
            Err(TrySendError::Closed(_)) => Err(AppError::ConnectionClosed),
        }
    }

    /// Queues one encoded frame, waiting for room in the queue.
    pub async fn send(&self, frame: Bytes) -> AppResult<()> {
        tokio::select! {
            biased;
            _ = self.inner.closing.cancelled() => Err(AppError::ConnectionClosed),
            res = self.inner.write_tx.send(frame) => res.map_err(|_| AppError::ConnectionClosed),
        }
    }

    /// Encodes `parts` as one message and queues it without waiting.
    pub fn write_msg(&self, parts: &[&[u8]]) -> AppResult<()> {
        let frame = self.inner.codec.encode(parts)?;
        self.write(frame)
    }

    /// Closes after flushing what is already queued. Idempotent.
    pub fn close(&self) {
        if !self.inner.closing.is_cancelled() {
            debug!(conn = self.id(), "connection closing");
            self.inner.closing.cancel();
        }
    }

    /// Closes now, dropping queued frames. Idempotent.
    pub fn destroy(&self) {
        if !self.inner.destroyed.is_cancelled() {
            debug!(conn = self.id(), "connection destroyed");
            self.inner.destroyed.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closing.is_cancelled()
    }

    /// Resolves once the connection starts closing.
    pub async fn closed(&self) {
        self.inner.closing.cancelled().await
    }
}

/// Drains the write queue into the socket, one frame at a time.
struct WriterTask {
    id: u64,
    writer: OwnedWriteHalf,
    write_rx: mpsc::Receiver<Bytes>,
    closing: CancellationToken,
    destroyed: CancellationToken,
    _shutdown_complete_tx: Option<mpsc::Sender<()>>,
}

impl WriterTask {
    async fn run(mut self) {
        let id = self.id;
        let destroyed = self.destroyed.clone();
        let closing = self.closing.clone();
        // a graceful close gets a bounded time to flush
        let flush_deadline = async {
            closing.cancelled().await;
            time::sleep(CLOSE_FLUSH_TIMEOUT).await;
        };
        tokio::select! {
            biased;
            _ = destroyed.cancelled() => {}
            _ = flush_deadline => {
                warn!(conn = id, "close conn: flush timed out");
                destroyed.cancel();
            }
            _ = self.write_loop() => {}
        }
        debug!(conn = id, "connection writer exited");
    }

    async fn write_loop(&mut self) {
        let mut draining = false;
        loop {
            let frame = if draining {
                self.write_rx.recv().await
            } else {
                tokio::select! {
                    biased;
                    _ = self.closing.cancelled() => {
                        // flush what is queued, accept nothing new
                        self.write_rx.close();
                        draining = true;
                        continue;
                    }
                    frame = self.write_rx.recv() => frame,
                }
            };
            let Some(frame) = frame else {
                if let Err(e) = self.writer.shutdown().await {
                    debug!(conn = self.id, "shutdown error: {e}");
                }
                return;
            };
            if let Err(e) = self.writer.write_all(&frame).await {
                debug!(conn = self.id, "write error: {e}");
                self.destroyed.cancel();
                return;
            }
        }
    }
}
