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

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Agent, ConnHandle, Connection, FrameCodec};
use crate::service::config::{DEFAULT_MAX_CONN_NUM, DEFAULT_PENDING_WRITE_NUM};
use crate::service::NetworkConfig;
use crate::utils::catch_panic;
use crate::{AppError, AppResult, Shutdown};

const MIN_ACCEPT_BACKOFF: Duration = Duration::from_millis(5);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Builds the agent that drives a freshly accepted connection.
pub type NewAgent<A> = Arc<dyn Fn(Connection) -> A + Send + Sync>;

type ConnSet = Arc<Mutex<HashMap<u64, ConnHandle>>>;

/// Accepts TCP connections and runs one agent per connection.
///
/// Connections beyond `max_conn_num` are closed right after accept.
// Shutdown sequence:
// 1. `close` signals the accept loop and waits for it to exit, so no new
//    connection can be added.
// 2. `destroy_all` is cancelled. Every connection the server spawned is a child
//    of it, including ones already removed from the set whose writers are
//    still flushing. The set is then cleared.
// 3. Agents see their reads fail and return; each driver task and writer
//    task holds a `shutdown_complete_tx` clone.
// 4. `close` drops its own sender and waits until the channel reports no
//    sender left, i.e. every driver and writer has exited.
pub struct TcpServer<A: Agent> {
    config: NetworkConfig,
    new_agent: Option<NewAgent<A>>,
    conns: ConnSet,
    destroy_all: CancellationToken,
    local_addr: Option<SocketAddr>,
    notify_shutdown: Option<broadcast::Sender<()>>,
    shutdown_complete_tx: Option<mpsc::Sender<()>>,
    shutdown_complete_rx: Option<mpsc::Receiver<()>>,
    accept_handle: Option<JoinHandle<()>>,
}

impl<A: Agent> TcpServer<A> {
    pub fn new(config: NetworkConfig) -> Self {
        TcpServer {
            config,
            new_agent: None,
            conns: Arc::new(Mutex::new(HashMap::new())),
            destroy_all: CancellationToken::new(),
            local_addr: None,
            notify_shutdown: None,
            shutdown_complete_tx: None,
            shutdown_complete_rx: None,
            accept_handle: None,
        }
    }

    pub fn set_new_agent<F>(&mut self, new_agent: F)
    where
        F: Fn(Connection) -> A + Send + Sync + 'static,
    {
        self.new_agent = Some(Arc::new(new_agent));
    }

    /// Binds the listener and starts the accept loop in the background.
    ///
    /// Fails without an agent factory. Zero limits are reset to their defaults.
    pub async fn start(&mut self) -> AppResult<SocketAddr> {
        if self.accept_handle.is_some() {
            return Err(AppError::IllegalState("tcp server already started".into()));
        }
        let new_agent = self
            .new_agent
            .clone()
            .ok_or_else(|| AppError::InvalidConfig("new_agent must not be nil".into()))?;

        if self.config.max_conn_num == 0 {
            self.config.max_conn_num = DEFAULT_MAX_CONN_NUM;
            warn!("invalid max_conn_num, reset to {}", self.config.max_conn_num);
        }
        if self.config.pending_write_num == 0 {
            self.config.pending_write_num = DEFAULT_PENDING_WRITE_NUM;
            warn!(
                "invalid pending_write_num, reset to {}",
                self.config.pending_write_num
            );
        }

        let listener = TcpListener::bind(&self.config.addr).await.map_err(|e| {
            error!(
                "Failed to bind server to address: {} - Error: {}",
                self.config.addr, e
            );
            e
        })?;
        let local_addr = listener.local_addr()?;
        info!("tcp server binding to {} for listening", local_addr);

        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);

        let acceptor = Acceptor {
            listener,
            conns: self.conns.clone(),
            destroy_all: self.destroy_all.clone(),
            new_agent,
            codec: Arc::new(FrameCodec::from_config(&self.config)),
            max_conn_num: self.config.max_conn_num,
            pending_write_num: self.config.pending_write_num,
            shutdown: Shutdown::new(notify_shutdown.subscribe()),
            shutdown_complete_tx: shutdown_complete_tx.clone(),
        };
        self.accept_handle = Some(tokio::spawn(acceptor.run()));
        self.local_addr = Some(local_addr);
        self.notify_shutdown = Some(notify_shutdown);
        self.shutdown_complete_tx = Some(shutdown_complete_tx);
        self.shutdown_complete_rx = Some(shutdown_complete_rx);
        Ok(local_addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Number of live connections.
    pub fn conn_count(&self) -> usize {
        self.conns.lock().len()
    }

    /// Stops accepting, closes every connection and waits for all agents.
    ///
    /// No agent runs after this returns. Idempotent.
    pub async fn close(&mut self) {
        let Some(accept_handle) = self.accept_handle.take() else {
            return;
        };
        if let Some(notify_shutdown) = self.notify_shutdown.take() {
            let _ = notify_shutdown.send(());
        }
        if let Err(e) = accept_handle.await {
            error!("accept loop failed: {:?}", e);
        }

        self.destroy_all.cancel();
        self.conns.lock().clear();

        drop(self.shutdown_complete_tx.take());
        if let Some(mut shutdown_complete_rx) = self.shutdown_complete_rx.take() {
            let _ = shutdown_complete_rx.recv().await;
        }
        info!("tcp server closed");
    }
}

impl<A: Agent> Drop for TcpServer<A> {
    fn drop(&mut self) {
        if self.accept_handle.is_some() {
            // not closed: stop accepting and destroy every connection
            if let Some(notify_shutdown) = self.notify_shutdown.take() {
                let _ = notify_shutdown.send(());
            }
            self.destroy_all.cancel();
        }
        debug!("tcp server dropped");
    }
}

/// State owned by the accept loop.
struct Acceptor<A: Agent> {
    listener: TcpListener,
    conns: ConnSet,
    destroy_all: CancellationToken,
    new_agent: NewAgent<A>,
    codec: Arc<FrameCodec>,
    max_conn_num: usize,
    pending_write_num: usize,
    shutdown: Shutdown,
    shutdown_complete_tx: mpsc::Sender<()>,
}

impl<A: Agent> Acceptor<A> {
    async fn run(mut self) {
        let mut backoff = Duration::ZERO;
        loop {
            let accepted = tokio::select! {
                res = self.listener.accept() => res,
                _ = self.shutdown.recv() => {
                    debug!("accept loop received shutdown signal");
                    break;
                }
            };

            match accepted {
                Ok((socket, remote_addr)) => {
                    backoff = Duration::ZERO;
                    self.handle_socket(socket, remote_addr);
                }
                Err(err) if is_transient(&err) => {
                    backoff = next_backoff(backoff);
                    warn!("accept error: {}; retrying in {:?}", err, backoff);
                    tokio::select! {
                        _ = time::sleep(backoff) => {}
                        _ = self.shutdown.recv() => break,
                    }
                }
                Err(err) => {
                    error!("accept error: {}; accept loop exits", err);
                    break;
                }
            }
        }
        debug!("accept loop exited");
    }

    fn handle_socket(&self, socket: TcpStream, remote_addr: SocketAddr) {
        let mut conns = self.conns.lock();
        if conns.len() >= self.max_conn_num {
            drop(conns);
            drop(socket);
            warn!(remote = %remote_addr, "too many connections");
            return;
        }

        let conn = match Connection::spawn(
            socket,
            self.codec.clone(),
            self.pending_write_num,
            Some(&self.destroy_all),
            Some(self.shutdown_complete_tx.clone()),
        ) {
            Ok(conn) => conn,
            Err(e) => {
                debug!(remote = %remote_addr, "dropping connection: {e}");
                return;
            }
        };
        let handle = conn.handle().clone();
        conns.insert(handle.id(), handle.clone());
        drop(conns);
        debug!(conn = handle.id(), remote = %remote_addr, "accept new connection");

        let mut agent = match catch_panic(|| (self.new_agent)(conn)) {
            Ok(agent) => agent,
            Err(message) => {
                error!(conn = handle.id(), "new_agent panicked: {message}");
                handle.destroy();
                self.conns.lock().remove(&handle.id());
                return;
            }
        };
        let guard = ConnGuard {
            handle,
            conns: self.conns.clone(),
        };
        let shutdown_complete_tx = self.shutdown_complete_tx.clone();
        tokio::spawn(async move {
            let _shutdown_complete_tx = shutdown_complete_tx;
            agent.run().await;
            // close and unregister before the agent's hook runs
            drop(guard);
            agent.on_close();
        });
    }
}

/// Closes and unregisters its connection when dropped, including when the
/// agent panics.
struct ConnGuard {
    handle: ConnHandle,
    conns: ConnSet,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.handle.close();
        self.conns.lock().remove(&self.handle.id());
    }
}

fn next_backoff(current: Duration) -> Duration {
    if current.is_zero() {
        MIN_ACCEPT_BACKOFF
    } else {
        (current * 2).min(MAX_ACCEPT_BACKOFF)
    }
}

#[cfg(target_os = "linux")]
const RESOURCE_EXHAUSTED: &[i32] = &[12, 23, 24, 105]; // ENOMEM ENFILE EMFILE ENOBUFS
#[cfg(target_os = "macos")]
const RESOURCE_EXHAUSTED: &[i32] = &[12, 23, 24, 55];
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
const RESOURCE_EXHAUSTED: &[i32] = &[];

/// Accept errors worth retrying: aborted handshakes and resource exhaustion.
fn is_transient(err: &io::Error) -> bool {
    use io::ErrorKind::*;
    matches!(
        err.kind(),
        ConnectionAborted | ConnectionReset | ConnectionRefused | Interrupted | WouldBlock
            | TimedOut | OutOfMemory
    ) || matches!(err.raw_os_error(), Some(code) if RESOURCE_EXHAUSTED.contains(&code))
}
