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
use std::sync::Arc;

use async_channel::TrySendError;
use tracing::{debug, trace, warn};

use super::call::{CallRequest, CallResult, Function, Reply, Shape};
use super::client::RpcClient;
use super::value::{Args, Value};
use crate::service::RpcConfig;
use crate::{AppError, AppResult, Shutdown};

/// How a request enters the server's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submit {
    /// wait for free capacity
    Block,
    /// fail with `QueueFull` when the queue is saturated
    NoWait,
}

/// The call-serving side of one worker.
///
/// Functions are registered before any [`RpcHandle`] is taken; afterwards the
/// registry is shared read-only. Requests are executed one at a time, in
/// submission order, by whoever drives [`RpcServer::serve`] (or
/// [`RpcServer::recv`] + [`RpcServer::exec`]).
#[derive(Debug)]
pub struct RpcServer {
    functions: Arc<HashMap<String, Function>>,
    request_tx: async_channel::Sender<CallRequest>,
    request_rx: async_channel::Receiver<CallRequest>,
}

impl RpcServer {
    pub fn new(chan_call_len: usize) -> RpcServer {
        let (request_tx, request_rx) = async_channel::bounded(chan_call_len.max(1));
        RpcServer {
            functions: Arc::new(HashMap::new()),
            request_tx,
            request_rx,
        }
    }

    pub fn with_config(config: &RpcConfig) -> RpcServer {
        RpcServer::new(config.chan_call_len)
    }

    /// Registers `function` under `id`.
    ///
    /// Fails on a duplicate id, and once a handle or client has been taken.
    pub fn register(&mut self, id: impl Into<String>, function: Function) -> AppResult<()> {
        let id = id.into();
        let functions = Arc::get_mut(&mut self.functions).ok_or_else(|| {
            AppError::IllegalState(format!(
                "function id {id}: registered after the server was opened"
            ))
        })?;
        if functions.contains_key(&id) {
            return Err(AppError::DuplicateFunction(id));
        }
        debug!(function = %id, shape = %function.shape(), "rpc function registered");
        functions.insert(id, function);
        Ok(())
    }

    pub fn handle(&self) -> RpcHandle {
        RpcHandle {
            functions: self.functions.clone(),
            request_tx: self.request_tx.clone(),
        }
    }

    pub fn open(&self, async_ret_len: usize) -> RpcClient {
        self.handle().open(async_ret_len)
    }

    /// Next queued request; `None` once the server is closed and drained.
    pub async fn recv(&self) -> Option<CallRequest> {
        self.request_rx.recv().await.ok()
    }

    /// Executes one request and delivers its result.
    pub fn exec(&self, request: CallRequest) {
        let CallRequest {
            id,
            function,
            args,
            reply,
            callback,
        } = request;
        trace!(function = %id, "rpc exec");
        let ret = function.call(&id, args);
        if let Err(e) = &ret {
            debug!(function = %id, "call error: {e}");
        }
        reply.send(CallResult { ret, callback });
    }

    /// Dispatch loop: runs requests until `shutdown` fires, then closes.
    pub async fn serve(&self, shutdown: &mut Shutdown) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    debug!("rpc server received shutdown signal");
                    break;
                }
                request = self.request_rx.recv() => match request {
                    Ok(request) => self.exec(request),
                    Err(_) => break,
                },
            }
        }
        self.close();
    }

    /// Stops accepting requests and fails every queued one with `ServerClosed`.
    ///
    /// Idempotent.
    pub fn close(&self) {
        self.request_rx.close();
        let mut drained = 0;
        while let Ok(request) = self.request_rx.try_recv() {
            request.reject(AppError::ServerClosed);
            drained += 1;
        }
        if drained > 0 {
            debug!("rpc server closed, {drained} queued requests failed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.request_rx.is_closed()
    }

    /// Number of queued requests.
    pub fn len(&self) -> usize {
        self.request_rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.request_rx.is_empty()
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Cloneable caller-side reference to one [`RpcServer`].
#[derive(Debug, Clone)]
pub struct RpcHandle {
    functions: Arc<HashMap<String, Function>>,
    pub(crate) request_tx: async_channel::Sender<CallRequest>,
}

impl RpcHandle {
    /// Opens a client whose async result queue holds `async_ret_len` results.
    pub fn open(&self, async_ret_len: usize) -> RpcClient {
        RpcClient::new(self.clone(), async_ret_len)
    }

    /// Submits a call whose result is discarded.
    ///
    /// Unknown ids are ignored; a full or closed queue drops the call.
    pub fn go(&self, id: &str, args: Args) {
        let Some(function) = self.functions.get(id) else {
            debug!(function = id, "go: function not registered");
            return;
        };
        let request = CallRequest {
            id: id.to_string(),
            function: function.clone(),
            args,
            reply: Reply::Discard,
            callback: None,
        };
        if let Err(e) = self.request_tx.try_send(request) {
            warn!(function = id, "go: call dropped, {e}");
        }
    }

    pub async fn call0(&self, id: &str, args: Args) -> AppResult<()> {
        self.open(0).call0(id, args).await
    }

    pub async fn call1(&self, id: &str, args: Args) -> AppResult<Value> {
        self.open(0).call1(id, args).await
    }

    pub async fn call_n(&self, id: &str, args: Args) -> AppResult<Vec<Value>> {
        self.open(0).call_n(id, args).await
    }

    pub fn is_closed(&self) -> bool {
        self.request_tx.is_closed()
    }

    /// Looks up `id` and checks it returns `shape`.
    pub(crate) fn function(&self, id: &str, shape: Shape) -> AppResult<Function> {
        let function = self
            .functions
            .get(id)
            .ok_or_else(|| AppError::UnknownFunction(id.to_string()))?;
        if function.shape() != shape {
            return Err(AppError::ShapeMismatch {
                id: id.to_string(),
                expected: shape,
                actual: function.shape(),
            });
        }
        Ok(function.clone())
    }

    pub(crate) async fn submit(&self, request: CallRequest, mode: Submit) -> AppResult<()> {
        match mode {
            Submit::Block => self
                .request_tx
                .send(request)
                .await
                .map_err(|_| AppError::ServerClosed),
            Submit::NoWait => self.request_tx.try_send(request).map_err(|e| match e {
                TrySendError::Full(_) => AppError::QueueFull,
                TrySendError::Closed(_) => AppError::ServerClosed,
            }),
        }
    }
}
