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

use async_channel::TrySendError;
use tokio::sync::oneshot;
use tracing::{debug, error};

use super::call::{CallRequest, CallResult, Callback, Reply, Return, Shape};
use super::server::{RpcHandle, Submit};
use super::value::{Args, Value};
use crate::{AppError, AppResult};

/// Caller-side binding to one [`RpcServer`](super::RpcServer).
///
/// Synchronous calls (`call0`/`call1`/`call_n`) suspend until their result
/// arrives and may be issued concurrently through a shared reference.
/// Async calls hand back their result through the client's own queue; the
/// callback runs when the owner collects it.
///
/// At most `async_ret_len` async calls can be outstanding. Calls beyond that
/// fail right away with `TooManyPendingCalls` and never reach the server.
#[derive(Debug)]
pub struct RpcClient {
    server: RpcHandle,
    async_tx: async_channel::Sender<CallResult>,
    async_rx: async_channel::Receiver<CallResult>,
    async_ret_len: usize,
    pending: usize,
}

impl RpcClient {
    pub(crate) fn new(server: RpcHandle, async_ret_len: usize) -> RpcClient {
        // a zero-length queue still needs a channel; the pending check keeps it unused
        let (async_tx, async_rx) = async_channel::bounded(async_ret_len.max(1));
        RpcClient {
            server,
            async_tx,
            async_rx,
            async_ret_len,
            pending: 0,
        }
    }

    pub async fn call0(&self, id: &str, args: Args) -> AppResult<()> {
        self.call(id, args, Shape::Unit, Submit::Block)
            .await?
            .into_unit()
    }

    pub async fn call1(&self, id: &str, args: Args) -> AppResult<Value> {
        self.call(id, args, Shape::Value, Submit::Block)
            .await?
            .into_value()
    }

    pub async fn call_n(&self, id: &str, args: Args) -> AppResult<Vec<Value>> {
        self.call(id, args, Shape::List, Submit::Block)
            .await?
            .into_list()
    }

    /// Like [`call0`](Self::call0), but fails with `QueueFull` instead of
    /// waiting for room in the server's queue.
    pub async fn try_call0(&self, id: &str, args: Args) -> AppResult<()> {
        self.call(id, args, Shape::Unit, Submit::NoWait)
            .await?
            .into_unit()
    }

    pub async fn try_call1(&self, id: &str, args: Args) -> AppResult<Value> {
        self.call(id, args, Shape::Value, Submit::NoWait)
            .await?
            .into_value()
    }

    pub async fn try_call_n(&self, id: &str, args: Args) -> AppResult<Vec<Value>> {
        self.call(id, args, Shape::List, Submit::NoWait)
            .await?
            .into_list()
    }

    async fn call(&self, id: &str, args: Args, shape: Shape, mode: Submit) -> AppResult<Return> {
        let function = self.server.function(id, shape)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = CallRequest {
            id: id.to_string(),
            function,
            args,
            reply: Reply::Sync(reply_tx),
            callback: None,
        };
        self.server.submit(request, mode).await?;
        // the server side drops the sender only if it went away without replying
        reply_rx.await.map_err(|_| AppError::ServerClosed)?.ret
    }

    pub fn async_call0<F>(&mut self, id: &str, args: Args, cb: F)
    where
        F: FnOnce(AppResult<()>) + Send + 'static,
    {
        self.async_call(id, args, Callback::Unit(Box::new(cb)));
    }

    pub fn async_call1<F>(&mut self, id: &str, args: Args, cb: F)
    where
        F: FnOnce(AppResult<Value>) + Send + 'static,
    {
        self.async_call(id, args, Callback::Value(Box::new(cb)));
    }

    pub fn async_call_n<F>(&mut self, id: &str, args: Args, cb: F)
    where
        F: FnOnce(AppResult<Vec<Value>>) + Send + 'static,
    {
        self.async_call(id, args, Callback::List(Box::new(cb)));
    }

    /// Submits without waiting. The expected shape is taken from the callback.
    ///
    /// A full server queue or an unknown function still counts as pending:
    /// the error reaches the callback on the next collect. Only the
    /// pending-limit failure runs the callback immediately.
    pub fn async_call(&mut self, id: &str, args: Args, callback: Callback) {
        if self.pending >= self.async_ret_len {
            debug!(function = id, pending = self.pending, "too many pending async calls");
            CallResult::failed(AppError::TooManyPendingCalls, Some(callback)).run_callback();
            return;
        }

        let function = match self.server.function(id, callback.shape()) {
            Ok(function) => function,
            Err(e) => {
                self.push_local(CallResult::failed(e, Some(callback)));
                return;
            }
        };
        let request = CallRequest {
            id: id.to_string(),
            function,
            args,
            reply: Reply::Async(self.async_tx.clone()),
            callback: Some(callback),
        };
        match self.server.request_tx.try_send(request) {
            Ok(()) => self.pending += 1,
            Err(TrySendError::Full(request)) => {
                self.push_local(CallResult::failed(AppError::QueueFull, request.callback))
            }
            Err(TrySendError::Closed(request)) => {
                self.push_local(CallResult::failed(AppError::ServerClosed, request.callback))
            }
        }
    }

    /// Queues a locally produced result as if the server had answered.
    fn push_local(&mut self, result: CallResult) {
        match self.async_tx.try_send(result) {
            Ok(()) => self.pending += 1,
            Err(e) => {
                error!("async result queue rejected a local result");
                e.into_inner().run_callback();
            }
        }
    }

    /// Waits for one async result and runs its callback.
    ///
    /// Returns `false` without waiting when nothing is pending.
    pub async fn collect(&mut self) -> bool {
        if self.pending == 0 {
            return false;
        }
        match self.async_rx.recv().await {
            Ok(result) => {
                self.cb(result);
                true
            }
            Err(_) => false,
        }
    }

    /// Runs the callback of one already completed async call, if any.
    pub fn try_collect(&mut self) -> bool {
        match self.async_rx.try_recv() {
            Ok(result) => {
                self.cb(result);
                true
            }
            Err(_) => false,
        }
    }

    /// Next completed async result, for use inside a worker's `select!`.
    /// Hand it to [`cb`](Self::cb). Never resolves while nothing is pending.
    pub async fn recv_result(&self) -> Option<CallResult> {
        self.async_rx.recv().await.ok()
    }

    pub fn cb(&mut self, result: CallResult) {
        self.pending = self.pending.saturating_sub(1);
        result.run_callback();
    }

    /// Collects every outstanding async result so no callback is lost.
    pub async fn close(&mut self) {
        while self.collect().await {}
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn is_idle(&self) -> bool {
        self.pending == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::args;
    use crate::rpc::{Function, RpcServer};

    fn add_server() -> RpcServer {
        let mut server = RpcServer::new(16);
        server
            .register(
                "add",
                Function::value(|args| {
                    let a = args.first().and_then(Value::as_i64).unwrap_or_default();
                    let b = args.get(1).and_then(Value::as_i64).unwrap_or_default();
                    Ok(Value::Int(a + b))
                }),
            )
            .unwrap();
        server
            .register("pair", Function::list(|args| Ok(args)))
            .unwrap();
        server
    }

    async fn drain(server: &RpcServer) {
        while !server.is_empty() {
            if let Some(request) = server.recv().await {
                server.exec(request);
            }
        }
    }

    #[tokio::test]
    async fn async_call_limit_bypasses_server() {
        let server = add_server();
        let mut client = server.open(2);
        let results = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let results = results.clone();
            client.async_call1("add", args![i, 1], move |ret| results.lock().push(ret));
        }
        // the third call failed locally and its callback already ran
        assert_eq!(client.pending(), 2);
        assert_eq!(server.len(), 2);
        assert!(matches!(
            results.lock()[0],
            Err(AppError::TooManyPendingCalls)
        ));

        drain(&server).await;
        client.close().await;
        assert!(client.is_idle());
        let results = results.lock();
        assert_eq!(results.len(), 3);
        assert_eq!(results[1].as_ref().unwrap(), &Value::Int(1));
        assert_eq!(results[2].as_ref().unwrap(), &Value::Int(2));
    }

    #[tokio::test]
    async fn async_unknown_function_reaches_callback_on_collect() {
        let server = add_server();
        let mut client = server.open(4);
        let seen = Arc::new(Mutex::new(None));
        let slot = seen.clone();
        client.async_call0("missing", args![], move |ret| *slot.lock() = Some(ret));
        assert_eq!(client.pending(), 1);
        assert!(seen.lock().is_none());
        assert!(client.try_collect());
        assert!(matches!(
            seen.lock().as_ref(),
            Some(Err(AppError::UnknownFunction(_)))
        ));
        assert!(client.is_idle());
    }

    #[tokio::test]
    async fn async_shape_is_checked_against_callback() {
        let server = add_server();
        let mut client = server.open(4);
        let seen = Arc::new(Mutex::new(None));
        let slot = seen.clone();
        client.async_call_n("add", args![1, 2], move |ret| *slot.lock() = Some(ret));
        client.close().await;
        assert!(matches!(
            seen.lock().as_ref(),
            Some(Err(AppError::ShapeMismatch { .. }))
        ));
    }

    #[tokio::test]
    async fn async_full_queue_is_reported_not_dropped() {
        let mut server = RpcServer::new(1);
        server.register("f", Function::unit(|_| Ok(()))).unwrap();
        let mut client = server.open(4);
        let errors = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..2 {
            let errors = errors.clone();
            client.async_call0("f", args![], move |ret| errors.lock().push(ret.is_err()));
        }
        assert_eq!(client.pending(), 2);
        drain(&server).await;
        client.close().await;
        // the first call ran, the second found the queue full
        let mut errors = errors.lock().clone();
        errors.sort();
        assert_eq!(errors, vec![false, true]);
    }

    #[tokio::test]
    async fn list_call_returns_all_values() {
        let server = add_server();
        let client = server.open(0);
        let (ret, _) = tokio::join!(client.call_n("pair", args![1, "b"]), drain_one(&server));
        assert_eq!(ret.unwrap(), args![1, "b"]);
    }

    async fn drain_one(server: &RpcServer) {
        if let Some(request) = server.recv().await {
            server.exec(request);
        }
    }

    #[tokio::test]
    async fn collect_with_nothing_pending_returns_immediately() {
        let server = add_server();
        let mut client = server.open(4);
        assert!(!client.collect().await);
        assert!(!client.try_collect());
    }
}
