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

use std::fmt;
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, error};

use super::value::{Args, Value};
use crate::utils::catch_panic;
use crate::{AppError, AppResult};

/// Return shape of a registered function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Shape {
    /// `(args) -> ()`
    Unit,
    /// `(args) -> value`
    Value,
    /// `(args) -> [value]`
    List,
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Shape::Unit => "unit",
            Shape::Value => "value",
            Shape::List => "list",
        };
        f.write_str(name)
    }
}

type UnitFn = dyn Fn(Args) -> AppResult<()> + Send + Sync;
type ValueFn = dyn Fn(Args) -> AppResult<Value> + Send + Sync;
type ListFn = dyn Fn(Args) -> AppResult<Vec<Value>> + Send + Sync;

/// A registered function, tagged by its return shape.
#[derive(Clone)]
pub enum Function {
    Unit(Arc<UnitFn>),
    Value(Arc<ValueFn>),
    List(Arc<ListFn>),
}

impl Function {
    pub fn unit<F>(f: F) -> Function
    where
        F: Fn(Args) -> AppResult<()> + Send + Sync + 'static,
    {
        Function::Unit(Arc::new(f))
    }

    pub fn value<F>(f: F) -> Function
    where
        F: Fn(Args) -> AppResult<Value> + Send + Sync + 'static,
    {
        Function::Value(Arc::new(f))
    }

    pub fn list<F>(f: F) -> Function
    where
        F: Fn(Args) -> AppResult<Vec<Value>> + Send + Sync + 'static,
    {
        Function::List(Arc::new(f))
    }

    pub fn shape(&self) -> Shape {
        match self {
            Function::Unit(_) => Shape::Unit,
            Function::Value(_) => Shape::Value,
            Function::List(_) => Shape::List,
        }
    }

    fn invoke(&self, args: Args) -> AppResult<Return> {
        match self {
            Function::Unit(f) => f(args).map(|_| Return::Unit),
            Function::Value(f) => f(args).map(Return::Value),
            Function::List(f) => f(args).map(Return::List),
        }
    }

    /// Invokes the function with panics converted into `CallPanicked`.
    pub(crate) fn call(&self, id: &str, args: Args) -> AppResult<Return> {
        match catch_panic(|| self.invoke(args)) {
            Ok(ret) => ret,
            Err(message) => {
                error!(function = id, "call panicked: {message}");
                Err(AppError::CallPanicked(message))
            }
        }
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Function({})", self.shape())
    }
}

/// Payload of a successful call, one variant per [`Shape`].
#[derive(Debug, Clone, PartialEq)]
pub enum Return {
    Unit,
    Value(Value),
    List(Vec<Value>),
}

impl Return {
    pub fn shape(&self) -> Shape {
        match self {
            Return::Unit => Shape::Unit,
            Return::Value(_) => Shape::Value,
            Return::List(_) => Shape::List,
        }
    }

    pub(crate) fn into_unit(self) -> AppResult<()> {
        match self {
            Return::Unit => Ok(()),
            other => Err(other.mismatch(Shape::Unit)),
        }
    }

    pub(crate) fn into_value(self) -> AppResult<Value> {
        match self {
            Return::Value(v) => Ok(v),
            other => Err(other.mismatch(Shape::Value)),
        }
    }

    pub(crate) fn into_list(self) -> AppResult<Vec<Value>> {
        match self {
            Return::List(l) => Ok(l),
            other => Err(other.mismatch(Shape::List)),
        }
    }

    fn mismatch(&self, expected: Shape) -> AppError {
        AppError::IllegalState(format!(
            "call returned {} where {expected} was expected",
            self.shape()
        ))
    }
}

/// Completion handler of an async call. Runs on the calling worker when the
/// result is collected.
pub enum Callback {
    Unit(Box<dyn FnOnce(AppResult<()>) + Send>),
    Value(Box<dyn FnOnce(AppResult<Value>) + Send>),
    List(Box<dyn FnOnce(AppResult<Vec<Value>>) + Send>),
}

impl Callback {
    pub fn shape(&self) -> Shape {
        match self {
            Callback::Unit(_) => Shape::Unit,
            Callback::Value(_) => Shape::Value,
            Callback::List(_) => Shape::List,
        }
    }

    fn invoke(self, ret: AppResult<Return>) {
        match self {
            Callback::Unit(cb) => cb(ret.and_then(Return::into_unit)),
            Callback::Value(cb) => cb(ret.and_then(Return::into_value)),
            Callback::List(cb) => cb(ret.and_then(Return::into_list)),
        }
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callback({})", self.shape())
    }
}

/// Where the result of a call goes.
#[derive(Debug)]
pub(crate) enum Reply {
    /// fire-and-forget, the result is discarded
    Discard,
    Sync(oneshot::Sender<CallResult>),
    Async(async_channel::Sender<CallResult>),
}

impl Reply {
    pub(crate) fn send(self, result: CallResult) {
        match self {
            Reply::Discard => {}
            Reply::Sync(tx) => {
                if tx.send(result).is_err() {
                    debug!("sync caller went away before its result arrived");
                }
            }
            Reply::Async(tx) => {
                if let Err(e) = tx.try_send(result) {
                    // the pending-count check keeps the queue from filling, so only a
                    // dropped client ends up here
                    debug!("async result dropped: {}", e);
                }
            }
        }
    }
}

/// One pending invocation, consumed once by the owning server.
#[derive(Debug)]
pub struct CallRequest {
    pub(crate) id: String,
    pub(crate) function: Function,
    pub(crate) args: Args,
    pub(crate) reply: Reply,
    pub(crate) callback: Option<Callback>,
}

impl CallRequest {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Completes the request without running it.
    pub(crate) fn reject(self, err: AppError) {
        let CallRequest {
            reply, callback, ..
        } = self;
        reply.send(CallResult::failed(err, callback));
    }
}

/// Outcome of exactly one [`CallRequest`].
#[derive(Debug)]
pub struct CallResult {
    pub(crate) ret: AppResult<Return>,
    pub(crate) callback: Option<Callback>,
}

impl CallResult {
    pub(crate) fn failed(err: AppError, callback: Option<Callback>) -> CallResult {
        CallResult {
            ret: Err(err),
            callback,
        }
    }

    pub fn ret(&self) -> &AppResult<Return> {
        &self.ret
    }

    /// Runs the callback, if any. A panicking callback is logged and swallowed.
    pub(crate) fn run_callback(self) {
        let CallResult { ret, callback } = self;
        let Some(callback) = callback else {
            return;
        };
        if let Err(message) = catch_panic(|| callback.invoke(ret)) {
            error!("callback panicked: {message}");
        }
    }
}
