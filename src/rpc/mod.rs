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

//! In-process RPC between workers
//!
//! A worker owns an [`RpcServer`] holding the functions it exposes. Other
//! workers reach it through an [`RpcHandle`] and issue calls from an
//! [`RpcClient`]. Nothing is shared besides the server's bounded request
//! queue and the per-call reply channels.
//!
//! # Flow
//!
//! 1. The owner registers functions, then hands out handles.
//! 2. A client looks the function up, checks its return shape, and queues a
//!    `CallRequest` carrying its reply channel.
//! 3. The owner's dispatch loop executes requests one at a time, in queue
//!    order, and sends each `CallResult` back exactly once.
//! 4. Synchronous callers await their reply; async callers collect results
//!    from the client's own queue and run the callbacks there.
//!
//! # Failure containment
//!
//! - A panicking function becomes an `AppError::CallPanicked` result.
//! - A panicking callback is logged and skipped.
//! - Closing a server fails every queued request with `AppError::ServerClosed`.

pub use call::{CallRequest, CallResult, Callback, Function, Return, Shape};
pub use client::RpcClient;
pub use server::{RpcHandle, RpcServer, Submit};
pub use value::{Args, Value};

mod call;
mod client;
mod server;
mod value;
