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

//! Network Module Implementation
//!
//! TCP transport for client connections: accepting sockets, framing
//! messages, and per-connection write queues.
//!
//! # Architecture
//!
//! Built on tokio's async I/O primitives:
//! - `TcpServer` runs the accept loop, enforces the connection limit and
//!   spawns one driver task per connection
//! - `Connection` owns the read half of a socket; its `ConnHandle` feeds a
//!   bounded write queue drained by a writer task
//! - `FrameCodec` reads and writes `[length][payload]` messages
//! - `Agent` is the application's per-connection driver
//!
//! # Backpressure
//!
//! A connection whose write queue is full is destroyed instead of blocking
//! the writer. Framing errors close only the offending connection.

pub use agent::Agent;
pub use connection::{ConnHandle, Connection};
pub use frame::FrameCodec;
pub use server::{NewAgent, TcpServer};

mod agent;
mod connection;
mod frame;
mod server;
