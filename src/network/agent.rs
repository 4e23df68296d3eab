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

use std::future::Future;

/// Application-supplied driver of one connection.
///
/// The server builds an agent per accepted [`Connection`](super::Connection),
/// awaits `run`, closes the connection, removes it from its live set, and only
/// then calls `on_close`. `run` must return once its connection is closed,
/// which a loop over `read_msg` does on its own.
pub trait Agent: Send + 'static {
    fn run(&mut self) -> impl Future<Output = ()> + Send;

    fn on_close(&mut self);
}
