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

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

/// Stop signal handed to a worker loop.
///
/// Fires once the paired `broadcast::Sender` sends or is dropped, and stays
/// fired afterwards.
#[derive(Debug)]
pub struct Shutdown {
    is_shutdown: bool,
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    pub fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            is_shutdown: false,
            notify,
        }
    }

    /// Creates a sender together with one subscribed `Shutdown`.
    pub fn channel() -> (broadcast::Sender<()>, Shutdown) {
        let (notify, rx) = broadcast::channel(1);
        (notify, Shutdown::new(rx))
    }

    pub fn is_shutdown(&mut self) -> bool {
        if !self.is_shutdown {
            match self.notify.try_recv() {
                Err(TryRecvError::Empty) => {}
                _ => self.is_shutdown = true,
            }
        }
        self.is_shutdown
    }

    pub async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }
        let _ = self.notify.recv().await;
        self.is_shutdown = true;
    }
}
