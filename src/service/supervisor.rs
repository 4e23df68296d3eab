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
use std::pin::Pin;

use chrono::{DateTime, Local};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{AppResult, Shutdown};
use crate::utils::{catch_panic, panic_message};

/// A long-lived worker managed by the [`Supervisor`].
pub trait Module: Send + 'static {
    fn name(&self) -> &str;

    fn on_init(&mut self) -> AppResult<()>;

    /// Worker loop; must return soon after `shutdown` fires.
    fn run<'a>(&'a mut self, shutdown: Shutdown) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

    fn on_destroy(&mut self);
}

struct ModuleSlot {
    name: String,
    module: Option<Box<dyn Module>>,
    notify_shutdown: Option<broadcast::Sender<()>>,
    handle: Option<JoinHandle<Box<dyn Module>>>,
}

/// Owns the registered modules in registration order.
///
/// `init` initializes all of them, then starts every `run` concurrently.
/// `destroy` walks them in reverse: signal, wait for `run` to return, then
/// `on_destroy`, so a module is torn down before the ones it depends on.
#[derive(Default)]
pub struct Supervisor {
    modules: Vec<ModuleSlot>,
    started_at: Option<DateTime<Local>>,
}

impl Supervisor {
    pub fn new() -> Supervisor {
        Supervisor::default()
    }

    pub fn register<M: Module>(&mut self, module: M) {
        self.register_boxed(Box::new(module));
    }

    pub fn register_boxed(&mut self, module: Box<dyn Module>) {
        debug!("module {} registered", module.name());
        self.modules.push(ModuleSlot {
            name: module.name().to_string(),
            module: Some(module),
            notify_shutdown: None,
            handle: None,
        });
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Runs every `on_init` in registration order, then spawns every `run`.
    ///
    /// Stops at the first failing `on_init`; nothing is spawned in that case.
    pub fn init(&mut self) -> AppResult<()> {
        for slot in &mut self.modules {
            if let Some(module) = slot.module.as_mut() {
                module.on_init().map_err(|e| {
                    error!("module {} init failed: {}", slot.name, e);
                    e
                })?;
                debug!("module {} initialized", slot.name);
            }
        }

        for slot in &mut self.modules {
            let Some(mut module) = slot.module.take() else {
                continue;
            };
            let (notify_shutdown, shutdown) = Shutdown::channel();
            slot.notify_shutdown = Some(notify_shutdown);
            slot.handle = Some(tokio::spawn(async move {
                module.run(shutdown).await;
                module
            }));
        }
        self.started_at = Some(Local::now());
        Ok(())
    }

    /// Stops and destroys the started modules in reverse registration order.
    pub async fn destroy(&mut self) {
        for slot in self.modules.iter_mut().rev() {
            let Some(handle) = slot.handle.take() else {
                continue;
            };
            if let Some(notify_shutdown) = slot.notify_shutdown.take() {
                let _ = notify_shutdown.send(());
            }
            let mut module = match handle.await {
                Ok(module) => module,
                Err(e) if e.is_panic() => {
                    error!(
                        "module {} run panicked: {}",
                        slot.name,
                        panic_message(e.into_panic())
                    );
                    continue;
                }
                Err(e) => {
                    error!("module {} run failed: {}", slot.name, e);
                    continue;
                }
            };
            if let Err(message) = catch_panic(|| module.on_destroy()) {
                error!("module {} destroy panicked: {}", slot.name, message);
            }
            debug!("module {} destroyed", slot.name);
        }
        if let Some(started_at) = self.started_at.take() {
            info!(
                "all modules destroyed, uptime {}s",
                (Local::now() - started_at).num_seconds()
            );
        }
    }

    /// `init`, wait for `signal`, `destroy`.
    pub async fn run_until<F>(&mut self, signal: F) -> AppResult<()>
    where
        F: Future<Output = ()>,
    {
        self.init()?;
        info!("{} modules running", self.modules.len());
        signal.await;
        info!("shutdown signal received, closing down");
        self.destroy().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::AppError;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        name: &'static str,
        log: Log,
        fail_init: bool,
        panic_in_run: bool,
        panic_in_destroy: bool,
    }

    impl Recorder {
        fn new(name: &'static str, log: &Log) -> Recorder {
            Recorder {
                name,
                log: log.clone(),
                fail_init: false,
                panic_in_run: false,
                panic_in_destroy: false,
            }
        }
    }

    impl Module for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn on_init(&mut self) -> AppResult<()> {
            self.log.lock().push(format!("init {}", self.name));
            if self.fail_init {
                return Err(AppError::InvalidConfig("bad module".into()));
            }
            Ok(())
        }

        fn run<'a>(
            &'a mut self,
            mut shutdown: Shutdown,
        ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
            Box::pin(async move {
                if self.panic_in_run {
                    panic!("run exploded");
                }
                shutdown.recv().await;
                self.log.lock().push(format!("stop {}", self.name));
            })
        }

        fn on_destroy(&mut self) {
            self.log.lock().push(format!("destroy {}", self.name));
            if self.panic_in_destroy {
                panic!("destroy exploded");
            }
        }
    }

    #[tokio::test]
    async fn destroys_in_reverse_registration_order() {
        let log = Log::default();
        let mut supervisor = Supervisor::new();
        for name in ["db", "game", "gate"] {
            supervisor.register(Recorder::new(name, &log));
        }
        supervisor.run_until(async {}).await.unwrap();
        assert_eq!(
            *log.lock(),
            vec![
                "init db",
                "init game",
                "init gate",
                "stop gate",
                "destroy gate",
                "stop game",
                "destroy game",
                "stop db",
                "destroy db",
            ]
        );
    }

    #[tokio::test]
    async fn init_failure_starts_nothing() {
        let log = Log::default();
        let mut supervisor = Supervisor::new();
        supervisor.register(Recorder::new("a", &log));
        let mut bad = Recorder::new("b", &log);
        bad.fail_init = true;
        supervisor.register(bad);
        supervisor.register(Recorder::new("c", &log));

        assert!(supervisor.init().is_err());
        supervisor.destroy().await;
        assert_eq!(*log.lock(), vec!["init a", "init b"]);
    }

    #[tokio::test]
    async fn panics_are_contained_per_module() {
        let log = Log::default();
        let mut supervisor = Supervisor::new();
        let mut crashing = Recorder::new("crashing", &log);
        crashing.panic_in_run = true;
        supervisor.register(crashing);
        let mut noisy = Recorder::new("noisy", &log);
        noisy.panic_in_destroy = true;
        supervisor.register(noisy);
        supervisor.register(Recorder::new("last", &log));

        supervisor.init().unwrap();
        supervisor.destroy().await;
        let log = log.lock();
        assert_eq!(
            log[3..].to_vec(),
            vec!["stop last", "destroy last", "stop noisy", "destroy noisy"]
        );
    }
}
