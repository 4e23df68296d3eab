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
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use clap::Parser;
use dotenv::dotenv;
use hearth::{
    args, setup_tracing, Agent, AppConfig, AppError, AppResult, Connection, Function, Module,
    NetworkConfig, RpcHandle, RpcServer, Shutdown, Supervisor, TcpServer,
};
use tokio::{runtime, signal};
use tracing::{debug, error, info, warn};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    PrintConfig,
}

/// Owns the game state; every call runs on this module's dispatch loop.
struct GameModule {
    server: RpcServer,
    online: Arc<AtomicUsize>,
}

impl GameModule {
    fn new(config: &AppConfig) -> AppResult<GameModule> {
        let online = Arc::new(AtomicUsize::new(0));
        let mut server = RpcServer::with_config(&config.rpc);

        let joined = online.clone();
        server.register(
            "join",
            Function::unit(move |args| {
                let count = joined.fetch_add(1, Ordering::Relaxed) + 1;
                debug!("player {:?} joined, {} online", args.first(), count);
                Ok(())
            }),
        )?;
        let left = online.clone();
        server.register(
            "leave",
            Function::unit(move |args| {
                let count = left.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
                debug!("player {:?} left, {} online", args.first(), count);
                Ok(())
            }),
        )?;
        server.register(
            "echo",
            Function::value(|mut args| {
                if args.is_empty() {
                    return Err(AppError::CallFailed("echo needs one argument".into()));
                }
                Ok(args.swap_remove(0))
            }),
        )?;

        Ok(GameModule { server, online })
    }
}

impl Module for GameModule {
    fn name(&self) -> &str {
        "game"
    }

    fn on_init(&mut self) -> AppResult<()> {
        info!("game module ready");
        Ok(())
    }

    fn run<'a>(&'a mut self, mut shutdown: Shutdown) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move { self.server.serve(&mut shutdown).await })
    }

    fn on_destroy(&mut self) {
        info!(
            "game module destroyed, {} players still online",
            self.online.load(Ordering::Relaxed)
        );
    }
}

/// Relays every client message to the game module and writes the reply back.
struct GateAgent {
    conn: Connection,
    game: RpcHandle,
}

impl Agent for GateAgent {
    async fn run(&mut self) {
        self.game.go("join", args![self.conn.id() as i64]);
        loop {
            let msg = match self.conn.read_msg().await {
                Ok(msg) => msg,
                Err(e) => {
                    debug!(conn = self.conn.id(), "read message: {e}");
                    break;
                }
            };
            let reply = match self.game.call1("echo", args![msg]).await {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(conn = self.conn.id(), "echo call failed: {e}");
                    break;
                }
            };
            let Some(payload) = reply.as_bytes() else {
                warn!(conn = self.conn.id(), "unexpected echo reply {:?}", reply);
                break;
            };
            if let Err(e) = self.conn.write_msg(&[&payload[..]]) {
                debug!(conn = self.conn.id(), "write message: {e}");
                break;
            }
        }
    }

    fn on_close(&mut self) {
        self.game.go("leave", args![self.conn.id() as i64]);
    }
}

struct GateModule {
    config: NetworkConfig,
    game: RpcHandle,
    server: Option<TcpServer<GateAgent>>,
}

impl Module for GateModule {
    fn name(&self) -> &str {
        "gate"
    }

    fn on_init(&mut self) -> AppResult<()> {
        let mut server = TcpServer::new(self.config.clone());
        let game = self.game.clone();
        server.set_new_agent(move |conn| GateAgent {
            conn,
            game: game.clone(),
        });
        self.server = Some(server);
        Ok(())
    }

    fn run<'a>(&'a mut self, mut shutdown: Shutdown) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let Some(server) = self.server.as_mut() else {
                return;
            };
            match server.start().await {
                Ok(addr) => info!("gate listening on {}", addr),
                Err(e) => {
                    error!("gate failed to start: {e}");
                    return;
                }
            }
            shutdown.recv().await;
            server.close().await;
        })
    }

    fn on_destroy(&mut self) {
        if let Some(server) = self.server.take() {
            info!("gate module destroyed, {} connections left", server.conn_count());
        }
    }
}

fn main() -> AppResult<()> {
    dotenv().ok();

    //setup config
    let commandline: CommandLine = CommandLine::parse();
    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let mut config = AppConfig::load(config_path)?;
    match commandline.verbose {
        0 => {}
        1 => config.log.level = "info".to_string(),
        2 => config.log.level = "debug".to_string(),
        _ => config.log.level = "trace".to_string(),
    }
    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", config);
        return Ok(());
    }

    let _log_guard = setup_tracing(&config.log)?;

    // startup tokio runtime
    let rt = runtime::Builder::new_multi_thread()
        .worker_threads(config.general.worker_threads())
        .enable_all()
        .build()?;

    let game = GameModule::new(&config)?;
    let gate = GateModule {
        config: config.network.clone(),
        game: game.server.handle(),
        server: None,
    };

    let mut supervisor = Supervisor::new();
    supervisor.register(game);
    supervisor.register(gate);

    rt.block_on(supervisor.run_until(async {
        if let Err(e) = signal::ctrl_c().await {
            error!("listen for ctrl-c: {e}");
        }
    }))
}
