pub use app_error::{AppError, AppResult};
pub use config::{AppConfig, GeneralConfig, LogConfig, NetworkConfig, RpcConfig};
pub use shutdown::Shutdown;
pub use supervisor::{Module, Supervisor};
pub use tracing_config::{setup_local_tracing, setup_tracing, LogGuard};

mod app_error;
pub mod config;
mod shutdown;
mod supervisor;
mod tracing_config;
