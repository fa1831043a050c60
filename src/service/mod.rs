pub use app_error::{AppError, AppResult};
pub use config::{
    global_config, DispatcherPool, NetworkConfig, TransportConfig, GLOBAL_CONFIG,
};
pub use node::ServerNode;
pub use server::TransportServer;
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing, LogGuard};

mod app_error;
mod config;
mod node;
mod server;
mod shutdown;
mod tracing_config;
