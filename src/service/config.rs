extern crate config as _;

use std::path::Path;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

pub static GLOBAL_CONFIG: OnceCell<TransportConfig> = OnceCell::new();
pub fn global_config() -> &'static TransportConfig {
    GLOBAL_CONFIG.get().unwrap()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    pub max_connection: usize,
    /// Largest declared payload length accepted by the frame codec.
    /// A header above this limit fails closed before any allocation.
    pub max_frame_size: usize,
    pub conn_read_buffer_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "0.0.0.0".to_string(),
            port: 7272,
            max_connection: 1024,
            max_frame_size: 4 * 1024 * 1024,
            conn_read_buffer_size: 4 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatcherPool {
    pub channel_capacity: usize,
    pub num_channels: i8,
    pub monitor_interval: u64,
    pub worker_check_timeout: u64,
}

impl Default for DispatcherPool {
    fn default() -> Self {
        DispatcherPool {
            channel_capacity: 1024,
            num_channels: num_cpus::get().min(i8::MAX as usize) as i8,
            monitor_interval: 30,
            worker_check_timeout: 10,
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    pub network: NetworkConfig,
    pub dispatcher_pool: DispatcherPool,
}

impl TransportConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<TransportConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;

        let transport_config: TransportConfig = config.try_deserialize()?;

        Ok(transport_config)
    }
}
