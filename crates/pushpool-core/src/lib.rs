pub mod config;
pub mod types;

pub use config::{GatewaySettings, PoolSettings, PushpoolConfig, StoreBackend};
pub use types::*;
