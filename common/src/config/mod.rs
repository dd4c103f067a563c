pub mod config;
pub mod ops_config;

pub use config::WorkerConfig;
pub use ops_config::OpsConfig;
