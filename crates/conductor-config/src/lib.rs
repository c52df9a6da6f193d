//! KDL configuration for Conductor masters.

pub mod error;
pub mod master;

pub use error::{ConfigError, ConfigResult};
pub use master::{
    ClaimsConfig, DatabaseConfig, LoggingConfig, MasterConfig, load_master_config,
    parse_master_config,
};
