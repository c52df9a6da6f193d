//! Master configuration parsing.
//!
//! ```kdl
//! master "master-1"
//! database "postgres://conductor@localhost/conductor" max-connections=10
//! logging filter="info" json=#false
//! claims expiry=3600
//! ```

use std::path::Path;
use std::time::Duration;

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};

/// Configuration of one master process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Name the master registers under in the shared store.
    pub master: String,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub claims: ClaimsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimsConfig {
    /// Claims older than this are released by `unclaim-expired`.
    pub expiry: Duration,
}

impl Default for ClaimsConfig {
    fn default() -> Self {
        Self {
            expiry: Duration::from_secs(3600),
        }
    }
}

/// Parse a master configuration from KDL text.
pub fn parse_master_config(kdl: &str) -> ConfigResult<MasterConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let mut master = None;
    let mut database = DatabaseConfig::default();
    let mut logging = LoggingConfig::default();
    let mut claims = ClaimsConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "master" => {
                if master.is_some() {
                    return Err(ConfigError::Duplicate("master".to_string()));
                }
                master = Some(
                    get_first_string_arg(node)
                        .ok_or_else(|| ConfigError::MissingField("master name".to_string()))?,
                );
            }
            "database" => {
                database.url = get_first_string_arg(node).or(database.url);
                if let Some(n) = get_integer_prop(node, "max-connections")? {
                    database.max_connections =
                        u32::try_from(n).map_err(|_| invalid("max-connections", n))?;
                }
            }
            "logging" => {
                if let Some(filter) = get_string_prop(node, "filter") {
                    logging.filter = filter;
                }
                if let Some(json) = get_bool_prop(node, "json") {
                    logging.json = json;
                }
            }
            "claims" => {
                if let Some(secs) = get_integer_prop(node, "expiry")? {
                    let secs = u64::try_from(secs).map_err(|_| invalid("expiry", secs))?;
                    claims.expiry = Duration::from_secs(secs);
                }
            }
            _ => {} // Ignore unknown nodes
        }
    }

    let master = master.ok_or_else(|| ConfigError::MissingField("master".to_string()))?;
    if master.is_empty() {
        return Err(ConfigError::MissingField("master name".to_string()));
    }

    Ok(MasterConfig {
        master,
        database,
        logging,
        claims,
    })
}

/// Read and parse a master configuration file.
pub fn load_master_config(path: impl AsRef<Path>) -> ConfigResult<MasterConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_master_config(&text)
}

fn invalid(field: &str, value: i128) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: format!("{} is out of range", value),
    }
}

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

fn get_integer_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<i128>> {
    match node.get(name) {
        None => Ok(None),
        Some(value) => value
            .as_integer()
            .map(Some)
            .ok_or_else(|| ConfigError::InvalidValue {
                field: name.to_string(),
                message: format!("expected an integer, got {}", value),
            }),
    }
}
