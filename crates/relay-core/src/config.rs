//! Properties-file loading for the broker and schema-registry clients.
//!
//! Files use the Java properties subset the Kafka tooling emits:
//! `key=value` per line, `#` comments, blank lines ignored. Only the first
//! `=` separates key from value.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Parsed `key -> value` pairs.
pub type Properties = BTreeMap<String, String>;

pub const BOOTSTRAP_SERVERS: &str = "bootstrap.servers";
pub const BOOTSTRAP_SERVERS_ENV: &str = "KAFKA_BOOTSTRAP_SERVERS";
pub const DEFAULT_BOOTSTRAP_SERVERS: &str = "localhost:9092";

/// Which client a properties file configures. Decides the fallback when the
/// file is missing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigKind {
    Broker,
    SchemaRegistry,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}:{line}: expected key=value")]
    Malformed { path: PathBuf, line: usize },
}

/// Read a properties file, falling back per `kind` when it does not exist.
pub fn read_properties(path: &Path, kind: ConfigKind) -> Result<Properties, ConfigError> {
    read_properties_with(path, kind, |name| std::env::var(name).ok())
}

/// Same as [`read_properties`] with an injectable environment lookup.
pub fn read_properties_with(
    path: &Path,
    kind: ConfigKind,
    env: impl Fn(&str) -> Option<String>,
) -> Result<Properties, ConfigError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            warn!(path = %path.display(), ?kind, "config file not found, using defaults");
            return Ok(fallback(kind, env));
        }
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let props = parse_properties(&content).map_err(|line| ConfigError::Malformed {
        path: path.to_path_buf(),
        line,
    })?;
    debug!(path = %path.display(), keys = ?props.keys().collect::<Vec<_>>(), "config loaded");
    Ok(props)
}

/// Parse properties text. Returns the 1-based number of the first bad line on failure.
pub fn parse_properties(content: &str) -> Result<Properties, usize> {
    let mut props = Properties::new();
    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line.split_once('=').ok_or(idx + 1)?;
        props.insert(key.trim().to_owned(), value.trim().to_owned());
    }
    Ok(props)
}

fn fallback(kind: ConfigKind, env: impl Fn(&str) -> Option<String>) -> Properties {
    let mut props = Properties::new();
    if kind == ConfigKind::Broker {
        let servers = env(BOOTSTRAP_SERVERS_ENV).unwrap_or_else(|| DEFAULT_BOOTSTRAP_SERVERS.into());
        props.insert(BOOTSTRAP_SERVERS.into(), servers);
    }
    props
}
