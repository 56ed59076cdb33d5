//! `custody.toml` loading.
//!
//! ```toml
//! reentry_checkpoint = 9
//!
//! [server]
//! port = 8080
//!
//! [master]
//! kind = "static"          # or "http"
//! path = "shipments.json"  # static: JSON array of master shipments
//! # base_url = "https://erp.example.com/api"
//! # auth_token = "..."
//!
//! [eligibility]
//! statuses = ["approved"]
//! date_from = "2025-01-01"
//!
//! [documents]
//! endpoint = "https://docs.example.com/render"
//! queue_capacity = 64      # omit to generate inline
//!
//! [[stages]]
//! checkpoint = 2
//! kind = "pending"
//! from = "delivery"
//! acting = "hub"
//! next = 3
//! ```
//!
//! Every section is optional; an absent `[[stages]]` list means the default
//! pipeline. `CUSTODY_PORT` overrides `server.port`. Bearer tokens fall back
//! to `CUSTODY_MASTER_AUTH_TOKEN` / `CUSTODY_DOCUMENTS_AUTH_TOKEN`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use custody_storage::Checkpoint;
use custody_workflow::master::http::HttpMaster;
use custody_workflow::{
    EligibilityFilter, MasterError, MasterSource, Stage, StageTable, StageTableError,
    StaticMaster,
};
use serde::Deserialize;

pub(crate) const DEFAULT_PORT: u16 = 8080;
pub(crate) const PORT_ENV: &str = "CUSTODY_PORT";

#[derive(Debug, thiserror::Error)]
pub(crate) enum ConfigError {
    #[error("error reading config '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("error parsing config '{path}': {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid {var}: '{value}' is not a port number")]
    Env { var: &'static str, value: String },
    #[error("invalid stage table: {0}")]
    Stages(#[from] StageTableError),
    #[error(transparent)]
    Master(#[from] MasterError),
    #[error("documents.queue_capacity must be at least 1")]
    QueueCapacity,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Config {
    #[serde(default)]
    pub(crate) server: ServerConfig,
    #[serde(default)]
    pub(crate) master: MasterConfig,
    #[serde(default)]
    pub(crate) eligibility: EligibilityConfig,
    pub(crate) documents: Option<DocumentsConfig>,
    #[serde(default)]
    pub(crate) stages: Vec<Stage>,
    pub(crate) reentry_checkpoint: Option<Checkpoint>,

    /// Directory relative paths in the file resolve against.
    #[serde(skip)]
    base_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ServerConfig {
    #[serde(default = "default_port")]
    pub(crate) port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: DEFAULT_PORT,
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub(crate) enum MasterConfig {
    Static {
        path: Option<PathBuf>,
    },
    Http {
        base_url: String,
        auth_token: Option<String>,
    },
}

impl Default for MasterConfig {
    fn default() -> Self {
        MasterConfig::Static { path: None }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct EligibilityConfig {
    #[serde(default)]
    pub(crate) statuses: Vec<String>,
    #[serde(default)]
    pub(crate) categories: Vec<String>,
    pub(crate) date_from: Option<String>,
    pub(crate) date_to: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct DocumentsConfig {
    pub(crate) endpoint: String,
    pub(crate) auth_token: Option<String>,
    /// Run generation on a background worker with this queue size.
    pub(crate) queue_capacity: Option<usize>,
}

impl Config {
    /// Load `path`, or the defaults when no file is given, then apply env
    /// overrides.
    pub(crate) fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Config::default(),
        };
        config.apply_env(std::env::var(PORT_ENV).ok())?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(config)
    }

    fn apply_env(&mut self, port: Option<String>) -> Result<(), ConfigError> {
        if let Some(value) = port.filter(|v| !v.is_empty()) {
            self.server.port = value.parse().map_err(|_| ConfigError::Env {
                var: PORT_ENV,
                value,
            })?;
        }
        Ok(())
    }

    /// The configured pipeline, or the default one.
    pub(crate) fn stage_table(&self) -> Result<StageTable, ConfigError> {
        let table = if self.stages.is_empty() {
            StageTable::default_pipeline()
        } else {
            StageTable::new(self.stages.clone())?
        };
        Ok(match self.reentry_checkpoint {
            Some(cp) => table.with_reentry(cp)?,
            None => table,
        })
    }

    pub(crate) fn master_source(&self) -> Result<Arc<dyn MasterSource>, ConfigError> {
        let master: Arc<dyn MasterSource> = match &self.master {
            MasterConfig::Static { path: None } => Arc::new(StaticMaster::empty()),
            MasterConfig::Static { path: Some(path) } => {
                Arc::new(StaticMaster::from_json_file(&self.base_dir.join(path))?)
            }
            MasterConfig::Http {
                base_url,
                auth_token,
            } => Arc::new(HttpMaster::new(base_url, auth_token.clone())?),
        };
        Ok(master)
    }

    /// Default eligibility filter for `GET /shipments/eligible`.
    pub(crate) fn eligibility_filter(&self) -> Result<EligibilityFilter, ConfigError> {
        let e = &self.eligibility;
        Ok(EligibilityFilter {
            statuses: e.statuses.iter().cloned().collect(),
            categories: e.categories.iter().cloned().collect(),
            date_from: e
                .date_from
                .as_deref()
                .map(EligibilityFilter::parse_date)
                .transpose()?,
            date_to: e
                .date_to
                .as_deref()
                .map(EligibilityFilter::parse_date)
                .transpose()?,
        })
    }

    pub(crate) fn check_documents(&self) -> Result<(), ConfigError> {
        match &self.documents {
            Some(DocumentsConfig {
                queue_capacity: Some(0),
                ..
            }) => Err(ConfigError::QueueCapacity),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use custody_workflow::StageKind;

    fn parse(text: &str) -> Config {
        toml::from_str(text).unwrap()
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = parse("");
        assert_eq!(config.server.port, DEFAULT_PORT);
        assert!(matches!(config.master, MasterConfig::Static { path: None }));
        let table = config.stage_table().unwrap();
        assert_eq!(table.entry_checkpoint(), 2);
        assert_eq!(table.reentry_checkpoint(), None);
    }

    #[test]
    fn full_file_parses() {
        let config = parse(
            r#"
reentry_checkpoint = 5

[server]
port = 9100

[master]
kind = "http"
base_url = "http://erp.local/api"

[eligibility]
statuses = ["approved"]
date_from = "2025-01-01"

[documents]
endpoint = "http://docs.local/render"
queue_capacity = 8

[[stages]]
checkpoint = 2
kind = "pending"
from = "delivery"
acting = "hub"
next = 3

[[stages]]
checkpoint = 3
kind = "held"
from = "delivery"
acting = "hub"
next = 4

[[stages]]
checkpoint = 4
kind = "pending"
from = "hub"
acting = "driver"
next = 5
captures_assignment = true

[[stages]]
checkpoint = 5
kind = "held"
from = "hub"
acting = "driver"
"#,
        );
        assert_eq!(config.server.port, 9100);
        let table = config.stage_table().unwrap();
        assert_eq!(table.stages().count(), 4);
        assert_eq!(table.reentry_checkpoint(), Some(5));
        assert!(table.stage_for(4).unwrap().captures_assignment);
        assert_eq!(table.stage_for(5).unwrap().kind, StageKind::Held);

        let filter = config.eligibility_filter().unwrap();
        assert!(filter.statuses.contains("approved"));
        assert!(filter.date_from.is_some());
        assert_eq!(
            config.documents.as_ref().and_then(|d| d.queue_capacity),
            Some(8)
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<Config>("[server]\nhost = \"x\"\n").is_err());
    }

    #[test]
    fn broken_stage_table_is_reported() {
        let config = parse(
            r#"
[[stages]]
checkpoint = 2
kind = "pending"
from = "delivery"
acting = "hub"
next = 7
"#,
        );
        assert!(matches!(
            config.stage_table(),
            Err(ConfigError::Stages(StageTableError::UnknownNext { .. }))
        ));
    }

    #[test]
    fn port_env_overrides_file() {
        let mut config = parse("[server]\nport = 9100\n");
        config.apply_env(Some("9200".into())).unwrap();
        assert_eq!(config.server.port, 9200);
        assert!(config.apply_env(Some("nope".into())).is_err());
    }

    #[test]
    fn zero_queue_capacity_is_rejected() {
        let config = parse("[documents]\nendpoint = \"http://d\"\nqueue_capacity = 0\n");
        assert!(matches!(
            config.check_documents(),
            Err(ConfigError::QueueCapacity)
        ));
    }

    #[test]
    fn static_master_path_resolves_next_to_config() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("shipments.json"),
            r#"[{"external_ref":"SJ-1","status":"approved","document_date":"2025-01-10","category":"retail"}]"#,
        )
        .unwrap();
        let path = dir.path().join("custody.toml");
        std::fs::write(&path, "[master]\nkind = \"static\"\npath = \"shipments.json\"\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        let master = config.master_source().unwrap();
        assert_eq!(master.source_id(), "static");
    }
}
