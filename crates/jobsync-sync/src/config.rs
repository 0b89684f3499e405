use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use jobsync_source::MongoSourceConfig;
use jobsync_storage::{InvalidChoice, NullKeyPolicy, PgDestinationConfig};
use serde::Deserialize;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobSchedulerError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid number for {key}: {value:?}")]
    InvalidNumber { key: &'static str, value: String },
    #[error(transparent)]
    InvalidChoice(#[from] InvalidChoice),
    #[error("invalid schedule {cron:?}: {source}")]
    InvalidSchedule {
        cron: String,
        #[source]
        source: JobSchedulerError,
    },
}

/// Transaction scope for inserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommitPolicy {
    /// One transaction for the whole run, committed once at the end.
    #[default]
    SingleBatch,
    /// One transaction per inserted row; failing rows are recorded and skipped.
    PerRow,
}

impl FromStr for CommitPolicy {
    type Err = InvalidChoice;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single-batch" => Ok(Self::SingleBatch),
            "per-row" => Ok(Self::PerRow),
            _ => Err(InvalidChoice {
                what: "commit policy",
                value: s.to_string(),
                expected: "single-batch, per-row",
            }),
        }
    }
}

impl fmt::Display for CommitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::SingleBatch => "single-batch",
            Self::PerRow => "per-row",
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub source: MongoSourceConfig,
    #[serde(default)]
    pub destination: PgDestinationConfig,
    #[serde(default)]
    pub commit_policy: CommitPolicy,
    #[serde(default)]
    pub null_keys: NullKeyPolicy,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_schedule_cron")]
    pub schedule_cron: String,
}

fn default_schedule_cron() -> String {
    "0 0 * * * *".to_string()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            source: MongoSourceConfig::default(),
            destination: PgDestinationConfig::default(),
            commit_policy: CommitPolicy::default(),
            null_keys: NullKeyPolicy::default(),
            dry_run: false,
            schedule_cron: default_schedule_cron(),
        }
    }
}

impl SyncConfig {
    /// Build config from `JOBSYNC_*` environment variables (call `dotenvy::dotenv()` first).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`SyncConfig::from_env`], reading values through `lookup`.
    /// Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();
        let connect_timeout_secs = parse_opt::<u64>(&get, "JOBSYNC_CONNECT_TIMEOUT_SECS")?;

        let source = MongoSourceConfig {
            uri: get("JOBSYNC_MONGO_URI").unwrap_or(defaults.source.uri),
            database: get("JOBSYNC_MONGO_DATABASE").unwrap_or(defaults.source.database),
            collection: get("JOBSYNC_MONGO_COLLECTION").unwrap_or(defaults.source.collection),
            app_name: defaults.source.app_name,
            connect_timeout_secs,
        };

        let destination = PgDestinationConfig {
            host: get("JOBSYNC_PG_HOST").unwrap_or(defaults.destination.host),
            port: parse_opt::<u16>(&get, "JOBSYNC_PG_PORT")?.unwrap_or(defaults.destination.port),
            database: get("JOBSYNC_PG_DATABASE").unwrap_or(defaults.destination.database),
            username: get("JOBSYNC_PG_USER").unwrap_or(defaults.destination.username),
            password: get("JOBSYNC_PG_PASSWORD"),
            ssl_mode: get("JOBSYNC_PG_SSLMODE").unwrap_or(defaults.destination.ssl_mode),
            ssl_root_cert: get("JOBSYNC_PG_SSLROOTCERT").map(PathBuf::from),
            connect_timeout_secs,
        };

        let config = Self {
            source,
            destination,
            commit_policy: get("JOBSYNC_COMMIT_POLICY")
                .map(|v| v.parse::<CommitPolicy>())
                .transpose()?
                .unwrap_or_default(),
            null_keys: get("JOBSYNC_NULL_KEYS")
                .map(|v| v.parse::<NullKeyPolicy>())
                .transpose()?
                .unwrap_or_default(),
            dry_run: false,
            schedule_cron: get("JOBSYNC_SCHEDULE_CRON").unwrap_or(defaults.schedule_cron),
        };
        config.validate()?;
        Ok(config)
    }

    /// Loads a YAML config file. A missing destination password falls back to
    /// `JOBSYNC_PG_PASSWORD` so the file can be committed without secrets.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        Self::from_yaml_file_with(path, |key| std::env::var(key).ok())
    }

    pub fn from_yaml_file_with<F>(path: &Path, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        if config.destination.password.is_none() {
            config.destination.password =
                lookup("JOBSYNC_PG_PASSWORD").filter(|v| !v.is_empty());
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.destination.ssl_mode()?;
        // Parsed by the scheduler's own cron parser; the job is discarded.
        Job::new(self.schedule_cron.as_str(), |_, _| {}).map_err(|source| {
            ConfigError::InvalidSchedule {
                cron: self.schedule_cron.clone(),
                source,
            }
        })?;
        Ok(())
    }
}

fn parse_opt<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    get(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidNumber { key, value })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_environment_is_empty() {
        let config = SyncConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.source.uri, "mongodb://localhost:27017");
        assert_eq!(config.source.collection, "jobs");
        assert_eq!(config.destination.port, 26257);
        assert_eq!(config.destination.ssl_mode, "verify-full");
        assert_eq!(config.destination.password, None);
        assert_eq!(config.commit_policy, CommitPolicy::SingleBatch);
        assert_eq!(config.null_keys, NullKeyPolicy::NullSafe);
        assert_eq!(config.source.connect_timeout_secs, None);
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("JOBSYNC_MONGO_URI", "mongodb+srv://u:p@cluster0.example.net/"),
            ("JOBSYNC_MONGO_DATABASE", "try"),
            ("JOBSYNC_PG_HOST", "db.internal"),
            ("JOBSYNC_PG_PORT", "5432"),
            ("JOBSYNC_PG_PASSWORD", "pw"),
            ("JOBSYNC_PG_SSLROOTCERT", "/etc/ssl/root.crt"),
            ("JOBSYNC_CONNECT_TIMEOUT_SECS", "10"),
            ("JOBSYNC_COMMIT_POLICY", "per-row"),
            ("JOBSYNC_NULL_KEYS", "strict"),
        ]))
        .unwrap();
        assert_eq!(config.source.database, "try");
        assert_eq!(config.destination.host, "db.internal");
        assert_eq!(config.destination.port, 5432);
        assert_eq!(config.destination.password.as_deref(), Some("pw"));
        assert_eq!(
            config.destination.ssl_root_cert,
            Some(PathBuf::from("/etc/ssl/root.crt"))
        );
        assert_eq!(config.source.connect_timeout_secs, Some(10));
        assert_eq!(config.destination.connect_timeout_secs, Some(10));
        assert_eq!(config.commit_policy, CommitPolicy::PerRow);
        assert_eq!(config.null_keys, NullKeyPolicy::Strict);
    }

    #[test]
    fn empty_values_count_as_unset() {
        let config = SyncConfig::from_lookup(lookup(&[("JOBSYNC_PG_HOST", "  ")])).unwrap();
        assert_eq!(config.destination.host, "localhost");
    }

    #[test]
    fn malformed_port_is_rejected() {
        let err = SyncConfig::from_lookup(lookup(&[("JOBSYNC_PG_PORT", "eighty")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidNumber { key: "JOBSYNC_PG_PORT", .. }
        ));
    }

    #[test]
    fn unknown_policy_is_rejected() {
        let err =
            SyncConfig::from_lookup(lookup(&[("JOBSYNC_COMMIT_POLICY", "sometimes")])).unwrap_err();
        assert!(err.to_string().contains("single-batch, per-row"));
    }

    #[test]
    fn unknown_ssl_mode_is_rejected() {
        let err = SyncConfig::from_lookup(lookup(&[("JOBSYNC_PG_SSLMODE", "maybe")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidChoice(_)));
    }

    #[test]
    fn malformed_cron_is_a_config_error() {
        let err = SyncConfig::from_lookup(lookup(&[("JOBSYNC_SCHEDULE_CRON", "every hour")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSchedule { .. }), "{err}");
        assert!(err.to_string().contains("every hour"));

        let ok = SyncConfig::from_lookup(lookup(&[("JOBSYNC_SCHEDULE_CRON", "0 */15 * * * *")]));
        assert_eq!(ok.unwrap().schedule_cron, "0 */15 * * * *");
    }

    #[test]
    fn yaml_file_loads_with_password_fallback() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(
            file,
            r#"
source:
  uri: "mongodb://mongo:27017"
  database: try
destination:
  host: cockroach
  username: jobsync
  ssl_mode: require
commit_policy: per-row
null_keys: strict
"#
        )
        .expect("write yaml");

        let env = lookup(&[("JOBSYNC_PG_PASSWORD", "s3cret")]);
        let config = SyncConfig::from_yaml_file_with(file.path(), env).unwrap();
        assert_eq!(config.source.uri, "mongodb://mongo:27017");
        assert_eq!(config.source.collection, "jobs");
        assert_eq!(config.destination.host, "cockroach");
        assert_eq!(config.destination.port, 26257);
        assert_eq!(config.destination.password.as_deref(), Some("s3cret"));
        assert_eq!(config.commit_policy, CommitPolicy::PerRow);
        assert_eq!(config.null_keys, NullKeyPolicy::Strict);
        assert_eq!(config.schedule_cron, "0 0 * * * *");
    }

    #[test]
    fn missing_yaml_file_reports_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("absent.yaml");
        let err = SyncConfig::from_yaml_file_with(&path, lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains("absent.yaml"));
    }
}
