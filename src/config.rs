use std::path::PathBuf;
use std::str::FromStr;

/// Server settings, read once at start-up from `PADDOCK_*` environment variables.
/// Unset or unparsable values fall back to their defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    /// Seeded as an ADMIN user in every new tenant so someone can log in.
    pub admin_email: Option<String>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "paddock".into(),
            max_connections: 256,
            compact_threshold: 1000,
            admin_email: None,
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|s| !s.trim().is_empty());

        Self {
            port: parsed(&lookup, "PADDOCK_PORT").unwrap_or(defaults.port),
            bind: non_empty("PADDOCK_BIND").unwrap_or(defaults.bind),
            data_dir: non_empty("PADDOCK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            password: lookup("PADDOCK_PASSWORD").unwrap_or(defaults.password),
            max_connections: parsed(&lookup, "PADDOCK_MAX_CONNECTIONS").unwrap_or(defaults.max_connections),
            compact_threshold: parsed(&lookup, "PADDOCK_COMPACT_THRESHOLD").unwrap_or(defaults.compact_threshold),
            admin_email: non_empty("PADDOCK_ADMIN_EMAIL"),
            tls_cert: non_empty("PADDOCK_TLS_CERT"),
            tls_key: non_empty("PADDOCK_TLS_KEY"),
            metrics_port: parsed(&lookup, "PADDOCK_METRICS_PORT"),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}
