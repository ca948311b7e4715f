//! Provides the CLI option parsers
//!
//! Used to parse argv, an optional TOML config file and the environment into
//! the structs the agent and the server consume. A key set in the
//! environment wins over the same key given as a flag, which wins over the
//! config file, which wins over the default.
use crate::retry::Policy;
use crate::security::Subnet;
use crate::time::parse_interval;
use clap::{App, Arg, ArgMatches};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::str::FromStr;
use std::time::Duration;

const VERSION: Option<&'static str> = option_env!("CARGO_PKG_VERSION");

/// Why a configuration could not be built.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("could not read config file {path}: {source}")]
    Read {
        /// Path given with `--config`.
        path: String,
        /// Underlying failure.
        source: io::Error,
    },
    /// The config file is not valid TOML.
    #[error("could not parse config file: {0}")]
    Toml(#[from] toml::de::Error),
    /// A key holds a value of the wrong shape.
    #[error("invalid value for {key}: {reason}")]
    Invalid {
        /// Offending key.
        key: &'static str,
        /// What was wrong with it.
        reason: String,
    },
}

fn invalid<R: fmt::Display>(key: &'static str, reason: R) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.to_string(),
    }
}

/// How the agent talks to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// JSON over HTTP.
    Http,
    /// Framed RPC over TCP.
    Rpc,
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Transport, String> {
        match s {
            "http" => Ok(Transport::Http),
            "rpc" | "grpc" => Ok(Transport::Rpc),
            other => Err(format!("unknown transport {:?}, expected http or rpc", other)),
        }
    }
}

/// Values given on the command line or in the environment, keyed by config
/// key.
pub type Overrides = BTreeMap<&'static str, String>;

enum Raw<'a> {
    Text(&'a str),
    Toml(&'a toml::Value),
}

/// One key looked up through every layer.
struct Layers<'a> {
    file: toml::value::Table,
    flags: &'a Overrides,
    env: &'a Overrides,
}

impl<'a> Layers<'a> {
    fn new(file: &str, flags: &'a Overrides, env: &'a Overrides) -> Result<Layers<'a>, ConfigError> {
        let file = if file.trim().is_empty() {
            toml::value::Table::new()
        } else {
            toml::from_str(file)?
        };
        Ok(Layers { file, flags, env })
    }

    fn raw(&self, key: &'static str) -> Option<Raw> {
        if let Some(v) = self.env.get(key) {
            return Some(Raw::Text(v));
        }
        if let Some(v) = self.flags.get(key) {
            return Some(Raw::Text(v));
        }
        self.file.get(key).map(Raw::Toml)
    }

    /// Empty strings count as unset.
    fn string(&self, key: &'static str) -> Result<Option<String>, ConfigError> {
        let s = match self.raw(key) {
            None => return Ok(None),
            Some(Raw::Text(s)) => s.to_string(),
            Some(Raw::Toml(toml::Value::String(s))) => s.clone(),
            Some(Raw::Toml(other)) => return Err(invalid(key, format!("expected a string, found {}", other.type_str()))),
        };
        Ok(if s.is_empty() { None } else { Some(s) })
    }

    fn string_or(&self, key: &'static str, default: &str) -> Result<String, ConfigError> {
        Ok(self.string(key)?.unwrap_or_else(|| default.to_string()))
    }

    fn interval(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        match self.raw(key) {
            None => Ok(default),
            Some(Raw::Text(s)) => parse_interval(s).ok_or_else(|| invalid(key, format!("{:?} is not an interval", s))),
            Some(Raw::Toml(toml::Value::String(s))) => {
                parse_interval(s).ok_or_else(|| invalid(key, format!("{:?} is not an interval", s)))
            }
            Some(Raw::Toml(toml::Value::Integer(n))) if *n >= 0 => Ok(Duration::from_secs(*n as u64)),
            Some(Raw::Toml(other)) => Err(invalid(key, format!("{} is not an interval", other))),
        }
    }

    fn integer(&self, key: &'static str, default: u64) -> Result<u64, ConfigError> {
        match self.raw(key) {
            None => Ok(default),
            Some(Raw::Text(s)) => s.trim().parse().map_err(|_| invalid(key, format!("{:?} is not a count", s))),
            Some(Raw::Toml(toml::Value::Integer(n))) if *n >= 0 => Ok(*n as u64),
            Some(Raw::Toml(other)) => Err(invalid(key, format!("{} is not a count", other))),
        }
    }

    fn boolean(&self, key: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.raw(key) {
            None => Ok(default),
            Some(Raw::Text(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(true),
                "false" | "0" | "no" => Ok(false),
                _ => Err(invalid(key, format!("{:?} is not a boolean", s))),
            },
            Some(Raw::Toml(toml::Value::Boolean(b))) => Ok(*b),
            Some(Raw::Toml(other)) => Err(invalid(key, format!("{} is not a boolean", other))),
        }
    }

    fn parsed<T>(&self, key: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.string(key)? {
            None => Ok(None),
            Some(s) => s.parse().map(Some).map_err(|e| invalid(key, e)),
        }
    }

    /// `-v` flags win; otherwise `log_level` from the file.
    fn verbose(&self, flagged: u64) -> Result<u64, ConfigError> {
        if flagged > 0 {
            return Ok(flagged);
        }
        match self.string("log_level")?.as_ref().map(|s| s.to_ascii_lowercase()) {
            None => Ok(0),
            Some(level) => match level.as_str() {
                "error" => Ok(0),
                "warn" => Ok(1),
                "info" => Ok(2),
                "debug" => Ok(3),
                "trace" => Ok(4),
                other => Err(invalid("log_level", format!("unknown level {:?}", other))),
            },
        }
    }
}

/// Configuration for `metrika-agent`.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Server address, `host:port` or a URL.
    pub address: String,
    /// How often the accumulator is shipped.
    pub report_interval: Duration,
    /// How often the sampler runs.
    pub poll_interval: Duration,
    /// HMAC key. Requests are signed when set.
    pub key: Option<String>,
    /// Number of delivery workers.
    pub rate_limit: usize,
    /// Path of the server's public key. Bodies are encrypted when set.
    pub crypto_key: Option<String>,
    /// Wire protocol.
    pub transport: Transport,
    /// Delivery retry policy.
    pub retry: Policy,
    /// Address advertised in `X-Real-IP`; detected when unset.
    pub local_ip: Option<String>,
    /// How long shutdown waits for queued batches.
    pub shutdown_grace: Duration,
    /// Log verbosity, see `logging::level`.
    pub verbose: u64,
}

impl Default for AgentConfig {
    fn default() -> AgentConfig {
        AgentConfig {
            address: "localhost:8080".to_string(),
            report_interval: Duration::from_secs(10),
            poll_interval: Duration::from_secs(2),
            key: None,
            rate_limit: 1,
            crypto_key: None,
            transport: Transport::Http,
            retry: Policy::default(),
            local_ip: None,
            shutdown_grace: Duration::from_secs(5),
            verbose: 0,
        }
    }
}

impl AgentConfig {
    /// Resolve every key through `env`, then `flags`, then the TOML text
    /// `file`, then the default.
    pub fn from_layers(file: &str, flags: &Overrides, env: &Overrides, verbose: u64) -> Result<AgentConfig, ConfigError> {
        let layers = Layers::new(file, flags, env)?;
        let d = AgentConfig::default();
        let rate_limit = layers.integer("rate_limit", d.rate_limit as u64)?;
        if rate_limit == 0 {
            return Err(invalid("rate_limit", "must be at least 1"));
        }
        let max_attempts = layers.integer("max_attempts", u64::from(d.retry.max_attempts))?;
        if max_attempts == 0 || max_attempts > u64::from(u32::MAX) {
            return Err(invalid("max_attempts", "must be between 1 and 2^32-1"));
        }
        let retry_unit_ms = layers.integer("retry_unit_ms", d.retry.unit.as_millis() as u64)?;
        let poll_interval = layers.interval("poll_interval", d.poll_interval)?;
        let report_interval = layers.interval("report_interval", d.report_interval)?;
        if poll_interval == Duration::from_secs(0) || report_interval == Duration::from_secs(0) {
            return Err(invalid("poll_interval", "intervals must be positive"));
        }
        Ok(AgentConfig {
            address: layers.string_or("address", &d.address)?,
            report_interval,
            poll_interval,
            key: layers.string("key")?,
            rate_limit: rate_limit as usize,
            crypto_key: layers.string("crypto_key")?,
            transport: layers.parsed("transport")?.unwrap_or(d.transport),
            retry: Policy {
                max_attempts: max_attempts as u32,
                unit: Duration::from_millis(retry_unit_ms),
            },
            local_ip: layers.string("local_ip")?,
            shutdown_grace: layers.interval("shutdown_grace", d.shutdown_grace)?,
            verbose: layers.verbose(verbose)?,
        })
    }
}

/// Configuration for `metrika-server`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP listen address.
    pub address: String,
    /// RPC listen address. No RPC listener when unset.
    pub rpc_address: Option<String>,
    /// Snapshot period. Zero makes every write synchronous.
    pub store_interval: Duration,
    /// Snapshot file.
    pub file_storage_path: String,
    /// Load the snapshot at start-up.
    pub restore: bool,
    /// SQLite database. The memory backend is used when unset.
    pub database_dsn: Option<String>,
    /// HMAC key for verifying requests and signing responses.
    pub key: Option<String>,
    /// Path of the private key. Bodies are decrypted when set.
    pub crypto_key: Option<String>,
    /// Only requests from this subnet are accepted.
    pub trusted_subnet: Option<Subnet>,
    /// Log verbosity, see `logging::level`.
    pub verbose: u64,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            address: "localhost:8080".to_string(),
            rpc_address: None,
            store_interval: Duration::from_secs(300),
            file_storage_path: "/tmp/metrics-db.json".to_string(),
            restore: true,
            database_dsn: None,
            key: None,
            crypto_key: None,
            trusted_subnet: None,
            verbose: 0,
        }
    }
}

impl ServerConfig {
    /// Resolve every key through `env`, then `flags`, then the TOML text
    /// `file`, then the default.
    pub fn from_layers(file: &str, flags: &Overrides, env: &Overrides, verbose: u64) -> Result<ServerConfig, ConfigError> {
        let layers = Layers::new(file, flags, env)?;
        let d = ServerConfig::default();
        Ok(ServerConfig {
            address: layers.string_or("address", &d.address)?,
            rpc_address: layers.string("rpc_address")?,
            store_interval: layers.interval("store_interval", d.store_interval)?,
            file_storage_path: layers.string_or("file_storage_path", &d.file_storage_path)?,
            restore: layers.boolean("restore", d.restore)?,
            database_dsn: layers.string("database_dsn")?,
            key: layers.string("key")?,
            crypto_key: layers.string("crypto_key")?,
            trusted_subnet: layers.parsed("trusted_subnet")?,
            verbose: layers.verbose(verbose)?,
        })
    }
}

const AGENT_KEYS: &[&str] = &[
    "address",
    "report_interval",
    "poll_interval",
    "key",
    "rate_limit",
    "crypto_key",
    "transport",
    "max_attempts",
    "retry_unit_ms",
    "local_ip",
    "shutdown_grace",
];

const SERVER_KEYS: &[&str] = &[
    "address",
    "rpc_address",
    "store_interval",
    "file_storage_path",
    "restore",
    "database_dsn",
    "key",
    "crypto_key",
    "trusted_subnet",
];

fn valued(name: &'static str, short: Option<&'static str>, help: &'static str) -> Arg<'static, 'static> {
    let arg = Arg::with_name(name)
        .long(name)
        .value_name(name)
        .takes_value(true)
        .help(help);
    match short {
        Some(s) => arg.short(s),
        None => arg,
    }
}

fn common(app: App<'static, 'static>) -> App<'static, 'static> {
    app.version(VERSION.unwrap_or("unknown"))
        .arg(
            Arg::with_name("config-file")
                .long("config")
                .short("C")
                .value_name("config")
                .help("A TOML config file to feed in.")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .multiple(true)
                .help("Turn on verbose output."),
        )
}

/// Read every key in `keys` from the process environment, upper-cased.
pub fn env_overrides(keys: &[&'static str]) -> Overrides {
    keys.iter()
        .filter_map(|k| std::env::var(k.to_ascii_uppercase()).ok().map(|v| (*k, v)))
        .collect()
}

fn flag_overrides(matches: &ArgMatches, keys: &[&'static str]) -> Overrides {
    keys.iter()
        .filter_map(|k| matches.value_of(k).map(|v| (*k, v.to_string())))
        .collect()
}

fn read_file(matches: &ArgMatches) -> Result<String, ConfigError> {
    match matches.value_of("config-file") {
        None => Ok(String::new()),
        Some(path) => fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        }),
    }
}

/// Parse the agent's command line and environment.
pub fn parse_agent_args() -> Result<AgentConfig, ConfigError> {
    let matches = common(App::new("metrika-agent"))
        .about("samples runtime metrics and ships them to a metrika server")
        .arg(valued("address", Some("a"), "Server address."))
        .arg(valued("report_interval", Some("r"), "Seconds between reports."))
        .arg(valued("poll_interval", Some("p"), "Seconds between samples."))
        .arg(valued("key", Some("k"), "HMAC key for signing requests."))
        .arg(valued("rate_limit", Some("l"), "Concurrent outgoing requests."))
        .arg(valued("crypto_key", None, "Path to the server's public key.").long("crypto-key"))
        .arg(valued("transport", Some("t"), "http or rpc."))
        .get_matches();
    let flags = flag_overrides(&matches, AGENT_KEYS);
    AgentConfig::from_layers(
        &read_file(&matches)?,
        &flags,
        &env_overrides(AGENT_KEYS),
        matches.occurrences_of("verbose"),
    )
}

/// Parse the server's command line and environment.
pub fn parse_server_args() -> Result<ServerConfig, ConfigError> {
    let matches = common(App::new("metrika-server"))
        .about("collects runtime metrics from metrika agents")
        .arg(valued("address", Some("a"), "HTTP listen address."))
        .arg(valued("rpc_address", Some("g"), "RPC listen address."))
        .arg(valued("store_interval", Some("i"), "Seconds between snapshots, 0 for synchronous."))
        .arg(valued("file_storage_path", Some("f"), "Snapshot file."))
        .arg(valued("restore", Some("r"), "Load the snapshot at start-up."))
        .arg(valued("database_dsn", Some("d"), "SQLite database path."))
        .arg(valued("key", Some("k"), "HMAC key for verifying requests."))
        .arg(valued("crypto_key", None, "Path to the private key.").long("crypto-key"))
        .arg(valued("trusted_subnet", Some("t"), "CIDR of trusted agents."))
        .get_matches();
    let flags = flag_overrides(&matches, SERVER_KEYS);
    ServerConfig::from_layers(
        &read_file(&matches)?,
        &flags,
        &env_overrides(SERVER_KEYS),
        matches.occurrences_of("verbose"),
    )
}

#[cfg(test)]
mod test {
    use super::*;

    fn overrides(pairs: &[(&'static str, &str)]) -> Overrides {
        pairs.iter().map(|(k, v)| (*k, v.to_string())).collect()
    }

    #[test]
    fn test_agent_defaults() {
        let none = Overrides::new();
        let config = AgentConfig::from_layers("", &none, &none, 0).unwrap();
        assert_eq!(config.address, "localhost:8080");
        assert_eq!(config.report_interval, Duration::from_secs(10));
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.rate_limit, 1);
        assert_eq!(config.transport, Transport::Http);
        assert_eq!(config.retry, Policy::default());
        assert!(config.key.is_none());
        assert!(config.crypto_key.is_none());
    }

    #[test]
    fn test_agent_precedence() {
        let file = r#"
address = "file:1"
report_interval = "1m"
poll_interval = 5
rate_limit = 4
transport = "rpc"
max_attempts = 5
retry_unit_ms = 10
log_level = "debug"
"#;
        let flags = overrides(&[("address", "flag:2"), ("poll_interval", "7")]);
        let env = overrides(&[("address", "env:3")]);
        let config = AgentConfig::from_layers(file, &flags, &env, 0).unwrap();
        assert_eq!(config.address, "env:3");
        assert_eq!(config.poll_interval, Duration::from_secs(7));
        assert_eq!(config.report_interval, Duration::from_secs(60));
        assert_eq!(config.rate_limit, 4);
        assert_eq!(config.transport, Transport::Rpc);
        assert_eq!(
            config.retry,
            Policy {
                max_attempts: 5,
                unit: Duration::from_millis(10)
            }
        );
        assert_eq!(config.verbose, 3);

        let config = AgentConfig::from_layers(file, &flags, &Overrides::new(), 2).unwrap();
        assert_eq!(config.address, "flag:2");
        assert_eq!(config.verbose, 2);
    }

    #[test]
    fn test_agent_rejects_bad_values() {
        let none = Overrides::new();
        assert!(AgentConfig::from_layers("rate_limit = 0", &none, &none, 0).is_err());
        assert!(AgentConfig::from_layers("poll_interval = \"soon\"", &none, &none, 0).is_err());
        assert!(AgentConfig::from_layers("poll_interval = 0", &none, &none, 0).is_err());
        assert!(AgentConfig::from_layers("transport = \"carrier-pigeon\"", &none, &none, 0).is_err());
        assert!(AgentConfig::from_layers("address = 8080", &none, &none, 0).is_err());
        assert!(AgentConfig::from_layers("address = ", &none, &none, 0).is_err());
        let env = overrides(&[("rate_limit", "many")]);
        assert!(AgentConfig::from_layers("", &none, &env, 0).is_err());
    }

    #[test]
    fn test_server_defaults() {
        let none = Overrides::new();
        let config = ServerConfig::from_layers("", &none, &none, 0).unwrap();
        assert_eq!(config.address, "localhost:8080");
        assert_eq!(config.store_interval, Duration::from_secs(300));
        assert_eq!(config.file_storage_path, "/tmp/metrics-db.json");
        assert!(config.restore);
        assert!(config.database_dsn.is_none());
        assert!(config.rpc_address.is_none());
        assert!(config.trusted_subnet.is_none());
    }

    #[test]
    fn test_server_layers() {
        let file = r#"
store_interval = 0
restore = false
database_dsn = "/var/lib/metrika.sqlite"
trusted_subnet = "10.0.0.0/8"
"#;
        let flags = overrides(&[("rpc_address", "127.0.0.1:3200"), ("restore", "true")]);
        let env = overrides(&[("database_dsn", "")]);
        let config = ServerConfig::from_layers(file, &flags, &env, 0).unwrap();
        assert_eq!(config.store_interval, Duration::from_secs(0));
        assert!(config.restore);
        assert!(config.database_dsn.is_none());
        assert_eq!(config.rpc_address.as_deref(), Some("127.0.0.1:3200"));
        assert_eq!(config.trusted_subnet, Some("10.0.0.0/8".parse().unwrap()));
    }

    #[test]
    fn test_server_rejects_bad_values() {
        let none = Overrides::new();
        assert!(ServerConfig::from_layers("restore = \"maybe\"", &none, &none, 0).is_err());
        assert!(ServerConfig::from_layers("trusted_subnet = \"10.0.0.0/40\"", &none, &none, 0).is_err());
        assert!(ServerConfig::from_layers("store_interval = -1", &none, &none, 0).is_err());
        assert!(ServerConfig::from_layers("log_level = \"loud\"", &none, &none, 0).is_err());
    }

    #[test]
    fn test_transport_names() {
        assert_eq!("http".parse::<Transport>(), Ok(Transport::Http));
        assert_eq!("rpc".parse::<Transport>(), Ok(Transport::Rpc));
        assert!("udp".parse::<Transport>().is_err());
    }
}
