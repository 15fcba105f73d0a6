use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use quark::time::parse_duration;

pub const DEFAULT_PORT: u16 = 33333;

/// Daemon configuration. Loadable from a TOML file and overridable with
/// `key=value` command-line arguments.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Desired discovery tree fanout.
    pub fanout: u64,
    /// Allow child applications to run as the superuser.
    pub allow_root: bool,
    /// Listening port on every served interface.
    pub port: u16,
    /// Interfaces to serve, as `address/prefix` strings.
    pub interfaces: Vec<String>,
    pub connection_timeout: String,
    pub max_connection_attempts: u32,
    pub network_scan_interval: String,
    pub network_interface_update_interval: String,
    pub transactions_directory: PathBuf,
    /// Worker threads; 0 means one per hardware CPU.
    pub num_threads: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            fanout: 2,
            allow_root: false,
            port: DEFAULT_PORT,
            interfaces: Vec::new(),
            connection_timeout: "7s".into(),
            max_connection_attempts: 1,
            network_scan_interval: "1m".into(),
            network_interface_update_interval: "1m".into(),
            transactions_directory: PathBuf::from("."),
            num_threads: 0,
            log_level: "info".into(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, String> {
        serdeconv::from_toml_file(path.as_ref())
            .map_err(|err| format!("Error loading configuration: {}", err))
    }

    /// Apply one `key=value` command-line override.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<(), String> {
        match key {
            "fanout" => {
                self.fanout = value
                    .parse()
                    .ok()
                    .filter(|fanout| *fanout >= 1)
                    .ok_or_else(|| format!("bad fanout: {}", value))?
            }
            "allow-root" => {
                self.allow_root = parse_bool(value).ok_or_else(|| format!("bad flag: {}", value))?
            }
            "port" => self.port = value.parse().map_err(|_| format!("bad port: {}", value))?,
            "interface" => self.interfaces.push(value.to_string()),
            "connection-timeout" => self.connection_timeout = value.to_string(),
            "max-connection-attempts" => {
                self.max_connection_attempts = value
                    .parse()
                    .map_err(|_| format!("bad attempt count: {}", value))?
            }
            "network-scan-interval" => self.network_scan_interval = value.to_string(),
            "network-interface-update-interval" => {
                self.network_interface_update_interval = value.to_string()
            }
            "transactions-directory" => self.transactions_directory = PathBuf::from(value),
            "num-threads" => {
                self.num_threads = value
                    .parse()
                    .map_err(|_| format!("bad thread count: {}", value))?
            }
            "log-level" => self.log_level = value.to_string(),
            _ => return Err(format!("unknown option: {}", key)),
        }
        Ok(())
    }

    pub fn connection_timeout(&self) -> Duration {
        parse_duration(&self.connection_timeout).unwrap_or(Duration::from_secs(7))
    }

    pub fn network_scan_interval(&self) -> Duration {
        parse_duration(&self.network_scan_interval).unwrap_or(Duration::from_secs(60))
    }

    pub fn network_interface_update_interval(&self) -> Duration {
        parse_duration(&self.network_interface_update_interval).unwrap_or(Duration::from_secs(60))
    }

    pub fn socket_path(&self) -> PathBuf {
        self.transactions_directory.join("gravitond.sock")
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

/// Parse `key=value` arguments, handling `config=<path>` first so explicit
/// overrides win over the file.
pub fn from_args<I: Iterator<Item = String>>(args: I) -> Result<Config, String> {
    let pairs: Vec<(String, String)> = args
        .map(|arg| {
            let mut parts = arg.splitn(2, '=');
            let key = parts.next().unwrap_or_default().to_string();
            let value = parts.next().map(str::to_string);
            match value {
                Some(value) => Ok((key, value)),
                None => Err(format!("expected key=value, got: {}", arg)),
            }
        })
        .collect::<Result<_, String>>()?;

    let mut config = Config::default();
    for (key, value) in &pairs {
        if key == "config" {
            config = Config::load(value)?;
        }
    }
    for (key, value) in &pairs {
        if key == "config" {
            continue;
        }
        config.apply(key, value)?;
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.fanout, 2);
        assert!(!config.allow_root);
        assert_eq!(config.connection_timeout(), Duration::from_secs(7));
    }

    #[test]
    fn test_from_args() {
        let args = [
            "fanout=3",
            "allow-root=1",
            "connection-timeout=1s",
            "max-connection-attempts=10",
            "network-scan-interval=5s",
            "network-interface-update-interval=1h",
            "transactions-directory=/var/lib/gravitond",
            "interface=10.0.0.1/16",
        ];
        let config = from_args(args.iter().map(|s| s.to_string())).unwrap();
        assert_eq!(config.fanout, 3);
        assert!(config.allow_root);
        assert_eq!(config.connection_timeout(), Duration::from_secs(1));
        assert_eq!(config.max_connection_attempts, 10);
        assert_eq!(config.network_scan_interval(), Duration::from_secs(5));
        assert_eq!(
            config.network_interface_update_interval(),
            Duration::from_secs(3600)
        );
        assert_eq!(
            config.transactions_directory,
            PathBuf::from("/var/lib/gravitond")
        );
        assert_eq!(config.interfaces, vec!["10.0.0.1/16".to_string()]);
    }

    #[test]
    fn test_bad_args_are_rejected() {
        assert!(from_args(["fanout=0".to_string()].into_iter()).is_err());
        assert!(from_args(["nonsense".to_string()].into_iter()).is_err());
        assert!(from_args(["what=ever".to_string()].into_iter()).is_err());
    }
}
