use crate::errdefs::ServiceError;
use flint::fingerprint;
use serde_derive::{Deserialize, Serialize};
use std::path::Path;

// Replaced by the release pipeline.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const BUILD_TIME: &str = match option_env!("SCRYD_BUILD_TIME") {
    Some(v) => v,
    None => "unknown",
};
pub const GIT_COMMIT: &str = match option_env!("SCRYD_GIT_COMMIT") {
    Some(v) => v,
    None => "unknown",
};

/// Runtime configuration, loaded from a TOML file named by the `-conf`
/// flag.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Listen address, `<ip_or_domain>:<port>`.
    pub address: String,
    /// Deployment mode, forwarded to the backend drivers as their log
    /// policy: one of release, test, debug.
    #[serde(default = "default_mode")]
    pub mode: String,
    /// Maximum log level of the daemon itself.
    #[serde(default = "default_log_level")]
    pub max_log_level: String,
    /// Whether to serve the bundled web client under /static.
    #[serde(default)]
    pub client: bool,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
    #[serde(default = "default_jwt_alg")]
    pub jwt_alg: String,
}

fn default_mode() -> String {
    "release".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_jwt_alg() -> String {
    "HS256".to_string()
}

impl Config {
    /// Reads and validates the configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, ServiceError> {
        let config: Config = serdeconv::from_toml_file(path)
            .map_err(|e| ServiceError::Config(e.to_string()))?;
        if config.address.is_empty() {
            return Err(ServiceError::Config("address must not be empty".into()));
        }
        if config.auth.jwt_secret.is_empty() {
            return Err(ServiceError::Config("auth.jwt_secret must not be empty".into()));
        }
        Ok(config)
    }
}

/// The credential quadruple carried inside a signed token. One set of
/// credentials maps to exactly one shared backend session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub protocol: String,
    pub host: String,
    #[serde(default)]
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// The shared-session key for these credentials.
    pub fn fingerprint(&self) -> String {
        fingerprint::fingerprint(&self.protocol, &self.host, &self.username, &self.password)
    }

    /// Splits `host` into its host and port parts.
    pub fn host_port(&self) -> Result<(String, String), ServiceError> {
        match self.host.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && !port.is_empty() => {
                Ok((host.to_string(), port.to_string()))
            }
            _ => Err(ServiceError::Handshake(format!(
                "host {:?} is missing a port",
                self.host
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_full_config() {
        let mut file = tempfile_path("scryd-config-full");
        write!(
            file.1,
            r#"
address = "0.0.0.0:5636"
mode = "debug"
max_log_level = "debug"
client = true

[auth]
jwt_secret = "swordfish"
jwt_alg = "HS512"
"#
        )
        .unwrap();

        let config = Config::load(&file.0).unwrap();
        assert_eq!(config.address, "0.0.0.0:5636");
        assert_eq!(config.mode, "debug");
        assert!(config.client);
        assert_eq!(config.auth.jwt_alg, "HS512");
        std::fs::remove_file(&file.0).unwrap();
    }

    #[test]
    fn test_load_defaults() {
        let mut file = tempfile_path("scryd-config-min");
        write!(
            file.1,
            r#"
address = "127.0.0.1:5636"

[auth]
jwt_secret = "secret"
"#
        )
        .unwrap();

        let config = Config::load(&file.0).unwrap();
        assert_eq!(config.mode, "release");
        assert_eq!(config.max_log_level, "info");
        assert_eq!(config.auth.jwt_alg, "HS256");
        assert!(!config.client);
        std::fs::remove_file(&file.0).unwrap();
    }

    #[test]
    fn test_missing_secret_is_rejected() {
        let mut file = tempfile_path("scryd-config-bad");
        write!(
            file.1,
            r#"
address = "127.0.0.1:5636"

[auth]
jwt_secret = ""
"#
        )
        .unwrap();
        assert!(Config::load(&file.0).is_err());
        std::fs::remove_file(&file.0).unwrap();
    }

    #[test]
    fn test_host_port_split() {
        let creds = Credentials {
            protocol: "vnc".into(),
            host: "10.0.0.1:5901".into(),
            username: "".into(),
            password: "pw".into(),
        };
        assert_eq!(creds.host_port().unwrap(), ("10.0.0.1".into(), "5901".into()));

        let creds = Credentials { host: "nohost".into(), ..creds };
        assert!(creds.host_port().is_err());
    }

    #[test]
    fn test_fingerprint_matches_shared_key() {
        let creds = Credentials {
            protocol: "vnc".into(),
            host: "0.0.0.0:5636".into(),
            username: "occamy".into(),
            password: "occamy".into(),
        };
        assert_eq!(creds.fingerprint(), "d742d2c10082f08506028cfb09cd1674");
    }

    fn tempfile_path(name: &str) -> (std::path::PathBuf, std::fs::File) {
        let path = std::env::temp_dir().join(format!("{}-{}.toml", name, std::process::id()));
        let file = std::fs::File::create(&path).unwrap();
        (path, file)
    }
}
