use std::collections::HashMap;

use serde::Deserialize;

/// Top-level TOML configuration. Field names mirror the on-disk TOML keys
/// (mixed case, matching the original deployment's config files) while the
/// Rust-side identifiers stay snake_case.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(rename = "cacheDir")]
    pub cache_dir: String,

    #[serde(rename = "TLSCertsDir", default)]
    pub tls_certs_dir: String,

    #[serde(rename = "DBFilename")]
    pub db_filename: String,

    #[serde(rename = "serverAddr", default = "default_server_addr")]
    pub server_addr: String,

    #[serde(default)]
    pub hosts: HashMap<String, Host>,

    #[serde(rename = "defaultHostAccessKey", default)]
    pub default_host_access_key: String,

    #[serde(rename = "defaultHostSecretKey", default)]
    pub default_host_secret_key: String,

    #[serde(rename = "secretKey")]
    pub secret_key: String,

    /// Byte budget `shrinkTo` targets when the maintenance `/__s3p/shrink`
    /// route is hit with no explicit target. Not present in the original
    /// deployment's config; lifts the hardcoded placeholder into config.
    #[serde(default)]
    pub max_cache_bytes: Option<u64>,

    /// When false (default), a failed maintenance-route signature check is
    /// answered with a silent 200 and an empty body, matching the original
    /// deployment's behavior. When true, failures are reported as 401/403.
    #[serde(default)]
    pub strict_signatures: bool,
}

fn default_server_addr() -> String {
    ":4430".to_string()
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Host {
    #[serde(skip)]
    pub name: String,

    pub bucket: String,

    #[serde(default)]
    pub path: String,

    #[serde(rename = "accessKey", default)]
    pub access_key: String,

    #[serde(rename = "secretKey", default)]
    pub secret_key: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config is invalid: {0}")]
    Invalid(String),
}

impl Config {
    pub async fn load(path: &str) -> Result<Self, ConfigError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_string(),
                source,
            })?;
        let cfg = Self::parse(&raw)?;
        cfg.validate_tls_dir().await?;
        Ok(cfg)
    }

    /// `TLSCertsDir` set but missing/not-a-directory is a startup failure,
    /// not a silent fallback to plain HTTP: an operator who configured it
    /// expects TLS, and a typo'd path should fail loudly rather than quietly
    /// serve unencrypted traffic.
    async fn validate_tls_dir(&self) -> Result<(), ConfigError> {
        if self.tls_certs_dir.is_empty() {
            return Ok(());
        }
        match tokio::fs::metadata(&self.tls_certs_dir).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(ConfigError::Invalid(format!(
                "TLSCertsDir {} exists but is not a directory",
                self.tls_certs_dir
            ))),
            Err(_) => Err(ConfigError::Invalid(format!(
                "TLSCertsDir {} does not exist",
                self.tls_certs_dir
            ))),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let mut cfg: Config = toml::from_str(raw)?;
        cfg.apply_defaults();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_defaults(&mut self) {
        for (name, host) in self.hosts.iter_mut() {
            host.name = name.clone();
            if host.access_key.is_empty() {
                host.access_key = self.default_host_access_key.clone();
            }
            if host.secret_key.is_empty() {
                host.secret_key = self.default_host_secret_key.clone();
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.secret_key.is_empty() {
            return Err(ConfigError::Invalid("secretKey must not be empty".into()));
        }
        if self.cache_dir.is_empty() {
            return Err(ConfigError::Invalid("cacheDir must not be empty".into()));
        }
        if self.db_filename.is_empty() {
            return Err(ConfigError::Invalid("DBFilename must not be empty".into()));
        }
        for (name, host) in &self.hosts {
            if host.bucket.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "host {name}: bucket must not be empty"
                )));
            }
            if host.access_key.is_empty() || host.secret_key.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "host {name}: no access/secret key and no default host credentials configured"
                )));
            }
        }
        Ok(())
    }

    /// Names of all configured virtual hosts, sorted for deterministic
    /// output (used both by `urls sign` tooling and the security headers'
    /// allowed-hosts admission list).
    pub fn host_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.hosts.keys().cloned().collect();
        names.sort();
        names
    }

    /// Looks up a configured host by the `Host` header value, stripping any
    /// trailing `:port`.
    pub fn host(&self, host_header: &str) -> Option<&Host> {
        let bare = host_header.split(':').next().unwrap_or(host_header);
        self.hosts.get(bare)
    }

    pub fn is_tls_configured(&self) -> bool {
        !self.tls_certs_dir.is_empty()
    }
}

impl Host {
    /// Cache-relative key: `<Name>/<Bucket>/<Path>/<objectPath>`, also the
    /// on-disk path under `CacheDir`.
    pub fn host_path(&self, object_path: &str) -> String {
        join_path(&self.name, &join_path(&self.bucket, &join_path(&self.path, object_path)))
    }

    /// Joins the host's configured path prefix onto a request path to form
    /// the key used against the origin bucket.
    pub fn bucket_path(&self, object_path: &str) -> String {
        join_path(&self.path, object_path)
    }
}

fn join_path(prefix: &str, suffix: &str) -> String {
    let prefix = prefix.trim_matches('/');
    let suffix = suffix.trim_matches('/');
    match (prefix.is_empty(), suffix.is_empty()) {
        (true, true) => String::new(),
        (true, false) => suffix.to_string(),
        (false, true) => prefix.to_string(),
        (false, false) => format!("{prefix}/{suffix}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hosts_with_fallback_credentials() {
        let toml = r#"
            cacheDir = "/var/cache/s3tlsproxy"
            DBFilename = "/var/cache/s3tlsproxy/meta"
            secretKey = "topsecret"
            defaultHostAccessKey = "AKIAEXAMPLE"
            defaultHostSecretKey = "shhh"

            [hosts."example.org"]
            bucket = "example-org-bucket"

            [hosts."example.com"]
            bucket = "example-com-bucket"
            accessKey = "AKIAOTHER"
            secretKey = "othersecret"
        "#;

        let cfg = Config::parse(toml).expect("config should parse");
        assert_eq!(cfg.host_names(), vec!["example.com", "example.org"]);

        let org = cfg.host("example.org").expect("host present");
        assert_eq!(org.access_key, "AKIAEXAMPLE");
        assert_eq!(org.secret_key, "shhh");

        let com = cfg.host("example.com").expect("host present");
        assert_eq!(com.access_key, "AKIAOTHER");
        assert_eq!(com.secret_key, "othersecret");
    }

    #[test]
    fn strips_port_from_host_header() {
        let toml = r#"
            cacheDir = "/tmp/cache"
            DBFilename = "/tmp/cache/meta"
            secretKey = "topsecret"

            [hosts."example.org"]
            bucket = "example-bucket"
            accessKey = "ak"
            secretKey = "sk"
        "#;
        let cfg = Config::parse(toml).unwrap();
        assert!(cfg.host("example.org:4430").is_some());
    }

    #[test]
    fn rejects_host_without_any_credentials() {
        let toml = r#"
            cacheDir = "/tmp/cache"
            DBFilename = "/tmp/cache/meta"
            secretKey = "topsecret"

            [hosts."example.org"]
            bucket = "example-bucket"
        "#;
        assert!(Config::parse(toml).is_err());
    }

    #[test]
    fn host_path_joins_prefix() {
        let host = Host {
            name: "example.org".into(),
            bucket: "b".into(),
            path: "assets".into(),
            access_key: "a".into(),
            secret_key: "s".into(),
        };
        assert_eq!(host.bucket_path("logo.png"), "assets/logo.png");
        assert_eq!(host.host_path("logo.png"), "example.org/b/assets/logo.png");
    }
}
