//! Facade configuration.
//!
//! Configuration is loaded from multiple sources with the following
//! priority:
//!
//! 1. Environment variables (`REGFACADE_*`)
//! 2. Configuration file (TOML)
//! 3. Default values
//!
//! ## Example configuration file
//!
//! ```toml
//! port = 5000
//! prefix = ""
//! store = "/var/lib/regfacade/store"
//! requireAuth = false
//!
//! [[staticLayer]]
//! ref = "/var/lib/regfacade/supervisor.tar.gz"
//! type = "file"
//!
//! [[staticLayer]]
//! ref = "registry.example.com/ide-tools:latest"
//! type = "image"
//!
//! [remoteSpecProvider]
//! addr = "spec-provider:9001"
//!
//! [remoteSpecProvider.tls]
//! ca = "/certs/ca.crt"
//! crt = "/certs/client.crt"
//! key = "/certs/client.key"
//!
//! [handover]
//! enabled = true
//! sockets = "/var/run/regfacade"
//! ```

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Registry facade configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// TCP port to listen on.
    pub port: u16,
    /// URL path prefix before `/v2`.
    pub prefix: String,
    /// Local blob store root.
    pub store: PathBuf,
    /// Ordered static layer sources appended to every image.
    pub static_layer: Vec<StaticLayerConfig>,
    /// Remote spec provider endpoint, registered as provider `remote`.
    pub remote_spec_provider: Option<RemoteSpecProviderConfig>,
    /// Fixed spec served by provider `static`, for setups without a
    /// remote provider.
    pub static_spec: Option<StaticSpecConfig>,
    /// Reject requests without an `Authorization` header.
    pub require_auth: bool,
    /// Serve HTTPS with this certificate.
    pub tls: Option<TlsConfig>,
    /// Listener handover between facade generations.
    pub handover: HandoverConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5000,
            prefix: String::new(),
            store: PathBuf::from("/var/lib/regfacade/store"),
            static_layer: Vec::new(),
            remote_spec_provider: None,
            static_spec: None,
            require_auth: false,
            tls: None,
            handover: HandoverConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from a file plus `REGFACADE_*` environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from(path: impl AsRef<std::path::Path>) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("REGFACADE_").split("_"))
            .extract()
    }

    /// Loads configuration from environment overrides only.
    ///
    /// # Errors
    ///
    /// Returns an error if an override cannot be parsed.
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Env::prefixed("REGFACADE_").split("_"))
            .extract()
    }
}

/// One static layer appended to every synthesized image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticLayerConfig {
    /// File path or image reference, depending on `type`.
    #[serde(rename = "ref")]
    pub reference: String,
    /// Source kind.
    #[serde(rename = "type")]
    pub kind: StaticLayerKind,
}

/// Kind of a static layer source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StaticLayerKind {
    /// A local gzip'd tar file.
    File,
    /// The layers of an image reference, pinned at startup.
    Image,
}

/// Remote spec provider endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSpecProviderConfig {
    /// Endpoint address, e.g. "spec-provider:9001".
    pub addr: String,
    /// mTLS material; plaintext when absent.
    pub tls: Option<ProviderTlsConfig>,
}

/// mTLS material paths for the spec provider connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderTlsConfig {
    /// CA certificate (PEM).
    pub ca: PathBuf,
    /// Client certificate (PEM).
    pub crt: PathBuf,
    /// Client private key (PEM).
    pub key: PathBuf,
}

/// Fixed image spec served by the `static` provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StaticSpecConfig {
    /// Workspace base image reference.
    pub base_ref: String,
    /// IDE image reference.
    pub ide_ref: String,
    /// Environment variables in `KEY=value` form.
    pub env_vars: Vec<String>,
    /// Entrypoint override.
    pub entrypoint: Vec<String>,
    /// User override.
    pub user: String,
}

/// HTTPS serving material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Certificate chain (PEM).
    pub crt: PathBuf,
    /// Private key (PEM).
    pub key: PathBuf,
}

/// Listener handover configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HandoverConfig {
    /// Whether to receive and offer listener handovers.
    pub enabled: bool,
    /// Directory for handover sockets.
    pub sockets: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port, 5000);
        assert!(config.prefix.is_empty());
        assert!(!config.require_auth);
        assert!(!config.handover.enabled);
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
            port = 8443
            prefix = "/registry"
            store = "/data/blobs"
            requireAuth = true

            [[staticLayer]]
            ref = "/layers/supervisor.tar.gz"
            type = "file"

            [[staticLayer]]
            ref = "registry.example.com/ide:latest"
            type = "image"

            [remoteSpecProvider]
            addr = "specs:9001"

            [staticSpec]
            baseRef = "registry.example.com/base:1.0"

            [handover]
            enabled = true
            sockets = "/run/regfacade"
        "#;

        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::string(toml))
            .extract()
            .unwrap();

        assert_eq!(config.port, 8443);
        assert_eq!(config.prefix, "/registry");
        assert!(config.require_auth);
        assert_eq!(config.static_layer.len(), 2);
        assert_eq!(config.static_layer[0].kind, StaticLayerKind::File);
        assert_eq!(config.static_layer[1].kind, StaticLayerKind::Image);
        assert_eq!(config.remote_spec_provider.unwrap().addr, "specs:9001");
        assert_eq!(
            config.static_spec.unwrap().base_ref,
            "registry.example.com/base:1.0"
        );
        assert!(config.handover.enabled);
        assert_eq!(config.handover.sockets, PathBuf::from("/run/regfacade"));
    }
}
