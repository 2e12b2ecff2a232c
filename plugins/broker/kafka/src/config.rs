use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;

use rskafka::client::{Credentials, SaslConfig};
use rustls::{ClientConfig, RootCertStore};
use serde::Deserialize;

use ferry_api::error::TransportError;

const DEFAULT_PORT: u16 = 9092;

/// `[broker.config]` table for `transport = "kafka"`.
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    /// Bootstrap brokers, `host` or `host:port`.
    #[serde(default = "default_brokers")]
    pub brokers: Vec<String>,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Reported in status only: partitions are assigned directly, without
    /// a consumer group.
    #[serde(default)]
    pub group_id: Option<String>,
    /// Start newly subscribed topics at the earliest offset instead of the
    /// latest. Overridable per subscribe call.
    #[serde(default)]
    pub from_beginning: bool,
    /// Fetch long-poll duration.
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: i32,
    /// Consecutive fetch errors on one partition before the session is
    /// reported lost.
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
    /// SASL PLAIN user. No SASL handshake without one.
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub tls: bool,
    /// PEM CA bundle. Without one the bundled web PKI roots are used.
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,
}

fn default_brokers() -> Vec<String> {
    vec![format!("localhost:{DEFAULT_PORT}")]
}
fn default_client_id() -> String {
    "ferry-kafka".into()
}
fn default_max_wait_ms() -> i32 {
    500
}
fn default_max_consecutive_errors() -> u32 {
    5
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: default_brokers(),
            client_id: default_client_id(),
            group_id: None,
            from_beginning: false,
            max_wait_ms: default_max_wait_ms(),
            max_consecutive_errors: default_max_consecutive_errors(),
            username: None,
            password: None,
            tls: false,
            ca_cert: None,
        }
    }
}

impl KafkaConfig {
    /// Bootstrap addresses with the default port filled in.
    pub fn bootstrap(&self) -> Result<Vec<String>, TransportError> {
        let brokers: Vec<String> = self
            .brokers
            .iter()
            .map(|b| b.trim())
            .filter(|b| !b.is_empty())
            .map(|b| {
                if b.contains(':') {
                    b.to_string()
                } else {
                    format!("{b}:{DEFAULT_PORT}")
                }
            })
            .collect();
        if brokers.is_empty() {
            return Err(TransportError::config("at least one kafka broker is required"));
        }
        Ok(brokers)
    }

    pub fn validate(&self) -> Result<(), TransportError> {
        self.bootstrap()?;
        if self.max_wait_ms <= 0 {
            return Err(TransportError::config("max_wait_ms must be positive"));
        }
        if self.max_consecutive_errors == 0 {
            return Err(TransportError::config("max_consecutive_errors must be at least 1"));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(TransportError::config("password given without username"));
        }
        if self.ca_cert.is_some() && !self.tls {
            return Err(TransportError::config("ca_cert given but tls is off"));
        }
        Ok(())
    }

    pub(crate) fn sasl(&self) -> Option<SaslConfig> {
        let username = self.username.clone()?;
        let password = self.password.clone().unwrap_or_default();
        Some(SaslConfig::Plain(Credentials::new(username, password)))
    }

    /// Build the rustls client config. Reads the CA file, no network I/O.
    pub(crate) fn load_tls(&self) -> Result<Option<Arc<ClientConfig>>, TransportError> {
        if !self.tls {
            return Ok(None);
        }

        let mut roots = RootCertStore::empty();
        match &self.ca_cert {
            Some(path) => {
                let added = read_ca(path, &mut roots)?;
                if added == 0 {
                    return Err(TransportError::config(format!(
                        "ca_cert '{}': no certificates found",
                        path.display()
                    )));
                }
            }
            None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
        }

        let config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| TransportError::config(format!("tls: {e}")))?
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Some(Arc::new(config)))
    }
}

fn read_ca(path: &PathBuf, roots: &mut RootCertStore) -> Result<usize, TransportError> {
    let file = std::fs::File::open(path)
        .map_err(|e| TransportError::config(format!("ca_cert '{}': {e}", path.display())))?;
    let mut reader = BufReader::new(file);
    let mut added = 0;
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.map_err(|e| TransportError::config(format!("ca_cert '{}': {e}", path.display())))?;
        roots
            .add(cert)
            .map_err(|e| TransportError::config(format!("ca_cert '{}': {e}", path.display())))?;
        added += 1;
    }
    Ok(added)
}
