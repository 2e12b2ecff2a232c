use std::path::PathBuf;
use std::time::Duration;

use rumqttc::{MqttOptions, QoS, TlsConfiguration, Transport};
use serde::Deserialize;

use ferry_api::error::TransportError;

pub const PLAIN_PORT: u16 = 1883;
pub const TLS_PORT: u16 = 8883;

/// `[broker.config]` table for `transport = "mqtt"`.
#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_host")]
    pub host: String,
    /// Defaults to 8883 with TLS, 1883 without.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Generated when absent.
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default = "default_true")]
    pub tls: bool,
    /// PEM CA bundle. Without one the platform roots are used.
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,
    #[serde(default)]
    pub client_cert: Option<PathBuf>,
    #[serde(default)]
    pub client_key: Option<PathBuf>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Request queue between the client handle and the event loop.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// QoS for subscriptions that don't ask for one.
    #[serde(default = "default_qos")]
    pub default_qos: u8,
}

fn default_host() -> String {
    "localhost".into()
}
fn default_true() -> bool {
    true
}
fn default_keep_alive_secs() -> u64 {
    60
}
fn default_channel_capacity() -> usize {
    64
}
fn default_qos() -> u8 {
    1
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: None,
            username: None,
            password: None,
            client_id: None,
            tls: default_true(),
            ca_cert: None,
            client_cert: None,
            client_key: None,
            keep_alive_secs: default_keep_alive_secs(),
            channel_capacity: default_channel_capacity(),
            default_qos: default_qos(),
        }
    }
}

impl MqttConfig {
    pub fn port(&self) -> u16 {
        self.port
            .unwrap_or(if self.tls { TLS_PORT } else { PLAIN_PORT })
    }

    pub fn validate(&self) -> Result<(), TransportError> {
        if self.host.is_empty() {
            return Err(TransportError::config("mqtt host must not be empty"));
        }
        if self.client_cert.is_some() != self.client_key.is_some() {
            return Err(TransportError::config(
                "client_cert and client_key must be set together",
            ));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(TransportError::config("password given without username"));
        }
        qos(self.default_qos)?;
        Ok(())
    }

    /// Read certificate files into a TLS transport.
    pub(crate) fn load_tls(&self) -> Result<Option<Transport>, TransportError> {
        if !self.tls {
            return Ok(None);
        }
        let Some(ca_path) = &self.ca_cert else {
            return Ok(Some(Transport::tls_with_default_config()));
        };

        let ca = read_pem(ca_path, "ca_cert")?;
        let client_auth = match (&self.client_cert, &self.client_key) {
            (Some(cert), Some(key)) => Some((read_pem(cert, "client_cert")?, read_pem(key, "client_key")?)),
            _ => None,
        };
        Ok(Some(Transport::Tls(TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth,
        })))
    }

    pub(crate) fn options(
        &self,
        client_id: &str,
        transport: Option<Transport>,
    ) -> MqttOptions {
        let mut opts = MqttOptions::new(client_id, self.host.clone(), self.port());
        opts.set_keep_alive(Duration::from_secs(self.keep_alive_secs.max(5)));
        opts.set_clean_session(true);
        if let Some(username) = &self.username {
            opts.set_credentials(username.clone(), self.password.clone().unwrap_or_default());
        }
        if let Some(transport) = transport {
            opts.set_transport(transport);
        }
        opts
    }
}

fn read_pem(path: &PathBuf, field: &str) -> Result<Vec<u8>, TransportError> {
    std::fs::read(path)
        .map_err(|e| TransportError::config(format!("{field} '{}': {e}", path.display())))
}

pub(crate) fn qos(level: u8) -> Result<QoS, TransportError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(TransportError::config(format!("unsupported QoS level {other}"))),
    }
}

pub(crate) fn qos_level(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}
