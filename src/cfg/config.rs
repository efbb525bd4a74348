// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::codec::WireKind;

/// Wire constant validated by the server before anything else is read from
/// a connection.
pub const MAGIC_NUMBER: u32 = 0x3bef5c;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_REGISTRY_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(10);

/// Session negotiation parameters, sent by the client once at the start of
/// every connection as one line of JSON, before any framed message.
///
/// `handle_timeout` of zero means the server does not bound handler
/// runtime.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Options {
    #[serde(rename = "MagicNumber")]
    pub magic_number: u32,

    #[serde(rename = "CodecType", default)]
    pub codec_type: WireKind,

    #[serde(
        rename = "ConnectionTimeout",
        with = "serde_millis",
        default = "default_connect_timeout"
    )]
    pub connect_timeout: Duration,

    #[serde(rename = "HandleTimeout", with = "serde_millis", default)]
    pub handle_timeout: Duration,
}

fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}

impl Default for Options {
    fn default() -> Self {
        Self {
            magic_number: MAGIC_NUMBER,
            codec_type: WireKind::Binary,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handle_timeout: Duration::ZERO,
        }
    }
}

impl Options {
    pub fn with_codec(mut self, kind: WireKind) -> Self {
        self.codec_type = kind;
        self
    }

    pub fn with_connect_timeout(mut self, d: Duration) -> Self {
        self.connect_timeout = d;
        self
    }

    pub fn with_handle_timeout(mut self, d: Duration) -> Self {
        self.handle_timeout = d;
        self
    }
}

/// Runtime configuration loaded from YAML. Everything here lives outside
/// the wire protocol; the session part is projected into [`Options`].
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Session knobs that ride the option handshake.
    #[serde(rename = "Session", default)]
    pub session: SessionConfig,
    /// Registry endpoint and heartbeat settings.
    #[serde(rename = "Registry", default)]
    pub registry: RegistryConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SessionConfig {
    #[serde(rename = "CodecType", default)]
    pub codec_type: WireKind,

    #[serde(
        rename = "ConnectionTimeout",
        with = "serde_secs",
        default = "default_connect_timeout"
    )]
    pub connect_timeout: Duration,

    #[serde(rename = "HandleTimeout", with = "serde_millis", default)]
    pub handle_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            codec_type: WireKind::Binary,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handle_timeout: Duration::ZERO,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RegistryConfig {
    /// Registry URL servers heartbeat to and clients refresh from.
    #[serde(rename = "Address", default)]
    pub address: Option<String>,

    /// How long a discovery trusts its cached endpoint list.
    #[serde(
        rename = "RefreshTimeout",
        with = "serde_secs",
        default = "default_refresh_timeout"
    )]
    pub refresh_timeout: Duration,

    /// Interval between heartbeats; derived from the entry TTL when unset.
    #[serde(rename = "HeartbeatInterval", with = "serde_opt_secs", default)]
    pub heartbeat_interval: Option<Duration>,

    /// Registry-side liveness window. Zero means entries never expire.
    #[serde(
        rename = "EntryTTL",
        with = "serde_secs",
        default = "default_registry_timeout"
    )]
    pub entry_ttl: Duration,
}

fn default_refresh_timeout() -> Duration {
    DEFAULT_REFRESH_TIMEOUT
}

fn default_registry_timeout() -> Duration {
    DEFAULT_REGISTRY_TIMEOUT
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            address: None,
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
            heartbeat_interval: None,
            entry_ttl: DEFAULT_REGISTRY_TIMEOUT,
        }
    }
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        if let Some(addr) = &self.registry.address {
            ensure!(
                !addr.is_empty(),
                "Registry.Address must not be empty when set"
            );
        }

        // A missing heartbeat interval defaults to TTL minus one minute so
        // an entry survives at least one missed beat.
        if self.registry.heartbeat_interval.is_none() && !self.registry.entry_ttl.is_zero()
        {
            self.registry.heartbeat_interval = Some(
                self.registry
                    .entry_ttl
                    .saturating_sub(Duration::from_secs(60)),
            );
        }

        if let Some(hb) = self.registry.heartbeat_interval {
            ensure!(!hb.is_zero(), "Registry.HeartbeatInterval must be > 0");
            if !self.registry.entry_ttl.is_zero() {
                ensure!(
                    hb < self.registry.entry_ttl,
                    "Registry.HeartbeatInterval must be shorter than Registry.EntryTTL"
                );
            }
        }

        ensure!(
            !self.registry.refresh_timeout.is_zero(),
            "Registry.RefreshTimeout must be > 0"
        );

        Ok(())
    }

    /// Project the session part into the wire handshake options.
    pub fn options(&self) -> Options {
        Options {
            magic_number: MAGIC_NUMBER,
            codec_type: self.session.codec_type,
            connect_timeout: self.session.connect_timeout,
            handle_timeout: self.session.handle_timeout,
        }
    }
}

/// Serde helpers for representing `Duration` as a number of seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Same as [`serde_secs`] for optional fields.
mod serde_opt_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        d: &Option<Duration>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<u64>::deserialize(d)?;
        Ok(secs.map(Duration::from_secs))
    }
}

/// Serde helpers for representing `Duration` as milliseconds; timeouts on
/// the option line need sub-second resolution.
mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_default_matches_wire_constants() {
        let opt = Options::default();
        assert_eq!(opt.magic_number, MAGIC_NUMBER);
        assert_eq!(opt.codec_type, WireKind::Binary);
        assert_eq!(opt.connect_timeout, Duration::from_secs(10));
        assert!(opt.handle_timeout.is_zero());
    }

    #[test]
    fn options_json_field_names() {
        let opt = Options::default().with_handle_timeout(Duration::from_millis(100));
        let json = serde_json::to_string(&opt).expect("serialize options");
        assert!(json.contains("\"MagicNumber\""));
        assert!(json.contains("\"CodecType\":\"application/gob\""));
        assert!(json.contains("\"HandleTimeout\":100"));
    }

    #[test]
    fn config_from_yaml_normalizes_heartbeat() {
        let yaml = r#"
Session:
  CodecType: application/json
  ConnectionTimeout: 5
Registry:
  Address: "http://127.0.0.1:9999/_namirpc_/registry"
  EntryTTL: 300
"#;
        let mut cfg: Config = serde_yaml::from_str(yaml).expect("parse yaml");
        cfg.validate_and_normalize().expect("validate");
        assert_eq!(cfg.session.codec_type, WireKind::Json);
        assert_eq!(
            cfg.registry.heartbeat_interval,
            Some(Duration::from_secs(240))
        );
        let opt = cfg.options();
        assert_eq!(opt.codec_type, WireKind::Json);
        assert_eq!(opt.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn config_rejects_heartbeat_slower_than_ttl() {
        let yaml = r#"
Registry:
  HeartbeatInterval: 400
  EntryTTL: 300
"#;
        let mut cfg: Config = serde_yaml::from_str(yaml).expect("parse yaml");
        assert!(cfg.validate_and_normalize().is_err());
    }
}
