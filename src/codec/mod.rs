// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// Length-framed header/body reader and writer.
pub mod framed;

use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::errors::RpcError;

/// Per-message metadata carried on the wire in front of every body frame.
///
/// `seq` is scoped to one connection: it starts at 1, grows by one per
/// issued request and is never reused. `error` is empty on requests and on
/// successful replies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    #[serde(rename = "ServiceMethod")]
    pub service_method: String,
    #[serde(rename = "Seq")]
    pub seq: u64,
    #[serde(rename = "Error")]
    pub error: String,
}

impl Header {
    pub fn request(service_method: &str, seq: u64) -> Self {
        Self {
            service_method: service_method.to_string(),
            seq,
            error: String::new(),
        }
    }
}

/// Body encoding negotiated in the option handshake.
///
/// The identifier strings are fixed wire constants; `Binary` is the
/// default self-describing encoding, `Json` the textual one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireKind {
    #[default]
    #[serde(rename = "application/gob")]
    Binary,
    #[serde(rename = "application/json")]
    Json,
}

impl WireKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WireKind::Binary => "application/gob",
            WireKind::Json => "application/json",
        }
    }

    /// Serialize one value into the payload of a single frame.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes, RpcError> {
        match self {
            WireKind::Binary => bincode::serialize(value)
                .map(Bytes::from)
                .map_err(|e| RpcError::Codec(format!("encode error: {e}"))),
            WireKind::Json => serde_json::to_vec(value)
                .map(Bytes::from)
                .map_err(|e| RpcError::Codec(format!("encode error: {e}"))),
        }
    }

    /// Decode one value out of a frame payload.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, RpcError> {
        match self {
            WireKind::Binary => bincode::deserialize(bytes)
                .map_err(|e| RpcError::Codec(format!("decode error: {e}"))),
            WireKind::Json => serde_json::from_slice(bytes)
                .map_err(|e| RpcError::Codec(format!("decode error: {e}"))),
        }
    }

    /// The placeholder body sent with errored replies.
    pub fn sentinel(&self) -> Bytes {
        self.encode(&()).unwrap_or_default()
    }
}
