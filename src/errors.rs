// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use thiserror::Error;

/// Categorical errors of the RPC runtime. The surface wording of every
/// variant is part of the observable interface: reply errors travel the
/// wire as the header error string and clients match on the text.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    #[error("connection is shut down")]
    Shutdown,

    #[error("connection closed")]
    Eof,

    #[error("rpc client: connect timeout: expect within {0:?}")]
    ConnectTimeout(Duration),

    #[error("rpc client: malformed address {0}, expect scheme@addr")]
    MalformedEndpoint(String),

    #[error("rpc client: call canceled")]
    Canceled,

    #[error("reading body fail: {0}")]
    ReadBody(String),

    #[error("rpc server: request handle timeout: expect within {0:?}")]
    HandleTimeout(Duration),

    #[error("rpc server: service/method request ill-formed: {0}")]
    IllFormedServiceMethod(String),

    #[error("rpc server: can't find service {0}")]
    ServiceNotFound(String),

    #[error("rpc server: can't find method {0}")]
    MethodNotFound(String),

    #[error("rpc server: service already defined: {0}")]
    DuplicateService(String),

    #[error("rpc codec: {0}")]
    Codec(String),

    #[error("rpc discovery: no available servers")]
    NoAvailableServers,

    #[error("rpc registry: {0}")]
    Registry(String),

    /// Error string a remote handler produced. Only the textual form
    /// crosses the wire; no structured taxonomy is preserved.
    #[error("{0}")]
    Remote(String),

    #[error("{0}")]
    Io(String),
}

impl From<std::io::Error> for RpcError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            RpcError::Eof
        } else {
            RpcError::Io(e.to_string())
        }
    }
}
