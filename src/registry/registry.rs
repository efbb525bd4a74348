// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::{Duration, Instant},
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpListener,
};
use tracing::{debug, warn};

use crate::{
    errors::RpcError,
    registry::{SERVER_HEADER, SERVERS_HEADER},
};

/// Path the registry answers on by default; in-process registries may
/// rebind.
pub const DEFAULT_REGISTRY_PATH: &str = "/_namirpc_/registry";

/// In-memory map of endpoint address to last heartbeat. An endpoint is
/// live while `now - last_heartbeat <= timeout`; a timeout of zero means
/// entries never expire.
pub struct Registry {
    timeout: Duration,
    servers: StdMutex<HashMap<String, Instant>>,
}

impl Registry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            servers: StdMutex::new(HashMap::new()),
        }
    }

    /// Upsert an endpoint with a fresh heartbeat stamp.
    pub fn put_server(&self, addr: &str) {
        let mut servers = self.servers();
        servers.insert(addr.to_string(), Instant::now());
    }

    /// Sorted live endpoints; stale entries are evicted in the same pass.
    pub fn alive_servers(&self) -> Vec<String> {
        let mut servers = self.servers();
        let now = Instant::now();
        servers.retain(|_, last| {
            self.timeout.is_zero() || *last + self.timeout > now
        });
        let mut alive: Vec<String> = servers.keys().cloned().collect();
        alive.sort();
        alive
    }

    /// Serve the registry HTTP endpoint until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, path: String) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "rpc registry: accepted connection");
                    let reg = Arc::clone(&self);
                    let path = path.clone();
                    tokio::spawn(async move {
                        if let Err(e) = reg.handle_conn(stream, &path).await {
                            warn!("rpc registry: connection error: {e}");
                        }
                    });
                },
                Err(e) => {
                    warn!("rpc registry: accept error: {e}");
                    return;
                },
            }
        }
    }

    async fn handle_conn<S>(self: Arc<Self>, stream: S, path: &str) -> Result<(), RpcError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let mut io = BufReader::new(stream);

        let mut request_line = String::new();
        if io.read_line(&mut request_line).await? == 0 {
            return Err(RpcError::Eof);
        }
        let mut headers = HashMap::new();
        loop {
            let mut line = String::new();
            let n = io.read_line(&mut line).await?;
            if n == 0 || line == "\r\n" || line == "\n" {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(
                    name.trim().to_ascii_lowercase(),
                    value.trim().to_string(),
                );
            }
        }

        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or("");
        let req_path = parts.next().unwrap_or("");

        let response = if req_path != path {
            "HTTP/1.0 404 Not Found\r\n\r\n".to_string()
        } else {
            match method {
                "GET" => format!(
                    "HTTP/1.0 200 OK\r\n{SERVERS_HEADER}: {}\r\nContent-Length: 0\r\n\r\n",
                    self.alive_servers().join(",")
                ),
                "POST" => match headers.get(&SERVER_HEADER.to_ascii_lowercase()) {
                    Some(addr) if !addr.is_empty() => {
                        self.put_server(addr);
                        "HTTP/1.0 200 OK\r\nContent-Length: 0\r\n\r\n".to_string()
                    },
                    _ => "HTTP/1.0 500 Internal Server Error\r\n\r\n".to_string(),
                },
                _ => "HTTP/1.0 405 Method Not Allowed\r\n\r\n".to_string(),
            }
        };

        io.write_all(response.as_bytes()).await?;
        io.flush().await?;
        Ok(())
    }

    fn servers(&self) -> std::sync::MutexGuard<'_, HashMap<String, Instant>> {
        self.servers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
