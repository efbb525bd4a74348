// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::HashMap;

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
};

use crate::errors::RpcError;

/// Status line and headers of a registry reply. Registry payloads are
/// empty, so the body is never read.
#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    headers: HashMap<String, String>,
}

impl HttpResponse {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Header-only HTTP GET against a registry URL.
pub async fn get(url: &str) -> Result<HttpResponse, RpcError> {
    request("GET", url, &[]).await
}

/// Header-only HTTP POST against a registry URL.
pub async fn post(url: &str, headers: &[(&str, &str)]) -> Result<HttpResponse, RpcError> {
    request("POST", url, headers).await
}

/// Accepts `http://host:port/path` or bare `host:port/path`.
fn split_url(url: &str) -> Result<(&str, &str), RpcError> {
    let rest = url.strip_prefix("http://").unwrap_or(url);
    let (host, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    if host.is_empty() {
        return Err(RpcError::Registry(format!("malformed registry url {url}")));
    }
    Ok((host, path))
}

async fn request(
    method: &str,
    url: &str,
    headers: &[(&str, &str)],
) -> Result<HttpResponse, RpcError> {
    let (host, path) = split_url(url)?;

    let stream = TcpStream::connect(host).await?;
    let mut io = BufReader::new(stream);

    let mut req = format!("{method} {path} HTTP/1.0\r\nHost: {host}\r\n");
    for (name, value) in headers {
        req.push_str(&format!("{name}: {value}\r\n"));
    }
    req.push_str("\r\n");
    io.write_all(req.as_bytes()).await?;
    io.flush().await?;

    let mut status_line = String::new();
    if io.read_line(&mut status_line).await? == 0 {
        return Err(RpcError::Eof);
    }
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| {
            RpcError::Registry(format!(
                "malformed status line {:?}",
                status_line.trim_end()
            ))
        })?;

    let mut resp_headers = HashMap::new();
    loop {
        let mut line = String::new();
        let n = io.read_line(&mut line).await?;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            resp_headers.insert(
                name.trim().to_ascii_lowercase(),
                value.trim().to_string(),
            );
        }
    }

    Ok(HttpResponse {
        status,
        headers: resp_headers,
    })
}
