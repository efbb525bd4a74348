// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use dashmap::{DashMap, mapref::entry::Entry};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpListener,
    sync::Mutex,
    time::timeout,
};
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::{
    cfg::config::MAGIC_NUMBER,
    codec::{
        Header, WireKind,
        framed::{CodecReader, CodecWriter, recv_options},
    },
    errors::RpcError,
    server::service::Service,
};

/// Path an HTTP-tunneled client CONNECTs to.
pub const DEFAULT_RPC_PATH: &str = "/_namirpc_";

const CONNECTED_RESPONSE: &str = "HTTP/1.0 200 OK Connected to Nami RPC\r\n\r\n";

/// Per-service snapshot of invocation counters, consumed by the debug
/// page renderer.
#[derive(Debug, Clone)]
pub struct ServiceSnapshot {
    pub name: String,
    pub methods: Vec<(String, u64)>,
}

/// An RPC server: a name-keyed map of registered services plus the
/// connection serving machinery. One instance accepts any number of
/// connections; every connection serves any number of concurrent
/// requests.
pub struct Server {
    services: DashMap<String, Arc<Service>>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        Self {
            services: DashMap::new(),
        }
    }

    /// Publish a service. The map is write-once per name.
    pub fn register(&self, svc: Service) -> Result<(), RpcError> {
        match self.services.entry(svc.name().to_string()) {
            Entry::Occupied(e) => Err(RpcError::DuplicateService(e.key().clone())),
            Entry::Vacant(v) => {
                v.insert(Arc::new(svc));
                Ok(())
            },
        }
    }

    /// Resolve a dotted `Service.Method` name against the service map.
    fn find(&self, service_method: &str) -> Result<(Arc<Service>, String), RpcError> {
        let (service, method) = service_method.rsplit_once('.').ok_or_else(|| {
            RpcError::IllFormedServiceMethod(service_method.to_string())
        })?;
        let svc = self
            .services
            .get(service)
            .ok_or_else(|| RpcError::ServiceNotFound(service.to_string()))?
            .clone();
        if !svc.has_method(method) {
            return Err(RpcError::MethodNotFound(method.to_string()));
        }
        Ok((svc, method.to_string()))
    }

    pub fn snapshot(&self) -> Vec<ServiceSnapshot> {
        let mut all: Vec<ServiceSnapshot> = self
            .services
            .iter()
            .map(|e| ServiceSnapshot {
                name: e.key().clone(),
                methods: e.value().method_stats(),
            })
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Accept raw connections until the listener fails.
    pub async fn accept(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "rpc server: accepted connection");
                    let srv = Arc::clone(&self);
                    tokio::spawn(async move { srv.serve_conn(stream).await });
                },
                Err(e) => {
                    warn!("rpc server: accept error: {e}");
                    return;
                },
            }
        }
    }

    /// Accept HTTP-tunneled connections until the listener fails.
    pub async fn accept_http(self: Arc<Self>, listener: TcpListener, path: String) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "rpc server: accepted http connection");
                    let srv = Arc::clone(&self);
                    let path = path.clone();
                    tokio::spawn(async move { srv.serve_http_conn(stream, &path).await });
                },
                Err(e) => {
                    warn!("rpc server: accept error: {e}");
                    return;
                },
            }
        }
    }

    /// Serve one connection: option handshake, then the request loop.
    pub async fn serve_conn<S>(self: Arc<Self>, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (r, w) = tokio::io::split(stream);
        let mut buf = BufReader::new(r);

        let opt = match recv_options(&mut buf).await {
            Ok(opt) => opt,
            Err(e) => {
                warn!("rpc server: options error: {e}");
                return;
            },
        };
        if opt.magic_number != MAGIC_NUMBER {
            warn!("rpc server: invalid magic number {:#x}", opt.magic_number);
            return;
        }

        let wire = opt.codec_type;
        let reader = CodecReader::from_buf(wire, buf);
        let writer = CodecWriter::new(wire, w);
        self.serve_codec(reader, writer, wire, opt.handle_timeout).await;
    }

    /// Accept an HTTP CONNECT on `path` and hand the hijacked stream to
    /// the regular serving path.
    pub async fn serve_http_conn<S>(self: Arc<Self>, stream: S, path: &str)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        match http_connect_handshake(stream, path).await {
            Ok(Some(io)) => self.serve_conn(io).await,
            Ok(None) => {},
            Err(e) => warn!("rpc server: http connect error: {e}"),
        }
    }

    async fn serve_codec<R, W>(
        self: Arc<Self>,
        mut reader: CodecReader<R>,
        writer: CodecWriter<W>,
        wire: WireKind,
        handle_timeout: Duration,
    ) where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let sending = Arc::new(Mutex::new(writer));
        let handlers = TaskTracker::new();

        loop {
            let mut header = match reader.read_header().await {
                Ok(h) => h,
                Err(RpcError::Eof) => break,
                Err(e) => {
                    warn!("rpc server: read header error: {e}");
                    break;
                },
            };
            // The body frame is consumed in the loop even when the lookup
            // fails, keeping the stream aligned.
            let body = match reader.read_body().await {
                Ok(b) => b,
                Err(e) => {
                    warn!("rpc server: read body error: {e}");
                    break;
                },
            };

            match self.find(&header.service_method) {
                Err(e) => {
                    header.error = e.to_string();
                    send_response(&sending, &header, &wire.sentinel()).await;
                },
                Ok((svc, method)) => {
                    handlers.spawn(handle_request(
                        svc,
                        method,
                        header,
                        body,
                        wire,
                        Arc::clone(&sending),
                        handle_timeout,
                    ));
                },
            }
        }

        // Requests already dispatched are allowed to finish.
        handlers.close();
        handlers.wait().await;
        let _ = sending.lock().await.close().await;
    }
}

async fn handle_request<W>(
    svc: Arc<Service>,
    method: String,
    mut header: Header,
    body: Bytes,
    wire: WireKind,
    sending: Arc<Mutex<CodecWriter<W>>>,
    handle_timeout: Duration,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let result = if handle_timeout.is_zero() {
        svc.call(&method, wire, body).await
    } else {
        let handler = tokio::spawn({
            let svc = Arc::clone(&svc);
            let method = method.clone();
            async move { svc.call(&method, wire, body).await }
        });
        match timeout(handle_timeout, handler).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(RpcError::Io(format!("handler task failed: {e}"))),
            // The detached handler keeps running but only this task may
            // reply for this sequence.
            Err(_) => Err(RpcError::HandleTimeout(handle_timeout)),
        }
    };

    match result {
        Ok(reply) => send_response(&sending, &header, &reply).await,
        Err(e) => {
            header.error = e.to_string();
            send_response(&sending, &header, &wire.sentinel()).await;
        },
    }
}

async fn send_response<W: AsyncWrite + Unpin>(
    sending: &Mutex<CodecWriter<W>>,
    header: &Header,
    body: &[u8],
) {
    let mut w = sending.lock().await;
    if let Err(e) = w.write(header, body).await {
        warn!("rpc server: write response error: {e}");
    }
}

/// Read one HTTP request; answer CONNECT on the expected path with the
/// fixed status line and return the stream, refuse everything else.
async fn http_connect_handshake<S>(
    stream: S,
    path: &str,
) -> Result<Option<BufReader<S>>, RpcError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let mut io = BufReader::new(stream);

    let mut request_line = String::new();
    if io.read_line(&mut request_line).await? == 0 {
        return Err(RpcError::Eof);
    }
    loop {
        let mut line = String::new();
        let n = io.read_line(&mut line).await?;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let req_path = parts.next().unwrap_or("");

    if method != "CONNECT" {
        io.write_all(b"HTTP/1.0 405 must CONNECT\r\n\r\n").await?;
        io.flush().await?;
        return Ok(None);
    }
    if req_path != path {
        io.write_all(b"HTTP/1.0 404 Not Found\r\n\r\n").await?;
        io.flush().await?;
        return Ok(None);
    }

    io.write_all(CONNECTED_RESPONSE.as_bytes()).await?;
    io.flush().await?;
    Ok(Some(io))
}
