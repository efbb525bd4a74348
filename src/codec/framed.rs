// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::Bytes;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt,
    BufReader, BufWriter,
};
use tracing::debug;

use crate::{
    cfg::config::Options,
    codec::{Header, WireKind},
    errors::RpcError,
};

/// Upper bound on a single frame payload. A peer announcing more than this
/// is treated as a framing error rather than an allocation request.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Reading side of one connection: a stream of `(Header, Body)` frame
/// pairs. Every frame is a `u32` big-endian length followed by payload.
///
/// Callers MUST pair every `read_header` with a `read_body` (dropping the
/// returned bytes is the "drain and discard" sink) so the stream stays
/// aligned even for errored replies.
pub struct CodecReader<R> {
    kind: WireKind,
    io: BufReader<R>,
}

impl<R: AsyncRead + Unpin> CodecReader<R> {
    pub fn new(kind: WireKind, io: R) -> Self {
        Self {
            kind,
            io: BufReader::new(io),
        }
    }

    /// Reuse a buffered reader that already served the option handshake.
    pub fn from_buf(kind: WireKind, io: BufReader<R>) -> Self {
        Self { kind, io }
    }

    async fn read_frame(&mut self) -> Result<Bytes, RpcError> {
        let len = self.io.read_u32().await?;
        if len > MAX_FRAME_LEN {
            return Err(RpcError::Codec(format!(
                "frame of {len} bytes exceeds limit of {MAX_FRAME_LEN}"
            )));
        }
        let mut buf = vec![0u8; len as usize];
        self.io.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    /// Block until one header frame is consumed.
    pub async fn read_header(&mut self) -> Result<Header, RpcError> {
        let frame = self.read_frame().await?;
        self.kind.decode(&frame)
    }

    /// Consume the body frame that follows the most recently read header.
    pub async fn read_body(&mut self) -> Result<Bytes, RpcError> {
        self.read_frame().await
    }
}

/// Writing side of one connection. Sessions serialize access with a send
/// mutex so the `(header, body)` pair of concurrent replies never
/// interleaves on the wire.
pub struct CodecWriter<W> {
    kind: WireKind,
    io: BufWriter<W>,
}

impl<W: AsyncWrite + Unpin> CodecWriter<W> {
    pub fn new(kind: WireKind, io: W) -> Self {
        Self {
            kind,
            io: BufWriter::new(io),
        }
    }

    async fn write_frame(&mut self, payload: &[u8]) -> Result<(), RpcError> {
        self.io.write_u32(payload.len() as u32).await?;
        self.io.write_all(payload).await?;
        Ok(())
    }

    /// Write one header frame and its body frame, flushing before return.
    pub async fn write(&mut self, header: &Header, body: &[u8]) -> Result<(), RpcError> {
        let head = self.kind.encode(header)?;
        self.write_frame(&head).await?;
        self.write_frame(body).await?;
        self.io.flush().await?;
        debug!(
            service_method = %header.service_method,
            seq = header.seq,
            body_len = body.len(),
            "frame written"
        );
        Ok(())
    }

    /// Release the underlying stream; repeated shutdowns are harmless.
    pub async fn close(&mut self) -> Result<(), RpcError> {
        let _ = self.io.shutdown().await;
        Ok(())
    }
}

/// Send the session options. Exchanged exactly once, before any framed
/// message, as a single line of JSON.
pub async fn send_options<W: AsyncWrite + Unpin>(
    io: &mut W,
    opt: &Options,
) -> Result<(), RpcError> {
    let mut line = serde_json::to_vec(opt)
        .map_err(|e| RpcError::Codec(format!("encode options: {e}")))?;
    line.push(b'\n');
    io.write_all(&line).await?;
    io.flush().await?;
    Ok(())
}

/// Decode the peer's option line. An unknown codec identifier fails here,
/// before any framed message is touched.
pub async fn recv_options<R: AsyncBufRead + Unpin>(io: &mut R) -> Result<Options, RpcError> {
    let mut line = String::new();
    let n = io.read_line(&mut line).await?;
    if n == 0 {
        return Err(RpcError::Eof);
    }
    serde_json::from_str(line.trim_end())
        .map_err(|e| RpcError::Codec(format!("decode options: {e}")))
}
