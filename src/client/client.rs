// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, PoisonError},
};

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};
use tokio::{
    io::{AsyncRead, WriteHalf},
    sync::{Mutex, oneshot},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::config::Options,
    codec::{
        Header, WireKind,
        framed::{CodecReader, CodecWriter, send_options},
    },
    client::dial::BoxedConnection,
    errors::RpcError,
};

type CallOutcome = Result<Bytes, RpcError>;

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

/// State guarded by the single state mutex: the sequence counter, the
/// pending map and both lifecycle flags move together so registration is
/// atomic against close and termination.
struct State {
    seq: u64,
    pending: HashMap<u64, oneshot::Sender<CallOutcome>>,
    /// Local close requested.
    closing: bool,
    /// Remote failure or I/O error observed by the receive loop.
    shutdown: bool,
}

/// A client session owning one connection. Requests from any number of
/// tasks share the connection; one receive task demultiplexes replies by
/// sequence number for the whole connection lifetime.
pub struct Client {
    wire: WireKind,
    /// Serializes outbound `(header, body)` pairs.
    sending: Mutex<CodecWriter<WriteHalf<BoxedConnection>>>,
    state: StdMutex<State>,
    closed: CancellationToken,
}

/// One in-flight request. Dropping an unresolved `Call` (for example when
/// the caller raced it against a timeout) removes its pending entry; the
/// eventual server reply is then drained by the receive loop.
pub struct Call {
    client: Arc<Client>,
    pub seq: u64,
    pub service_method: String,
    rx: oneshot::Receiver<CallOutcome>,
}

impl Call {
    /// Wait for the reply body without decoding it.
    pub async fn wait_raw(mut self) -> Result<Bytes, RpcError> {
        match (&mut self.rx).await {
            Ok(outcome) => outcome,
            Err(_) => Err(RpcError::Shutdown),
        }
    }

    /// Wait for the reply and decode it into the caller's type.
    pub async fn wait<R: DeserializeOwned>(self) -> Result<R, RpcError> {
        let wire = self.client.wire;
        let body = self.wait_raw().await?;
        wire.decode(&body)
            .map_err(|e| RpcError::ReadBody(e.to_string()))
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        drop(self.client.remove_call(self.seq));
    }
}

impl Client {
    /// Exchange options on `conn` and start the session. The receive loop
    /// runs until the connection dies or `close` is called.
    pub async fn new(mut conn: BoxedConnection, opt: &Options) -> Result<Arc<Self>, RpcError> {
        send_options(&mut conn, opt).await?;

        let wire = opt.codec_type;
        let (r, w) = tokio::io::split(conn);
        let client = Arc::new(Self {
            wire,
            sending: Mutex::new(CodecWriter::new(wire, w)),
            state: StdMutex::new(State {
                seq: 1,
                pending: HashMap::new(),
                closing: false,
                shutdown: false,
            }),
            closed: CancellationToken::new(),
        });

        let reader = CodecReader::new(wire, r);
        let session = Arc::clone(&client);
        tokio::spawn(async move { session.receive(reader).await });

        Ok(client)
    }

    pub fn wire(&self) -> WireKind {
        self.wire
    }

    /// True while neither side has torn the session down.
    pub fn is_available(&self) -> bool {
        let st = self.state();
        !st.closing && !st.shutdown
    }

    /// Request local close. The codec shutdown fails the receive loop,
    /// which then terminates every still-pending call. A second close
    /// reports the session already shut down.
    pub async fn close(&self) -> Result<(), RpcError> {
        {
            let mut st = self.state();
            if st.closing {
                return Err(RpcError::Shutdown);
            }
            st.closing = true;
        }
        self.closed.cancel();
        let mut sending = self.sending.lock().await;
        sending.close().await
    }

    /// Issue a request without waiting for its reply.
    pub async fn go<A: Serialize>(self: &Arc<Self>, service_method: &str, args: &A) -> Call {
        match self.wire.encode(args) {
            Ok(frame) => self.go_raw(service_method, frame).await,
            Err(e) => {
                let (tx, rx) = oneshot::channel();
                let _ = tx.send(Err(e));
                Call {
                    client: Arc::clone(self),
                    seq: 0,
                    service_method: service_method.to_string(),
                    rx,
                }
            },
        }
    }

    /// [`Client::go`] over a pre-encoded argument frame.
    pub async fn go_raw(self: &Arc<Self>, service_method: &str, args: Bytes) -> Call {
        let (tx, rx) = oneshot::channel();
        let mut call = Call {
            client: Arc::clone(self),
            seq: 0,
            service_method: service_method.to_string(),
            rx,
        };

        let mut sending = self.sending.lock().await;
        let seq = match self.register(tx) {
            Ok(seq) => seq,
            Err(tx) => {
                let _ = tx.send(Err(RpcError::Shutdown));
                return call;
            },
        };
        call.seq = seq;

        let header = Header::request(service_method, seq);
        if let Err(e) = sending.write(&header, &args).await {
            // If the entry is already gone the receive loop has taken
            // responsibility for this call.
            if let Some(tx) = self.remove_call(seq) {
                let _ = tx.send(Err(e));
            }
        }
        call
    }

    /// Synchronous call: issue, wait, decode. Cancellation-safe — callers
    /// race this future against their own timeout or token.
    pub async fn call<A, R>(self: &Arc<Self>, service_method: &str, args: &A) -> Result<R, RpcError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        self.go(service_method, args).await.wait().await
    }

    /// [`Client::call`] over pre-encoded frames, reply left undecoded.
    pub async fn call_raw(
        self: &Arc<Self>,
        service_method: &str,
        args: Bytes,
    ) -> Result<Bytes, RpcError> {
        self.go_raw(service_method, args).await.wait_raw().await
    }

    async fn receive<R: AsyncRead + Unpin>(self: Arc<Self>, mut reader: CodecReader<R>) {
        let cause = loop {
            let header = tokio::select! {
                _ = self.closed.cancelled() => break RpcError::Shutdown,
                h = reader.read_header() => match h {
                    Ok(h) => h,
                    Err(e) => break e,
                },
            };

            match self.remove_call(header.seq) {
                // Write failed or the caller gave up; drain the body so
                // the frame stream stays aligned.
                None => {
                    debug!(seq = header.seq, "rpc client: reply without pending call");
                    if let Err(e) = reader.read_body().await {
                        break e;
                    }
                },
                Some(tx) if !header.error.is_empty() => {
                    let drained = reader.read_body().await;
                    let _ = tx.send(Err(RpcError::Remote(header.error)));
                    if let Err(e) = drained {
                        break e;
                    }
                },
                Some(tx) => match reader.read_body().await {
                    Ok(body) => {
                        let _ = tx.send(Ok(body));
                    },
                    Err(e) => {
                        let _ = tx.send(Err(RpcError::ReadBody(e.to_string())));
                        break e;
                    },
                },
            }
        };
        self.terminate(cause).await;
    }

    /// Fail every pending call with the terminating cause. Registrations
    /// observe `shutdown` afterwards and fail synchronously.
    async fn terminate(&self, cause: RpcError) {
        let _sending = self.sending.lock().await;
        let mut st = self.state();
        st.shutdown = true;
        if !st.pending.is_empty() {
            warn!(
                pending = st.pending.len(),
                "rpc client: session terminated: {cause}"
            );
        }
        for (_, tx) in st.pending.drain() {
            let _ = tx.send(Err(cause.clone()));
        }
    }

    fn register(
        &self,
        tx: oneshot::Sender<CallOutcome>,
    ) -> Result<u64, oneshot::Sender<CallOutcome>> {
        let mut st = self.state();
        if st.closing || st.shutdown {
            return Err(tx);
        }
        let seq = st.seq;
        st.seq += 1;
        st.pending.insert(seq, tx);
        Ok(seq)
    }

    fn remove_call(&self, seq: u64) -> Option<oneshot::Sender<CallOutcome>> {
        self.state().pending.remove(&seq)
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
