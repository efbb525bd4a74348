// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, PoisonError},
};

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};
use tokio::{sync::Mutex, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    cfg::config::Options,
    client::client::Client,
    errors::RpcError,
    xclient::discovery::{Discovery, SelectMode},
};

/// Outcome shared between broadcast sub-requests. Only the first error and
/// the first successful reply are kept; everything later is ignored.
struct BroadcastState {
    first_error: Option<RpcError>,
    reply: Option<Bytes>,
    succeeded: bool,
}

/// A load-balancing client: discovery picks the endpoint, a pool keyed by
/// endpoint reuses sessions, and `broadcast` fans one call out to every
/// known endpoint.
pub struct XClient {
    discovery: Arc<dyn Discovery>,
    mode: SelectMode,
    opt: Options,
    clients: Mutex<HashMap<String, Arc<Client>>>,
}

impl XClient {
    pub fn new(discovery: Arc<dyn Discovery>, mode: SelectMode, opt: Options) -> Arc<Self> {
        Arc::new(Self {
            discovery,
            mode,
            opt,
            clients: Mutex::new(HashMap::new()),
        })
    }

    /// Close and evict every cached session.
    pub async fn close(&self) {
        let mut clients = self.clients.lock().await;
        for (endpoint, client) in clients.drain() {
            debug!(%endpoint, "rpc xclient: closing cached session");
            let _ = client.close().await;
        }
    }

    /// Fetch the cached session for `endpoint`, replacing it when it is no
    /// longer available.
    async fn dial(&self, endpoint: &str) -> Result<Arc<Client>, RpcError> {
        let mut clients = self.clients.lock().await;
        if let Some(cached) = clients.get(endpoint) {
            if cached.is_available() {
                return Ok(Arc::clone(cached));
            }
            let _ = cached.close().await;
            clients.remove(endpoint);
        }

        let client = Client::xdial(endpoint, &self.opt).await?;
        clients.insert(endpoint.to_string(), Arc::clone(&client));
        Ok(client)
    }

    /// Call one endpoint picked by the discovery under the select mode.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R, RpcError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let endpoint = self.discovery.get(self.mode).await?;
        let client = self.dial(&endpoint).await?;
        client.call(service_method, args).await
    }

    /// Fan the call out to every discovered endpoint concurrently.
    ///
    /// The first sub-error cancels the remaining sub-requests. The reply
    /// of the first successful sub-request is kept; each sub-request
    /// decodes into its own scratch buffer so a failing endpoint can never
    /// corrupt a successful reply. Returns `Ok` iff at least one
    /// sub-request succeeded (`Ok(None)` only for an empty endpoint
    /// list), otherwise the first observed error.
    pub async fn broadcast<A, R>(
        self: &Arc<Self>,
        service_method: &str,
        args: &A,
    ) -> Result<Option<R>, RpcError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let servers = self.discovery.get_all().await?;
        let frame = self.opt.codec_type.encode(args)?;
        let cancel = CancellationToken::new();
        let state = Arc::new(StdMutex::new(BroadcastState {
            first_error: None,
            reply: None,
            succeeded: false,
        }));

        let mut subs: JoinSet<()> = JoinSet::new();
        for endpoint in servers {
            let xc = Arc::clone(self);
            let method = service_method.to_string();
            let frame = frame.clone();
            let cancel = cancel.clone();
            let state = Arc::clone(&state);
            subs.spawn(async move {
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => Err(RpcError::Canceled),
                    res = async {
                        let client = xc.dial(&endpoint).await?;
                        client.call_raw(&method, frame).await
                    } => res,
                };

                let mut st = state.lock().unwrap_or_else(PoisonError::into_inner);
                match outcome {
                    Ok(body) => {
                        st.succeeded = true;
                        if st.reply.is_none() {
                            st.reply = Some(body);
                        }
                    },
                    Err(e) => {
                        if st.first_error.is_none() {
                            st.first_error = Some(e);
                            cancel.cancel();
                        }
                    },
                }
            });
        }
        while subs.join_next().await.is_some() {}
        cancel.cancel();

        let mut st = state.lock().unwrap_or_else(PoisonError::into_inner);
        if st.succeeded {
            match st.reply.take() {
                Some(body) => self
                    .opt
                    .codec_type
                    .decode(&body)
                    .map(Some)
                    .map_err(|e| RpcError::ReadBody(e.to_string())),
                None => Ok(None),
            }
        } else if let Some(e) = st.first_error.take() {
            Err(e)
        } else {
            Ok(None)
        }
    }
}
