// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    cfg::config::DEFAULT_REFRESH_TIMEOUT,
    errors::RpcError,
    registry::{SERVERS_HEADER, http},
    xclient::discovery::{Discovery, MultiServersDiscovery, SelectMode},
};

/// Discovery backed by a heartbeat registry. Endpoints are cached in a
/// static discovery and refetched over HTTP once the cache outlives the
/// refresh timeout.
pub struct RegistryDiscovery {
    servers: MultiServersDiscovery,
    registry: String,
    refresh_timeout: Duration,
    /// Held across the HTTP fetch so concurrent refreshes collapse into
    /// one.
    last_updated: Mutex<Option<Instant>>,
}

impl RegistryDiscovery {
    pub fn new(registry: impl Into<String>, refresh_timeout: Option<Duration>) -> Self {
        Self {
            servers: MultiServersDiscovery::new(Vec::new()),
            registry: registry.into(),
            refresh_timeout: refresh_timeout.unwrap_or(DEFAULT_REFRESH_TIMEOUT),
            last_updated: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Discovery for RegistryDiscovery {
    async fn refresh(&self) -> Result<(), RpcError> {
        let mut last = self.last_updated.lock().await;
        if let Some(t) = *last
            && t + self.refresh_timeout > Instant::now()
        {
            return Ok(());
        }

        debug!("rpc discovery: refresh servers from registry {}", self.registry);
        let resp = http::get(&self.registry).await?;
        let servers = resp
            .header(SERVERS_HEADER)
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        self.servers.update(servers).await?;
        *last = Some(Instant::now());
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) -> Result<(), RpcError> {
        let mut last = self.last_updated.lock().await;
        self.servers.update(servers).await?;
        *last = Some(Instant::now());
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String, RpcError> {
        self.refresh().await?;
        self.servers.get(mode).await
    }

    async fn get_all(&self) -> Result<Vec<String>, RpcError> {
        self.refresh().await?;
        self.servers.get_all().await
    }
}
