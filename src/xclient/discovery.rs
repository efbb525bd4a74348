// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use rand::RngExt;

use crate::errors::RpcError;

/// How `get` picks one endpoint out of the current list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    RandomSelect,
    RoundRobinSelect,
}

/// A source of RPC endpoints. Endpoints are `scheme@addr` strings.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Pull the latest endpoint list from an authority; a no-op for
    /// static discoveries.
    async fn refresh(&self) -> Result<(), RpcError>;

    /// Replace the endpoint list wholesale.
    async fn update(&self, servers: Vec<String>) -> Result<(), RpcError>;

    /// Pick one endpoint under the selection mode.
    async fn get(&self, mode: SelectMode) -> Result<String, RpcError>;

    /// Snapshot of the current list.
    async fn get_all(&self) -> Result<Vec<String>, RpcError>;
}

struct Cursor {
    servers: Vec<String>,
    index: usize,
}

/// A fixed set of endpoints without a registry behind it. The round-robin
/// cursor starts at a random offset so a fleet of fresh clients does not
/// stampede the same server.
pub struct MultiServersDiscovery {
    inner: StdMutex<Cursor>,
}

impl MultiServersDiscovery {
    pub fn new(servers: Vec<String>) -> Self {
        let index = rand::rng().random_range(0..i32::MAX as usize - 1);
        Self {
            inner: StdMutex::new(Cursor { servers, index }),
        }
    }

    fn cursor(&self) -> std::sync::MutexGuard<'_, Cursor> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Discovery for MultiServersDiscovery {
    async fn refresh(&self) -> Result<(), RpcError> {
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) -> Result<(), RpcError> {
        self.cursor().servers = servers;
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String, RpcError> {
        let mut cur = self.cursor();
        let n = cur.servers.len();
        if n == 0 {
            return Err(RpcError::NoAvailableServers);
        }
        match mode {
            SelectMode::RandomSelect => {
                Ok(cur.servers[rand::rng().random_range(0..n)].clone())
            },
            SelectMode::RoundRobinSelect => {
                let picked = cur.servers[cur.index % n].clone();
                cur.index = (cur.index + 1) % n;
                Ok(picked)
            },
        }
    }

    async fn get_all(&self) -> Result<Vec<String>, RpcError> {
        Ok(self.cursor().servers.clone())
    }
}
