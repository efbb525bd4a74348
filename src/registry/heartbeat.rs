// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use tokio::time::interval;
use tracing::{info, warn};

use crate::{
    cfg::config::DEFAULT_REGISTRY_TIMEOUT,
    errors::RpcError,
    registry::{SERVER_HEADER, http},
};

/// Register `addr` with the registry now and keep the entry alive with a
/// periodic POST. The default period leaves one missed beat of slack
/// before the registry TTL expires the entry.
///
/// The periodic routine stops on its first failed POST; the immediate
/// first beat reports its failure to the caller instead.
pub async fn heartbeat(
    registry: &str,
    addr: &str,
    period: Option<Duration>,
) -> Result<(), RpcError> {
    send_heartbeat(registry, addr).await?;

    let period = period
        .unwrap_or_else(|| DEFAULT_REGISTRY_TIMEOUT.saturating_sub(Duration::from_secs(60)));
    let registry = registry.to_string();
    let addr = addr.to_string();
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = send_heartbeat(&registry, &addr).await {
                warn!("rpc registry: heartbeat error: {e}");
                break;
            }
        }
    });

    Ok(())
}

async fn send_heartbeat(registry: &str, addr: &str) -> Result<(), RpcError> {
    info!("rpc server: {addr} sending heartbeat to registry {registry}");
    let resp = http::post(registry, &[(SERVER_HEADER, addr)]).await?;
    if resp.status >= 300 {
        return Err(RpcError::Registry(format!(
            "heartbeat rejected with status {}",
            resp.status
        )));
    }
    Ok(())
}
