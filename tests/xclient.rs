// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

mod common;

use std::sync::Arc;

use common::{SumArgs, start_server};
use nami_rpc::{
    cfg::config::Options,
    errors::RpcError,
    xclient::{
        discovery::{Discovery, MultiServersDiscovery, SelectMode},
        xclient::XClient,
    },
};

#[tokio::test(flavor = "multi_thread")]
async fn call_picks_a_discovered_endpoint() {
    let (addr, _server) = start_server(false).await;
    let discovery = Arc::new(MultiServersDiscovery::new(vec![format!("tcp@{addr}")]));
    let xc = XClient::new(discovery, SelectMode::RandomSelect, Options::default());

    let reply: i32 = xc
        .call("Foo.Sum", &SumArgs { a: 3, b: 4 })
        .await
        .expect("Foo.Sum via xclient");
    assert_eq!(reply, 7);
    xc.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn round_robin_spreads_calls_over_endpoints() {
    let (addr1, server1) = start_server(false).await;
    let (addr2, server2) = start_server(false).await;
    let discovery = Arc::new(MultiServersDiscovery::new(vec![
        format!("tcp@{addr1}"),
        format!("tcp@{addr2}"),
    ]));
    let xc = XClient::new(discovery, SelectMode::RoundRobinSelect, Options::default());

    for _ in 0..4 {
        let reply: i32 = xc
            .call("Foo.Sum", &SumArgs { a: 1, b: 1 })
            .await
            .expect("Foo.Sum");
        assert_eq!(reply, 2);
    }

    for server in [server1, server2] {
        let snapshot = server.snapshot();
        assert_eq!(snapshot.len(), 1);
        let sum_calls = snapshot[0]
            .methods
            .iter()
            .find(|(name, _)| name == "Sum")
            .map(|(_, n)| *n)
            .expect("Sum stats");
        assert_eq!(sum_calls, 2, "round robin must hit each endpoint twice");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn broadcast_keeps_the_first_success() {
    let (ok_addr, _ok) = start_server(false).await;
    let (fail_addr, _fail) = start_server(true).await;
    let discovery = Arc::new(MultiServersDiscovery::new(vec![
        format!("tcp@{ok_addr}"),
        format!("tcp@{fail_addr}"),
    ]));
    let xc = XClient::new(discovery, SelectMode::RoundRobinSelect, Options::default());

    let reply: Option<i32> = xc
        .broadcast("Foo.Sum", &SumArgs { a: 3, b: 4 })
        .await
        .expect("one endpoint succeeded");
    assert_eq!(reply, Some(7));
}

#[tokio::test(flavor = "multi_thread")]
async fn broadcast_returns_first_error_when_all_fail() {
    let (addr1, _s1) = start_server(true).await;
    let (addr2, _s2) = start_server(true).await;
    let discovery = Arc::new(MultiServersDiscovery::new(vec![
        format!("tcp@{addr1}"),
        format!("tcp@{addr2}"),
    ]));
    let xc = XClient::new(discovery, SelectMode::RoundRobinSelect, Options::default());

    let err = xc
        .broadcast::<_, i32>("Foo.Sum", &SumArgs { a: 3, b: 4 })
        .await
        .err()
        .expect("all endpoints failed");
    assert!(err.to_string().contains("boom"), "unexpected error: {err}");
}

#[tokio::test(flavor = "multi_thread")]
async fn broadcast_over_no_endpoints_is_empty() {
    let discovery = Arc::new(MultiServersDiscovery::new(Vec::new()));
    let xc = XClient::new(discovery, SelectMode::RandomSelect, Options::default());

    let reply: Option<i32> = xc
        .broadcast("Foo.Sum", &SumArgs { a: 0, b: 0 })
        .await
        .expect("empty fan-out");
    assert_eq!(reply, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn call_without_endpoints_reports_no_servers() {
    let discovery = Arc::new(MultiServersDiscovery::new(Vec::new()));
    let xc = XClient::new(discovery, SelectMode::RandomSelect, Options::default());

    match xc.call::<_, i32>("Foo.Sum", &SumArgs { a: 0, b: 0 }).await {
        Err(RpcError::NoAvailableServers) => {},
        other => panic!("expected NoAvailableServers, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn pool_redials_after_close() {
    let (addr, _server) = start_server(false).await;
    let endpoint = format!("tcp@{addr}");
    let discovery = Arc::new(MultiServersDiscovery::new(vec![endpoint]));
    let xc = XClient::new(discovery, SelectMode::RandomSelect, Options::default());

    let reply: i32 = xc
        .call("Foo.Sum", &SumArgs { a: 1, b: 2 })
        .await
        .expect("first call");
    assert_eq!(reply, 3);

    // Closing tears down every cached session; the next call must evict
    // the dead entry and dial a fresh one.
    xc.close().await;
    let reply: i32 = xc
        .call("Foo.Sum", &SumArgs { a: 2, b: 2 })
        .await
        .expect("call after close");
    assert_eq!(reply, 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn discovery_update_switches_targets() {
    let (addr1, _s1) = start_server(false).await;
    let (addr2, server2) = start_server(false).await;
    let discovery = Arc::new(MultiServersDiscovery::new(vec![format!("tcp@{addr1}")]));
    let xc = XClient::new(
        Arc::clone(&discovery) as Arc<dyn Discovery>,
        SelectMode::RandomSelect,
        Options::default(),
    );

    let _: i32 = xc
        .call("Foo.Sum", &SumArgs { a: 1, b: 1 })
        .await
        .expect("call against first list");

    discovery
        .update(vec![format!("tcp@{addr2}")])
        .await
        .expect("update");
    let _: i32 = xc
        .call("Foo.Sum", &SumArgs { a: 1, b: 1 })
        .await
        .expect("call against replaced list");

    let hits: u64 = server2.snapshot()[0]
        .methods
        .iter()
        .map(|(_, n)| *n)
        .sum();
    assert_eq!(hits, 1, "second call must land on the replacement endpoint");
}
