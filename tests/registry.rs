// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

mod common;

use std::{sync::Arc, time::Duration};

use common::{SumArgs, start_server};
use nami_rpc::{
    cfg::config::Options,
    registry::{
        SERVER_HEADER, SERVERS_HEADER, heartbeat::heartbeat, http,
        registry::{DEFAULT_REGISTRY_PATH, Registry},
    },
    xclient::{
        discovery::{Discovery, SelectMode},
        registry_discovery::RegistryDiscovery,
        xclient::XClient,
    },
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    time::sleep,
};

async fn start_registry(ttl: Duration) -> (String, Arc<Registry>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind listener");
    let addr = listener.local_addr().expect("local addr");
    let registry = Arc::new(Registry::new(ttl));
    tokio::spawn(
        Arc::clone(&registry).serve(listener, DEFAULT_REGISTRY_PATH.to_string()),
    );
    (format!("http://{addr}{DEFAULT_REGISTRY_PATH}"), registry)
}

#[tokio::test(flavor = "multi_thread")]
async fn heartbeat_registers_an_endpoint() {
    let (url, _registry) = start_registry(Duration::from_secs(300)).await;
    heartbeat(&url, "tcp@127.0.0.1:7001", None)
        .await
        .expect("first heartbeat");

    let resp = http::get(&url).await.expect("GET");
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header(SERVERS_HEADER), Some("tcp@127.0.0.1:7001"));
}

#[tokio::test(flavor = "multi_thread")]
async fn get_hides_entries_older_than_ttl() {
    let (url, _registry) = start_registry(Duration::from_millis(200)).await;
    http::post(&url, &[(SERVER_HEADER, "tcp@127.0.0.1:7001")])
        .await
        .expect("POST");

    let resp = http::get(&url).await.expect("GET");
    assert_eq!(resp.header(SERVERS_HEADER), Some("tcp@127.0.0.1:7001"));

    sleep(Duration::from_millis(300)).await;
    let resp = http::get(&url).await.expect("GET after TTL");
    assert_eq!(resp.header(SERVERS_HEADER), Some(""));
}

#[tokio::test(flavor = "multi_thread")]
async fn post_without_server_header_is_rejected() {
    let (url, _registry) = start_registry(Duration::from_secs(300)).await;
    let resp = http::post(&url, &[]).await.expect("POST");
    assert_eq!(resp.status, 500);
}

#[tokio::test(flavor = "multi_thread")]
async fn unsupported_methods_and_paths() {
    let (url, _registry) = start_registry(Duration::from_secs(300)).await;
    let host = url
        .strip_prefix("http://")
        .and_then(|rest| rest.split('/').next())
        .expect("registry host");

    let stream = TcpStream::connect(host).await.expect("connect");
    let mut io = BufReader::new(stream);
    io.write_all(format!("PUT {DEFAULT_REGISTRY_PATH} HTTP/1.0\r\n\r\n").as_bytes())
        .await
        .expect("send PUT");
    io.flush().await.expect("flush");
    let mut status = String::new();
    io.read_line(&mut status).await.expect("status line");
    assert!(status.contains("405"), "unexpected status: {status}");

    let resp = http::get(&format!("http://{host}/elsewhere"))
        .await
        .expect("GET wrong path");
    assert_eq!(resp.status, 404);
}

#[tokio::test(flavor = "multi_thread")]
async fn discovery_refresh_respects_the_cache_window() {
    let (url, registry) = start_registry(Duration::from_secs(300)).await;
    http::post(&url, &[(SERVER_HEADER, "tcp@127.0.0.1:7001")])
        .await
        .expect("POST first");

    let discovery = RegistryDiscovery::new(url, Some(Duration::from_millis(300)));
    assert_eq!(
        discovery.get_all().await.expect("first get_all"),
        vec!["tcp@127.0.0.1:7001".to_string()]
    );

    // A second endpoint heartbeats, but the cache window hides it.
    registry.put_server("tcp@127.0.0.1:7002");
    assert_eq!(
        discovery.get_all().await.expect("cached get_all").len(),
        1,
        "refresh inside the window must be a no-op"
    );

    sleep(Duration::from_millis(400)).await;
    assert_eq!(
        discovery.get_all().await.expect("refreshed get_all").len(),
        2,
        "an elapsed window must refetch"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn registry_backed_call_end_to_end() {
    let (url, _registry) = start_registry(Duration::from_secs(300)).await;
    let (addr, _server) = start_server(false).await;
    heartbeat(&url, &format!("tcp@{addr}"), None)
        .await
        .expect("heartbeat");

    let discovery = Arc::new(RegistryDiscovery::new(url, None));
    let xc = XClient::new(discovery, SelectMode::RandomSelect, Options::default());
    let reply: i32 = xc
        .call("Foo.Sum", &SumArgs { a: 19, b: 23 })
        .await
        .expect("registry-backed call");
    assert_eq!(reply, 42);
}

#[tokio::test(flavor = "multi_thread")]
async fn discovery_get_fails_on_empty_registry() {
    let (url, _registry) = start_registry(Duration::from_secs(300)).await;
    let discovery = RegistryDiscovery::new(url, None);
    assert!(discovery.get(SelectMode::RandomSelect).await.is_err());
}
