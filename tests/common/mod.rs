// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use nami_rpc::server::{
    server::{DEFAULT_RPC_PATH, Server},
    service::Service,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SumArgs {
    pub a: i32,
    pub b: i32,
}

pub struct Foo {
    pub fail: bool,
}

/// The demo service: `Sum` adds, `Sleep` stalls for the given number of
/// milliseconds. A failing instance stalls briefly before erroring so
/// broadcast races resolve the same way every run.
pub fn foo_service(fail: bool) -> Service {
    Service::builder(Foo { fail })
        .method("Sum", |recv: Arc<Foo>, args: SumArgs| async move {
            if recv.fail {
                tokio::time::sleep(Duration::from_millis(50)).await;
                anyhow::bail!("boom");
            }
            Ok(args.a + args.b)
        })
        .method("Sleep", |_recv: Arc<Foo>, millis: u64| async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok(millis)
        })
        .finish()
}

/// Bind an ephemeral port, register `Foo` and serve raw connections.
pub async fn start_server(fail: bool) -> (String, Arc<Server>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind listener");
    let addr = listener.local_addr().expect("local addr").to_string();
    let server = Arc::new(Server::new());
    server.register(foo_service(fail)).expect("register Foo");
    tokio::spawn(Arc::clone(&server).accept(listener));
    (addr, server)
}

/// Same as [`start_server`] behind the HTTP CONNECT tunnel.
pub async fn start_http_server() -> (String, Arc<Server>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind listener");
    let addr = listener.local_addr().expect("local addr").to_string();
    let server = Arc::new(Server::new());
    server.register(foo_service(false)).expect("register Foo");
    tokio::spawn(Arc::clone(&server).accept_http(listener, DEFAULT_RPC_PATH.to_string()));
    (addr, server)
}
