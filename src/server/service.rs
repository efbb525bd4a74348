// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    any::type_name,
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};
use tracing::info;

use crate::{codec::WireKind, errors::RpcError};

type MethodFuture = Pin<Box<dyn Future<Output = Result<Bytes, RpcError>> + Send>>;
type MethodHandler = Box<dyn Fn(WireKind, Bytes) -> MethodFuture + Send + Sync>;

/// One callable method: the decoder+invoker closure supplied at
/// registration, plus its invocation counter for the debug surface.
struct Method {
    handler: MethodHandler,
    num_calls: AtomicU64,
}

/// A registered handler object: the receiver's service name plus its
/// method table. Built through [`ServiceBuilder`], keyed on the server by
/// name, immutable afterwards.
pub struct Service {
    name: String,
    methods: HashMap<String, Method>,
}

impl Service {
    /// Start registering methods of `receiver`. The service name is the
    /// receiver's short type name.
    pub fn builder<T: Send + Sync + 'static>(receiver: T) -> ServiceBuilder<T> {
        ServiceBuilder {
            receiver: Arc::new(receiver),
            name: short_type_name::<T>().to_string(),
            methods: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    /// Decode the body, invoke the handler, encode its reply. Handler
    /// errors come back as [`RpcError::Remote`] so only their text reaches
    /// the wire.
    pub async fn call(
        &self,
        method: &str,
        wire: WireKind,
        body: Bytes,
    ) -> Result<Bytes, RpcError> {
        let m = self
            .methods
            .get(method)
            .ok_or_else(|| RpcError::MethodNotFound(method.to_string()))?;
        m.num_calls.fetch_add(1, Ordering::Relaxed);
        (m.handler)(wire, body).await
    }

    /// Per-method invocation counts, for the debug surface.
    pub fn method_stats(&self) -> Vec<(String, u64)> {
        let mut stats: Vec<(String, u64)> = self
            .methods
            .iter()
            .map(|(name, m)| (name.clone(), m.num_calls.load(Ordering::Relaxed)))
            .collect();
        stats.sort();
        stats
    }
}

/// Collects methods for one receiver. Eligibility is what the signature
/// admits: one argument value in, one reply value out, an error return —
/// both serde-encodable.
pub struct ServiceBuilder<T> {
    receiver: Arc<T>,
    name: String,
    methods: HashMap<String, Method>,
}

impl<T: Send + Sync + 'static> ServiceBuilder<T> {
    /// Override the type-derived service name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Register one method. Re-registering a name replaces the previous
    /// handler.
    pub fn method<A, R, F, Fut>(mut self, name: &str, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(Arc<T>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let receiver = Arc::clone(&self.receiver);
        let f = Arc::new(f);
        let handler: MethodHandler = Box::new(move |wire, body| {
            let receiver = Arc::clone(&receiver);
            let f = Arc::clone(&f);
            Box::pin(async move {
                let args: A = wire.decode(&body)?;
                let reply = f(receiver, args)
                    .await
                    .map_err(|e| RpcError::Remote(e.to_string()))?;
                wire.encode(&reply)
            })
        });

        info!("rpc server: regist {}.{}", self.name, name);
        self.methods.insert(
            name.to_string(),
            Method {
                handler,
                num_calls: AtomicU64::new(0),
            },
        );
        self
    }

    pub fn finish(self) -> Service {
        Service {
            name: self.name,
            methods: self.methods,
        }
    }
}

fn short_type_name<T>() -> &'static str {
    let full = type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    struct Foo;

    #[derive(Serialize, Deserialize)]
    struct SumArgs {
        a: i32,
        b: i32,
    }

    fn foo_service() -> Service {
        Service::builder(Foo).method("Sum", |_recv: Arc<Foo>, args: SumArgs| async move {
            Ok(args.a + args.b)
        })
        .finish()
    }

    #[test]
    fn service_name_is_short_type_name() {
        assert_eq!(foo_service().name(), "Foo");
        let renamed = Service::builder(Foo).named("Bar").finish();
        assert_eq!(renamed.name(), "Bar");
    }

    #[tokio::test]
    async fn call_decodes_invokes_encodes() {
        let svc = foo_service();
        let wire = WireKind::Binary;
        let body = wire.encode(&SumArgs { a: 3, b: 4 }).expect("encode args");
        let reply = svc.call("Sum", wire, body).await.expect("call Sum");
        let sum: i32 = wire.decode(&reply).expect("decode reply");
        assert_eq!(sum, 7);
    }

    #[tokio::test]
    async fn call_counts_invocations() {
        let svc = foo_service();
        let wire = WireKind::Binary;
        for _ in 0..3 {
            let body = wire.encode(&SumArgs { a: 1, b: 1 }).expect("encode args");
            svc.call("Sum", wire, body).await.expect("call Sum");
        }
        assert_eq!(svc.method_stats(), vec![("Sum".to_string(), 3)]);
    }

    #[tokio::test]
    async fn unknown_method_and_bad_body() {
        let svc = foo_service();
        let wire = WireKind::Binary;
        let body = wire.encode(&SumArgs { a: 0, b: 0 }).expect("encode args");
        match svc.call("Missing", wire, body).await {
            Err(RpcError::MethodNotFound(m)) => assert_eq!(m, "Missing"),
            other => panic!("expected MethodNotFound, got {other:?}"),
        }

        let garbage = Bytes::from_static(b"\xff");
        assert!(svc.call("Sum", wire, garbage).await.is_err());
    }

    #[tokio::test]
    async fn handler_error_is_remote_text() {
        let svc = Service::builder(Foo)
            .method("Fail", |_recv: Arc<Foo>, _args: ()| async move {
                Err::<i32, _>(anyhow::anyhow!("boom"))
            })
            .finish();
        let wire = WireKind::Binary;
        let body = wire.encode(&()).expect("encode unit");
        match svc.call("Fail", wire, body).await {
            Err(RpcError::Remote(msg)) => assert_eq!(msg, "boom"),
            other => panic!("expected Remote, got {other:?}"),
        }
    }
}
