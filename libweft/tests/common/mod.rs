// Copyright © 2026 The Weft Contributors
//
// This file is part of weft, distributed under the terms of the GPLv3
// or later. For full terms see the included LICENSE file.

//! In-memory test network: a hub of nodes with partition control, plus
//! a fixed-identity storage backend so test nodes get stable names.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tokio::sync::mpsc;

use libweft::{
    net::{Inbound, Priority, Transport},
    storage::{self, LocalIdentityStorage, Storage},
    Config, Coordinator, NodeId,
};

/// A little universe of connected test nodes.
#[derive(Clone, Default)]
pub struct Hub {
    inner: Arc<Mutex<HubInner>>,
}

#[derive(Default)]
struct HubInner {
    nodes: HashMap<NodeId, mpsc::UnboundedSender<Inbound>>,
    /// Directed blocked links (from, to).
    cut: HashSet<(NodeId, NodeId)>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, id: NodeId) -> Arc<HubTransport> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().unwrap().nodes.insert(id.clone(), tx);
        Arc::new(HubTransport {
            id,
            hub: self.inner.clone(),
            rx: Mutex::new(Some(rx)),
        })
    }

    /// Cut both directions between `a` and `b`.
    pub fn partition(&self, a: &NodeId, b: &NodeId) {
        let mut inner = self.inner.lock().unwrap();
        inner.cut.insert((a.clone(), b.clone()));
        inner.cut.insert((b.clone(), a.clone()));
    }

    /// Cut only the `from` → `to` direction.
    pub fn partition_one_way(&self, from: &NodeId, to: &NodeId) {
        self.inner
            .lock()
            .unwrap()
            .cut
            .insert((from.clone(), to.clone()));
    }

    /// Restore both directions between `a` and `b`.
    pub fn heal(&self, a: &NodeId, b: &NodeId) {
        let mut inner = self.inner.lock().unwrap();
        inner.cut.remove(&(a.clone(), b.clone()));
        inner.cut.remove(&(b.clone(), a.clone()));
    }
}

pub struct HubTransport {
    id: NodeId,
    hub: Arc<Mutex<HubInner>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
}

#[async_trait]
impl Transport for HubTransport {
    async fn send(&self, to: &NodeId, frame: Bytes, _priority: Priority) {
        let hub = self.hub.lock().unwrap();
        if hub.cut.contains(&(self.id.clone(), to.clone())) {
            return;
        }
        if let Some(tx) = hub.nodes.get(to) {
            tx.send(Inbound {
                peer: self.id.clone(),
                frame,
                received_at_ms: 0,
            })
            .ok();
        }
    }

    fn incoming(&self) -> BoxStream<'static, Inbound> {
        use futures::StreamExt as _;

        let rx = self
            .rx
            .lock()
            .unwrap()
            .take()
            .expect("incoming() is subscribed exactly once");
        futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|inbound| (inbound, rx))
        })
        .boxed()
    }
}

/// Identity storage pinning a node to a fixed id; incarnation writes
/// are observable by the test.
pub struct FixedIdentity {
    id: NodeId,
    incarnation: Mutex<u64>,
}

impl FixedIdentity {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            incarnation: Mutex::new(0),
        }
    }

    pub fn incarnation(&self) -> u64 {
        *self.incarnation.lock().unwrap()
    }
}

#[async_trait]
impl LocalIdentityStorage for FixedIdentity {
    async fn resolve_node_id(&self) -> Result<NodeId, storage::Error> {
        Ok(self.id.clone())
    }

    async fn save_incarnation(&self, incarnation: u64) -> Result<(), storage::Error> {
        *self.incarnation.lock().unwrap() = incarnation;
        Ok(())
    }

    async fn load_incarnation(&self) -> Result<u64, storage::Error> {
        Ok(*self.incarnation.lock().unwrap())
    }
}

pub struct TestNode {
    pub id: NodeId,
    pub coordinator: Coordinator,
    pub identity: Arc<FixedIdentity>,
}

/// Spin up a named node attached to the hub.
pub async fn node(hub: &Hub, name: &str) -> TestNode {
    let id = NodeId::new(name).unwrap();
    let identity = Arc::new(FixedIdentity::new(id.clone()));
    let transport = hub.attach(id.clone());
    let coordinator = Coordinator::new(
        Config::default(),
        transport,
        Storage {
            local: Some(identity.clone()),
            ..Storage::in_memory()
        },
    )
    .await
    .unwrap();

    TestNode {
        id,
        coordinator,
        identity,
    }
}

/// Route engine tracing to the test output when `RUST_LOG` is set.
#[allow(dead_code)]
pub fn logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `cond` under the paused clock until it holds, or give up after
/// two virtual minutes.
pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..240 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    panic!("timed out waiting for: {what}");
}
