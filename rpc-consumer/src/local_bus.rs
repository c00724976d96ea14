// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-process message bus, for `local://` transport URLs
//!
//! Calls are routed by exchange and topic.  Point-to-point consumers of a
//! topic take turns receiving calls; fanout consumers only see
//! [`LocalTransport::fanout_cast`].

use crate::bus::BusError;
use crate::bus::Connection;
use crate::bus::IncomingCall;
use crate::bus::RpcReply;
use crate::bus::Target;
use crate::bus::Transport;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::sync::mpsc;

pub const LOCAL_TRANSPORT_SCHEME: &str = "local://";

// Calls queued for a consumer that has not yet pulled them.
const CONSUMER_QUEUE_DEPTH: usize = 1024;

type QueueKey = (String, String);

#[derive(Debug)]
struct Subscriber {
    connection: u64,
    fanout: bool,
    tx: mpsc::Sender<IncomingCall>,
}

#[derive(Debug, Default)]
struct Queue {
    subscribers: Vec<Subscriber>,
    next: usize,
}

impl Queue {
    fn next_point_to_point(&mut self) -> Option<mpsc::Sender<IncomingCall>> {
        let candidates: Vec<_> =
            self.subscribers.iter().filter(|s| !s.fanout).collect();
        if candidates.is_empty() {
            return None;
        }
        let tx = candidates[self.next % candidates.len()].tx.clone();
        self.next = self.next.wrapping_add(1);
        Some(tx)
    }
}

#[derive(Debug, Default)]
struct Inner {
    queues: BTreeMap<QueueKey, Queue>,
    next_connection: u64,
    open: BTreeSet<u64>,
    closed: u64,
    refuse: Option<String>,
}

/// An in-process message bus.
///
/// Clones share the same bus.
#[derive(Clone, Debug, Default)]
pub struct LocalTransport {
    inner: Arc<Mutex<Inner>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent connection attempts fail with `reason`
    pub fn refuse_connections(&self, reason: &str) {
        self.inner.lock().unwrap().refuse = Some(reason.to_string());
    }

    pub fn accept_connections(&self) {
        self.inner.lock().unwrap().refuse = None;
    }

    pub fn open_connections(&self) -> usize {
        self.inner.lock().unwrap().open.len()
    }

    /// Number of connections that have been closed
    pub fn closed_connections(&self) -> u64 {
        self.inner.lock().unwrap().closed
    }

    pub fn consumer_count(&self, exchange: &str, topic: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .queues
            .get(&(exchange.to_string(), topic.to_string()))
            .map(|q| q.subscribers.len())
            .unwrap_or(0)
    }

    fn route(
        &self,
        exchange: &str,
        topic: &str,
    ) -> Result<mpsc::Sender<IncomingCall>, BusError> {
        self.inner
            .lock()
            .unwrap()
            .queues
            .get_mut(&(exchange.to_string(), topic.to_string()))
            .and_then(Queue::next_point_to_point)
            .ok_or_else(|| BusError::NoConsumer {
                exchange: exchange.to_string(),
                topic: topic.to_string(),
            })
    }

    /// Invokes `method` on one consumer of `topic` and waits for its reply.
    ///
    /// The outer error reports delivery problems; the inner result is the
    /// reply produced by the remote endpoint.
    pub async fn call(
        &self,
        exchange: &str,
        topic: &str,
        method: &str,
        args: Value,
    ) -> Result<RpcReply, BusError> {
        let tx = self.route(exchange, topic)?;
        let (call, reply) = IncomingCall::call(method, args);
        tx.send(call).await.map_err(|_| BusError::ConnectionClosed)?;
        reply
            .await
            .map_err(|_| BusError::NoReply { method: method.to_string() })
    }

    /// Delivers `method` to one consumer of `topic` without waiting for a
    /// reply
    pub async fn cast(
        &self,
        exchange: &str,
        topic: &str,
        method: &str,
        args: Value,
    ) -> Result<(), BusError> {
        let tx = self.route(exchange, topic)?;
        tx.send(IncomingCall::cast(method, args))
            .await
            .map_err(|_| BusError::ConnectionClosed)
    }

    /// Delivers `method` to every fanout consumer of `topic`, returning how
    /// many received it
    pub async fn fanout_cast(
        &self,
        exchange: &str,
        topic: &str,
        method: &str,
        args: Value,
    ) -> usize {
        let senders: Vec<_> = self
            .inner
            .lock()
            .unwrap()
            .queues
            .get(&(exchange.to_string(), topic.to_string()))
            .map(|q| {
                q.subscribers
                    .iter()
                    .filter(|s| s.fanout)
                    .map(|s| s.tx.clone())
                    .collect()
            })
            .unwrap_or_default();
        let mut delivered = 0;
        for tx in senders {
            if tx.send(IncomingCall::cast(method, args.clone())).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn connect(
        &self,
        url: &str,
        target: &Target,
    ) -> Result<Box<dyn Connection>, BusError> {
        if !url.starts_with(LOCAL_TRANSPORT_SCHEME) {
            return Err(BusError::UnsupportedTransport { url: url.to_string() });
        }
        let mut inner = self.inner.lock().unwrap();
        if let Some(reason) = &inner.refuse {
            return Err(BusError::Connect {
                url: url.to_string(),
                message: reason.clone(),
            });
        }
        inner.next_connection += 1;
        let id = inner.next_connection;
        inner.open.insert(id);
        Ok(Box::new(LocalConnection {
            id,
            exchange: target.exchange.clone(),
            transport: self.clone(),
            closed: false,
        }))
    }
}

#[derive(Debug)]
struct LocalConnection {
    id: u64,
    exchange: String,
    transport: LocalTransport,
    closed: bool,
}

#[async_trait]
impl Connection for LocalConnection {
    async fn create_consumer(
        &mut self,
        target: &Target,
    ) -> Result<mpsc::Receiver<IncomingCall>, BusError> {
        if self.closed {
            return Err(BusError::ConnectionClosed);
        }
        let (tx, rx) = mpsc::channel(CONSUMER_QUEUE_DEPTH);
        let mut inner = self.transport.inner.lock().unwrap();
        for topic in [target.topic.clone(), target.server_topic()] {
            let queue =
                inner.queues.entry((self.exchange.clone(), topic)).or_default();
            queue.subscribers.push(Subscriber {
                connection: self.id,
                fanout: target.fanout,
                tx: tx.clone(),
            });
        }
        Ok(rx)
    }

    async fn close(&mut self) -> Result<(), BusError> {
        if self.closed {
            return Err(BusError::ConnectionClosed);
        }
        self.closed = true;
        let mut inner = self.transport.inner.lock().unwrap();
        for queue in inner.queues.values_mut() {
            queue.subscribers.retain(|s| s.connection != self.id);
        }
        inner.queues.retain(|_, q| !q.subscribers.is_empty());
        inner.open.remove(&self.id);
        inner.closed += 1;
        Ok(())
    }
}
