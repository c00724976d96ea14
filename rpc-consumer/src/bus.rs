// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces to the message bus
//!
//! The bus itself (broker, wire protocol, acknowledgement) lives outside this
//! crate.  A [`Transport`] opens [`Connection`]s; a connection registers a
//! consumer for a [`Target`] and yields the calls delivered to it as
//! [`IncomingCall`]s on a channel.

use crate::endpoint::RpcError;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

/// The outcome of a remote call, as sent back to the caller
pub type RpcReply = Result<Value, RpcError>;

/// Where a consumer listens.
///
/// With `fanout` unset, each call on `topic` goes to exactly one of the
/// consumers registered for it.  Calls may also be addressed to a single
/// server through [`Target::server_topic`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Target {
    pub topic: String,
    pub server: String,
    pub exchange: String,
    pub fanout: bool,
}

impl Target {
    pub fn server_topic(&self) -> String {
        format!("{}.{}", self.topic, self.server)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Unsupported transport URL {url:?}")]
    UnsupportedTransport { url: String },

    #[error("Failed to connect to {url}: {message}")]
    Connect { url: String, message: String },

    #[error("No consumer for topic {topic:?} on exchange {exchange:?}")]
    NoConsumer { exchange: String, topic: String },

    #[error("Connection is closed")]
    ConnectionClosed,

    #[error("Call to {method} was dropped without a reply")]
    NoReply { method: String },
}

/// Sends the reply for one call back to its caller
#[derive(Debug)]
pub struct Responder(oneshot::Sender<RpcReply>);

impl Responder {
    /// Returns false if the caller stopped waiting for the reply
    pub fn send(self, reply: RpcReply) -> bool {
        self.0.send(reply).is_ok()
    }
}

/// A remote call delivered to a consumer
#[derive(Debug)]
pub struct IncomingCall {
    method: String,
    args: Value,
    responder: Option<Responder>,
}

impl IncomingCall {
    /// A call whose caller waits on the returned receiver for the reply
    pub fn call(
        method: impl Into<String>,
        args: Value,
    ) -> (IncomingCall, oneshot::Receiver<RpcReply>) {
        let (tx, rx) = oneshot::channel();
        let call = IncomingCall {
            method: method.into(),
            args,
            responder: Some(Responder(tx)),
        };
        (call, rx)
    }

    /// A call that expects no reply
    pub fn cast(method: impl Into<String>, args: Value) -> IncomingCall {
        IncomingCall { method: method.into(), args, responder: None }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn expects_reply(&self) -> bool {
        self.responder.is_some()
    }

    pub fn into_parts(self) -> (String, Value, Option<Responder>) {
        (self.method, self.args, self.responder)
    }
}

/// Opens connections to a message bus
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        target: &Target,
    ) -> Result<Box<dyn Connection>, BusError>;
}

/// A single connection to the message bus
#[async_trait]
pub trait Connection: Send + Sync {
    /// Registers a consumer for `target.topic` and for the server-directed
    /// topic of `target`
    async fn create_consumer(
        &mut self,
        target: &Target,
    ) -> Result<mpsc::Receiver<IncomingCall>, BusError>;

    /// Releases the connection and every consumer registered on it
    async fn close(&mut self) -> Result<(), BusError>;
}
