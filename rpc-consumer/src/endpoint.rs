// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Handlers for remote calls and the registry that routes calls to them

use crate::bus::IncomingCall;
use crate::bus::RpcReply;
use async_trait::async_trait;
use display_error_chain::DisplayErrorChain;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use slog::debug;
use slog::warn;
use slog::Logger;
use std::collections::BTreeMap;
use std::sync::Arc;

/// An error returned to the caller of a remote method
#[derive(
    Clone, Debug, Deserialize, Eq, PartialEq, Serialize, thiserror::Error,
)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RpcError {
    #[error("No endpoint handles method {method:?}")]
    UnknownMethod { method: String },

    #[error("Invalid arguments for {method}: {message}")]
    InvalidArguments { method: String, message: String },

    #[error("{method} failed: {message}")]
    Failed { method: String, message: String, retryable: bool },
}

impl RpcError {
    /// Builds a failure reply for `method` from `err` and its whole source
    /// chain
    pub fn failed<E>(method: &str, err: &E, retryable: bool) -> Self
    where
        E: std::error::Error,
    {
        RpcError::Failed {
            method: method.to_string(),
            message: DisplayErrorChain::new(err).to_string(),
            retryable,
        }
    }

    pub fn retryable(&self) -> bool {
        match self {
            RpcError::Failed { retryable, .. } => *retryable,
            RpcError::UnknownMethod { .. }
            | RpcError::InvalidArguments { .. } => false,
        }
    }
}

/// Decodes the JSON arguments of `method`.  A missing (null) argument
/// object is treated as empty.
pub fn decode_args<T: DeserializeOwned>(
    method: &str,
    args: Value,
) -> Result<T, RpcError> {
    let args =
        if args.is_null() { Value::Object(Default::default()) } else { args };
    serde_json::from_value(args).map_err(|err| RpcError::InvalidArguments {
        method: method.to_string(),
        message: err.to_string(),
    })
}

/// Encodes a successful reply
pub fn encode_reply<T: Serialize>(method: &str, value: &T) -> RpcReply {
    serde_json::to_value(value)
        .map_err(|err| RpcError::failed(method, &err, false))
}

/// An object that services a fixed set of remote methods
#[async_trait]
pub trait RpcEndpoint: Send + Sync {
    fn name(&self) -> &'static str;

    /// Every method name this endpoint answers to
    fn methods(&self) -> &'static [&'static str];

    /// Services one call.  Only invoked with names from
    /// [`RpcEndpoint::methods`].
    async fn dispatch(&self, method: &str, args: Value) -> RpcReply;

    /// Discards per-endpoint state accumulated from earlier calls
    fn reset(&self) {}
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("No endpoints were registered")]
    Empty,

    #[error(
        "Method {method:?} is handled by both endpoint {first:?} and \
         endpoint {second:?}"
    )]
    DuplicateMethod {
        method: &'static str,
        first: &'static str,
        second: &'static str,
    },
}

/// Routes calls by method name to the endpoint that handles it.
///
/// Endpoints keep the order they were registered in.
pub struct EndpointRegistry {
    endpoints: Vec<Arc<dyn RpcEndpoint>>,
    by_method: BTreeMap<&'static str, usize>,
}

impl EndpointRegistry {
    pub fn new(
        endpoints: Vec<Arc<dyn RpcEndpoint>>,
    ) -> Result<Self, RegistryError> {
        if endpoints.is_empty() {
            return Err(RegistryError::Empty);
        }
        let mut by_method = BTreeMap::new();
        for (index, endpoint) in endpoints.iter().enumerate() {
            for &method in endpoint.methods() {
                if let Some(prev) = by_method.insert(method, index) {
                    return Err(RegistryError::DuplicateMethod {
                        method,
                        first: endpoints[prev].name(),
                        second: endpoint.name(),
                    });
                }
            }
        }
        Ok(Self { endpoints, by_method })
    }

    pub fn endpoint_names(&self) -> Vec<&'static str> {
        self.endpoints.iter().map(|e| e.name()).collect()
    }

    pub fn handles(&self, method: &str) -> bool {
        self.by_method.contains_key(method)
    }

    pub async fn dispatch(&self, method: &str, args: Value) -> RpcReply {
        match self.by_method.get(method) {
            Some(&index) => self.endpoints[index].dispatch(method, args).await,
            None => {
                Err(RpcError::UnknownMethod { method: method.to_string() })
            }
        }
    }

    /// Dispatches `call` and sends the reply back if the caller wants one
    pub async fn handle(&self, log: &Logger, call: IncomingCall) {
        let (method, args, responder) = call.into_parts();
        let reply = self.dispatch(&method, args).await;
        if let Err(error) = &reply {
            warn!(
                log,
                "remote call failed";
                "method" => &method,
                "error" => %error,
            );
        }
        match responder {
            Some(responder) => {
                if !responder.send(reply) {
                    debug!(
                        log,
                        "caller went away before the reply was sent";
                        "method" => &method,
                    );
                }
            }
            None => debug!(log, "cast handled"; "method" => &method),
        }
    }

    pub fn reset(&self) {
        for endpoint in &self.endpoints {
            endpoint.reset();
        }
    }
}
