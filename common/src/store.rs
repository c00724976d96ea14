// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface to the host-managed store of ports and subnets

use crate::api::Port;
use crate::api::PortCreate;
use crate::api::PortFilters;
use crate::api::PortId;
use crate::api::PortUpdate;
use crate::api::Subnet;
use crate::api::SubnetId;
use crate::context::OpContext;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

/// Kinds of records held by the store
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResourceType {
    Port,
    Subnet,
    Network,
}

/// An error reported by the resource store.
#[derive(Clone, Debug, Deserialize, thiserror::Error, PartialEq, Serialize)]
pub enum StoreError {
    /// The named record does not exist.
    #[error("{resource} not found: {id}")]
    NotFound { resource: ResourceType, id: String },
    /// The request conflicts with existing state (e.g., an address that is
    /// already allocated).
    #[error("Conflict: {message}")]
    Conflict { message: String },
    /// The request was rejected as malformed.
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },
    /// The store could not be reached or is temporarily unable to serve.
    #[error("Store unavailable: {message}")]
    Unavailable { message: String },
    #[error("Internal store error: {message}")]
    Internal { message: String },
}

impl StoreError {
    pub fn not_found(resource: ResourceType, id: impl ToString) -> Self {
        StoreError::NotFound { resource, id: id.to_string() }
    }

    pub fn unavailable(message: impl ToString) -> Self {
        StoreError::Unavailable { message: message.to_string() }
    }

    pub fn internal(message: impl ToString) -> Self {
        StoreError::Internal { message: message.to_string() }
    }

    /// Returns whether the error is likely transient and could reasonably be
    /// retried
    pub fn retryable(&self) -> bool {
        match self {
            StoreError::Unavailable { .. } => true,

            StoreError::NotFound { .. }
            | StoreError::Conflict { .. }
            | StoreError::InvalidRequest { .. }
            | StoreError::Internal { .. } => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// CRUD access to ports and subnets.
///
/// These are the only calls the driver makes into the host's resource
/// layer.  Implementations must tolerate concurrent use from many tasks;
/// callers do no locking of their own.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get_subnet(
        &self,
        opctx: &OpContext,
        subnet_id: &SubnetId,
    ) -> Result<Subnet, StoreError>;

    async fn create_port(
        &self,
        opctx: &OpContext,
        port: PortCreate,
    ) -> Result<Port, StoreError>;

    async fn update_port(
        &self,
        opctx: &OpContext,
        port_id: &PortId,
        update: PortUpdate,
    ) -> Result<Port, StoreError>;

    async fn get_ports(
        &self,
        opctx: &OpContext,
        filters: &PortFilters,
    ) -> Result<Vec<Port>, StoreError>;

    async fn delete_port(
        &self,
        opctx: &OpContext,
        port_id: &PortId,
    ) -> Result<(), StoreError>;

    /// Whether port create requests may carry `binding:capabilities`.
    fn supports_binding_capabilities(&self) -> bool {
        false
    }
}
