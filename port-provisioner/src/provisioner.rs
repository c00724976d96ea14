// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Creation and removal of load balancer ports in the resource store

use crate::subnet_cache::SubnetCache;
use ipnetwork::IpNetwork;
use lbaas_common::api::device_id_for_host;
use lbaas_common::api::BindingCapabilities;
use lbaas_common::api::FixedIp;
use lbaas_common::api::NetworkId;
use lbaas_common::api::Port;
use lbaas_common::api::PortCreate;
use lbaas_common::api::PortFilters;
use lbaas_common::api::PortId;
use lbaas_common::api::PortStatus;
use lbaas_common::api::PortUpdate;
use lbaas_common::api::Subnet;
use lbaas_common::api::SubnetId;
use lbaas_common::api::DEVICE_OWNER_LBAASV2;
use lbaas_common::OpContext;
use lbaas_common::ResourceStore;
use lbaas_common::StoreError;
use macaddr::MacAddr6;
use serde::Deserialize;
use serde::Serialize;
use slog::debug;
use slog::error;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to look up subnet {subnet_id}")]
    SubnetLookup {
        subnet_id: SubnetId,
        #[source]
        err: StoreError,
    },

    #[error("{ip} is not within subnet {subnet_id} ({cidr})")]
    AddressNotInSubnet { ip: IpAddr, subnet_id: SubnetId, cidr: IpNetwork },

    #[error("Failed to create port on subnet {subnet_id}")]
    CreatePort {
        subnet_id: SubnetId,
        #[source]
        err: StoreError,
    },

    #[error("Failed to mark port {port_id} active")]
    ActivatePort {
        port_id: PortId,
        #[source]
        err: StoreError,
    },

    #[error("Port {port_id} is still {status} after being marked active")]
    PortNotActive { port_id: PortId, status: PortStatus },

    #[error("Failed to list ports")]
    ListPorts(#[source] StoreError),

    #[error("Failed to delete port {port_id}")]
    DeletePort {
        port_id: PortId,
        #[source]
        err: StoreError,
    },

    #[error(
        "Failed to delete {} of {} ports",
        .outcome.failures.len(),
        .outcome.deleted.len() + .outcome.failures.len()
    )]
    IncompleteDelete { outcome: DeleteOutcome },
}

impl Error {
    /// The store error underlying this failure, if any
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            Error::SubnetLookup { err, .. }
            | Error::CreatePort { err, .. }
            | Error::ActivatePort { err, .. }
            | Error::ListPorts(err)
            | Error::DeletePort { err, .. } => Some(err),
            Error::IncompleteDelete { outcome } => {
                outcome.failures.first().map(|f| &f.error)
            }
            Error::AddressNotInSubnet { .. } | Error::PortNotActive { .. } => {
                None
            }
        }
    }

    pub fn retryable(&self) -> bool {
        self.store_error().map(StoreError::retryable).unwrap_or(false)
    }
}

fn default_fixed_address_count() -> usize {
    1
}

/// Parameters for a port whose addresses are picked by the store
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CreatePortParams {
    #[serde(default)]
    pub subnet_id: Option<SubnetId>,
    #[serde(default)]
    pub mac_address: Option<MacAddr6>,
    #[serde(default)]
    pub name: String,
    /// Number of addresses to allocate on the subnet. Zero is treated as
    /// one.
    #[serde(default = "default_fixed_address_count")]
    pub fixed_address_count: usize,
    /// When non-empty, the port is bound to this host's device id.
    #[serde(default)]
    pub host: String,
}

impl Default for CreatePortParams {
    fn default() -> Self {
        Self {
            subnet_id: None,
            mac_address: None,
            name: String::new(),
            fixed_address_count: default_fixed_address_count(),
            host: String::new(),
        }
    }
}

/// Parameters for a port with one caller-chosen address
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct SpecificIpPortParams {
    #[serde(default)]
    pub subnet_id: Option<SubnetId>,
    #[serde(default)]
    pub mac_address: Option<MacAddr6>,
    #[serde(default)]
    pub ip_address: Option<IpAddr>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub host: String,
}

/// A port that could not be removed, or a lookup that failed before any
/// port was identified (`port_id` is `None`).
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct DeleteFailure {
    pub port_id: Option<PortId>,
    pub error: StoreError,
}

/// Result of a best-effort bulk delete
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct DeleteOutcome {
    pub deleted: Vec<PortId>,
    pub failures: Vec<DeleteFailure>,
}

impl DeleteOutcome {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

fn present(subnet_id: Option<&SubnetId>) -> Option<&SubnetId> {
    subnet_id.filter(|id| !id.is_empty())
}

/// Creates and destroys the ports that anchor load balancer virtual servers
/// and members to tenant subnets.
///
/// Every port handed back by a create operation is `ACTIVE`.  Safe to share
/// between tasks; all serialization of mutations is left to the store.
pub struct PortProvisioner {
    log: Logger,
    store: Arc<dyn ResourceStore>,
    subnet_cache: Option<SubnetCache>,
}

impl PortProvisioner {
    pub fn new(log: &Logger, store: Arc<dyn ResourceStore>) -> Self {
        let log = log.new(o!("component" => "PortProvisioner"));
        Self { log, store, subnet_cache: None }
    }

    /// Cache subnet lookups for `ttl`
    pub fn with_subnet_cache(mut self, ttl: Duration) -> Self {
        info!(self.log, "caching subnet lookups"; "ttl" => ?ttl);
        self.subnet_cache = Some(SubnetCache::new(ttl));
        self
    }

    pub fn subnet_cache(&self) -> Option<&SubnetCache> {
        self.subnet_cache.as_ref()
    }

    /// Returns the subnet and whether it was served from the cache
    async fn lookup_subnet(
        &self,
        opctx: &OpContext,
        subnet_id: &SubnetId,
    ) -> Result<(Subnet, bool), Error> {
        if let Some(subnet) =
            self.subnet_cache.as_ref().and_then(|c| c.get(subnet_id))
        {
            return Ok((subnet, true));
        }
        self.fetch_subnet(opctx, subnet_id).await.map(|subnet| (subnet, false))
    }

    async fn fetch_subnet(
        &self,
        opctx: &OpContext,
        subnet_id: &SubnetId,
    ) -> Result<Subnet, Error> {
        match self.store.get_subnet(opctx, subnet_id).await {
            Ok(subnet) => {
                if let Some(cache) = &self.subnet_cache {
                    cache.insert(subnet.clone());
                }
                Ok(subnet)
            }
            Err(err) => {
                Err(Error::SubnetLookup { subnet_id: subnet_id.clone(), err })
            }
        }
    }

    fn binding_capabilities(&self) -> Option<BindingCapabilities> {
        self.store
            .supports_binding_capabilities()
            .then_some(BindingCapabilities { port_filter: false })
    }

    fn port_request(
        &self,
        subnet: &Subnet,
        name: &str,
        mac_address: Option<MacAddr6>,
        device_id: String,
        fixed_ips: Vec<FixedIp>,
    ) -> PortCreate {
        PortCreate {
            tenant_id: subnet.tenant_id.clone(),
            name: name.to_string(),
            network_id: subnet.network_id.clone(),
            mac_address,
            admin_state_up: true,
            device_id,
            device_owner: DEVICE_OWNER_LBAASV2.to_string(),
            status: PortStatus::Active,
            fixed_ips,
            binding_capabilities: self.binding_capabilities(),
        }
    }

    /// Creates the port and forces it `ACTIVE`.
    ///
    /// If the status update fails the new port is removed again, so callers
    /// never get back (or leave behind) a port stuck `DOWN`.
    async fn create_active_port(
        &self,
        opctx: &OpContext,
        subnet_id: &SubnetId,
        request: PortCreate,
    ) -> Result<Port, Error> {
        let port =
            self.store.create_port(opctx, request).await.map_err(|err| {
                warn!(
                    opctx.log,
                    "failed to create port";
                    "subnet_id" => %subnet_id,
                    "error" => %err,
                );
                if err.is_not_found() {
                    if let Some(cache) = &self.subnet_cache {
                        cache.invalidate(subnet_id);
                    }
                }
                Error::CreatePort { subnet_id: subnet_id.clone(), err }
            })?;

        // The store may ignore the requested status and report the port
        // DOWN until something updates it.  It may ignore the update too.
        let update = PortUpdate::status(PortStatus::Active);
        let failure =
            match self.store.update_port(opctx, &port.id, update).await {
                Ok(port) if port.status == PortStatus::Active => {
                    info!(
                        opctx.log,
                        "created port";
                        "port_id" => %port.id,
                        "subnet_id" => %subnet_id,
                    );
                    return Ok(port);
                }
                Ok(updated) => Error::PortNotActive {
                    port_id: updated.id,
                    status: updated.status,
                },
                Err(err) => {
                    Error::ActivatePort { port_id: port.id.clone(), err }
                }
            };

        warn!(
            opctx.log,
            "failed to mark port active, removing it";
            "port_id" => %port.id,
            "error" => %failure,
        );
        if let Err(delete_err) = self.store.delete_port(opctx, &port.id).await
        {
            error!(
                opctx.log,
                "failed to remove port that could not be activated";
                "port_id" => %port.id,
                "error" => %delete_err,
            );
        }
        Err(failure)
    }

    /// Creates a port with `fixed_address_count` store-assigned addresses
    /// on the given subnet.
    ///
    /// Returns `Ok(None)` without touching the store when no subnet is
    /// given.
    pub async fn create_port_on_subnet(
        &self,
        opctx: &OpContext,
        params: &CreatePortParams,
    ) -> Result<Option<Port>, Error> {
        debug!(
            opctx.log,
            "create_port_on_subnet";
            "subnet_id" => ?params.subnet_id,
            "mac_address" => ?params.mac_address,
            "name" => &params.name,
            "fixed_address_count" => params.fixed_address_count,
            "host" => &params.host,
        );
        let Some(subnet_id) = present(params.subnet_id.as_ref()) else {
            return Ok(None);
        };

        let (subnet, _) = self.lookup_subnet(opctx, subnet_id).await?;
        let fixed_ips = vec![
            FixedIp::from_pool(subnet.id.clone());
            params.fixed_address_count.max(1)
        ];
        let device_id = if params.host.is_empty() {
            String::new()
        } else {
            device_id_for_host(&params.host)
        };
        let request = self.port_request(
            &subnet,
            &params.name,
            params.mac_address,
            device_id,
            fixed_ips,
        );
        self.create_active_port(opctx, subnet_id, request).await.map(Some)
    }

    /// Creates a port holding exactly `ip_address` on the given subnet.
    ///
    /// The device id is derived from `host`, so repeated calls for one host
    /// agree on it.  Returns `Ok(None)` without touching the store unless
    /// both the subnet and the address are given.
    pub async fn create_port_on_subnet_with_specific_ip(
        &self,
        opctx: &OpContext,
        params: &SpecificIpPortParams,
    ) -> Result<Option<Port>, Error> {
        debug!(
            opctx.log,
            "create_port_on_subnet_with_specific_ip";
            "subnet_id" => ?params.subnet_id,
            "mac_address" => ?params.mac_address,
            "ip_address" => ?params.ip_address,
            "name" => &params.name,
            "host" => &params.host,
        );
        let (Some(subnet_id), Some(ip)) =
            (present(params.subnet_id.as_ref()), params.ip_address)
        else {
            return Ok(None);
        };

        let (mut subnet, cached) =
            self.lookup_subnet(opctx, subnet_id).await?;
        if cached && !subnet.cidr.contains(ip) {
            // The subnet's CIDR may have changed since it was cached.
            debug!(
                opctx.log,
                "cached subnet does not contain address, refetching";
                "subnet_id" => %subnet_id,
            );
            subnet = self.fetch_subnet(opctx, subnet_id).await?;
        }
        if !subnet.cidr.contains(ip) {
            return Err(Error::AddressNotInSubnet {
                ip,
                subnet_id: subnet.id,
                cidr: subnet.cidr,
            });
        }
        let request = self.port_request(
            &subnet,
            &params.name,
            params.mac_address,
            device_id_for_host(&params.host),
            vec![FixedIp::with_address(subnet.id.clone(), ip)],
        );
        self.create_active_port(opctx, subnet_id, request).await.map(Some)
    }

    /// Creates the port for a pool member at `ip_address`.
    ///
    /// `network_id` is accepted for compatibility but unused: the subnet
    /// alone determines the network.
    pub async fn create_port_for_member(
        &self,
        opctx: &OpContext,
        ip_address: IpAddr,
        mac_address: Option<MacAddr6>,
        network_id: Option<&NetworkId>,
        subnet_id: Option<&SubnetId>,
    ) -> Result<Option<Port>, Error> {
        debug!(
            opctx.log,
            "create_port_for_member";
            "ip_address" => %ip_address,
            "network_id" => ?network_id,
            "subnet_id" => ?subnet_id,
        );
        let params = SpecificIpPortParams {
            subnet_id: subnet_id.cloned(),
            mac_address,
            ip_address: Some(ip_address),
            ..Default::default()
        };
        self.create_port_on_subnet_with_specific_ip(opctx, &params).await
    }

    /// Returns all ports named exactly `name`
    pub async fn get_port_by_name(
        &self,
        opctx: &OpContext,
        name: &str,
    ) -> Result<Vec<Port>, Error> {
        debug!(opctx.log, "get_port_by_name"; "name" => name);
        if name.is_empty() {
            return Ok(Vec::new());
        }
        self.store
            .get_ports(opctx, &PortFilters::by_name(name))
            .await
            .map_err(Error::ListPorts)
    }

    /// Returns ports with an address on `subnet_id`, restricted to
    /// `ip_address` when given
    pub async fn get_ports_for_fixedip(
        &self,
        opctx: &OpContext,
        subnet_id: Option<&SubnetId>,
        ip_address: Option<IpAddr>,
    ) -> Result<Vec<Port>, Error> {
        debug!(
            opctx.log,
            "get_ports_for_fixedip";
            "subnet_id" => ?subnet_id,
            "ip_address" => ?ip_address,
        );
        let Some(subnet_id) = present(subnet_id) else {
            return Ok(Vec::new());
        };
        let filters = PortFilters::by_fixed_ip(subnet_id.clone(), ip_address);
        self.store.get_ports(opctx, &filters).await.map_err(|err| {
            warn!(
                opctx.log,
                "failed to list ports for fixed ip";
                "subnet_id" => %subnet_id,
                "error" => %err,
            );
            Error::ListPorts(err)
        })
    }

    /// Deletes the port `port_id`, or else every port with `mac_address`.
    ///
    /// Does nothing when neither is given.  Returns the ids removed.  When
    /// deleting by MAC address, every matching port is attempted; if any
    /// could not be removed the error carries the full outcome.
    pub async fn delete_port(
        &self,
        opctx: &OpContext,
        port_id: Option<&PortId>,
        mac_address: Option<MacAddr6>,
    ) -> Result<Vec<PortId>, Error> {
        debug!(
            opctx.log,
            "delete_port";
            "port_id" => ?port_id,
            "mac_address" => ?mac_address,
        );
        let ports = match (port_id.filter(|id| !id.is_empty()), mac_address) {
            (Some(port_id), _) => {
                self.store.delete_port(opctx, port_id).await.map_err(
                    |err| Error::DeletePort { port_id: port_id.clone(), err },
                )?;
                info!(opctx.log, "deleted port"; "port_id" => %port_id);
                return Ok(vec![port_id.clone()]);
            }
            (None, Some(mac)) => self
                .store
                .get_ports(opctx, &PortFilters::by_mac_address(mac))
                .await
                .map_err(Error::ListPorts)?,
            (None, None) => return Ok(Vec::new()),
        };

        let mut outcome = DeleteOutcome::default();
        self.delete_each(opctx, ports, &mut outcome).await;
        if outcome.is_complete() {
            Ok(outcome.deleted)
        } else {
            Err(Error::IncompleteDelete { outcome })
        }
    }

    /// Deletes every port named exactly `name`.
    ///
    /// Never fails: each failure is logged and reported in the outcome, and
    /// the remaining ports are still attempted.
    pub async fn delete_port_by_name(
        &self,
        opctx: &OpContext,
        name: &str,
    ) -> DeleteOutcome {
        debug!(opctx.log, "delete_port_by_name"; "name" => name);
        let mut outcome = DeleteOutcome::default();
        if name.is_empty() {
            return outcome;
        }

        let ports =
            match self.store.get_ports(opctx, &PortFilters::by_name(name)).await
            {
                Ok(ports) => ports,
                Err(error) => {
                    error!(
                        opctx.log,
                        "failed to delete port: could not list ports";
                        "name" => name,
                        "error" => %error,
                    );
                    outcome
                        .failures
                        .push(DeleteFailure { port_id: None, error });
                    return outcome;
                }
            };
        self.delete_each(opctx, ports, &mut outcome).await;
        outcome
    }

    async fn delete_each(
        &self,
        opctx: &OpContext,
        ports: Vec<Port>,
        outcome: &mut DeleteOutcome,
    ) {
        for port in ports {
            match self.store.delete_port(opctx, &port.id).await {
                Ok(()) => {
                    info!(opctx.log, "deleted port"; "port_id" => %port.id);
                    outcome.deleted.push(port.id);
                }
                Err(error) => {
                    error!(
                        opctx.log,
                        "failed to delete port";
                        "port_id" => %port.id,
                        "error" => %error,
                    );
                    outcome
                        .failures
                        .push(DeleteFailure { port_id: Some(port.id), error });
                }
            }
        }
    }
}
