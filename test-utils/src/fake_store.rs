// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An in-memory [`ResourceStore`] for tests
//!
//! New ports come back `DOWN` regardless of the requested status, the way
//! the ML2 plugin behaves, so tests exercise the provisioner's follow-up
//! status update.  Every call is recorded, any operation can be made to
//! fail once or persistently, and status updates can be silently dropped.

use async_trait::async_trait;
use ipnetwork::IpNetwork;
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
use lbaas_common::api::TenantId;
use lbaas_common::store::ResourceType;
use lbaas_common::OpContext;
use lbaas_common::ResourceStore;
use lbaas_common::StoreError;
use macaddr::MacAddr6;
use slog::debug;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

/// Store operations, for fault injection and call inspection
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StoreOp {
    GetSubnet,
    CreatePort,
    UpdatePort,
    GetPorts,
    DeletePort,
}

/// A recorded call into the store
#[derive(Clone, Debug, PartialEq)]
pub enum StoreCall {
    GetSubnet(SubnetId),
    CreatePort(PortCreate),
    UpdatePort(PortId, PortUpdate),
    GetPorts(PortFilters),
    DeletePort(PortId),
}

impl StoreCall {
    pub fn op(&self) -> StoreOp {
        match self {
            StoreCall::GetSubnet(_) => StoreOp::GetSubnet,
            StoreCall::CreatePort(_) => StoreOp::CreatePort,
            StoreCall::UpdatePort(..) => StoreOp::UpdatePort,
            StoreCall::GetPorts(_) => StoreOp::GetPorts,
            StoreCall::DeletePort(_) => StoreOp::DeletePort,
        }
    }
}

#[derive(Debug)]
struct Fault {
    op: StoreOp,
    error: StoreError,
    persistent: bool,
}

#[derive(Debug, Default)]
struct Inner {
    subnets: BTreeMap<SubnetId, Subnet>,
    ports: BTreeMap<PortId, Port>,
    calls: Vec<StoreCall>,
    faults: Vec<Fault>,
    next_port: u64,
}

impl Inner {
    fn record(&mut self, call: StoreCall) -> Result<(), StoreError> {
        let op = call.op();
        self.calls.push(call);
        let Some(idx) = self.faults.iter().position(|f| f.op == op) else {
            return Ok(());
        };
        if self.faults[idx].persistent {
            Err(self.faults[idx].error.clone())
        } else {
            Err(self.faults.remove(idx).error)
        }
    }

    fn address_in_use(&self, subnet_id: &SubnetId, ip: IpAddr) -> bool {
        self.ports.values().any(|port| {
            port.fixed_ips.iter().any(|fixed| {
                fixed.subnet_id == *subnet_id && fixed.ip_address == Some(ip)
            })
        })
    }

    // The network address and the gateway (first host) are never handed
    // out.
    fn allocate(
        &self,
        subnet: &Subnet,
        taken: &[IpAddr],
    ) -> Result<IpAddr, StoreError> {
        subnet
            .cidr
            .iter()
            .skip(2)
            .find(|ip| {
                !taken.contains(ip) && !self.address_in_use(&subnet.id, *ip)
            })
            .ok_or_else(|| StoreError::Conflict {
                message: format!("no addresses left in subnet {}", subnet.id),
            })
    }
}

pub struct FakeResourceStore {
    log: slog::Logger,
    inner: Mutex<Inner>,
    binding_capabilities: AtomicBool,
    ignore_status_updates: AtomicBool,
}

impl FakeResourceStore {
    pub fn new(log: &slog::Logger) -> Self {
        Self {
            log: log.new(slog::o!("component" => "FakeResourceStore")),
            inner: Mutex::new(Inner::default()),
            binding_capabilities: AtomicBool::new(false),
            ignore_status_updates: AtomicBool::new(false),
        }
    }

    /// Adds a subnet with the given CIDR, owned by tenant "tenant-1" on
    /// network "net-1"
    pub fn add_subnet(&self, id: &str, cidr: &str) -> Subnet {
        let cidr: IpNetwork = cidr.parse().expect("valid CIDR");
        let subnet = Subnet {
            id: SubnetId::from(id),
            tenant_id: TenantId::from("tenant-1"),
            network_id: NetworkId::from("net-1"),
            name: format!("subnet-{id}"),
            cidr,
        };
        self.inner
            .lock()
            .unwrap()
            .subnets
            .insert(subnet.id.clone(), subnet.clone());
        subnet
    }

    pub fn remove_subnet(&self, id: &str) {
        self.inner.lock().unwrap().subnets.remove(&SubnetId::from(id));
    }

    pub fn set_supports_binding_capabilities(&self, supported: bool) {
        self.binding_capabilities.store(supported, Ordering::SeqCst);
    }

    /// Fail the next call of `op` with `error`
    pub fn fail_next(&self, op: StoreOp, error: StoreError) {
        self.inner.lock().unwrap().faults.push(Fault {
            op,
            error,
            persistent: false,
        });
    }

    /// Fail every call of `op` with `error` until [`Self::clear_faults`]
    pub fn fail_always(&self, op: StoreOp, error: StoreError) {
        self.inner.lock().unwrap().faults.push(Fault {
            op,
            error,
            persistent: true,
        });
    }

    pub fn clear_faults(&self) {
        self.inner.lock().unwrap().faults.clear();
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn calls_of(&self, op: StoreOp) -> Vec<StoreCall> {
        self.calls().into_iter().filter(|c| c.op() == op).collect()
    }

    pub fn clear_calls(&self) {
        self.inner.lock().unwrap().calls.clear();
    }

    pub fn ports(&self) -> Vec<Port> {
        self.inner.lock().unwrap().ports.values().cloned().collect()
    }

    pub fn port(&self, id: &PortId) -> Option<Port> {
        self.inner.lock().unwrap().ports.get(id).cloned()
    }

    /// Acknowledge port status updates without applying them
    pub fn set_ignore_status_updates(&self, ignore: bool) {
        self.ignore_status_updates.store(ignore, Ordering::SeqCst);
    }
}

#[async_trait]
impl ResourceStore for FakeResourceStore {
    async fn get_subnet(
        &self,
        _opctx: &OpContext,
        subnet_id: &SubnetId,
    ) -> Result<Subnet, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.record(StoreCall::GetSubnet(subnet_id.clone()))?;
        inner
            .subnets
            .get(subnet_id)
            .cloned()
            .ok_or_else(|| {
                StoreError::not_found(ResourceType::Subnet, subnet_id)
            })
    }

    async fn create_port(
        &self,
        _opctx: &OpContext,
        request: PortCreate,
    ) -> Result<Port, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.record(StoreCall::CreatePort(request.clone()))?;

        let mut taken = Vec::new();
        let mut fixed_ips = Vec::with_capacity(request.fixed_ips.len());
        for fixed in &request.fixed_ips {
            let subnet = inner
                .subnets
                .get(&fixed.subnet_id)
                .cloned()
                .ok_or_else(|| {
                    StoreError::not_found(
                        ResourceType::Subnet,
                        &fixed.subnet_id,
                    )
                })?;
            let ip = match fixed.ip_address {
                Some(ip) => {
                    if !subnet.cidr.contains(ip) {
                        return Err(StoreError::InvalidRequest {
                            message: format!(
                                "{ip} is not within subnet {} ({})",
                                subnet.id, subnet.cidr
                            ),
                        });
                    }
                    if taken.contains(&ip)
                        || inner.address_in_use(&subnet.id, ip)
                    {
                        return Err(StoreError::Conflict {
                            message: format!(
                                "{ip} already allocated in subnet {}",
                                subnet.id
                            ),
                        });
                    }
                    ip
                }
                None => inner.allocate(&subnet, &taken)?,
            };
            taken.push(ip);
            fixed_ips.push(FixedIp::with_address(subnet.id.clone(), ip));
        }

        inner.next_port += 1;
        let n = inner.next_port;
        let mac_address = request.mac_address.unwrap_or_else(|| {
            let b = n.to_be_bytes();
            MacAddr6::new(0xfa, 0x16, 0x3e, b[5], b[6], b[7])
        });
        let port = Port {
            id: PortId::new(format!("port-{n}")),
            tenant_id: request.tenant_id,
            name: request.name,
            network_id: request.network_id,
            mac_address,
            admin_state_up: request.admin_state_up,
            status: PortStatus::Down,
            device_id: request.device_id,
            device_owner: request.device_owner,
            fixed_ips,
            binding_capabilities: request.binding_capabilities,
        };
        inner.ports.insert(port.id.clone(), port.clone());
        debug!(self.log, "created port"; "port_id" => %port.id);
        Ok(port)
    }

    async fn update_port(
        &self,
        _opctx: &OpContext,
        port_id: &PortId,
        update: PortUpdate,
    ) -> Result<Port, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.record(StoreCall::UpdatePort(port_id.clone(), update.clone()))?;
        let port = inner
            .ports
            .get_mut(port_id)
            .ok_or_else(|| StoreError::not_found(ResourceType::Port, port_id))?;
        if let Some(status) = update.status {
            if !self.ignore_status_updates.load(Ordering::SeqCst) {
                port.status = status;
            }
        }
        if let Some(name) = update.name {
            port.name = name;
        }
        if let Some(admin_state_up) = update.admin_state_up {
            port.admin_state_up = admin_state_up;
        }
        Ok(port.clone())
    }

    async fn get_ports(
        &self,
        _opctx: &OpContext,
        filters: &PortFilters,
    ) -> Result<Vec<Port>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.record(StoreCall::GetPorts(filters.clone()))?;
        Ok(inner
            .ports
            .values()
            .filter(|p| filters.matches(p))
            .cloned()
            .collect())
    }

    async fn delete_port(
        &self,
        _opctx: &OpContext,
        port_id: &PortId,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.record(StoreCall::DeletePort(port_id.clone()))?;
        match inner.ports.remove(port_id) {
            Some(_) => {
                debug!(self.log, "deleted port"; "port_id" => %port_id);
                Ok(())
            }
            None => Err(StoreError::not_found(ResourceType::Port, port_id)),
        }
    }

    fn supports_binding_capabilities(&self) -> bool {
        self.binding_capabilities.load(Ordering::SeqCst)
    }
}
