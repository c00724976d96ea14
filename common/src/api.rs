// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Network port and subnet records as exchanged with the resource store

use ipnetwork::IpNetwork;
use macaddr::MacAddr6;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use uuid::Uuid;

/// Device owner tag marking a port as created and managed by this driver.
pub const DEVICE_OWNER_LBAASV2: &str = "network:f5lbaasv2";

macro_rules! opaque_id {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(
            Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq,
            PartialOrd, Serialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Identifiers are assigned by the store; an empty one is
            /// treated the same as an absent one.
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

opaque_id!(
    /// Store-assigned identifier of a port.
    PortId
);
opaque_id!(
    /// Store-assigned identifier of a subnet.
    SubnetId
);
opaque_id!(NetworkId);
opaque_id!(TenantId);

/// Operational status of a port.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    PartialEq,
    Serialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum PortStatus {
    Active,
    Down,
    Build,
    Error,
}

/// An address assignment binding a port to a subnet.
///
/// Without `ip_address` the store picks an address from the subnet's pool.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FixedIp {
    pub subnet_id: SubnetId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<IpAddr>,
}

impl FixedIp {
    pub fn from_pool(subnet_id: SubnetId) -> Self {
        Self { subnet_id, ip_address: None }
    }

    pub fn with_address(subnet_id: SubnetId, ip_address: IpAddr) -> Self {
        Self { subnet_id, ip_address: Some(ip_address) }
    }
}

/// Port binding capabilities, only sent to stores that understand them.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct BindingCapabilities {
    pub port_filter: bool,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Subnet {
    pub id: SubnetId,
    pub tenant_id: TenantId,
    pub network_id: NetworkId,
    #[serde(default)]
    pub name: String,
    pub cidr: IpNetwork,
}

/// A virtual network attachment, as reported by the store.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Port {
    pub id: PortId,
    pub tenant_id: TenantId,
    pub name: String,
    pub network_id: NetworkId,
    pub mac_address: MacAddr6,
    pub admin_state_up: bool,
    pub status: PortStatus,
    pub device_id: String,
    pub device_owner: String,
    pub fixed_ips: Vec<FixedIp>,
    #[serde(
        rename = "binding:capabilities",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub binding_capabilities: Option<BindingCapabilities>,
}

/// Fields of a port creation request.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PortCreate {
    pub tenant_id: TenantId,
    pub name: String,
    pub network_id: NetworkId,
    /// Left to the store when absent.
    pub mac_address: Option<MacAddr6>,
    pub admin_state_up: bool,
    pub device_id: String,
    pub device_owner: String,
    /// Requested status. Stores are free to ignore this.
    pub status: PortStatus,
    pub fixed_ips: Vec<FixedIp>,
    #[serde(
        rename = "binding:capabilities",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub binding_capabilities: Option<BindingCapabilities>,
}

/// Fields of a port update request; `None` leaves a field unchanged.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct PortUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PortStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_state_up: Option<bool>,
}

impl PortUpdate {
    pub fn status(status: PortStatus) -> Self {
        Self { status: Some(status), ..Default::default() }
    }
}

/// Compound match on a port's fixed IPs.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FixedIpFilter {
    pub subnet_id: SubnetId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<IpAddr>,
}

/// Filters for listing ports.
///
/// List-valued filters match when the port's value is any of the listed
/// values; all present filters must match.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct PortFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<Vec<MacAddr6>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_ips: Option<FixedIpFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_owner: Option<Vec<String>>,
}

impl PortFilters {
    pub fn by_name(name: &str) -> Self {
        Self { name: Some(vec![name.to_string()]), ..Default::default() }
    }

    pub fn by_mac_address(mac: MacAddr6) -> Self {
        Self { mac_address: Some(vec![mac]), ..Default::default() }
    }

    pub fn by_fixed_ip(
        subnet_id: SubnetId,
        ip_address: Option<IpAddr>,
    ) -> Self {
        Self {
            fixed_ips: Some(FixedIpFilter { subnet_id, ip_address }),
            ..Default::default()
        }
    }

    pub fn matches(&self, port: &Port) -> bool {
        if let Some(names) = &self.name {
            if !names.iter().any(|n| *n == port.name) {
                return false;
            }
        }
        if let Some(macs) = &self.mac_address {
            if !macs.contains(&port.mac_address) {
                return false;
            }
        }
        if let Some(owners) = &self.device_owner {
            if !owners.iter().any(|o| *o == port.device_owner) {
                return false;
            }
        }
        if let Some(filter) = &self.fixed_ips {
            let hit = port.fixed_ips.iter().any(|ip| {
                ip.subnet_id == filter.subnet_id
                    && match filter.ip_address {
                        Some(want) => ip.ip_address == Some(want),
                        None => true,
                    }
            });
            if !hit {
                return false;
            }
        }
        true
    }
}

/// Device identifier for ports bound to `host`.
///
/// This is a name-based (v5) UUID in the DNS namespace, so every caller
/// naming the same host computes the same identifier.
pub fn device_id_for_host(host: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_DNS, host.as_bytes()).to_string()
}
