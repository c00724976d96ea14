// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Provisioning of the network ports that anchor load balancer virtual
//! servers and members to tenant subnets.

mod provisioner;
mod subnet_cache;

pub use provisioner::CreatePortParams;
pub use provisioner::DeleteFailure;
pub use provisioner::DeleteOutcome;
pub use provisioner::Error;
pub use provisioner::PortProvisioner;
pub use provisioner::SpecificIpPortParams;
pub use subnet_cache::SubnetCache;
