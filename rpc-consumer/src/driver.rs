// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The driver object the consumer serves

use crate::agent_callback::AgentRegistry;
use crate::agent_callback::AgentStatusCallback;
use crate::config::DriverConfig;
use crate::endpoint::RpcEndpoint;
use crate::plugin_rpc::PluginRpc;
use lbaas_common::ResourceStore;
use lbaas_port_provisioner::PortProvisioner;
use slog::o;
use slog::Logger;
use std::fmt;
use std::sync::Arc;

/// Owns the driver's port provisioner and the endpoints that expose it
pub struct LbaasDriver {
    environment: Option<String>,
    provisioner: Arc<PortProvisioner>,
    plugin_rpc: Arc<PluginRpc>,
    agent_callback: Arc<AgentStatusCallback>,
}

impl LbaasDriver {
    pub fn new(
        log: &Logger,
        config: &DriverConfig,
        store: Arc<dyn ResourceStore>,
    ) -> Self {
        let log = log.new(o!("component" => "LbaasDriver"));
        let mut provisioner = PortProvisioner::new(&log, store);
        if let Some(ttl) = config.subnet_cache_ttl() {
            provisioner = provisioner.with_subnet_cache(ttl);
        }
        let provisioner = Arc::new(provisioner);
        let plugin_rpc = Arc::new(PluginRpc::new(&log, provisioner.clone()));
        let agent_callback =
            Arc::new(AgentStatusCallback::new(&log, AgentRegistry::new()));
        Self {
            environment: config.environment().map(str::to_string),
            provisioner,
            plugin_rpc,
            agent_callback,
        }
    }

    /// The deployment environment tag, if one is set
    pub fn environment(&self) -> Option<&str> {
        self.environment.as_deref()
    }

    pub fn provisioner(&self) -> &Arc<PortProvisioner> {
        &self.provisioner
    }

    pub fn plugin_rpc(&self) -> &Arc<PluginRpc> {
        &self.plugin_rpc
    }

    pub fn agents(&self) -> &AgentRegistry {
        self.agent_callback.agents()
    }

    /// The endpoints to register with the consumer: the driver's own first,
    /// then the agent status callback
    pub fn endpoints(&self) -> Vec<Arc<dyn RpcEndpoint>> {
        let plugin_rpc: Arc<dyn RpcEndpoint> = self.plugin_rpc.clone();
        let agent_callback: Arc<dyn RpcEndpoint> = self.agent_callback.clone();
        vec![plugin_rpc, agent_callback]
    }
}

impl fmt::Display for LbaasDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.environment() {
            Some(env) => write!(f, "f5 lbaas driver ({env})"),
            None => write!(f, "f5 lbaas driver"),
        }
    }
}
