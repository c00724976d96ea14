// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Message bus consumer for the F5 LBaaS driver
//!
//! An [`RpcConsumer`] subscribes to the driver's topic and hands each
//! incoming remote call to whichever registered [`RpcEndpoint`] claims the
//! call's method name.  The driver's own endpoint ([`PluginRpc`]) services
//! port requests through the port provisioner.

pub mod agent_callback;
pub mod bus;
pub mod config;
mod consumer;
pub mod driver;
pub mod endpoint;
pub mod local_bus;
pub mod plugin_rpc;
pub mod topic;

pub use agent_callback::AgentStatusCallback;
pub use config::Config;
pub use consumer::Error;
pub use consumer::RpcConsumer;
pub use driver::LbaasDriver;
pub use endpoint::EndpointRegistry;
pub use endpoint::RpcEndpoint;
pub use endpoint::RpcError;
pub use plugin_rpc::PluginRpc;
pub use topic::Topic;
