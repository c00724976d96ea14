// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Remote methods through which agents manage load balancer ports

use crate::bus::RpcReply;
use crate::endpoint::decode_args;
use crate::endpoint::encode_reply;
use crate::endpoint::RpcEndpoint;
use crate::endpoint::RpcError;
use async_trait::async_trait;
use lbaas_common::api::NetworkId;
use lbaas_common::api::PortId;
use lbaas_common::api::SubnetId;
use lbaas_common::OpContext;
use lbaas_port_provisioner::CreatePortParams;
use lbaas_port_provisioner::PortProvisioner;
use lbaas_port_provisioner::SpecificIpPortParams;
use macaddr::MacAddr6;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use slog::o;
use slog::Logger;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use strum::VariantNames;

#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    PartialEq,
    strum::EnumString,
    strum::IntoStaticStr,
    strum::VariantNames,
)]
#[strum(serialize_all = "snake_case")]
pub enum PluginRpcMethod {
    CreatePortOnSubnet,
    CreatePortOnSubnetWithSpecificIp,
    CreatePortForMember,
    GetPortByName,
    GetPortsForFixedip,
    DeletePort,
    DeletePortByName,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CreatePortForMemberArgs {
    pub ip_address: IpAddr,
    #[serde(default)]
    pub mac_address: Option<MacAddr6>,
    #[serde(default)]
    pub network_id: Option<NetworkId>,
    #[serde(default)]
    pub subnet_id: Option<SubnetId>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PortNameArgs {
    #[serde(default)]
    pub port_name: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct DeletePortArgs {
    #[serde(default)]
    pub port_id: Option<PortId>,
    #[serde(default)]
    pub mac_address: Option<MacAddr6>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct FixedIpArgs {
    #[serde(default)]
    pub subnet_id: Option<SubnetId>,
    #[serde(default)]
    pub ip_address: Option<IpAddr>,
}

/// The driver's endpoint, servicing port requests from agents
pub struct PluginRpc {
    log: Logger,
    provisioner: Arc<PortProvisioner>,
}

impl PluginRpc {
    pub fn new(log: &Logger, provisioner: Arc<PortProvisioner>) -> Self {
        Self { log: log.new(o!("component" => "PluginRpc")), provisioner }
    }

    async fn call(
        &self,
        opctx: &OpContext,
        method: PluginRpcMethod,
        args: Value,
    ) -> RpcReply {
        let name: &'static str = method.into();
        let failed = |err: lbaas_port_provisioner::Error| {
            let retryable = err.retryable();
            RpcError::failed(name, &err, retryable)
        };
        let p = &self.provisioner;

        match method {
            PluginRpcMethod::CreatePortOnSubnet => {
                let params: CreatePortParams = decode_args(name, args)?;
                let port = p
                    .create_port_on_subnet(opctx, &params)
                    .await
                    .map_err(failed)?;
                encode_reply(name, &port)
            }
            PluginRpcMethod::CreatePortOnSubnetWithSpecificIp => {
                let params: SpecificIpPortParams = decode_args(name, args)?;
                let port = p
                    .create_port_on_subnet_with_specific_ip(opctx, &params)
                    .await
                    .map_err(failed)?;
                encode_reply(name, &port)
            }
            PluginRpcMethod::CreatePortForMember => {
                let args: CreatePortForMemberArgs = decode_args(name, args)?;
                let port = p
                    .create_port_for_member(
                        opctx,
                        args.ip_address,
                        args.mac_address,
                        args.network_id.as_ref(),
                        args.subnet_id.as_ref(),
                    )
                    .await
                    .map_err(failed)?;
                encode_reply(name, &port)
            }
            PluginRpcMethod::GetPortByName => {
                let args: PortNameArgs = decode_args(name, args)?;
                let ports = p
                    .get_port_by_name(opctx, &args.port_name)
                    .await
                    .map_err(failed)?;
                encode_reply(name, &ports)
            }
            PluginRpcMethod::GetPortsForFixedip => {
                let args: FixedIpArgs = decode_args(name, args)?;
                let ports = p
                    .get_ports_for_fixedip(
                        opctx,
                        args.subnet_id.as_ref(),
                        args.ip_address,
                    )
                    .await
                    .map_err(failed)?;
                encode_reply(name, &ports)
            }
            PluginRpcMethod::DeletePort => {
                let args: DeletePortArgs = decode_args(name, args)?;
                let deleted = p
                    .delete_port(opctx, args.port_id.as_ref(), args.mac_address)
                    .await
                    .map_err(failed)?;
                encode_reply(name, &deleted)
            }
            PluginRpcMethod::DeletePortByName => {
                let args: PortNameArgs = decode_args(name, args)?;
                let outcome =
                    p.delete_port_by_name(opctx, &args.port_name).await;
                encode_reply(name, &outcome)
            }
        }
    }
}

#[async_trait]
impl RpcEndpoint for PluginRpc {
    fn name(&self) -> &'static str {
        "plugin_rpc"
    }

    fn methods(&self) -> &'static [&'static str] {
        PluginRpcMethod::VARIANTS
    }

    async fn dispatch(&self, method: &str, args: Value) -> RpcReply {
        let Ok(which) = PluginRpcMethod::from_str(method) else {
            return Err(RpcError::UnknownMethod { method: method.to_string() });
        };
        let opctx = OpContext::for_rpc(&self.log, method);
        self.call(&opctx, which, args).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use lbaas_common::api::Port;
    use lbaas_common::api::PortStatus;
    use lbaas_common::store::ResourceType;
    use lbaas_common::StoreError;
    use lbaas_port_provisioner::DeleteOutcome;
    use lbaas_test_utils::dev::test_setup_log;
    use lbaas_test_utils::fake_store::FakeResourceStore;
    use lbaas_test_utils::fake_store::StoreOp;
    use serde_json::json;

    fn setup(log: &Logger) -> (Arc<FakeResourceStore>, PluginRpc) {
        let store = Arc::new(FakeResourceStore::new(log));
        store.add_subnet("sub-1", "10.1.0.0/24");
        let provisioner = Arc::new(PortProvisioner::new(log, store.clone()));
        (store, PluginRpc::new(log, provisioner))
    }

    #[test]
    fn test_method_names() {
        assert_eq!(
            PluginRpcMethod::VARIANTS,
            &[
                "create_port_on_subnet",
                "create_port_on_subnet_with_specific_ip",
                "create_port_for_member",
                "get_port_by_name",
                "get_ports_for_fixedip",
                "delete_port",
                "delete_port_by_name",
            ]
        );
    }

    #[tokio::test]
    async fn test_create_and_find_port() {
        let logctx = test_setup_log("test_create_and_find_port");
        let (_store, rpc) = setup(&logctx.log);

        let reply = rpc
            .dispatch(
                "create_port_on_subnet_with_specific_ip",
                json!({
                    "subnet_id": "sub-1",
                    "ip_address": "10.1.0.50",
                    "name": "vip-1",
                    "host": "bigip-1",
                }),
            )
            .await
            .unwrap();
        let port: Port = serde_json::from_value(reply).unwrap();
        assert_eq!(port.status, PortStatus::Active);
        assert_eq!(port.name, "vip-1");

        let reply = rpc
            .dispatch("get_port_by_name", json!({ "port_name": "vip-1" }))
            .await
            .unwrap();
        let ports: Vec<Port> = serde_json::from_value(reply).unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].id, port.id);

        let reply = rpc
            .dispatch(
                "get_ports_for_fixedip",
                json!({ "subnet_id": "sub-1", "ip_address": "10.1.0.50" }),
            )
            .await
            .unwrap();
        let ports: Vec<Port> = serde_json::from_value(reply).unwrap();
        assert_eq!(ports.len(), 1);

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_missing_arguments_reply_null() {
        let logctx = test_setup_log("test_missing_arguments_reply_null");
        let (store, rpc) = setup(&logctx.log);

        let reply =
            rpc.dispatch("create_port_on_subnet", Value::Null).await.unwrap();
        assert_eq!(reply, Value::Null);
        let reply = rpc.dispatch("delete_port", json!({})).await.unwrap();
        assert_eq!(reply, json!([]));
        assert!(store.calls().is_empty());

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_errors() {
        let logctx = test_setup_log("test_errors");
        let (store, rpc) = setup(&logctx.log);

        let err = rpc
            .dispatch("create_port_for_member", json!({ "subnet_id": "sub-1" }))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::InvalidArguments { .. }));

        let err = rpc.dispatch("no_such_method", json!({})).await.unwrap_err();
        assert!(matches!(err, RpcError::UnknownMethod { .. }));

        store.fail_next(StoreOp::GetSubnet, StoreError::unavailable("down"));
        let err = rpc
            .dispatch(
                "create_port_for_member",
                json!({ "ip_address": "10.1.0.9", "subnet_id": "sub-1" }),
            )
            .await
            .unwrap_err();
        assert!(err.retryable());
        match err {
            RpcError::Failed { method, message, .. } => {
                assert_eq!(method, "create_port_for_member");
                assert!(message.contains("sub-1"), "{message}");
                assert!(message.contains("down"), "{message}");
            }
            other => panic!("unexpected error: {other}"),
        }

        store.fail_next(
            StoreOp::GetSubnet,
            StoreError::not_found(ResourceType::Subnet, "sub-2"),
        );
        let err = rpc
            .dispatch(
                "create_port_on_subnet",
                json!({ "subnet_id": "sub-2" }),
            )
            .await
            .unwrap_err();
        assert!(!err.retryable());

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_delete_by_name_reports_outcome() {
        let logctx = test_setup_log("test_delete_by_name_reports_outcome");
        let (store, rpc) = setup(&logctx.log);

        for _ in 0..2 {
            rpc.dispatch(
                "create_port_on_subnet",
                json!({ "subnet_id": "sub-1", "name": "snat-1" }),
            )
            .await
            .unwrap();
        }
        store.fail_next(StoreOp::DeletePort, StoreError::internal("boom"));
        let reply = rpc
            .dispatch("delete_port_by_name", json!({ "port_name": "snat-1" }))
            .await
            .unwrap();
        let outcome: DeleteOutcome = serde_json::from_value(reply).unwrap();
        assert_eq!(outcome.deleted.len(), 1);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(store.ports().len(), 1);

        logctx.cleanup_successful();
    }
}
