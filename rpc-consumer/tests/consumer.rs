// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tests driving the consumer over the in-process message bus

use anyhow::Context;
use async_trait::async_trait;
use lbaas_common::api::device_id_for_host;
use lbaas_common::api::Port;
use lbaas_common::api::PortStatus;
use lbaas_common::api::DEVICE_OWNER_LBAASV2;
use lbaas_rpc_consumer::bus::RpcReply;
use lbaas_rpc_consumer::config::DriverConfig;
use lbaas_rpc_consumer::config::RpcConfig;
use lbaas_rpc_consumer::local_bus::LocalTransport;
use lbaas_rpc_consumer::topic::TOPIC_PROCESS_ON_HOST_V2;
use lbaas_rpc_consumer::EndpointRegistry;
use lbaas_rpc_consumer::Error;
use lbaas_rpc_consumer::LbaasDriver;
use lbaas_rpc_consumer::RpcConsumer;
use lbaas_rpc_consumer::RpcEndpoint;
use lbaas_rpc_consumer::RpcError;
use lbaas_rpc_consumer::Topic;
use lbaas_test_utils::dev::test_setup_log;
use lbaas_test_utils::fake_store::FakeResourceStore;
use serde_json::json;
use serde_json::Value;
use slog::Logger;
use std::net::IpAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

const EXCHANGE: &str = "common";
const HOST: &str = "controller-1";

fn rpc_config(worker_count: usize) -> RpcConfig {
    RpcConfig {
        transport_url: "local://".to_string(),
        topic_base: TOPIC_PROCESS_ON_HOST_V2.to_string(),
        exchange: EXCHANGE.to_string(),
        host: HOST.to_string(),
        worker_count,
    }
}

fn driver(
    log: &Logger,
    environment: Option<&str>,
) -> (Arc<FakeResourceStore>, LbaasDriver) {
    let store = Arc::new(FakeResourceStore::new(log));
    store.add_subnet("sub-1", "10.1.0.0/24");
    let config = DriverConfig {
        environment: environment.map(str::to_string),
        subnet_cache_ttl_secs: None,
    };
    let driver = LbaasDriver::new(log, &config, store.clone());
    (store, driver)
}

/// Releases calls to [`GatedEndpoint`] one at a time
#[derive(Default)]
struct Gate {
    entered: Notify,
    release: Notify,
}

struct GatedEndpoint {
    gate: Arc<Gate>,
}

#[async_trait]
impl RpcEndpoint for GatedEndpoint {
    fn name(&self) -> &'static str {
        "gated"
    }

    fn methods(&self) -> &'static [&'static str] {
        &["wait"]
    }

    async fn dispatch(&self, _method: &str, _args: Value) -> RpcReply {
        self.gate.entered.notify_one();
        self.gate.release.notified().await;
        Ok(json!("done"))
    }
}

/// Records how many calls it is servicing at once
#[derive(Default)]
struct CountingEndpoint {
    current: AtomicUsize,
    max: AtomicUsize,
}

#[async_trait]
impl RpcEndpoint for CountingEndpoint {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn methods(&self) -> &'static [&'static str] {
        &["work"]
    }

    async fn dispatch(&self, _method: &str, _args: Value) -> RpcReply {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(Value::Null)
    }
}

async fn consumer_with(
    log: &Logger,
    bus: &LocalTransport,
    endpoint: Arc<dyn RpcEndpoint>,
    worker_count: usize,
) -> RpcConsumer {
    let registry = EndpointRegistry::new(vec![endpoint]).unwrap();
    let topic = Topic::new("test-topic", None);
    let Ok(consumer) = RpcConsumer::with_registry(
        log,
        &rpc_config(worker_count),
        topic,
        registry,
        bus,
    )
    .await
    else {
        panic!("failed to create consumer");
    };
    consumer
}

#[tokio::test]
async fn test_specific_ip_port_over_bus() -> anyhow::Result<()> {
    let logctx = test_setup_log("test_specific_ip_port_over_bus");
    let bus = LocalTransport::new();
    let (store, driver) = driver(&logctx.log, Some("prod"));
    let consumer =
        RpcConsumer::new(&logctx.log, &rpc_config(4), &driver, &bus).await?;
    let topic = format!("{TOPIC_PROCESS_ON_HOST_V2}_prod");
    assert_eq!(consumer.topic().as_str(), topic);
    assert!(!consumer.target().fanout);
    assert_eq!(consumer.target().exchange, EXCHANGE);
    consumer.start()?;
    assert!(consumer.is_running());

    let reply = bus
        .call(
            EXCHANGE,
            &topic,
            "create_port_on_subnet_with_specific_ip",
            json!({
                "subnet_id": "sub-1",
                "ip_address": "10.1.0.20",
                "mac_address": "fa:16:3e:00:00:aa",
                "name": "vip-web",
                "host": "bigip-1",
            }),
        )
        .await?
        .context("create_port_on_subnet_with_specific_ip")?;
    let port: Port = serde_json::from_value(reply)?;
    assert_eq!(port.status, PortStatus::Active);
    assert_eq!(port.device_owner, DEVICE_OWNER_LBAASV2);
    assert_eq!(port.device_id, device_id_for_host("bigip-1"));
    assert_eq!(port.fixed_ips.len(), 1);
    assert_eq!(
        port.fixed_ips[0].ip_address,
        Some("10.1.0.20".parse::<IpAddr>()?)
    );
    let stored = store.port(&port.id).context("port missing from store")?;
    assert_eq!(stored.status, PortStatus::Active);
    assert_eq!(consumer.dispatched(), 1);

    // Nothing listens on the unsuffixed topic.
    assert!(bus
        .call(EXCHANGE, TOPIC_PROCESS_ON_HOST_V2, "get_port_by_name", json!({}))
        .await
        .is_err());

    consumer.stop(true).await?;
    assert!(!consumer.is_running());
    assert_eq!(bus.open_connections(), 0);
    assert_eq!(bus.closed_connections(), 1);

    logctx.cleanup_successful();
    Ok(())
}

#[tokio::test]
async fn test_server_topic_and_agent_callback() {
    let logctx = test_setup_log("test_server_topic_and_agent_callback");
    let bus = LocalTransport::new();
    let (_store, driver) = driver(&logctx.log, None);
    let Ok(consumer) =
        RpcConsumer::new(&logctx.log, &rpc_config(4), &driver, &bus).await
    else {
        panic!("failed to create consumer");
    };
    consumer.start().unwrap();

    let server_topic = format!("{TOPIC_PROCESS_ON_HOST_V2}.{HOST}");
    let reply = bus
        .call(
            EXCHANGE,
            &server_topic,
            "report_state",
            json!({
                "agent_state": { "agent_state": {
                    "host": "bigip-agent-1",
                    "binary": "f5-oslbaasv2-agent",
                    "agent_type": "Loadbalancerv2 agent",
                }},
            }),
        )
        .await
        .unwrap();
    assert_eq!(reply, Ok(json!("new")));
    assert_eq!(driver.agents().len(), 1);

    let reply = bus
        .call(EXCHANGE, &server_topic, "has_alive_neutron_server", Value::Null)
        .await
        .unwrap();
    assert_eq!(reply, Ok(json!(true)));

    // reset() reaches the agent callback and clears the counter.
    assert_eq!(consumer.dispatched(), 2);
    consumer.reset();
    assert!(driver.agents().is_empty());
    assert_eq!(consumer.dispatched(), 0);
    assert!(consumer.is_running());

    consumer.stop(true).await.unwrap();
    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_bad_calls_are_answered() {
    let logctx = test_setup_log("test_bad_calls_are_answered");
    let bus = LocalTransport::new();
    let (store, driver) = driver(&logctx.log, None);
    let Ok(consumer) =
        RpcConsumer::new(&logctx.log, &rpc_config(4), &driver, &bus).await
    else {
        panic!("failed to create consumer");
    };
    consumer.start().unwrap();

    let reply = bus
        .call(
            EXCHANGE,
            TOPIC_PROCESS_ON_HOST_V2,
            "update_loadbalancer",
            json!({}),
        )
        .await
        .unwrap();
    assert_eq!(
        reply,
        Err(RpcError::UnknownMethod { method: "update_loadbalancer".into() })
    );

    let reply = bus
        .call(
            EXCHANGE,
            TOPIC_PROCESS_ON_HOST_V2,
            "create_port_on_subnet_with_specific_ip",
            json!({ "subnet_id": "sub-1", "ip_address": "not-an-ip" }),
        )
        .await
        .unwrap();
    assert!(matches!(reply, Err(RpcError::InvalidArguments { .. })));
    assert!(store.calls().is_empty());

    // A cast gets no reply but is still serviced.
    bus.cast(
        EXCHANGE,
        TOPIC_PROCESS_ON_HOST_V2,
        "create_port_on_subnet",
        json!({ "subnet_id": "sub-1", "name": "snat-1" }),
    )
    .await
    .unwrap();
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let ports = store.ports();
            if ports.len() == 1 && ports[0].status == PortStatus::Active {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("cast was never serviced");
    consumer.stop(true).await.unwrap();

    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_graceful_stop_waits_for_in_flight_calls() {
    let logctx =
        test_setup_log("test_graceful_stop_waits_for_in_flight_calls");
    let bus = LocalTransport::new();
    let gate = Arc::new(Gate::default());
    let endpoint = Arc::new(GatedEndpoint { gate: gate.clone() });
    let consumer =
        Arc::new(consumer_with(&logctx.log, &bus, endpoint, 4).await);
    consumer.start().unwrap();

    let call = {
        let bus = bus.clone();
        tokio::spawn(async move {
            bus.call(EXCHANGE, "test-topic", "wait", Value::Null).await
        })
    };
    gate.entered.notified().await;

    let stop = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.stop(true).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!stop.is_finished());
    assert_eq!(bus.closed_connections(), 0);

    gate.release.notify_one();
    stop.await.unwrap().unwrap();
    assert_eq!(bus.closed_connections(), 1);
    assert_eq!(call.await.unwrap().unwrap(), Ok(json!("done")));

    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_immediate_stop_does_not_wait() {
    let logctx = test_setup_log("test_immediate_stop_does_not_wait");
    let bus = LocalTransport::new();
    let gate = Arc::new(Gate::default());
    let endpoint = Arc::new(GatedEndpoint { gate: gate.clone() });
    let consumer = consumer_with(&logctx.log, &bus, endpoint, 4).await;
    consumer.start().unwrap();

    let call = {
        let bus = bus.clone();
        tokio::spawn(async move {
            bus.call(EXCHANGE, "test-topic", "wait", Value::Null).await
        })
    };
    gate.entered.notified().await;

    tokio::time::timeout(Duration::from_secs(10), consumer.stop(false))
        .await
        .expect("stop(false) should not wait for the in-flight call")
        .unwrap();
    assert_eq!(bus.closed_connections(), 1);

    // The abandoned call still completes and replies.
    gate.release.notify_one();
    assert_eq!(call.await.unwrap().unwrap(), Ok(json!("done")));

    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_cancelled_stop_still_releases_connection() {
    let logctx =
        test_setup_log("test_cancelled_stop_still_releases_connection");
    let bus = LocalTransport::new();
    let gate = Arc::new(Gate::default());
    let endpoint = Arc::new(GatedEndpoint { gate: gate.clone() });
    let consumer = consumer_with(&logctx.log, &bus, endpoint, 4).await;
    consumer.start().unwrap();

    let call = {
        let bus = bus.clone();
        tokio::spawn(async move {
            bus.call(EXCHANGE, "test-topic", "wait", Value::Null).await
        })
    };
    gate.entered.notified().await;

    // Give up on the graceful stop while the call is still in flight.
    let result =
        tokio::time::timeout(Duration::from_millis(50), consumer.stop(true))
            .await;
    assert!(result.is_err());
    assert!(!consumer.is_running());
    assert_eq!(bus.open_connections(), 1);
    assert_eq!(bus.closed_connections(), 0);

    // The next stop closes what the cancelled one left open.
    consumer.stop(false).await.unwrap();
    assert_eq!(bus.open_connections(), 0);
    assert_eq!(bus.closed_connections(), 1);

    gate.release.notify_one();
    assert_eq!(call.await.unwrap().unwrap(), Ok(json!("done")));

    consumer.stop(true).await.unwrap();
    assert_eq!(bus.closed_connections(), 1);

    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_lifecycle() {
    let logctx = test_setup_log("test_lifecycle");
    let bus = LocalTransport::new();
    let (_store, driver) = driver(&logctx.log, None);
    let Ok(consumer) =
        RpcConsumer::new(&logctx.log, &rpc_config(4), &driver, &bus).await
    else {
        panic!("failed to create consumer");
    };
    assert_eq!(bus.open_connections(), 1);
    assert_eq!(bus.consumer_count(EXCHANGE, TOPIC_PROCESS_ON_HOST_V2), 1);

    consumer.start().unwrap();
    consumer.start().unwrap();
    assert!(consumer.is_running());

    consumer.stop(true).await.unwrap();
    consumer.stop(false).await.unwrap();
    assert_eq!(bus.closed_connections(), 1);
    assert_eq!(bus.consumer_count(EXCHANGE, TOPIC_PROCESS_ON_HOST_V2), 0);
    assert!(matches!(consumer.start(), Err(Error::AlreadyStopped)));

    // A consumer that never started still releases its connection.
    let Ok(idle) =
        RpcConsumer::new(&logctx.log, &rpc_config(4), &driver, &bus).await
    else {
        panic!("failed to create consumer");
    };
    idle.stop(true).await.unwrap();
    assert_eq!(bus.closed_connections(), 2);
    assert_eq!(bus.open_connections(), 0);

    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_construction_failures() {
    let logctx = test_setup_log("test_construction_failures");
    let bus = LocalTransport::new();
    let (_store, driver) = driver(&logctx.log, None);

    bus.refuse_connections("broker unreachable");
    let result =
        RpcConsumer::new(&logctx.log, &rpc_config(4), &driver, &bus).await;
    assert!(matches!(result, Err(Error::Connect { .. })));
    bus.accept_connections();

    let mut config = rpc_config(4);
    config.transport_url = "amqp://guest@rabbit:5672/".to_string();
    let result = RpcConsumer::new(&logctx.log, &config, &driver, &bus).await;
    assert!(matches!(result, Err(Error::Connect { .. })));

    let result =
        RpcConsumer::new(&logctx.log, &rpc_config(0), &driver, &bus).await;
    assert!(matches!(result, Err(Error::NoWorkers)));
    assert_eq!(bus.open_connections(), 0);

    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_worker_count_bounds_concurrency() {
    let logctx = test_setup_log("test_worker_count_bounds_concurrency");
    let bus = LocalTransport::new();
    let endpoint = Arc::new(CountingEndpoint::default());
    let consumer = consumer_with(&logctx.log, &bus, endpoint.clone(), 2).await;
    consumer.start().unwrap();

    let calls = (0..6)
        .map(|_| bus.call(EXCHANGE, "test-topic", "work", Value::Null));
    for reply in futures::future::join_all(calls).await {
        assert_eq!(reply.unwrap(), Ok(Value::Null));
    }
    assert_eq!(endpoint.max.load(Ordering::SeqCst), 2);
    assert_eq!(consumer.dispatched(), 6);

    consumer.stop(true).await.unwrap();
    logctx.cleanup_successful();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_member_ports() {
    let logctx = test_setup_log("test_concurrent_member_ports");
    let bus = LocalTransport::new();
    let (store, driver) = driver(&logctx.log, None);
    let Ok(consumer) =
        RpcConsumer::new(&logctx.log, &rpc_config(4), &driver, &bus).await
    else {
        panic!("failed to create consumer");
    };
    consumer.start().unwrap();

    let calls = (10..18).map(|host| {
        let bus = bus.clone();
        tokio::spawn(async move {
            bus.call(
                EXCHANGE,
                TOPIC_PROCESS_ON_HOST_V2,
                "create_port_for_member",
                json!({
                    "ip_address": format!("10.1.0.{host}"),
                    "network_id": "ignored",
                    "subnet_id": "sub-1",
                }),
            )
            .await
        })
    });
    for call in futures::future::join_all(calls).await {
        let reply = call.unwrap().unwrap().unwrap();
        let port: Port = serde_json::from_value(reply).unwrap();
        assert_eq!(port.status, PortStatus::Active);
        assert_eq!(port.network_id.as_str(), "net-1");
    }

    let ports = store.ports();
    assert_eq!(ports.len(), 8);
    assert!(ports.iter().all(|p| p.status == PortStatus::Active));

    consumer.stop(true).await.unwrap();
    logctx.cleanup_successful();
}
