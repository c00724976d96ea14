// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Agent heartbeats

use crate::bus::RpcReply;
use crate::endpoint::decode_args;
use crate::endpoint::encode_reply;
use crate::endpoint::RpcEndpoint;
use crate::endpoint::RpcError;
use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use slog::debug;
use slog::info;
use slog::o;
use slog::Logger;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::Mutex;
use strum::VariantNames;

/// What an agent reports about itself in each heartbeat
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct AgentState {
    pub host: String,
    pub binary: String,
    #[serde(default)]
    pub topic: String,
    pub agent_type: String,
    #[serde(default)]
    pub configurations: Value,
    /// Set by an agent on the first report after it starts
    #[serde(default)]
    pub start_flag: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
struct ReportStateArgs {
    agent_state: AgentStateEnvelope,
    #[serde(default)]
    time: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
struct AgentStateEnvelope {
    agent_state: AgentState,
}

/// Reply to `report_state`
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AgentStatus {
    /// First report from this agent
    New,
    Alive,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AgentRecord {
    pub state: AgentState,
    /// When the report was received
    pub last_report: DateTime<Utc>,
    /// When the agent says it sent the report, if it said
    pub reported_time: Option<String>,
}

/// Latest heartbeat per agent, keyed by agent type and host
#[derive(Clone, Debug, Default)]
pub struct AgentRegistry {
    agents: Arc<Mutex<BTreeMap<(String, String), AgentRecord>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a heartbeat, returning whether the agent was already known
    pub fn record(
        &self,
        state: AgentState,
        reported_time: Option<String>,
    ) -> AgentStatus {
        let key = (state.agent_type.clone(), state.host.clone());
        let record =
            AgentRecord { state, last_report: Utc::now(), reported_time };
        match self.agents.lock().unwrap().insert(key, record) {
            Some(_) => AgentStatus::Alive,
            None => AgentStatus::New,
        }
    }

    pub fn get(&self, agent_type: &str, host: &str) -> Option<AgentRecord> {
        self.agents
            .lock()
            .unwrap()
            .get(&(agent_type.to_string(), host.to_string()))
            .cloned()
    }

    pub fn list(&self) -> Vec<AgentRecord> {
        self.agents.lock().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.agents.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.agents.lock().unwrap().clear();
    }
}

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
pub enum AgentCallbackMethod {
    ReportState,
    HasAliveNeutronServer,
}

/// Generic endpoint through which agents report their status
pub struct AgentStatusCallback {
    log: Logger,
    agents: AgentRegistry,
}

impl AgentStatusCallback {
    pub fn new(log: &Logger, agents: AgentRegistry) -> Self {
        let log = log.new(o!("component" => "AgentStatusCallback"));
        Self { log, agents }
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    fn report_state(&self, args: Value) -> RpcReply {
        let method: &'static str = AgentCallbackMethod::ReportState.into();
        let args: ReportStateArgs = decode_args(method, args)?;
        let state = args.agent_state.agent_state;
        let (host, agent_type) = (state.host.clone(), state.agent_type.clone());
        let start_flag = state.start_flag;
        let status = self.agents.record(state, args.time);
        if status == AgentStatus::New || start_flag {
            info!(
                self.log,
                "agent reported";
                "host" => host,
                "agent_type" => agent_type,
                "status" => %status,
            );
        } else {
            debug!(
                self.log,
                "agent heartbeat";
                "host" => host,
                "agent_type" => agent_type,
            );
        }
        encode_reply(method, &status)
    }
}

#[async_trait]
impl RpcEndpoint for AgentStatusCallback {
    fn name(&self) -> &'static str {
        "agent_status_callback"
    }

    fn methods(&self) -> &'static [&'static str] {
        AgentCallbackMethod::VARIANTS
    }

    async fn dispatch(&self, method: &str, args: Value) -> RpcReply {
        match AgentCallbackMethod::from_str(method) {
            Ok(AgentCallbackMethod::ReportState) => self.report_state(args),
            Ok(AgentCallbackMethod::HasAliveNeutronServer) => {
                Ok(Value::Bool(true))
            }
            Err(_) => {
                Err(RpcError::UnknownMethod { method: method.to_string() })
            }
        }
    }

    fn reset(&self) {
        debug!(self.log, "forgetting reported agents");
        self.agents.clear();
    }
}
