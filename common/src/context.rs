// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-operation context handed to the resource store

use chrono::DateTime;
use chrono::Utc;
use slog::o;
use slog::Logger;
use uuid::Uuid;

/// Context for a single operation against the resource store.
///
/// Stores scope their mutations (and any transaction) to the context they
/// are given, so a caller that wants several store calls to commit together
/// must issue them with the same `OpContext`.
#[derive(Clone, Debug)]
pub struct OpContext {
    pub log: Logger,
    request_id: Uuid,
    created: DateTime<Utc>,
    kind: OpKind,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpKind {
    /// Work done on behalf of an incoming remote call
    Rpc,
    /// Work not tied to any remote caller
    Background,
}

impl OpContext {
    /// Returns a context for servicing the remote call `method`
    pub fn for_rpc(log: &Logger, method: &str) -> Self {
        let request_id = Uuid::new_v4();
        let log = log.new(o!(
            "method" => method.to_string(),
            "req_id" => request_id.to_string(),
        ));
        OpContext { log, request_id, created: Utc::now(), kind: OpKind::Rpc }
    }

    /// Returns a context for work started from within this process
    pub fn for_background(log: &Logger) -> Self {
        let request_id = Uuid::new_v4();
        let log = log.new(o!("req_id" => request_id.to_string()));
        OpContext {
            log,
            request_id,
            created: Utc::now(),
            kind: OpKind::Background,
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }
}
