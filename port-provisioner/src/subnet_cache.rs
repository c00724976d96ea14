// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Time-limited cache of subnet lookups

use lbaas_common::api::Subnet;
use lbaas_common::api::SubnetId;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct Entry {
    subnet: Subnet,
    fetched: Instant,
}

/// Subnet records keyed by id, each valid for a fixed time after it was
/// fetched from the store.
///
/// The store remains the source of truth: expired entries are never
/// returned, and callers drop an entry as soon as the store reports the
/// subnet missing.
#[derive(Debug)]
pub struct SubnetCache {
    ttl: Duration,
    entries: Mutex<HashMap<SubnetId, Entry>>,
}

impl SubnetCache {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: Mutex::new(HashMap::new()) }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, id: &SubnetId) -> Option<Subnet> {
        let mut entries = self.entries.lock().unwrap();
        let fresh = entries.get(id).map(|e| e.fetched.elapsed() < self.ttl)?;
        if fresh {
            entries.get(id).map(|e| e.subnet.clone())
        } else {
            entries.remove(id);
            None
        }
    }

    pub fn insert(&self, subnet: Subnet) {
        let entry = Entry { subnet, fetched: Instant::now() };
        self.entries.lock().unwrap().insert(entry.subnet.id.clone(), entry);
    }

    pub fn invalidate(&self, id: &SubnetId) {
        self.entries.lock().unwrap().remove(id);
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
