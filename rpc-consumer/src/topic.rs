// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Names of the topics the driver listens on

use std::fmt;

/// Base topic on which the driver receives calls from its agents.
pub const TOPIC_PROCESS_ON_HOST_V2: &str = "f5-lbaasv2-process-on-controller";

/// A message bus destination: a base name, optionally scoped to a
/// deployment environment as `<base>_<environment>`.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Topic(String);

impl Topic {
    pub fn new(base: &str, environment: Option<&str>) -> Self {
        match environment.filter(|env| !env.is_empty()) {
            Some(env) => Topic(format!("{base}_{env}")),
            None => Topic(base.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
