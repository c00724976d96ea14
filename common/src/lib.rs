// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! # F5 LBaaS driver: common facilities
//!
//! Types shared between the port provisioner and the RPC consumer: the
//! network port model, the filters used to look ports up, and the
//! [`store::ResourceStore`] boundary through which all port and subnet
//! records are read and written.  The store itself (and its schema and
//! transaction manager) belongs to the host networking service; nothing
//! here persists state.

pub mod api;
pub mod context;
pub mod store;

pub use context::OpContext;
pub use store::ResourceStore;
pub use store::StoreError;
