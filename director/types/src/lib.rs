// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types shared by the flotilla director's planning components.
//!
//! This crate holds the data model the reconciliation core operates on: the
//! desired side (instance groups and desired instances, built fresh each
//! deployment run), the persisted side (instance, VM, and persistent disk
//! records, plus the [`records::Fleet`] arena that owns them), and the
//! typed wire payloads handed to the per-VM agent.
//!
//! It lives in its own crate because both the network model and the
//! planning engine need it, and neither should depend on the other's
//! internals.

pub mod ids;
pub mod instance;
pub mod link;
pub mod records;
pub mod spec;
pub mod stemcell;
pub mod variables;
