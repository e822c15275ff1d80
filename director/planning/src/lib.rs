// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The flotilla director's reconciliation engine.
//!
//! For each managed instance, an [`instance_plan::InstancePlan`] pairs the
//! desired definition with the persisted record and classifies exactly
//! what must change: nothing, an in-place update, a disk recreation, a
//! duplicate-VM recreation, or a full teardown.  The orchestrator reads
//! the plan's predicates and issues the corresponding cloud-provider
//! calls; nothing in this crate talks to a CPI.
//!
//! Planning for distinct instances is embarrassingly parallel (each plan
//! is a pure function of its own pair plus shared read-only topology), so
//! [`pool::DeploymentPlanner`] fans plan construction out over a bounded
//! pool, with all address allocation serialized through one
//! [`flotilla_director_network::ip_provider::IpProvider`].

pub mod errors;
pub mod instance_plan;
pub mod instance_spec;
pub mod network_planner;
pub mod pool;
#[cfg(test)]
pub(crate) mod testing;

pub use errors::{CompatibilityError, PlanningError};
pub use instance_plan::{InstancePlan, PlanningFlags};
