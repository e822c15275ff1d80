// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Planning error taxonomy.
//!
//! A plan is refused, never partially applied: any of these surfaces to
//! the caller before a single convergence action is attempted.

use flotilla_director_network::errors::{AllocationError, TopologyError};
use flotilla_director_types::records::FleetError;
use flotilla_director_types::variables::InterpolationError;

/// Validation failures found before planning, enumerated in full so an
/// operator fixes the manifest once, not once per missing item.
#[derive(Clone, Debug, thiserror::Error)]
#[error(
    "deployment cannot proceed; {} problem(s) found:\n  {}",
    missing.len(),
    missing.join("\n  ")
)]
pub struct CompatibilityError {
    pub missing: Vec<String>,
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum PlanningError {
    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    Compatibility(#[from] CompatibilityError),

    #[error("interpolation failed during planning: {0}")]
    Interpolation(#[from] InterpolationError),

    #[error("persisted state read failed: {0}")]
    Fleet(#[from] FleetError),

    #[error(
        "instance group '{instance_group}' references unknown network \
         '{network}'"
    )]
    UnknownNetwork { instance_group: String, network: String },

    #[error(
        "network '{network}' does not offer availability zone{} required by \
         instance group '{instance_group}'",
        az.as_deref().map(|az| format!(" '{az}'")).unwrap_or_default()
    )]
    NetworkAzMismatch {
        instance_group: String,
        network: String,
        az: Option<String>,
    },
}
