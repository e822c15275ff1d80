// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Links: the typed contracts through which one instance group exposes
//! addressing and properties to another.
//!
//! Link resolution itself happens outside this core; the planner only
//! carries each consumed link's resolved payload into the spec builder and
//! hands its definition to the DNS encoder when a link-scoped address is
//! needed.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity of a link as the DNS encoder sees it: enough to build a query
/// scoped to the link's provider group.
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct LinkDefinition {
    /// The link's name as consumed.
    pub name: String,
    /// Name of the provider-side link group the query should resolve to.
    pub group_name: String,
}

/// A link consumed by one of an instance group's jobs, resolved to its
/// provider-side payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConsumedLink {
    pub definition: LinkDefinition,
    /// The provider's raw payload.  The spec builder projects this through
    /// the allow-list before it reaches an agent.
    pub payload: Value,
}
