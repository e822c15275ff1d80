// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The desired side of a deployment run: instance groups and the desired
//! instances cut from them.
//!
//! Everything here is constructed once per run from the deployment manifest
//! (parsed elsewhere) and never mutated afterwards.  The reconciliation
//! engine compares these against the persisted records in
//! [`crate::records`].

use crate::ids::InstanceUuid;
use crate::link::ConsumedLink;
use crate::spec::{JobSpecSection, PackageSpec, TemplateSpec};
use crate::stemcell::Stemcell;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// The state an operator asked an instance to be in.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    Started,
    Stopped,
    Detached,
    Recreate,
}

/// Lifecycle profile of an instance group.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    Service,
    Errand,
}

/// A named failure-isolation domain.  The optional `cpi` binds instances
/// placed in this zone to one cloud provider in multi-CPI deployments.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityZone {
    pub name: String,
    pub cloud_properties: Value,
    pub cpi: Option<String>,
}

impl AvailabilityZone {
    pub fn new(name: &str, cloud_properties: Value) -> Self {
        Self { name: name.to_string(), cloud_properties, cpi: None }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmType {
    pub name: String,
    pub cloud_properties: Value,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmExtension {
    pub name: String,
    pub cloud_properties: Value,
}

/// A named persistent disk requirement of an instance group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DiskType {
    pub name: String,
    pub size_mb: u64,
    pub cloud_properties: Value,
}

/// A concern for which an instance group elects a default network.
///
/// `Addressable` selects the network that link consumers and DNS-preferred
/// addresses are drawn from, overriding the gateway network.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum NetworkConcern {
    Addressable,
    Dns,
    Gateway,
}

impl NetworkConcern {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkConcern::Addressable => "addressable",
            NetworkConcern::Dns => "dns",
            NetworkConcern::Gateway => "gateway",
        }
    }
}

impl fmt::Display for NetworkConcern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One network an instance group attaches to, as declared in the manifest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAttachment {
    pub name: String,
    /// Static IPs assigned to this group on this network, in declaration
    /// order.  Instance `i` of the group takes the `i`-th entry.
    #[serde(default)]
    pub static_ips: Vec<std::net::IpAddr>,
    /// Concerns for which this network is the group's default.
    #[serde(default)]
    pub default_for: Vec<NetworkConcern>,
}

/// A job template the group runs, identified by its rendered identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct JobTemplate {
    pub name: String,
    pub release: String,
    pub version: String,
    pub sha1: String,
    pub blobstore_id: String,
}

/// A named class of homogeneous instances sharing templates, VM type, and
/// network defaults.
#[derive(Clone, Debug)]
pub struct InstanceGroup {
    pub name: String,
    pub deployment: String,
    pub lifecycle: Option<Lifecycle>,
    pub jobs: Vec<JobTemplate>,
    pub vm_type: VmType,
    pub vm_extensions: Vec<VmExtension>,
    pub stemcell: Stemcell,
    pub env: Value,
    pub persistent_disks: Vec<DiskType>,
    pub networks: Vec<NetworkAttachment>,
    pub properties: Value,
    /// Resolved package blobstore references for the group's jobs.
    pub packages: BTreeMap<String, PackageSpec>,
    /// Links consumed by this group's jobs: job name -> link name -> link.
    pub consumed_links: BTreeMap<String, BTreeMap<String, ConsumedLink>>,
}

impl InstanceGroup {
    /// The concern -> network-name election across all attachments.
    pub fn default_network(&self) -> BTreeMap<NetworkConcern, String> {
        let mut defaults = BTreeMap::new();
        for attachment in &self.networks {
            for concern in &attachment.default_for {
                defaults.insert(*concern, attachment.name.clone());
            }
        }
        defaults
    }

    /// The job section of the spec payloads, with templates in manifest
    /// order.  Comparison sorts; serialization does not.
    pub fn job_spec_section(&self) -> JobSpecSection {
        JobSpecSection {
            name: self.name.clone(),
            templates: self
                .jobs
                .iter()
                .map(|job| TemplateSpec {
                    name: job.name.clone(),
                    version: job.version.clone(),
                    sha1: job.sha1.clone(),
                    blobstore_id: job.blobstore_id.clone(),
                })
                .collect(),
        }
    }
}

/// One instance the deployment manifest asks for.  Paired with zero or one
/// persisted [`crate::records::InstanceRecord`] during planning.
#[derive(Clone, Debug)]
pub struct DesiredInstance {
    pub group: Arc<InstanceGroup>,
    pub index: u32,
    pub uuid: InstanceUuid,
    pub availability_zone: Option<AvailabilityZone>,
    pub state: DesiredState,
    pub bootstrap: bool,
    /// Hash over the job/package/link render inputs, computed by the
    /// renderer before planning.  `None` until first render.
    pub configuration_hash: Option<String>,
}

impl DesiredInstance {
    pub fn az_name(&self) -> Option<&str> {
        self.availability_zone.as_ref().map(|az| az.name.as_str())
    }

    /// The CPI this instance is bound to via its availability zone, if any.
    pub fn cpi(&self) -> Option<&str> {
        self.availability_zone.as_ref().and_then(|az| az.cpi.as_deref())
    }

    /// Cloud properties the instance's VM should be created with: the
    /// availability zone's properties as the base, VM extensions merged
    /// over them left to right, and the VM type merged last.  The VM type
    /// wins over any extension; the right-most extension wins among
    /// extensions.
    pub fn merged_cloud_properties(&self) -> Value {
        let mut sources: Vec<&Value> = Vec::new();
        if let Some(az) = &self.availability_zone {
            sources.push(&az.cloud_properties);
        }
        for extension in &self.group.vm_extensions {
            sources.push(&extension.cloud_properties);
        }
        sources.push(&self.group.vm_type.cloud_properties);
        merge_objects(&sources)
    }
}

/// Shallow-merge JSON objects in order; later keys win.  Non-object
/// sources contribute nothing (manifest validation rejects them upstream).
fn merge_objects(sources: &[&Value]) -> Value {
    let mut merged = serde_json::Map::new();
    for source in sources {
        if let Value::Object(map) = source {
            for (key, value) in map {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    Value::Object(merged)
}
