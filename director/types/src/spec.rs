// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire payloads exchanged with the per-VM agent and persisted as the
//! instance's last-applied spec.
//!
//! These used to be free-form maps in the original system; here every spec
//! variant is a versioned struct with explicit optional fields so that a
//! typo'd key is a compile error rather than a silent no-op.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Schema version stamped into every spec payload.
pub const SPEC_SCHEMA_VERSION: u32 = 1;

fn spec_schema_version() -> u32 {
    SPEC_SCHEMA_VERSION
}

/// Kind tag of a per-network settings entry.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum NetworkSettingKind {
    Manual,
    Dynamic,
    Vip,
}

/// The settings an instance holds for one attached network: the agent
/// consumes these verbatim.
///
/// `dns_record_name` is derived, not authoritative; settings comparison
/// strips it before diffing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct NetworkSetting {
    #[serde(rename = "type")]
    pub kind: NetworkSettingKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub netmask: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<Vec<String>>,
    /// Concerns (sorted by name) for which this network is the group's
    /// default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Vec<String>>,
    pub cloud_properties: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_record_name: Option<String>,
}

impl NetworkSetting {
    /// Copy with the derived DNS name removed, for settings comparison.
    pub fn without_dns_record_name(&self) -> NetworkSetting {
        NetworkSetting { dns_record_name: None, ..self.clone() }
    }
}

/// Rendered identity of one job template.
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub struct TemplateSpec {
    pub name: String,
    pub version: String,
    pub sha1: String,
    pub blobstore_id: String,
}

/// The `job` section of a spec payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct JobSpecSection {
    pub name: String,
    pub templates: Vec<TemplateSpec>,
}

impl JobSpecSection {
    /// Comparable form: templates sorted by name, so reordering templates
    /// in the manifest is not a change.
    pub fn sorted(&self) -> JobSpecSection {
        let mut templates = self.templates.clone();
        templates.sort();
        JobSpecSection { name: self.name.clone(), templates }
    }
}

/// A resolved package blobstore reference.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PackageSpec {
    pub name: String,
    pub version: String,
    pub sha1: String,
    pub blobstore_id: String,
    /// Transient access token, not part of the package's identity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signed_url: Option<String>,
}

impl PackageSpec {
    /// Identity-only copy, for comparison.
    pub fn without_signed_url(&self) -> PackageSpec {
        PackageSpec { signed_url: None, ..self.clone() }
    }
}

/// Reference to the rendered-template archive in the blobstore.  Absent
/// until rendering has actually occurred.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RenderedTemplatesArchive {
    pub blobstore_id: String,
    pub sha1: String,
}

/// One provider instance listed inside a link payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct LinkInstanceSpec {
    pub name: String,
    pub index: u32,
    pub bootstrap: bool,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub az: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// The allow-listed projection of a consumed link embedded into spec
/// payloads.
///
/// Deserializing a raw link payload into this struct *is* the allow-list:
/// serde drops every field not named here, which is exactly the set the
/// agent may see.
#[derive(
    Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema,
)]
pub struct LinkSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instances: Option<Vec<LinkInstanceSpec>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_network: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_short_dns_addresses: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_link_dns_names: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
}

impl LinkSpec {
    /// Project a raw link payload through the allow-list.
    pub fn from_raw(payload: &Value) -> LinkSpec {
        serde_json::from_value(payload.clone()).unwrap_or_default()
    }
}

/// `vm_type` section of a spec payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct VmTypeSpec {
    pub name: String,
    pub cloud_properties: Value,
}

/// `stemcell` section of a spec payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StemcellSpec {
    pub name: String,
    pub version: String,
}

/// The full apply spec handed to an instance's agent.
///
/// The jobless variant used to pre-provision a VM before rendering is the
/// same struct with `job: None` (see
/// [`ApplySpec::into_jobless`]).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ApplySpec {
    #[serde(default = "spec_schema_version")]
    pub schema_version: u32,
    pub deployment: String,
    pub name: String,
    pub index: u32,
    pub bootstrap: bool,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub az: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<JobSpecSection>,
    pub networks: BTreeMap<String, NetworkSetting>,
    pub packages: BTreeMap<String, PackageSpec>,
    pub properties: Value,
    /// job name -> link name -> allow-listed link.
    pub links: BTreeMap<String, BTreeMap<String, LinkSpec>>,
    pub dns_domain_name: String,
    pub persistent_disk: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rendered_templates_archive: Option<RenderedTemplatesArchive>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration_hash: Option<String>,
    /// The instance's preferred address under the active addressing policy.
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

impl ApplySpec {
    /// The jobless variant: identical, minus the job/template section and
    /// the rendered archive (which cannot exist before rendering).
    pub fn into_jobless(mut self) -> ApplySpec {
        self.job = None;
        self.rendered_templates_archive = None;
        self
    }
}

/// The persisted snapshot of what is actually running on an instance.
///
/// Written after successful convergence; the sole source of truth the next
/// run diffs against.  Every field is optional because snapshots written
/// by older directors, or never written at all, are a normal case and mean
/// "treat as changed", not "error".
#[derive(
    Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema,
)]
pub struct InstanceSpecSnapshot {
    #[serde(default = "spec_schema_version")]
    pub schema_version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub az: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bootstrap: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<crate::instance::Lifecycle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<JobSpecSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub networks: Option<BTreeMap<String, NetworkSetting>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm_type: Option<VmTypeSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stemcell: Option<StemcellSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packages: Option<BTreeMap<String, PackageSpec>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<Value>,
    /// Raw, unfiltered links as resolved for this instance.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub links: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistent_disk: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rendered_templates_archive: Option<RenderedTemplatesArchive>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_domain_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_link_allow_list_drops_unknown_fields() {
        let raw = json!({
            "deployment_name": "dep1",
            "some_internal_key": "must not leak",
            "networks": ["default"],
            "properties": { "listen_port": 8080 },
            "instances": [{
                "name": "provider",
                "index": 0,
                "bootstrap": true,
                "id": "3d46803d-1527-4209-8e1f-822105fece7c",
                "az": "z1",
                "address": "10.244.0.4",
            }],
            "instance_group": "provider-ig",
            "default_network": "private",
            "domain": "bosh",
        });

        let link = LinkSpec::from_raw(&raw);
        assert_eq!(link.deployment_name.as_deref(), Some("dep1"));
        assert_eq!(link.instance_group.as_deref(), Some("provider-ig"));
        assert_eq!(link.instances.as_ref().unwrap().len(), 1);

        let reserialized = serde_json::to_value(&link).unwrap();
        assert!(reserialized.get("some_internal_key").is_none());
        // "networks" is not on the allow-list either.
        assert!(reserialized.get("networks").is_none());
    }

    #[test]
    fn test_jobless_variant_strips_job_section() {
        let spec = ApplySpec {
            schema_version: SPEC_SCHEMA_VERSION,
            deployment: "prod".to_string(),
            name: "router".to_string(),
            index: 0,
            bootstrap: true,
            id: "uuid-1".to_string(),
            az: None,
            job: Some(JobSpecSection {
                name: "router".to_string(),
                templates: vec![],
            }),
            networks: BTreeMap::new(),
            packages: BTreeMap::new(),
            properties: json!({}),
            links: BTreeMap::new(),
            dns_domain_name: "bosh".to_string(),
            persistent_disk: 0,
            rendered_templates_archive: Some(RenderedTemplatesArchive {
                blobstore_id: "blob".to_string(),
                sha1: "sha".to_string(),
            }),
            configuration_hash: None,
            address: "10.0.0.3".to_string(),
            ip: Some("10.0.0.3".to_string()),
        };

        let jobless = spec.into_jobless();
        assert!(jobless.job.is_none());
        assert!(jobless.rendered_templates_archive.is_none());
    }

    #[test]
    fn test_template_reorder_is_not_a_change_after_sorting() {
        let a = JobSpecSection {
            name: "job".to_string(),
            templates: vec![
                TemplateSpec {
                    name: "b".to_string(),
                    version: "1".to_string(),
                    sha1: "s1".to_string(),
                    blobstore_id: "id1".to_string(),
                },
                TemplateSpec {
                    name: "a".to_string(),
                    version: "2".to_string(),
                    sha1: "s2".to_string(),
                    blobstore_id: "id2".to_string(),
                },
            ],
        };
        let mut b = a.clone();
        b.templates.reverse();
        assert_ne!(a, b);
        assert_eq!(a.sorted(), b.sorted());
    }
}
