// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Builds the serializable payloads for a converged instance: the apply
//! spec handed to the agent, the jobless variant used to pre-provision a
//! VM before rendering, and the full snapshot persisted as the record of
//! what is running.
//!
//! Properties and link properties are interpolated through the instance's
//! *desired* variable set before embedding; raw placeholder syntax never
//! reaches an agent.  The persisted snapshot, by contrast, keeps raw
//! values so that the next run's comparisons stay interpolation-aware.

use crate::errors::PlanningError;
use crate::instance_plan::InstancePlan;
use flotilla_director_network::dns::DnsEncoder;
use flotilla_director_network::settings::{AddressingPolicy, NetworkSettings};
use flotilla_director_types::instance::DesiredInstance;
use flotilla_director_types::records::VariableSet;
use flotilla_director_types::spec::{
    ApplySpec, InstanceSpecSnapshot, LinkSpec, NetworkSetting, PackageSpec,
    RenderedTemplatesArchive, StemcellSpec, VmTypeSpec, SPEC_SCHEMA_VERSION,
};
use flotilla_director_types::variables::VariablesInterpolator;
use serde_json::Value;
use std::collections::BTreeMap;

/// Spec construction for one non-obsolete instance plan.
pub struct InstanceSpecBuilder<'a> {
    plan: &'a InstancePlan,
    interpolator: &'a dyn VariablesInterpolator,
    policy: &'a AddressingPolicy,
    encoder: &'a dyn DnsEncoder,
    /// The variable-set version desired values interpolate through.
    variable_set: &'a VariableSet,
    /// Present only once rendering has actually produced an archive.
    rendered_templates_archive: Option<RenderedTemplatesArchive>,
}

impl<'a> InstanceSpecBuilder<'a> {
    /// Returns `None` for obsolete plans: an instance being scaled away
    /// has no spec to build.
    pub fn new(
        plan: &'a InstancePlan,
        interpolator: &'a dyn VariablesInterpolator,
        policy: &'a AddressingPolicy,
        encoder: &'a dyn DnsEncoder,
        variable_set: &'a VariableSet,
    ) -> Option<InstanceSpecBuilder<'a>> {
        plan.desired()?;
        Some(InstanceSpecBuilder {
            plan,
            interpolator,
            policy,
            encoder,
            variable_set,
            rendered_templates_archive: None,
        })
    }

    pub fn with_rendered_templates_archive(
        mut self,
        archive: RenderedTemplatesArchive,
    ) -> Self {
        self.rendered_templates_archive = Some(archive);
        self
    }

    fn desired(&self) -> &DesiredInstance {
        self.plan.desired().expect("checked at construction")
    }

    /// The full apply spec handed to the instance's agent.
    pub async fn apply_spec(&self) -> Result<ApplySpec, PlanningError> {
        let desired = self.desired();
        let group = &desired.group;

        let reservations: Vec<_> = self
            .plan
            .network_plans()
            .iter()
            .filter(|plan| !plan.is_obsolete())
            .map(|plan| plan.reservation.clone())
            .collect();
        let current_networks = self
            .plan
            .existing()
            .and_then(|existing| existing.record.spec.as_ref())
            .and_then(|spec| spec.networks.clone())
            .unwrap_or_default();
        let default_network = group.default_network();
        let uuid = desired.uuid.to_string();
        let settings = NetworkSettings {
            instance_group_name: &group.name,
            deployment_name: &group.deployment,
            default_network: &default_network,
            reservations: &reservations,
            current_networks: &current_networks,
            availability_zone: desired.az_name(),
            instance_index: desired.index,
            instance_uuid: &uuid,
            policy: self.policy,
            encoder: self.encoder,
        };

        let networks = settings.to_hash_with_dns_record_names()?;
        let address =
            settings.network_address(self.policy.use_dns_addresses)?;
        let ip = networks
            .get(settings.address_network_name()?)
            .and_then(|setting: &NetworkSetting| setting.ip.clone());

        let properties = self
            .interpolator
            .interpolate(&group.properties, self.variable_set)
            .await?;
        let links = self.interpolated_links().await?;

        Ok(ApplySpec {
            schema_version: SPEC_SCHEMA_VERSION,
            deployment: group.deployment.clone(),
            name: group.name.clone(),
            index: desired.index,
            bootstrap: desired.bootstrap,
            id: uuid,
            az: desired.az_name().map(str::to_string),
            job: Some(group.job_spec_section()),
            networks,
            packages: group.packages.clone(),
            properties,
            links,
            dns_domain_name: self.policy.root_domain.clone(),
            persistent_disk: group
                .persistent_disks
                .first()
                .map(|disk| disk.size_mb)
                .unwrap_or(0),
            rendered_templates_archive: self
                .rendered_templates_archive
                .clone(),
            configuration_hash: desired.configuration_hash.clone(),
            address,
            ip,
        })
    }

    /// The jobless variant, for pre-provisioning a VM before template
    /// rendering is complete.
    pub async fn jobless_spec(&self) -> Result<ApplySpec, PlanningError> {
        Ok(self.apply_spec().await?.into_jobless())
    }

    /// The snapshot persisted after successful convergence.  Values stay
    /// raw (uninterpolated) so future comparisons can interpolate both
    /// sides through their respective variable sets.
    pub async fn full_spec(
        &self,
    ) -> Result<InstanceSpecSnapshot, PlanningError> {
        let apply = self.apply_spec().await?;
        let desired = self.desired();
        let group = &desired.group;

        let stemcell = &group.stemcell;
        let model = stemcell.model_for_cpi(desired.cpi());
        let (stemcell_name, stemcell_version) = match model {
            Some(model) => (model.name.clone(), model.version.clone()),
            None => (stemcell.name.clone(), stemcell.version.clone()),
        };

        let packages: BTreeMap<String, PackageSpec> = group
            .packages
            .iter()
            .map(|(name, spec)| (name.clone(), spec.without_signed_url()))
            .collect();

        let raw_links: BTreeMap<&String, BTreeMap<&String, &Value>> = group
            .consumed_links
            .iter()
            .map(|(job, links)| {
                (
                    job,
                    links
                        .iter()
                        .map(|(name, link)| (name, &link.payload))
                        .collect(),
                )
            })
            .collect();

        Ok(InstanceSpecSnapshot {
            schema_version: SPEC_SCHEMA_VERSION,
            deployment: Some(group.deployment.clone()),
            name: Some(group.name.clone()),
            index: Some(desired.index),
            az: desired.az_name().map(str::to_string),
            bootstrap: Some(desired.bootstrap),
            lifecycle: group.lifecycle,
            job: Some(group.job_spec_section()),
            networks: Some(apply.networks),
            vm_type: Some(VmTypeSpec {
                name: group.vm_type.name.clone(),
                cloud_properties: desired.merged_cloud_properties(),
            }),
            stemcell: Some(StemcellSpec {
                name: stemcell_name,
                version: stemcell_version,
            }),
            env: Some(group.env.clone()),
            packages: Some(packages),
            properties: Some(group.properties.clone()),
            links: Some(serde_json::to_value(raw_links).unwrap_or_default()),
            configuration_hash: desired.configuration_hash.clone(),
            persistent_disk: Some(apply.persistent_disk),
            rendered_templates_archive: self
                .rendered_templates_archive
                .clone(),
            dns_domain_name: Some(self.policy.root_domain.clone()),
            address: Some(apply.address),
            ip: apply.ip,
        })
    }

    /// Consumed links with properties interpolated and every field not on
    /// the allow-list dropped.
    async fn interpolated_links(
        &self,
    ) -> Result<BTreeMap<String, BTreeMap<String, LinkSpec>>, PlanningError>
    {
        let mut links = BTreeMap::new();
        for (job, consumed) in &self.desired().group.consumed_links {
            let mut per_job = BTreeMap::new();
            for (name, link) in consumed {
                let interpolated = self
                    .interpolator
                    .interpolate(&link.payload, self.variable_set)
                    .await?;
                per_job.insert(name.clone(), LinkSpec::from_raw(&interpolated));
            }
            links.insert(job.clone(), per_job);
        }
        Ok(links)
    }
}
