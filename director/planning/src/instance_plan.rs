// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The reconciliation engine: classifies, for one instance, exactly what
//! must change.
//!
//! A plan pairs a desired instance with zero-or-one persisted snapshot
//! (and vice versa: an obsolete plan has no desired side).  Every change
//! dimension is computed once at construction as a pure function of the
//! pair plus run-level flags; the public predicates are cheap total
//! getters, so planning the same pair twice yields identical answers.
//!
//! A malformed or missing persisted spec is not an error: a fresh or
//! never-converged instance simply compares as "everything changed".

use crate::errors::PlanningError;
use crate::network_planner::NetworkPlan;
use flotilla_director_network::dns::DnsEncoder;
use flotilla_director_network::settings::{AddressingPolicy, NetworkSettings};
use flotilla_director_types::instance::{DesiredInstance, DesiredState};
use flotilla_director_types::records::{
    AgentJobState, ExistingInstanceSnapshot, InstanceState, VariableSet,
    VmRecord,
};
use flotilla_director_types::spec::{NetworkSetting, PackageSpec};
use flotilla_director_types::variables::VariablesInterpolator;
use serde::Deserialize;
use serde_json::Value;
use slog::{debug, o, Logger};
use std::collections::{BTreeMap, BTreeSet};

/// Run-level convergence requests.
#[derive(Clone, Copy, Debug, Default, Deserialize)]
#[serde(default)]
pub struct PlanningFlags {
    /// Force full recreation of every instance in the deployment.
    pub recreate_deployment: bool,
    /// Force recreation of persistent disks only.
    pub recreate_persistent_disks: bool,
}

/// Fingerprints of the director configuration VMs are built against.
/// When these rotate, running VMs must be recreated to pick them up.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct DirectorFingerprints {
    pub blobstore: Option<String>,
    pub message_bus: Option<String>,
}

/// Shared, read-only inputs to plan construction.
pub struct PlanContext<'a> {
    pub interpolator: &'a dyn VariablesInterpolator,
    pub policy: &'a AddressingPolicy,
    pub encoder: &'a dyn DnsEncoder,
    pub flags: PlanningFlags,
    pub fingerprints: &'a DirectorFingerprints,
    /// Variable set the run interpolates desired values through, for
    /// instances with no persisted desired-set pointer yet.
    pub run_variable_set: &'a VariableSet,
    /// The (name, address) pairs currently present in the DNS record
    /// store, when the caller wants DNS drift detected.
    pub existing_dns_records: Option<&'a BTreeSet<(String, String)>>,
    pub log: &'a Logger,
}

/// One dimension along which an instance differs from its desired state.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord,
)]
pub enum ChangeKind {
    Stemcell,
    CloudProperties,
    Env,
    Networks,
    NetworkSettings,
    PersistentDisk,
    Job,
    Packages,
    Configuration,
    State,
    Dns,
    BlobstoreConfig,
    MessageBusConfig,
    Recreate,
    RecreatePersistentDisks,
}

#[derive(Clone, Debug, Default)]
struct InstanceChanges {
    unresponsive_agent: bool,
    recreation_requested: bool,
    recreate_disks_requested: bool,
    stemcell: bool,
    cloud_properties: bool,
    env: bool,
    networks: bool,
    network_settings: bool,
    persistent_disk: bool,
    job: bool,
    packages: bool,
    configuration: bool,
    state: bool,
    dns: bool,
    blobstore_config: bool,
    message_bus_config: bool,
}

/// The reconciliation result for one (desired, existing) pair.
pub struct InstancePlan {
    desired: Option<DesiredInstance>,
    existing: Option<ExistingInstanceSnapshot>,
    network_plans: Vec<NetworkPlan>,
    changes: InstanceChanges,
    log: Logger,
}

impl InstancePlan {
    /// Pair a desired instance with its persisted snapshot and compute
    /// every change dimension.
    ///
    /// `network_plans` come from the network planner and must already be
    /// resolved.  Fails only on interpolation or settings-derivation
    /// errors; comparisons themselves are total.
    pub async fn build(
        ctx: &PlanContext<'_>,
        desired: Option<DesiredInstance>,
        existing: Option<ExistingInstanceSnapshot>,
        network_plans: Vec<NetworkPlan>,
    ) -> Result<InstancePlan, PlanningError> {
        let log = ctx.log.new(o!(
            "instance" => desired
                .as_ref()
                .map(|d| d.uuid.to_string())
                .or_else(|| existing.as_ref().map(|e| e.record.uuid.to_string()))
                .unwrap_or_else(|| "<none>".to_string()),
            "instance_group" => desired
                .as_ref()
                .map(|d| d.group.name.clone())
                .or_else(|| existing.as_ref().map(|e| e.record.group_name.clone()))
                .unwrap_or_default(),
        ));

        let mut changes = InstanceChanges {
            unresponsive_agent: existing
                .as_ref()
                .and_then(|e| e.record.agent_state)
                == Some(AgentJobState::Unresponsive),
            recreation_requested: ctx.flags.recreate_deployment
                || desired
                    .as_ref()
                    .is_some_and(|d| d.state == DesiredState::Recreate),
            recreate_disks_requested: ctx.flags.recreate_persistent_disks,
            ..Default::default()
        };

        Self::diff_network_topology(&log, &network_plans, &mut changes);

        match (&desired, &existing) {
            (Some(desired), Some(existing)) => {
                let cmp = Comparator { ctx, desired, existing, log: &log };
                changes.stemcell = cmp.stemcell_changed();
                changes.cloud_properties =
                    cmp.cloud_properties_changed().await?;
                changes.env = cmp.env_changed();
                changes.network_settings =
                    cmp.network_settings_changed(&network_plans).await?;
                changes.persistent_disk =
                    ctx.flags.recreate_persistent_disks
                        || cmp.persistent_disks_changed().await?;
                changes.job = cmp.job_changed();
                changes.packages = cmp.packages_changed();
                changes.configuration = cmp.configuration_changed();
                changes.state = cmp.state_changed();
                changes.dns = cmp.dns_changed(&network_plans)?;
                changes.blobstore_config = cmp.vm_fingerprint_changed(
                    ctx.fingerprints.blobstore.as_deref(),
                    |vm| vm.blobstore_config_fingerprint.as_deref(),
                    "blobstore",
                );
                changes.message_bus_config = cmp.vm_fingerprint_changed(
                    ctx.fingerprints.message_bus.as_deref(),
                    |vm| vm.message_bus_config_fingerprint.as_deref(),
                    "message bus",
                );
            }
            (Some(desired), None) => {
                // Nothing exists yet; the only meaningful comparison is
                // whether a disk must be created.
                changes.persistent_disk = ctx.flags.recreate_persistent_disks
                    || !desired.group.persistent_disks.is_empty();
            }
            (None, Some(existing)) => {
                // Scaled away: releasing an active disk is a disk change.
                changes.persistent_disk =
                    !existing.active_disks.is_empty();
            }
            (None, None) => {}
        }

        Ok(InstancePlan { desired, existing, network_plans, changes, log })
    }

    fn diff_network_topology(
        log: &Logger,
        network_plans: &[NetworkPlan],
        changes: &mut InstanceChanges,
    ) {
        let describe = |state: fn(&NetworkPlan) -> bool| -> Vec<String> {
            network_plans
                .iter()
                .filter(|plan| state(plan))
                .map(|plan| plan.reservation.to_string())
                .collect()
        };
        let obsolete = describe(NetworkPlan::is_obsolete);
        let desired = describe(NetworkPlan::is_desired);
        if !obsolete.is_empty() {
            debug!(
                log,
                "network topology changed";
                "obsolete_reservations" => obsolete.join(", "),
            );
            changes.networks = true;
        }
        if !desired.is_empty() {
            debug!(
                log,
                "network topology changed";
                "desired_reservations" => desired.join(", "),
            );
            changes.networks = true;
        }
    }

    // Pairing shape -------------------------------------------------------

    /// The desired side is absent: the instance is being scaled down.
    pub fn is_obsolete(&self) -> bool {
        self.desired.is_none()
    }

    /// The persisted side is absent: nothing exists to converge from.
    pub fn is_new(&self) -> bool {
        self.existing.is_none()
    }

    pub fn is_existing(&self) -> bool {
        !self.is_new() && !self.is_obsolete()
    }

    pub fn desired(&self) -> Option<&DesiredInstance> {
        self.desired.as_ref()
    }

    pub fn existing(&self) -> Option<&ExistingInstanceSnapshot> {
        self.existing.as_ref()
    }

    pub fn network_plans(&self) -> &[NetworkPlan] {
        &self.network_plans
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    // Individual change predicates ---------------------------------------

    pub fn stemcell_changed(&self) -> bool {
        self.changes.stemcell
    }

    pub fn cloud_properties_changed(&self) -> bool {
        self.changes.cloud_properties
    }

    pub fn env_changed(&self) -> bool {
        self.changes.env
    }

    /// Topology change: a different reservation set (networks added,
    /// removed, or re-addressed to a different binding).
    pub fn networks_changed(&self) -> bool {
        self.changes.networks
    }

    /// Settings-only change: same reservation set, different derived
    /// addressing fields.  Tracked and persisted, but does not by itself
    /// force a shutdown.
    pub fn network_settings_changed(&self) -> bool {
        self.changes.network_settings
    }

    pub fn persistent_disk_changed(&self) -> bool {
        self.changes.persistent_disk
    }

    pub fn job_changed(&self) -> bool {
        self.changes.job
    }

    pub fn packages_changed(&self) -> bool {
        self.changes.packages
    }

    pub fn configuration_changed(&self) -> bool {
        self.changes.configuration
    }

    pub fn state_changed(&self) -> bool {
        self.changes.state
    }

    pub fn dns_changed(&self) -> bool {
        self.changes.dns
    }

    pub fn blobstore_config_changed(&self) -> bool {
        self.changes.blobstore_config
    }

    pub fn message_bus_config_changed(&self) -> bool {
        self.changes.message_bus_config
    }

    pub fn unresponsive_agent(&self) -> bool {
        self.changes.unresponsive_agent
    }

    pub fn recreation_requested(&self) -> bool {
        self.changes.recreation_requested
    }

    // Composite predicates ------------------------------------------------

    /// Must the running VM be stopped?  True for scale-downs, any cause of
    /// recreation, and topology changes.  A pure settings change or a
    /// VM-type rename with identical cloud properties does not shut
    /// anything down.
    pub fn needs_shutting_down(&self) -> bool {
        self.is_obsolete()
            || self.recreate_for_non_network_reasons()
            || self.networks_changed()
    }

    /// Must a replacement VM be built?  Same as
    /// [`Self::needs_shutting_down`] minus topology changes: an existing
    /// VM can be re-pointed at new addresses without duplicating it.
    pub fn needs_duplicate_vm(&self) -> bool {
        self.is_obsolete() || self.recreate_for_non_network_reasons()
    }

    /// Is a recreation attributable to something deeper than network
    /// drift?  Network-only recreations can be handled more cheaply.
    pub fn recreate_for_non_network_reasons(&self) -> bool {
        self.changes.cloud_properties
            || self.changes.stemcell
            || self.changes.env
            || self.changes.blobstore_config
            || self.changes.message_bus_config
            || self.changes.unresponsive_agent
            || self.changes.recreation_requested
    }

    pub fn changed(&self) -> bool {
        !self.changes().is_empty()
    }

    /// Every dimension found changed, for orchestration display and logs.
    pub fn changes(&self) -> BTreeSet<ChangeKind> {
        let c = &self.changes;
        [
            (c.recreation_requested, ChangeKind::Recreate),
            (c.recreate_disks_requested, ChangeKind::RecreatePersistentDisks),
            (c.stemcell, ChangeKind::Stemcell),
            (c.cloud_properties, ChangeKind::CloudProperties),
            (c.env, ChangeKind::Env),
            (c.networks, ChangeKind::Networks),
            (c.network_settings, ChangeKind::NetworkSettings),
            (c.persistent_disk, ChangeKind::PersistentDisk),
            (c.job, ChangeKind::Job),
            (c.packages, ChangeKind::Packages),
            (c.configuration, ChangeKind::Configuration),
            (c.state, ChangeKind::State),
            (c.dns, ChangeKind::Dns),
            (c.blobstore_config, ChangeKind::BlobstoreConfig),
            (c.message_bus_config, ChangeKind::MessageBusConfig),
        ]
        .into_iter()
        .filter_map(|(changed, kind)| changed.then_some(kind))
        .collect()
    }

    /// Does a candidate VM record already satisfy this plan?  Used to
    /// pick among multiple historical VMs mid-recreate: stemcell, env,
    /// and interpolated cloud properties must all match exactly.
    pub async fn vm_matches_plan(
        &self,
        interpolator: &dyn VariablesInterpolator,
        vm: &VmRecord,
    ) -> Result<bool, PlanningError> {
        let (Some(desired), Some(existing)) = (&self.desired, &self.existing)
        else {
            return Ok(false);
        };
        let Some(vm_cloud_properties) = &vm.cloud_properties else {
            return Ok(false);
        };

        let stemcell = &desired.group.stemcell;
        let model = stemcell.model_for_cpi(desired.cpi());
        let (want_name, want_version) = match model {
            Some(model) => (model.name.as_str(), model.version.as_str()),
            None => (stemcell.name.as_str(), stemcell.version.as_str()),
        };
        if vm.stemcell_name.as_deref() != Some(want_name)
            || vm.stemcell_version.as_deref() != Some(want_version)
        {
            return Ok(false);
        }

        let empty = Value::Object(serde_json::Map::new());
        if vm.env.as_ref().unwrap_or(&empty) != &desired.group.env {
            return Ok(false);
        }

        let desired_props = interpolator
            .interpolate(
                &desired.merged_cloud_properties(),
                &existing.desired_variable_set,
            )
            .await?;
        let vm_props = interpolator
            .interpolate(vm_cloud_properties, &existing.current_variable_set)
            .await?;
        Ok(desired_props == vm_props)
    }
}

/// Comparison helpers over a fully-paired plan.
struct Comparator<'a> {
    ctx: &'a PlanContext<'a>,
    desired: &'a DesiredInstance,
    existing: &'a ExistingInstanceSnapshot,
    log: &'a Logger,
}

impl Comparator<'_> {
    fn snapshot(
        &self,
    ) -> Option<&flotilla_director_types::spec::InstanceSpecSnapshot> {
        self.existing.record.spec.as_ref()
    }

    fn log_change(&self, what: &str, from: &impl serde::Serialize, to: &impl serde::Serialize) {
        debug!(
            self.log,
            "change detected";
            "check" => what,
            "from" => serde_json::to_string(from).unwrap_or_default(),
            "to" => serde_json::to_string(to).unwrap_or_default(),
        );
    }

    fn stemcell_changed(&self) -> bool {
        let stemcell = &self.desired.group.stemcell;
        let model = stemcell.model_for_cpi(self.desired.cpi());
        let (want_name, want_version) = match model {
            Some(model) => (model.name.as_str(), model.version.as_str()),
            None => (stemcell.name.as_str(), stemcell.version.as_str()),
        };
        let Some(snapshot) =
            self.snapshot().and_then(|spec| spec.stemcell.as_ref())
        else {
            return true;
        };
        let changed =
            snapshot.name != want_name || snapshot.version != want_version;
        if changed {
            self.log_change(
                "stemcell",
                &snapshot,
                &(want_name, want_version),
            );
        }
        changed
    }

    async fn cloud_properties_changed(&self) -> Result<bool, PlanningError> {
        let desired = self.desired.merged_cloud_properties();
        let Some(old) = self
            .snapshot()
            .and_then(|spec| spec.vm_type.as_ref())
            .map(|vm_type| &vm_type.cloud_properties)
        else {
            return Ok(true);
        };
        let changed = self
            .ctx
            .interpolator
            .interpolated_values_differ(
                old,
                &desired,
                &self.existing.current_variable_set,
                &self.existing.desired_variable_set,
            )
            .await?;
        if changed {
            self.log_change("cloud properties", old, &desired);
        }
        Ok(changed)
    }

    fn env_changed(&self) -> bool {
        // The env actually baked into the VM lives on the VM record.
        let Some(vm_env) =
            self.existing.active_vm.as_ref().and_then(|vm| vm.env.as_ref())
        else {
            return false;
        };
        let changed = vm_env != &self.desired.group.env;
        if changed {
            self.log_change("env", vm_env, &self.desired.group.env);
        }
        changed
    }

    async fn network_settings_changed(
        &self,
        network_plans: &[NetworkPlan],
    ) -> Result<bool, PlanningError> {
        let old = self
            .snapshot()
            .and_then(|spec| spec.networks.as_ref());
        let Some(old) = old else { return Ok(false) };
        if old.is_empty() {
            return Ok(false);
        }

        let reservations: Vec<_> = network_plans
            .iter()
            .filter(|plan| !plan.is_obsolete())
            .map(|plan| plan.reservation.clone())
            .collect();
        let default_network = self.desired.group.default_network();
        let uuid = self.desired.uuid.to_string();
        let settings = NetworkSettings {
            instance_group_name: &self.desired.group.name,
            deployment_name: &self.desired.group.deployment,
            default_network: &default_network,
            reservations: &reservations,
            current_networks: old,
            availability_zone: self.desired.az_name(),
            instance_index: self.desired.index,
            instance_uuid: &uuid,
            policy: self.ctx.policy,
            encoder: self.ctx.encoder,
        };
        let new = settings.to_hash()?;

        // dns_record_name is derived, not authoritative; ignore it.
        let strip = |settings: &BTreeMap<String, NetworkSetting>| {
            settings
                .iter()
                .map(|(name, setting)| {
                    (name.clone(), setting.without_dns_record_name())
                })
                .collect::<BTreeMap<_, _>>()
        };
        let old_value = serde_json::to_value(strip(old)).unwrap_or_default();
        let new_value = serde_json::to_value(strip(&new)).unwrap_or_default();

        let changed = self
            .ctx
            .interpolator
            .interpolated_values_differ(
                &old_value,
                &new_value,
                &self.existing.current_variable_set,
                &self.existing.desired_variable_set,
            )
            .await?;
        if changed {
            self.log_change("network settings", &old_value, &new_value);
        }
        Ok(changed)
    }

    async fn persistent_disks_changed(&self) -> Result<bool, PlanningError> {
        let mut old: BTreeMap<&str, (u64, Value)> = BTreeMap::new();
        for disk in &self.existing.active_disks {
            let props = self
                .ctx
                .interpolator
                .interpolate(
                    &disk.cloud_properties,
                    &self.existing.current_variable_set,
                )
                .await?;
            old.insert(disk.name.as_str(), (disk.size_mb, props));
        }
        let mut new: BTreeMap<&str, (u64, Value)> = BTreeMap::new();
        for disk in &self.desired.group.persistent_disks {
            let props = self
                .ctx
                .interpolator
                .interpolate(
                    &disk.cloud_properties,
                    &self.existing.desired_variable_set,
                )
                .await?;
            new.insert(disk.name.as_str(), (disk.size_mb, props));
        }

        let names: BTreeSet<&str> =
            old.keys().chain(new.keys()).copied().collect();
        let mut changed = false;
        for name in names {
            if old.get(name) != new.get(name) {
                self.log_change(
                    "persistent disk",
                    &old.get(name),
                    &new.get(name),
                );
                changed = true;
            }
        }
        Ok(changed)
    }

    fn job_changed(&self) -> bool {
        let desired = self.desired.group.job_spec_section().sorted();
        let Some(current) = self.snapshot().and_then(|spec| spec.job.as_ref())
        else {
            return true;
        };
        let current = current.sorted();
        let changed = current != desired;
        if changed {
            self.log_change("job", &current, &desired);
        }
        changed
    }

    fn packages_changed(&self) -> bool {
        let comparable = |packages: &BTreeMap<String, PackageSpec>| {
            packages
                .iter()
                .map(|(name, spec)| (name.clone(), spec.without_signed_url()))
                .collect::<BTreeMap<_, _>>()
        };
        let Some(current) =
            self.snapshot().and_then(|spec| spec.packages.as_ref())
        else {
            return true;
        };
        let current = comparable(current);
        let desired = comparable(&self.desired.group.packages);
        let changed = current != desired;
        if changed {
            self.log_change("packages", &current, &desired);
        }
        changed
    }

    fn configuration_changed(&self) -> bool {
        let current =
            self.snapshot().and_then(|spec| spec.configuration_hash.clone());
        let changed = current != self.desired.configuration_hash;
        if changed {
            self.log_change(
                "configuration",
                &current,
                &self.desired.configuration_hash,
            );
        }
        changed
    }

    fn state_changed(&self) -> bool {
        let record = &self.existing.record;
        let effective = match self.desired.state {
            DesiredState::Detached => InstanceState::Detached,
            DesiredState::Stopped => InstanceState::Stopped,
            DesiredState::Started | DesiredState::Recreate => {
                InstanceState::Started
            }
        };
        if effective == InstanceState::Detached
            && record.state != InstanceState::Detached
        {
            debug!(self.log, "instance needs to be detached");
            return true;
        }
        if record.agent_state == Some(AgentJobState::Unresponsive) {
            return true;
        }
        let running = record.agent_state == Some(AgentJobState::Running);
        match effective {
            InstanceState::Stopped if running => true,
            InstanceState::Started if !running => true,
            _ => false,
        }
    }

    fn dns_changed(
        &self,
        network_plans: &[NetworkPlan],
    ) -> Result<bool, PlanningError> {
        let Some(known) = self.ctx.existing_dns_records else {
            return Ok(false);
        };
        let reservations: Vec<_> = network_plans
            .iter()
            .filter(|plan| !plan.is_obsolete())
            .map(|plan| plan.reservation.clone())
            .collect();
        let current_networks = self
            .snapshot()
            .and_then(|spec| spec.networks.clone())
            .unwrap_or_default();
        let default_network = self.desired.group.default_network();
        let uuid = self.desired.uuid.to_string();
        let settings = NetworkSettings {
            instance_group_name: &self.desired.group.name,
            deployment_name: &self.desired.group.deployment,
            default_network: &default_network,
            reservations: &reservations,
            current_networks: &current_networks,
            availability_zone: self.desired.az_name(),
            instance_index: self.desired.index,
            instance_uuid: &uuid,
            policy: self.ctx.policy,
            encoder: self.ctx.encoder,
        };
        for (name, ip) in settings.dns_record_info()? {
            if !known.contains(&(name.clone(), ip.clone())) {
                debug!(
                    self.log,
                    "expected DNS record not found";
                    "name" => name,
                    "ip" => ip,
                );
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn vm_fingerprint_changed(
        &self,
        current: Option<&str>,
        fingerprint: impl Fn(&VmRecord) -> Option<&str>,
        what: &str,
    ) -> bool {
        let (Some(current), Some(vm)) =
            (current, self.existing.active_vm.as_ref())
        else {
            return false;
        };
        let changed = fingerprint(vm) != Some(current);
        if changed {
            self.log_change(
                &format!("{what} config"),
                &fingerprint(vm),
                &current,
            );
        }
        changed
    }
}
