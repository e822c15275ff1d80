// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persisted records: what the director last knew about each instance, its
//! VMs, and its persistent disks.
//!
//! Records reference one another by typed id (an arena, not an object
//! graph) because an instance's active VM is swapped out mid-recreate and
//! owning pointers would make that swap a lifetime puzzle.  [`Fleet`] is
//! the read/write contract the reconciliation core uses; the real SQL
//! store implements the same operations.

use crate::ids::{DiskUuid, InstanceUuid, VariableSetId, VmUuid};
use crate::spec::InstanceSpecSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Lifecycle state a persisted instance is currently in.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Started,
    Stopped,
    Detached,
}

/// The job state the instance's agent last reported.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum AgentJobState {
    Running,
    Stopped,
    Failing,
    Unresponsive,
}

/// Durable record of one managed instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub uuid: InstanceUuid,
    pub group_name: String,
    pub index: u32,
    pub deployment: String,
    pub availability_zone: Option<String>,
    pub state: InstanceState,
    /// Last reported agent health; `None` when the agent has never
    /// reported (e.g. no VM yet).
    pub agent_state: Option<AgentJobState>,
    /// The last-applied spec snapshot, the sole source of truth for what
    /// is actually running.  `None` for a never-converged instance.
    pub spec: Option<InstanceSpecSnapshot>,
    pub active_vm: Option<VmUuid>,
    pub disks: Vec<DiskUuid>,
    /// Variable-set version the current spec was interpolated with.
    pub current_variable_set: VariableSetId,
    /// Variable-set version the next convergence should interpolate with.
    pub desired_variable_set: VariableSetId,
    pub time_created: DateTime<Utc>,
    pub time_modified: DateTime<Utc>,
}

/// Record of one underlying virtual machine.
///
/// At most one VM per instance is active; others exist only during a
/// recreate-in-progress window.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VmRecord {
    pub uuid: VmUuid,
    pub instance: InstanceUuid,
    pub cloud_id: String,
    pub agent_id: String,
    pub active: bool,
    pub stemcell_name: Option<String>,
    pub stemcell_version: Option<String>,
    pub cloud_properties: Option<Value>,
    pub env: Option<Value>,
    /// Fingerprint of the blobstore configuration this VM was created
    /// with; drift forces recreation.
    pub blobstore_config_fingerprint: Option<String>,
    /// Fingerprint of the message-bus configuration this VM was created
    /// with; drift forces recreation.
    pub message_bus_config_fingerprint: Option<String>,
    pub time_created: DateTime<Utc>,
}

/// Record of one persistent disk.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistentDiskRecord {
    pub uuid: DiskUuid,
    pub instance: InstanceUuid,
    pub name: String,
    pub size_mb: u64,
    pub cloud_properties: Value,
    /// An instance owns at most one active disk; inactive disks are
    /// historical, kept only during migration.
    pub active: bool,
    pub time_created: DateTime<Utc>,
}

/// A versioned pointer into the credential/variable store, with the
/// per-variable version ids needed for interpolation-aware comparison.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableSet {
    pub id: VariableSetId,
    pub deployment: String,
    /// variable name -> concrete version id in the store.
    pub variables: BTreeMap<String, String>,
}

/// Snapshot of everything planning needs to know about one persisted
/// instance, read atomically so that a concurrent writer cannot produce a
/// partially-updated comparison input.
#[derive(Clone, Debug)]
pub struct ExistingInstanceSnapshot {
    pub record: InstanceRecord,
    pub active_vm: Option<VmRecord>,
    pub active_disks: Vec<PersistentDiskRecord>,
    pub current_variable_set: VariableSet,
    pub desired_variable_set: VariableSet,
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum FleetError {
    #[error("no such instance: {0}")]
    NoSuchInstance(InstanceUuid),
    #[error("no such VM: {0}")]
    NoSuchVm(VmUuid),
    #[error("instance {instance} references unknown variable set {set}")]
    NoSuchVariableSet { instance: InstanceUuid, set: VariableSetId },
}

/// In-memory arena of persisted records and the typed load/save contract
/// over them.
#[derive(Clone, Debug, Default)]
pub struct Fleet {
    instances: BTreeMap<InstanceUuid, InstanceRecord>,
    vms: BTreeMap<VmUuid, VmRecord>,
    disks: BTreeMap<DiskUuid, PersistentDiskRecord>,
    variable_sets: BTreeMap<VariableSetId, VariableSet>,
}

impl Fleet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_instance(&mut self, record: InstanceRecord) {
        self.instances.insert(record.uuid, record);
    }

    pub fn insert_vm(&mut self, record: VmRecord) {
        self.vms.insert(record.uuid, record);
    }

    pub fn insert_disk(&mut self, record: PersistentDiskRecord) {
        self.disks.insert(record.uuid, record);
    }

    pub fn insert_variable_set(&mut self, set: VariableSet) {
        self.variable_sets.insert(set.id, set);
    }

    pub fn instance(&self, id: InstanceUuid) -> Option<&InstanceRecord> {
        self.instances.get(&id)
    }

    pub fn instances(&self) -> impl Iterator<Item = &InstanceRecord> {
        self.instances.values()
    }

    pub fn vm(&self, id: VmUuid) -> Option<&VmRecord> {
        self.vms.get(&id)
    }

    /// All VM records for an instance, active first.
    pub fn vms_for_instance(
        &self,
        id: InstanceUuid,
    ) -> Vec<&VmRecord> {
        let mut vms: Vec<_> =
            self.vms.values().filter(|vm| vm.instance == id).collect();
        vms.sort_by_key(|vm| !vm.active);
        vms
    }

    pub fn variable_set(&self, id: VariableSetId) -> Option<&VariableSet> {
        self.variable_sets.get(&id)
    }

    /// Atomically read one instance with its active VM, active disks, and
    /// resolved variable sets.
    pub fn snapshot_instance(
        &self,
        id: InstanceUuid,
    ) -> Result<ExistingInstanceSnapshot, FleetError> {
        let record = self
            .instances
            .get(&id)
            .cloned()
            .ok_or(FleetError::NoSuchInstance(id))?;
        let active_vm = match record.active_vm {
            None => None,
            Some(vm_id) => Some(
                self.vms.get(&vm_id).cloned().ok_or(FleetError::NoSuchVm(vm_id))?,
            ),
        };
        let active_disks = record
            .disks
            .iter()
            .filter_map(|disk_id| self.disks.get(disk_id))
            .filter(|disk| disk.active)
            .cloned()
            .collect();
        let lookup_set = |set: VariableSetId| {
            self.variable_sets.get(&set).cloned().ok_or(
                FleetError::NoSuchVariableSet { instance: id, set },
            )
        };
        Ok(ExistingInstanceSnapshot {
            active_vm,
            active_disks,
            current_variable_set: lookup_set(record.current_variable_set)?,
            desired_variable_set: lookup_set(record.desired_variable_set)?,
            record,
        })
    }

    /// Persist the spec snapshot of a converged instance and advance its
    /// current variable set to the one the convergence used.
    pub fn save_spec(
        &mut self,
        id: InstanceUuid,
        spec: InstanceSpecSnapshot,
    ) -> Result<(), FleetError> {
        let record = self
            .instances
            .get_mut(&id)
            .ok_or(FleetError::NoSuchInstance(id))?;
        record.spec = Some(spec);
        record.current_variable_set = record.desired_variable_set;
        record.time_modified = Utc::now();
        Ok(())
    }

    /// Mark `vm` as the instance's single active VM.
    pub fn set_active_vm(
        &mut self,
        id: InstanceUuid,
        vm: VmUuid,
    ) -> Result<(), FleetError> {
        if !self.vms.contains_key(&vm) {
            return Err(FleetError::NoSuchVm(vm));
        }
        let record = self
            .instances
            .get_mut(&id)
            .ok_or(FleetError::NoSuchInstance(id))?;
        record.active_vm = Some(vm);
        record.time_modified = Utc::now();
        for candidate in self.vms.values_mut() {
            if candidate.instance == id {
                candidate.active = candidate.uuid == vm;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn record(uuid: InstanceUuid, set: VariableSetId) -> InstanceRecord {
        InstanceRecord {
            uuid,
            group_name: "router".to_string(),
            index: 0,
            deployment: "prod".to_string(),
            availability_zone: None,
            state: InstanceState::Started,
            agent_state: Some(AgentJobState::Running),
            spec: None,
            active_vm: None,
            disks: vec![],
            current_variable_set: set,
            desired_variable_set: set,
            time_created: Utc::now(),
            time_modified: Utc::now(),
        }
    }

    #[test]
    fn test_snapshot_excludes_inactive_disks() {
        let mut fleet = Fleet::new();
        let set = VariableSet {
            id: VariableSetId::new_v4(),
            deployment: "prod".to_string(),
            variables: BTreeMap::new(),
        };
        let instance = InstanceUuid::new_v4();
        let mut rec = record(instance, set.id);

        let active = DiskUuid::new_v4();
        let historical = DiskUuid::new_v4();
        rec.disks = vec![active, historical];
        fleet.insert_variable_set(set);
        fleet.insert_instance(rec);
        for (uuid, is_active) in [(active, true), (historical, false)] {
            fleet.insert_disk(PersistentDiskRecord {
                uuid,
                instance,
                name: "db".to_string(),
                size_mb: 1024,
                cloud_properties: serde_json::json!({}),
                active: is_active,
                time_created: Utc::now(),
            });
        }

        let snapshot = fleet.snapshot_instance(instance).unwrap();
        assert_eq!(snapshot.active_disks.len(), 1);
        assert_eq!(snapshot.active_disks[0].uuid, active);
    }

    #[test]
    fn test_set_active_vm_deactivates_others() {
        let mut fleet = Fleet::new();
        let set = VariableSet {
            id: VariableSetId::new_v4(),
            deployment: "prod".to_string(),
            variables: BTreeMap::new(),
        };
        let instance = InstanceUuid::new_v4();
        fleet.insert_variable_set(set.clone());
        fleet.insert_instance(record(instance, set.id));

        let old_vm = VmUuid::new_v4();
        let new_vm = VmUuid::new_v4();
        for (uuid, active) in [(old_vm, true), (new_vm, false)] {
            fleet.insert_vm(VmRecord {
                uuid,
                instance,
                cloud_id: format!("i-{uuid}"),
                agent_id: format!("agent-{uuid}"),
                active,
                stemcell_name: None,
                stemcell_version: None,
                cloud_properties: None,
                env: None,
                blobstore_config_fingerprint: None,
                message_bus_config_fingerprint: None,
                time_created: Utc::now(),
            });
        }

        fleet.set_active_vm(instance, new_vm).unwrap();
        assert!(!fleet.vm(old_vm).unwrap().active);
        assert!(fleet.vm(new_vm).unwrap().active);
        let vms = fleet.vms_for_instance(instance);
        assert_eq!(vms[0].uuid, new_vm);
    }
}
