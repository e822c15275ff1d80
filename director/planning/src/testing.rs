// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Test fixtures shared by this crate's unit tests.

use crate::instance_plan::{DirectorFingerprints, PlanContext, PlanningFlags};
use crate::network_planner::NetworkPlanner;
use async_trait::async_trait;
use flotilla_director_network::dns::RegistryDnsEncoder;
use flotilla_director_network::ip_provider::IpProvider;
use flotilla_director_network::network::{
    ManualNetworkConfig, Network, NetworkConfig,
};
use flotilla_director_network::reservation::Reservation;
use flotilla_director_network::settings::{AddressingPolicy, NetworkSettings};
use flotilla_director_network::subnet::{
    ManualSubnetConfig, NetworkParseOptions,
};
use flotilla_director_types::ids::{InstanceUuid, VariableSetId, VmUuid};
use flotilla_director_types::instance::{
    DesiredInstance, DesiredState, InstanceGroup, JobTemplate,
    NetworkAttachment, NetworkConcern, VmType,
};
use flotilla_director_types::records::{
    AgentJobState, ExistingInstanceSnapshot, InstanceRecord, InstanceState,
    PersistentDiskRecord, VariableSet, VmRecord,
};
use flotilla_director_types::spec::{
    InstanceSpecSnapshot, PackageSpec, StemcellSpec, VmTypeSpec,
};
use flotilla_director_types::stemcell::{Stemcell, StemcellModel};
use flotilla_director_types::variables::{
    InterpolationError, VariablesInterpolator,
};
use serde_json::{json, Value};
use slog::Logger;
use std::collections::BTreeMap;
use std::sync::Arc;

pub fn log() -> Logger {
    Logger::root(slog::Discard, slog::o!())
}

/// Interpolator with per-variable-set values: a `"((name))"` string
/// resolves to whatever the given set maps `name` to.
#[derive(Debug, Default)]
pub struct TestInterpolator {
    pub values: BTreeMap<VariableSetId, BTreeMap<String, Value>>,
}

impl TestInterpolator {
    fn resolve(
        &self,
        value: &Value,
        set: &VariableSet,
    ) -> Result<Value, InterpolationError> {
        match value {
            Value::String(s) => {
                let Some(name) =
                    s.strip_prefix("((").and_then(|s| s.strip_suffix("))"))
                else {
                    return Ok(value.clone());
                };
                self.values
                    .get(&set.id)
                    .and_then(|values| values.get(name))
                    .cloned()
                    .ok_or_else(|| InterpolationError::MissingVariable {
                        name: name.to_string(),
                        set: set.id.to_string(),
                    })
            }
            Value::Array(items) => Ok(Value::Array(
                items
                    .iter()
                    .map(|item| self.resolve(item, set))
                    .collect::<Result<_, _>>()?,
            )),
            Value::Object(map) => Ok(Value::Object(
                map.iter()
                    .map(|(key, item)| {
                        Ok((key.clone(), self.resolve(item, set)?))
                    })
                    .collect::<Result<_, InterpolationError>>()?,
            )),
            _ => Ok(value.clone()),
        }
    }
}

#[async_trait]
impl VariablesInterpolator for TestInterpolator {
    async fn interpolate(
        &self,
        raw: &Value,
        set: &VariableSet,
    ) -> Result<Value, InterpolationError> {
        self.resolve(raw, set)
    }
}

pub fn variable_set() -> VariableSet {
    VariableSet {
        id: VariableSetId::new_v4(),
        deployment: "prod".to_string(),
        variables: BTreeMap::new(),
    }
}

pub fn networks() -> BTreeMap<String, Arc<Network>> {
    let config = NetworkConfig::Manual(ManualNetworkConfig {
        name: "a".to_string(),
        dns: Some(vec!["192.168.1.1".parse().unwrap()]),
        subnets: vec![ManualSubnetConfig {
            range: Some("192.168.1.0/24".to_string()),
            gateway: Some("192.168.1.1".to_string()),
            reserved: vec!["192.168.1.3".to_string()],
            static_ips: vec!["192.168.1.100-192.168.1.110".to_string()],
            cloud_properties: Some(json!({"subnet_tag": "private"})),
            ..Default::default()
        }],
        managed: false,
    });
    let network =
        Network::parse(&config, &[], &NetworkParseOptions::default()).unwrap();
    BTreeMap::from([("a".to_string(), Arc::new(network))])
}

pub fn make_group() -> InstanceGroup {
    InstanceGroup {
        name: "router".to_string(),
        deployment: "prod".to_string(),
        lifecycle: None,
        jobs: vec![JobTemplate {
            name: "router-job".to_string(),
            release: "router-release".to_string(),
            version: "2".to_string(),
            sha1: "jobsha".to_string(),
            blobstore_id: "job-blob".to_string(),
        }],
        vm_type: VmType {
            name: "small".to_string(),
            cloud_properties: json!({"instance_type": "m4.large"}),
        },
        vm_extensions: vec![],
        stemcell: Stemcell {
            name: "ubuntu-stemcell".to_string(),
            os: "ubuntu-jammy".to_string(),
            version: "1".to_string(),
            models: vec![StemcellModel {
                name: "ubuntu-stemcell".to_string(),
                operating_system: "ubuntu-jammy".to_string(),
                version: "1".to_string(),
                cpi: None,
            }],
        },
        env: json!({"bosh": {"password": "hunter2"}}),
        persistent_disks: vec![],
        networks: vec![NetworkAttachment {
            name: "a".to_string(),
            static_ips: vec![],
            default_for: vec![NetworkConcern::Dns, NetworkConcern::Gateway],
        }],
        properties: json!({"listen_port": 8080}),
        packages: BTreeMap::from([(
            "router-pkg".to_string(),
            PackageSpec {
                name: "router-pkg".to_string(),
                version: "7".to_string(),
                sha1: "pkgsha".to_string(),
                blobstore_id: "pkg-blob".to_string(),
                signed_url: None,
            },
        )]),
        consumed_links: BTreeMap::new(),
    }
}

pub fn make_desired(group: Arc<InstanceGroup>, index: u32) -> DesiredInstance {
    DesiredInstance {
        group,
        index,
        uuid: InstanceUuid::new_v4(),
        availability_zone: None,
        state: DesiredState::Started,
        bootstrap: index == 0,
        configuration_hash: Some("confighash".to_string()),
    }
}

/// A persisted snapshot that matches `desired` exactly, holding address
/// `ip` on network "a": planning this pair must find no changes.
pub fn matching_snapshot(
    desired: &DesiredInstance,
    networks: &BTreeMap<String, Arc<Network>>,
    ip: &str,
    current_set: &VariableSet,
    desired_set: &VariableSet,
) -> ExistingInstanceSnapshot {
    let group = &desired.group;

    // Resolve a scratch reservation so the persisted settings blob is
    // exactly what the engine would derive today.
    let mut provider = IpProvider::new(log());
    let mut reservation = Reservation::new_dynamic(
        desired.uuid,
        Arc::clone(&networks["a"]),
    )
    .with_address(ip.parse().unwrap());
    provider.reserve(&mut reservation).unwrap();
    let reservations = vec![reservation];

    let policy = AddressingPolicy::default();
    let encoder = RegistryDnsEncoder::new();
    let default_network = group.default_network();
    let uuid = desired.uuid.to_string();
    let no_current_networks = BTreeMap::new();
    let settings = NetworkSettings {
        instance_group_name: &group.name,
        deployment_name: &group.deployment,
        default_network: &default_network,
        reservations: &reservations,
        current_networks: &no_current_networks,
        availability_zone: desired.az_name(),
        instance_index: desired.index,
        instance_uuid: &uuid,
        policy: &policy,
        encoder: &encoder,
    };
    let persisted_networks = settings.to_hash_with_dns_record_names().unwrap();

    let model = group.stemcell.models.first().unwrap();
    let spec = InstanceSpecSnapshot {
        deployment: Some(group.deployment.clone()),
        name: Some(group.name.clone()),
        index: Some(desired.index),
        job: Some(group.job_spec_section()),
        networks: Some(persisted_networks),
        vm_type: Some(VmTypeSpec {
            name: group.vm_type.name.clone(),
            cloud_properties: desired.merged_cloud_properties(),
        }),
        stemcell: Some(StemcellSpec {
            name: model.name.clone(),
            version: model.version.clone(),
        }),
        env: Some(group.env.clone()),
        packages: Some(group.packages.clone()),
        properties: Some(group.properties.clone()),
        configuration_hash: desired.configuration_hash.clone(),
        persistent_disk: Some(
            group.persistent_disks.first().map(|d| d.size_mb).unwrap_or(0),
        ),
        ..Default::default()
    };

    let vm = VmRecord {
        uuid: VmUuid::new_v4(),
        instance: desired.uuid,
        cloud_id: "i-abc123".to_string(),
        agent_id: "agent-abc123".to_string(),
        active: true,
        stemcell_name: Some(model.name.clone()),
        stemcell_version: Some(model.version.clone()),
        cloud_properties: Some(desired.merged_cloud_properties()),
        env: Some(group.env.clone()),
        blobstore_config_fingerprint: None,
        message_bus_config_fingerprint: None,
        time_created: chrono::Utc::now(),
    };

    let active_disks: Vec<PersistentDiskRecord> = group
        .persistent_disks
        .iter()
        .map(|disk| PersistentDiskRecord {
            uuid: flotilla_director_types::ids::DiskUuid::new_v4(),
            instance: desired.uuid,
            name: disk.name.clone(),
            size_mb: disk.size_mb,
            cloud_properties: disk.cloud_properties.clone(),
            active: true,
            time_created: chrono::Utc::now(),
        })
        .collect();

    ExistingInstanceSnapshot {
        record: InstanceRecord {
            uuid: desired.uuid,
            group_name: group.name.clone(),
            index: desired.index,
            deployment: group.deployment.clone(),
            availability_zone: desired.az_name().map(str::to_string),
            state: InstanceState::Started,
            agent_state: Some(AgentJobState::Running),
            spec: Some(spec),
            active_vm: Some(vm.uuid),
            disks: active_disks.iter().map(|disk| disk.uuid).collect(),
            current_variable_set: current_set.id,
            desired_variable_set: desired_set.id,
            time_created: chrono::Utc::now(),
            time_modified: chrono::Utc::now(),
        },
        active_vm: Some(vm),
        active_disks,
        current_variable_set: current_set.clone(),
        desired_variable_set: desired_set.clone(),
    }
}

/// Owns everything a [`PlanContext`] borrows.
pub struct TestCtx {
    pub interpolator: TestInterpolator,
    pub policy: AddressingPolicy,
    pub encoder: RegistryDnsEncoder,
    pub flags: PlanningFlags,
    pub fingerprints: DirectorFingerprints,
    pub run_variable_set: VariableSet,
    pub log: Logger,
}

impl TestCtx {
    pub fn new() -> TestCtx {
        TestCtx {
            interpolator: TestInterpolator::default(),
            policy: AddressingPolicy::default(),
            encoder: RegistryDnsEncoder::new(),
            flags: PlanningFlags::default(),
            fingerprints: DirectorFingerprints::default(),
            run_variable_set: variable_set(),
            log: log(),
        }
    }

    pub fn ctx(&self) -> PlanContext<'_> {
        PlanContext {
            interpolator: &self.interpolator,
            policy: &self.policy,
            encoder: &self.encoder,
            flags: self.flags,
            fingerprints: &self.fingerprints,
            run_variable_set: &self.run_variable_set,
            existing_dns_records: None,
            log: &self.log,
        }
    }
}

/// Plan networks and build the instance plan, the way the pool does.
pub async fn build_plan(
    test_ctx: &TestCtx,
    networks: &BTreeMap<String, Arc<Network>>,
    desired: Option<DesiredInstance>,
    existing: Option<ExistingInstanceSnapshot>,
) -> crate::instance_plan::InstancePlan {
    let mut provider = IpProvider::new(log());
    let planner = NetworkPlanner { networks, log: &test_ctx.log };
    let network_plans = match (&desired, &existing) {
        (Some(desired), existing) => planner
            .plan_instance_networks(
                &mut provider,
                desired,
                existing
                    .as_ref()
                    .and_then(|e| e.record.spec.as_ref())
                    .and_then(|spec| spec.networks.as_ref()),
            )
            .unwrap(),
        (None, Some(snapshot)) => planner
            .plan_obsolete_instance(&mut provider, snapshot)
            .unwrap(),
        (None, None) => vec![],
    };
    crate::instance_plan::InstancePlan::build(
        &test_ctx.ctx(),
        desired,
        existing,
        network_plans,
    )
    .await
    .unwrap()
}
