// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deployment-wide planning: validation, allocation, and bounded fan-out.
//!
//! Planning happens in two phases.  Address allocation runs first,
//! sequentially, in manifest declaration order: every write to shared
//! allocation state goes through the single [`IpProvider`], and static-IP
//! assignment stays deterministic across runs.  Plan construction (the
//! interpolation-heavy comparison work) then fans out over a bounded
//! concurrent pool; each instance's plan is a pure function of its own
//! snapshot, so no ordering applies.
//!
//! The variable interpolator is treated as a potentially slow external
//! call: every interpolation is wrapped in a per-call timeout so one
//! stalled request cannot hold unrelated instances hostage.  There is no
//! retry logic here; a failed reservation or interpolation fails the run
//! and retrying is the orchestration layer's policy.

use crate::errors::{CompatibilityError, PlanningError};
use crate::instance_plan::{
    DirectorFingerprints, InstancePlan, PlanContext, PlanningFlags,
};
use crate::network_planner::NetworkPlanner;
use async_trait::async_trait;
use flotilla_director_network::dns::DnsEncoder;
use flotilla_director_network::ip_provider::IpProvider;
use flotilla_director_network::network::Network;
use flotilla_director_network::settings::AddressingPolicy;
use flotilla_director_types::instance::DesiredInstance;
use flotilla_director_types::records::{Fleet, VariableSet};
use flotilla_director_types::variables::{
    InterpolationError, VariablesInterpolator,
};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Deserialize;
use serde_json::Value;
use slog::{o, Logger};
use std::collections::BTreeSet;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PlanningOptions {
    /// How many instance plans may be under construction at once.
    pub max_in_flight: usize,
    /// Budget for a single variable-interpolation call.
    pub interpolation_timeout_ms: u64,
    pub flags: PlanningFlags,
}

impl Default for PlanningOptions {
    fn default() -> Self {
        PlanningOptions {
            max_in_flight: 4,
            interpolation_timeout_ms: 30_000,
            flags: PlanningFlags::default(),
        }
    }
}

impl PlanningOptions {
    fn interpolation_timeout(&self) -> Duration {
        Duration::from_millis(self.interpolation_timeout_ms)
    }
}

/// Wraps an interpolator so every call observes a deadline and
/// cancellation propagates to the caller's plan only.
pub struct TimeoutInterpolator {
    inner: Arc<dyn VariablesInterpolator>,
    timeout: Duration,
}

impl TimeoutInterpolator {
    pub fn new(
        inner: Arc<dyn VariablesInterpolator>,
        timeout: Duration,
    ) -> Self {
        TimeoutInterpolator { inner, timeout }
    }
}

#[async_trait]
impl VariablesInterpolator for TimeoutInterpolator {
    async fn interpolate(
        &self,
        raw: &Value,
        set: &VariableSet,
    ) -> Result<Value, InterpolationError> {
        tokio::time::timeout(self.timeout, self.inner.interpolate(raw, set))
            .await
            .map_err(|_| InterpolationError::Timeout(self.timeout))?
    }
}

/// Everything a planning run produces: one plan per instance (desired or
/// obsolete), plus the allocation authority holding the run's address
/// bindings, which the orchestrator uses to release obsolete plans.
pub struct DeploymentPlanOutcome {
    pub instance_plans: Vec<InstancePlan>,
    pub provider: IpProvider,
}

/// Plans a whole deployment.
pub struct DeploymentPlanner {
    pub networks: BTreeMap<String, Arc<Network>>,
    pub interpolator: Arc<dyn VariablesInterpolator>,
    pub encoder: Arc<dyn DnsEncoder>,
    pub policy: AddressingPolicy,
    pub fingerprints: DirectorFingerprints,
    pub options: PlanningOptions,
    pub run_variable_set: VariableSet,
    pub existing_dns_records: Option<BTreeSet<(String, String)>>,
    pub log: Logger,
}

impl DeploymentPlanner {
    /// Plan every instance of `deployment`: each desired instance paired
    /// with its persisted record (if any), plus an obsolete plan for each
    /// persisted instance the desired state no longer mentions.
    pub async fn plan(
        &self,
        deployment: &str,
        desired: Vec<DesiredInstance>,
        fleet: &Fleet,
    ) -> Result<DeploymentPlanOutcome, PlanningError> {
        self.validate_compatibility(&desired)?;

        let log = self.log.new(o!("deployment" => deployment.to_string()));
        let planner = NetworkPlanner { networks: &self.networks, log: &log };

        let mut validated_groups = BTreeSet::new();
        for instance in &desired {
            if validated_groups.insert(instance.group.name.clone()) {
                planner.validate_group_static_ips(&instance.group)?;
            }
        }

        // Snapshot-consistent reads: each pairing works on an owned copy
        // of its instance's records, taken before planning starts.
        let desired_uuids: BTreeSet<_> =
            desired.iter().map(|instance| instance.uuid).collect();
        let mut paired = Vec::new();
        for instance in desired {
            let snapshot = match fleet.instance(instance.uuid) {
                Some(_) => Some(fleet.snapshot_instance(instance.uuid)?),
                None => None,
            };
            paired.push((Some(instance), snapshot));
        }
        for record in fleet.instances() {
            if record.deployment == deployment
                && !desired_uuids.contains(&record.uuid)
            {
                paired
                    .push((None, Some(fleet.snapshot_instance(record.uuid)?)));
            }
        }

        // Phase 1: allocation, strictly sequential in declaration order.
        let mut provider =
            IpProvider::new(log.new(o!("component" => "ip-provider")));
        let mut tasks = Vec::new();
        for (instance, snapshot) in paired {
            let network_plans = match (&instance, &snapshot) {
                (Some(instance), snapshot) => planner
                    .plan_instance_networks(
                        &mut provider,
                        instance,
                        snapshot
                            .as_ref()
                            .and_then(|s| s.record.spec.as_ref())
                            .and_then(|spec| spec.networks.as_ref()),
                    )?,
                (None, Some(snapshot)) => {
                    planner.plan_obsolete_instance(&mut provider, snapshot)?
                }
                (None, None) => vec![],
            };
            tasks.push((instance, snapshot, network_plans));
        }

        // Phase 2: comparisons fan out over the bounded pool.
        let interpolator = TimeoutInterpolator::new(
            Arc::clone(&self.interpolator),
            self.options.interpolation_timeout(),
        );
        let ctx = PlanContext {
            interpolator: &interpolator,
            policy: &self.policy,
            encoder: &*self.encoder,
            flags: self.options.flags,
            fingerprints: &self.fingerprints,
            run_variable_set: &self.run_variable_set,
            existing_dns_records: self.existing_dns_records.as_ref(),
            log: &log,
        };
        let ctx = &ctx;
        let mut indexed: Vec<(usize, InstancePlan)> = stream::iter(
            tasks.into_iter().enumerate().map(
                |(position, (instance, snapshot, network_plans))| async move {
                    InstancePlan::build(ctx, instance, snapshot, network_plans)
                        .await
                        .map(|plan| (position, plan))
                },
            ),
        )
        .buffer_unordered(self.options.max_in_flight.max(1))
        .try_collect()
        .await?;
        indexed.sort_by_key(|(position, _)| *position);

        Ok(DeploymentPlanOutcome {
            instance_plans: indexed.into_iter().map(|(_, plan)| plan).collect(),
            provider,
        })
    }

    /// Pre-planning validation, reported as one enumerated list so the
    /// operator fixes the manifest once.
    fn validate_compatibility(
        &self,
        desired: &[DesiredInstance],
    ) -> Result<(), CompatibilityError> {
        let mut missing = Vec::new();
        let mut seen = BTreeSet::new();
        for instance in desired {
            let key = (
                instance.group.name.clone(),
                instance.cpi().map(str::to_string),
            );
            if !seen.insert(key) {
                continue;
            }
            let stemcell = &instance.group.stemcell;
            if stemcell.models.is_empty() {
                missing.push(format!(
                    "stemcell '{}/{}' has no uploaded builds",
                    stemcell.name, stemcell.version
                ));
            } else if let Some(cpi) = instance.cpi() {
                // A CPI-bound zone needs either a build for that CPI or a
                // CPI-less build to fall back to.
                let satisfiable = stemcell.models.iter().any(|model| {
                    model.cpi.as_deref() == Some(cpi) || model.cpi.is_none()
                });
                if !satisfiable {
                    missing.push(format!(
                        "stemcell '{}/{}' (os '{}') has no build usable by \
                         CPI '{cpi}'",
                        stemcell.name, stemcell.version, stemcell.os
                    ));
                }
            }
            for (name, package) in &instance.group.packages {
                if package.blobstore_id.is_empty()
                    && package.signed_url.is_none()
                {
                    missing.push(format!(
                        "package '{name}' (instance group '{}') has no \
                         compiled or source artifact",
                        instance.group.name
                    ));
                }
            }
        }
        missing.sort();
        missing.dedup();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(CompatibilityError { missing })
        }
    }
}
