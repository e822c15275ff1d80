// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! DNS names for instances and links.
//!
//! Two address shapes exist: the standard per-instance record
//! `<uuid-or-index>.<group>.<network>.<deployment>.<root-domain>`, and a
//! compact encoded query `q-<token>.q-g<token>.<root-domain>` used when
//! short addresses are enabled.  The encoded forms are produced through
//! [`DnsEncoder`] so that the resolver component (outside this core) can
//! map them back to the same target set; tokens must therefore be stable
//! for identical inputs.

use flotilla_director_types::link::LinkDefinition;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Turn a manifest name into a valid DNS label: lowercased, underscores
/// become dashes, anything else invalid is dropped.
pub fn canonical_label(name: &str) -> String {
    name.chars()
        .filter_map(|c| match c {
            'a'..='z' | '0'..='9' | '-' => Some(c),
            'A'..='Z' => Some(c.to_ascii_lowercase()),
            '_' => Some('-'),
            _ => None,
        })
        .collect()
}

/// The standard DNS record name for one instance hostname on one network.
///
/// `hostname` is the instance's UUID or numeric index and is emitted
/// verbatim; the other labels are canonicalized.
pub fn dns_record_name(
    hostname: &str,
    instance_group: &str,
    network: &str,
    deployment: &str,
    root_domain: &str,
) -> String {
    format!(
        "{hostname}.{}.{}.{}.{root_domain}",
        canonical_label(instance_group),
        canonical_label(network),
        canonical_label(deployment),
    )
}

/// Everything an encoder needs to scope a query to one instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceQuery<'a> {
    pub instance_uuid: &'a str,
    pub instance_group: &'a str,
    pub deployment: &'a str,
    pub network: &'a str,
    pub root_domain: &'a str,
}

/// Produces compact, resolver-decodable DNS queries.
///
/// Implementations must be idempotent: the same query yields the same
/// token every time, within a run and across runs backed by the same
/// registry.
pub trait DnsEncoder: Send + Sync {
    /// Encoded address selecting exactly this instance on this network.
    fn encode_instance_query(&self, query: &InstanceQuery<'_>) -> String;

    /// Encoded address selecting the provider group of `link`, suitable
    /// for handing to a link consumer.
    fn encode_link_query(
        &self,
        link: &LinkDefinition,
        query: &InstanceQuery<'_>,
    ) -> String;
}

#[derive(Debug, Default)]
struct RegistryInner {
    uuid_numbers: BTreeMap<String, u64>,
    network_ids: BTreeMap<String, u64>,
    /// (group type, group name, deployment) -> id.
    group_ids: BTreeMap<(String, String, String), u64>,
}

impl RegistryInner {
    fn number_for_uuid(&mut self, uuid: &str) -> u64 {
        let next = self.uuid_numbers.len() as u64 + 1;
        *self.uuid_numbers.entry(uuid.to_string()).or_insert(next)
    }

    fn id_for_network(&mut self, network: &str) -> u64 {
        let next = self.network_ids.len() as u64 + 1;
        *self.network_ids.entry(network.to_string()).or_insert(next)
    }

    fn id_for_group(
        &mut self,
        group_type: &str,
        name: &str,
        deployment: &str,
    ) -> u64 {
        let next = self.group_ids.len() as u64 + 1;
        *self
            .group_ids
            .entry((
                group_type.to_string(),
                name.to_string(),
                deployment.to_string(),
            ))
            .or_insert(next)
    }
}

/// In-memory [`DnsEncoder`]: assigns small stable ids on first use.
///
/// Suitable for tests and single-process use; the production encoder
/// persists its registry so ids survive director restarts.
#[derive(Debug, Default)]
pub struct RegistryDnsEncoder {
    inner: Mutex<RegistryInner>,
}

impl RegistryDnsEncoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DnsEncoder for RegistryDnsEncoder {
    fn encode_instance_query(&self, query: &InstanceQuery<'_>) -> String {
        let mut inner = self.inner.lock().unwrap();
        let m = inner.number_for_uuid(query.instance_uuid);
        let n = inner.id_for_network(query.network);
        let g = inner.id_for_group(
            "instance-group",
            query.instance_group,
            query.deployment,
        );
        format!("q-m{m}n{n}s0.q-g{g}.{}", query.root_domain)
    }

    fn encode_link_query(
        &self,
        link: &LinkDefinition,
        query: &InstanceQuery<'_>,
    ) -> String {
        let mut inner = self.inner.lock().unwrap();
        let g =
            inner.id_for_group("link", &link.group_name, query.deployment);
        format!("q-s0.q-g{g}.{}", query.root_domain)
    }
}
