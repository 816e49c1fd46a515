use std::collections::{BTreeMap, HashSet};
use std::fmt::Display;

use anyhow::{bail, Context, Result};
use futures::future::join_all;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    api::{Api, ListParams},
    core::ApiResource,
    discovery::{self, verbs, ApiGroup, Scope},
    Client, ResourceExt,
};
use mcpsync_core::{should_skip_resource, Gvr};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const CRD_GROUP: &str = "apiextensions.k8s.io";
const CRD_RESOURCE: &str = "customresourcedefinitions";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("CRD {0} has no spec.group")]
    MissingGroup(String),
    #[error("CRD {0} has no spec.names.plural")]
    MissingPlural(String),
    #[error("CRD {0} declares no served version")]
    NoServedVersion(String),
}

/// A type to watch: its GVR plus what an informer needs to build an `Api`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedResource {
    pub gvr: Gvr,
    pub kind: String,
    pub namespaced: bool,
}

impl WatchedResource {
    pub fn from_api_resource(ar: &ApiResource, namespaced: bool) -> Self {
        Self { gvr: Gvr::new(&ar.group, &ar.version, &ar.plural), kind: ar.kind.clone(), namespaced }
    }

    pub fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: self.gvr.group.clone(),
            version: self.gvr.version.clone(),
            api_version: self.gvr.api_version(),
            kind: self.kind.clone(),
            plural: self.gvr.resource.clone(),
        }
    }
}

pub fn is_crd_resource(gvr: &Gvr) -> bool { gvr.group == CRD_GROUP && gvr.resource == CRD_RESOURCE }

/// The single GVR to watch for a CRD: the storage version, else the first served one.
pub fn crd_resource(crd: &CustomResourceDefinition) -> Result<WatchedResource, DiscoveryError> {
    let name = crd.name_any();
    let spec = &crd.spec;
    if spec.group.is_empty() {
        return Err(DiscoveryError::MissingGroup(name));
    }
    if spec.names.plural.is_empty() {
        return Err(DiscoveryError::MissingPlural(name));
    }
    let version = spec
        .versions
        .iter()
        .find(|v| v.storage)
        .or_else(|| spec.versions.iter().find(|v| v.served))
        .ok_or_else(|| DiscoveryError::NoServedVersion(name.clone()))?;
    Ok(WatchedResource {
        gvr: Gvr::new(&spec.group, &version.name, &spec.names.plural),
        kind: spec.names.kind.clone(),
        namespaced: spec.scope == "Namespaced",
    })
}

/// Union of built-in and CRD-derived types, with noisy types and
/// subresources removed. A CRD's own entry replaces whatever versions API
/// discovery reported for the same group/resource.
pub fn merge_discovered(builtin: Vec<WatchedResource>, crds: Vec<WatchedResource>) -> Vec<WatchedResource> {
    let crd_keys: HashSet<(String, String)> =
        crds.iter().map(|r| (r.gvr.group.clone(), r.gvr.resource.clone())).collect();
    let mut out: BTreeMap<(String, String), WatchedResource> = BTreeMap::new();
    let builtin = builtin.into_iter().filter(|r| !crd_keys.contains(&(r.gvr.group.clone(), r.gvr.resource.clone())));
    for r in builtin.chain(crds) {
        if r.gvr.is_subresource() || should_skip_resource(&r.gvr.group, &r.gvr.resource) {
            continue;
        }
        out.entry((r.gvr.group.clone(), r.gvr.resource.clone())).or_insert(r);
    }
    out.into_values().collect()
}

/// List/watchable resources of one API group at its recommended versions.
fn watchable(group: &ApiGroup) -> Vec<WatchedResource> {
    let mut out = Vec::new();
    for (ar, caps) in group.recommended_resources() {
        if !caps.supports_operation(verbs::LIST) || !caps.supports_operation(verbs::WATCH) {
            debug!(group = %ar.group, resource = %ar.plural, "not list/watchable; skipping");
            continue;
        }
        out.push(WatchedResource::from_api_resource(&ar, matches!(caps.scope, Scope::Namespaced)));
    }
    out
}

/// Fold per-group discovery results. A group that failed is logged and
/// counted, and the rest are kept. Returns the resources and the names of the
/// groups that failed.
pub fn gather_groups<E: Display>(
    results: impl IntoIterator<Item = (String, Result<Vec<WatchedResource>, E>)>,
) -> (Vec<WatchedResource>, Vec<String>) {
    let mut resources = Vec::new();
    let mut failed = Vec::new();
    for (name, result) in results {
        match result {
            Ok(found) => resources.extend(found),
            Err(e) => {
                metrics::counter!("discovery_group_errors_total", 1u64);
                warn!(group = %name, error = %e, "API group discovery failed; skipping group");
                failed.push(name);
            }
        }
    }
    (resources, failed)
}

/// Discover every watchable type the cluster serves, including CRDs.
///
/// Each group is queried on its own, so an unavailable aggregated API only
/// drops its own group. Discovery fails only when no group answered.
pub async fn discover(client: &Client) -> Result<Vec<WatchedResource>> {
    let groups = client.list_api_groups().await.context("listing API groups")?;
    let names: Vec<String> = std::iter::once(ApiGroup::CORE_GROUP.to_string())
        .chain(groups.groups.into_iter().map(|g| g.name))
        .collect();
    let results = join_all(names.iter().map(|name| async move {
        let found = discovery::group(client, name).await.map(|g| watchable(&g));
        (name.clone(), found)
    }))
    .await;
    let (builtin, failed) = gather_groups(results);
    if failed.len() == names.len() {
        bail!("every API group failed discovery ({})", failed.join(", "));
    }

    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    let crds = api.list(&ListParams::default()).await.context("listing CustomResourceDefinitions")?;
    let mut custom = Vec::new();
    for crd in crds.iter() {
        match crd_resource(crd) {
            Ok(r) => custom.push(r),
            Err(e) => {
                metrics::counter!("discovery_crd_errors_total", 1u64);
                warn!(error = %e, "skipping malformed CRD");
            }
        }
    }

    let (n_builtin, n_crds) = (builtin.len(), custom.len());
    let out = merge_discovered(builtin, custom);
    info!(builtin = n_builtin, crds = n_crds, failed_groups = failed.len(), watched = out.len(), "discovery complete");
    Ok(out)
}
