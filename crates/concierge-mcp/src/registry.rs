//! Consumer-scoped tool catalogs over leased instances.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, info};

use concierge_types::{InstanceKey, LaunchSpec, ToolSpec};

use crate::error::McpError;
use crate::manager::{InstanceManager, Lease};
use crate::protocol::RemoteTool;

/// A tool as exposed to one consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDescriptor {
    pub original_name: String,
    pub owner: InstanceKey,
    pub public_name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolDescriptor {
    pub fn to_spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.public_name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
        }
    }
}

/// The tools one consumer may call, plus the leases that keep their servers alive.
pub struct CatalogView {
    consumer: String,
    leases: HashMap<InstanceKey, Lease>,
    tools: BTreeMap<String, ToolDescriptor>,
}

impl CatalogView {
    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    pub fn get(&self, public_name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(public_name)
    }

    /// Descriptors in public-name order.
    pub fn tools(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.tools.values()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn instance_keys(&self) -> impl Iterator<Item = &InstanceKey> {
        self.leases.keys()
    }

    /// Drop tools for which `keep` returns false. Leases are unaffected.
    pub fn retain(&mut self, mut keep: impl FnMut(&ToolDescriptor) -> bool) {
        self.tools.retain(|_, tool| keep(tool));
    }
}

pub struct ToolRegistry {
    manager: Arc<InstanceManager>,
}

impl ToolRegistry {
    pub fn new(manager: Arc<InstanceManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<InstanceManager> {
        &self.manager
    }

    /// Lease every instance in `instances` and merge their tools.
    ///
    /// On any failure the leases taken so far are released before returning.
    pub async fn build_catalog(
        &self,
        consumer: &str,
        instances: &[(InstanceKey, LaunchSpec)],
    ) -> Result<CatalogView, McpError> {
        let mut seen = HashSet::new();
        let wanted: Vec<&(InstanceKey, LaunchSpec)> =
            instances.iter().filter(|(key, _)| seen.insert(key.clone())).collect();

        let acquired = join_all(
            wanted
                .iter()
                .map(|(key, spec)| self.manager.acquire(key, spec)),
        )
        .await;

        let mut leases = HashMap::new();
        let mut failure = None;
        for result in acquired {
            match result {
                Ok(lease) => {
                    leases.insert(lease.key().clone(), lease);
                }
                Err(e) if failure.is_none() => failure = Some(e),
                Err(_) => {}
            }
        }
        if let Some(e) = failure {
            release_all(leases).await;
            return Err(e);
        }

        let view = CatalogView {
            consumer: consumer.to_string(),
            leases,
            tools: BTreeMap::new(),
        };
        self.populate(view).await
    }

    /// Re-point `view` at a new instance set, keeping leases that are still wanted.
    pub async fn rebuild_catalog(
        &self,
        view: CatalogView,
        instances: &[(InstanceKey, LaunchSpec)],
    ) -> Result<CatalogView, McpError> {
        let CatalogView {
            consumer,
            mut leases,
            ..
        } = view;

        let wanted: HashSet<&InstanceKey> = instances.iter().map(|(key, _)| key).collect();
        let dropped: Vec<InstanceKey> = leases
            .keys()
            .filter(|key| !wanted.contains(key))
            .cloned()
            .collect();
        for key in dropped {
            if let Some(lease) = leases.remove(&key) {
                lease.release().await;
            }
        }

        let mut failure = None;
        for (key, spec) in instances {
            if leases.contains_key(key) {
                continue;
            }
            match self.manager.acquire(key, spec).await {
                Ok(lease) => {
                    leases.insert(key.clone(), lease);
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = failure {
            release_all(leases).await;
            return Err(e);
        }

        self.populate(CatalogView {
            consumer,
            leases,
            tools: BTreeMap::new(),
        })
        .await
    }

    async fn populate(&self, mut view: CatalogView) -> Result<CatalogView, McpError> {
        let listed = join_all(view.leases.values().map(|lease| async move {
            (lease.key().clone(), lease.list_tools().await)
        }))
        .await;

        let mut listings = Vec::new();
        for (key, result) in listed {
            match result {
                Ok(tools) => listings.push((key, tools)),
                Err(e) => {
                    release_all(view.leases).await;
                    return Err(e);
                }
            }
        }

        match merge_tools(listings) {
            Ok(tools) => {
                info!(
                    consumer = %view.consumer,
                    instances = view.leases.len(),
                    tools = tools.len(),
                    "Catalog built"
                );
                view.tools = tools;
                Ok(view)
            }
            Err(e) => {
                release_all(view.leases).await;
                Err(e)
            }
        }
    }

    /// Invoke a catalog tool by its public name.
    pub async fn dispatch(
        &self,
        view: &CatalogView,
        public_name: &str,
        arguments: Value,
    ) -> Result<String, McpError> {
        let tool = view
            .tools
            .get(public_name)
            .ok_or_else(|| McpError::UnknownTool(public_name.to_string()))?;
        let lease = view
            .leases
            .get(&tool.owner)
            .ok_or_else(|| McpError::UnknownTool(public_name.to_string()))?;
        debug!(
            consumer = %view.consumer,
            tool = %public_name,
            owner = %tool.owner,
            "Dispatching tool call"
        );
        lease.invoke(&tool.original_name, arguments).await
    }

    /// Release every lease held by `view`.
    pub async fn release(&self, view: CatalogView) {
        debug!(consumer = %view.consumer, leases = view.leases.len(), "Releasing catalog");
        release_all(view.leases).await;
    }
}

async fn release_all(leases: HashMap<InstanceKey, Lease>) {
    join_all(leases.into_values().map(Lease::release)).await;
}

/// Assign unique public names across all listings.
///
/// Names get the capability's namespace prefix. Names that still clash
/// between instances get the capability's collision prefix when their
/// namespace prefix is empty. Anything clashing after that is a conflict.
pub fn merge_tools(
    mut listings: Vec<(InstanceKey, Vec<RemoteTool>)>,
) -> Result<BTreeMap<String, ToolDescriptor>, McpError> {
    listings.sort_by(|a, b| a.0.cmp(&b.0));

    let mut candidates: Vec<ToolDescriptor> = listings
        .into_iter()
        .flat_map(|(key, tools)| {
            tools.into_iter().map(move |tool| ToolDescriptor {
                public_name: format!("{}{}", key.capability.namespace_prefix(), tool.name),
                original_name: tool.name,
                owner: key.clone(),
                description: tool.description.unwrap_or_default(),
                input_schema: tool.input_schema,
            })
        })
        .collect();

    let mut owners: HashMap<&str, HashSet<&InstanceKey>> = HashMap::new();
    for tool in &candidates {
        owners.entry(&tool.public_name).or_default().insert(&tool.owner);
    }
    let clashing: HashSet<String> = owners
        .into_iter()
        .filter(|(_, keys)| keys.len() > 1)
        .map(|(name, _)| name.to_string())
        .collect();

    for tool in &mut candidates {
        if clashing.contains(&tool.public_name) && tool.owner.capability.namespace_prefix().is_empty() {
            tool.public_name = format!("{}{}", tool.owner.capability.collision_prefix(), tool.public_name);
        }
    }

    let mut catalog: BTreeMap<String, ToolDescriptor> = BTreeMap::new();
    for tool in candidates {
        if let Some(existing) = catalog.get(&tool.public_name) {
            return Err(McpError::CatalogConflict {
                name: tool.public_name.clone(),
                first: existing.owner.to_string(),
                second: tool.owner.to_string(),
            });
        }
        catalog.insert(tool.public_name.clone(), tool);
    }
    Ok(catalog)
}
