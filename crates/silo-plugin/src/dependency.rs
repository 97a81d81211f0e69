//! Start-order resolution over declared plugin dependencies.
//!
//! A DFS topological sort with explicit cycle detection: dependencies
//! start before their dependents, unknown dependencies and cycles fail
//! resolution outright rather than starting a partial graph.

use crate::descriptor::PluginDescriptor;
use crate::{PluginError, PluginResult};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Resolve the order in which the given plugins must start.
///
/// The result lists every plugin exactly once, each after all of its
/// declared dependencies. Input order is the tie-break, so resolution is
/// deterministic.
pub fn resolve_start_order(descriptors: &[PluginDescriptor]) -> PluginResult<Vec<String>> {
    let by_id: HashMap<&str, &PluginDescriptor> = descriptors
        .iter()
        .map(|d| (d.id.as_str(), d))
        .collect();

    // Validate references before walking.
    for descriptor in descriptors {
        for dependency in &descriptor.dependencies {
            if !by_id.contains_key(dependency.as_str()) {
                return Err(PluginError::UnresolvedDependency {
                    plugin: descriptor.id.clone(),
                    detail: format!("depends on unknown plugin '{dependency}'"),
                });
            }
        }
    }

    let mut order = Vec::with_capacity(descriptors.len());
    let mut visited: HashSet<&str> = HashSet::new();
    let mut visiting: HashSet<&str> = HashSet::new();

    fn visit<'a>(
        id: &'a str,
        by_id: &HashMap<&'a str, &'a PluginDescriptor>,
        visited: &mut HashSet<&'a str>,
        visiting: &mut HashSet<&'a str>,
        order: &mut Vec<String>,
    ) -> PluginResult<()> {
        if visited.contains(id) {
            return Ok(());
        }
        if !visiting.insert(id) {
            return Err(PluginError::UnresolvedDependency {
                plugin: id.to_string(),
                detail: "dependency cycle".to_string(),
            });
        }

        for dependency in &by_id[id].dependencies {
            visit(dependency.as_str(), by_id, visited, visiting, order)?;
        }

        visiting.remove(id);
        visited.insert(id);
        order.push(id.to_string());
        Ok(())
    }

    for descriptor in descriptors {
        visit(
            descriptor.id.as_str(),
            &by_id,
            &mut visited,
            &mut visiting,
            &mut order,
        )?;
    }

    debug!(?order, "plugin start order resolved");
    Ok(order)
}
