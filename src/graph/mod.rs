use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use crate::config::{Classification, ServiceCatalog};
use crate::error::{ConfigError, Result};

/// Dependency graph over the service catalog with forward and reverse
/// edges, used to compute startup plans and consolidation groupings.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: HashMap<String, GraphNode>,
}

#[derive(Debug, Clone)]
struct GraphNode {
    classification: Classification,
    startup_priority: i32,
    memory_mb: u64,
    consolidation_group: Option<String>,
    dependencies: Vec<String>,
    dependents: Vec<String>,
}

/// A computed startup plan over a selected service set.
#[derive(Debug, Clone, Serialize)]
pub struct StartupPlan {
    /// Full startup order, dependency-ranked, priority tie-broken.
    pub order: Vec<String>,
    /// Levelized parallel groups; group k+1 starts only after group k.
    pub groups: Vec<Vec<String>>,
    /// Longest dependency chain by estimated time.
    pub critical_path: Vec<String>,
    /// Sum of per-group maxima: the best-case wall-clock estimate.
    pub estimated_wall_clock_secs: f64,
    /// Per-service startup time estimates.
    pub estimates_secs: HashMap<String, f64>,
    /// Residual-cycle fallbacks taken during levelization. Empty in any
    /// validated graph.
    pub anomalies: Vec<String>,
}

impl DependencyGraph {
    /// Build the graph and run fatal validation: every dependency must
    /// resolve within the catalog and no cycles may exist.
    pub fn build(catalog: &ServiceCatalog) -> Result<Self> {
        let mut nodes: HashMap<String, GraphNode> = catalog
            .services()
            .map(|config| {
                (
                    config.name.clone(),
                    GraphNode {
                        classification: config.classification,
                        startup_priority: config.startup_priority,
                        memory_mb: config.resources.memory_mb,
                        consolidation_group: config.consolidation_group.clone(),
                        dependencies: config.dependencies.clone(),
                        dependents: Vec::new(),
                    },
                )
            })
            .collect();

        // Resolve edges before wiring reverse links.
        for config in catalog.services() {
            for dep in &config.dependencies {
                if !nodes.contains_key(dep) {
                    return Err(ConfigError::UnresolvedDependency {
                        service: config.name.clone(),
                        dependency: dep.clone(),
                    }
                    .into());
                }
            }
        }
        for config in catalog.services() {
            for dep in &config.dependencies {
                nodes
                    .get_mut(dep)
                    .expect("dependency resolved above")
                    .dependents
                    .push(config.name.clone());
            }
        }
        for node in nodes.values_mut() {
            node.dependents.sort();
        }

        let graph = Self { nodes };

        let cycles = graph.detect_cycles();
        if !cycles.is_empty() {
            return Err(ConfigError::CircularDependency {
                cycles: cycles
                    .iter()
                    .map(|cycle| cycle.join(" -> "))
                    .collect(),
            }
            .into());
        }

        for warning in graph.classification_warnings() {
            warn!("{warning}");
        }

        Ok(graph)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn dependencies_of(&self, name: &str) -> &[String] {
        self.nodes
            .get(name)
            .map(|n| n.dependencies.as_slice())
            .unwrap_or(&[])
    }

    pub fn dependents_of(&self, name: &str) -> &[String] {
        self.nodes
            .get(name)
            .map(|n| n.dependents.as_slice())
            .unwrap_or(&[])
    }

    /// Rewire dependents of `from` to depend on `to` instead. Used when
    /// consolidation folds a secondary service into a primary.
    pub fn redirect_dependents(&mut self, from: &str, to: &str) {
        let dependents = self
            .nodes
            .get(from)
            .map(|n| n.dependents.clone())
            .unwrap_or_default();

        for dependent in &dependents {
            if dependent == to {
                continue;
            }
            if let Some(node) = self.nodes.get_mut(dependent) {
                for dep in node.dependencies.iter_mut() {
                    if dep == from {
                        *dep = to.to_string();
                    }
                }
                node.dependencies.dedup();
            }
        }
        if let Some(node) = self.nodes.get_mut(from) {
            node.dependents.clear();
        }
        if let Some(node) = self.nodes.get_mut(to) {
            for dependent in dependents {
                if dependent != to && !node.dependents.contains(&dependent) {
                    node.dependents.push(dependent);
                }
            }
            node.dependents.sort();
        }
    }

    /// Restore a previously redirected edge set. Counterpart of
    /// [`redirect_dependents`] for consolidation rollback.
    pub fn restore_dependents(&mut self, service: &str, dependents: Vec<String>) {
        for dependent in &dependents {
            if let Some(node) = self.nodes.get_mut(dependent) {
                if !node.dependencies.iter().any(|d| d == service) {
                    node.dependencies.push(service.to_string());
                }
            }
        }
        if let Some(node) = self.nodes.get_mut(service) {
            node.dependents = dependents;
            node.dependents.sort();
        }
    }

    /// All elementary cycles reachable from any node, via three-color
    /// DFS. An empty result means the graph is a DAG.
    pub fn detect_cycles(&self) -> Vec<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut colors: HashMap<&str, Color> =
            self.nodes.keys().map(|n| (n.as_str(), Color::White)).collect();
        let mut cycles = Vec::new();

        fn dfs<'a>(
            graph: &'a DependencyGraph,
            name: &'a str,
            colors: &mut HashMap<&'a str, Color>,
            path: &mut Vec<&'a str>,
            cycles: &mut Vec<Vec<String>>,
        ) {
            colors.insert(name, Color::Gray);
            path.push(name);

            if let Some(node) = graph.nodes.get(name) {
                for dep in &node.dependencies {
                    match colors.get(dep.as_str()) {
                        Some(Color::Gray) => {
                            let start = path.iter().position(|n| *n == dep).unwrap_or(0);
                            let mut cycle: Vec<String> =
                                path[start..].iter().map(|s| s.to_string()).collect();
                            cycle.push(dep.clone());
                            cycles.push(cycle);
                        }
                        Some(Color::White) => dfs(graph, dep, colors, path, cycles),
                        _ => {}
                    }
                }
            }

            path.pop();
            colors.insert(name, Color::Black);
        }

        let mut names: Vec<&str> = self.nodes.keys().map(String::as_str).collect();
        names.sort();
        for name in names {
            if colors[name] == Color::White {
                let mut path = Vec::new();
                dfs(self, name, &mut colors, &mut path, &mut cycles);
            }
        }
        cycles
    }

    /// Non-fatal warnings: essential services should depend only on
    /// essential services.
    pub fn classification_warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let mut names: Vec<&String> = self.nodes.keys().collect();
        names.sort();
        for name in names {
            let node = &self.nodes[name];
            if node.classification != Classification::Essential {
                continue;
            }
            for dep in &node.dependencies {
                if let Some(dep_node) = self.nodes.get(dep) {
                    if dep_node.classification != Classification::Essential {
                        warnings.push(format!(
                            "Essential service {} depends on {} service {}",
                            name,
                            dep_node.classification.as_str(),
                            dep
                        ));
                    }
                }
            }
        }
        warnings
    }

    /// Estimated startup time for one service:
    /// base(classification) x (1 + 0.2 x deps) x (1 + memory_mb / 1000).
    pub fn estimate_startup_secs(&self, name: &str) -> f64 {
        let Some(node) = self.nodes.get(name) else {
            return 0.0;
        };
        let base = node.classification.base_startup_secs();
        let dep_factor = 1.0 + 0.2 * node.dependencies.len() as f64;
        let memory_factor = 1.0 + node.memory_mb as f64 / 1000.0;
        base * dep_factor * memory_factor
    }

    /// Compute the startup plan for a selected subset of services.
    ///
    /// Dependencies outside the selection are treated as satisfied for
    /// ordering purposes; the registry still enforces activation of
    /// every dependency at load time.
    pub fn plan(&self, included: &[String]) -> StartupPlan {
        let selected: HashSet<&str> = included
            .iter()
            .map(String::as_str)
            .filter(|n| self.nodes.contains_key(*n))
            .collect();

        let groups = self.levelize(&selected);
        let order: Vec<String> = groups.0.iter().flatten().cloned().collect();

        let estimates_secs: HashMap<String, f64> = selected
            .iter()
            .map(|n| (n.to_string(), self.estimate_startup_secs(n)))
            .collect();

        let estimated_wall_clock_secs = groups
            .0
            .iter()
            .map(|group| {
                group
                    .iter()
                    .map(|n| estimates_secs.get(n).copied().unwrap_or(0.0))
                    .fold(0.0_f64, f64::max)
            })
            .sum();

        let critical_path = self.critical_path(&selected, &estimates_secs);

        StartupPlan {
            order,
            groups: groups.0,
            critical_path,
            estimated_wall_clock_secs,
            estimates_secs,
            anomalies: groups.1,
        }
    }

    /// Greedy levelization: repeatedly emit the set of services whose
    /// unresolved dependencies within the remaining set are empty.
    fn levelize(&self, selected: &HashSet<&str>) -> (Vec<Vec<String>>, Vec<String>) {
        let mut remaining: HashSet<&str> = selected.clone();
        let mut groups = Vec::new();
        let mut anomalies = Vec::new();

        while !remaining.is_empty() {
            let mut ready: Vec<&str> = remaining
                .iter()
                .copied()
                .filter(|name| {
                    self.nodes[*name]
                        .dependencies
                        .iter()
                        .all(|dep| !remaining.contains(dep.as_str()))
                })
                .collect();

            if ready.is_empty() {
                // Residual cycle; should not occur after validation.
                let fallback = remaining
                    .iter()
                    .copied()
                    .min_by_key(|name| (self.nodes[*name].startup_priority, *name))
                    .expect("remaining is non-empty");
                anomalies.push(fallback.to_string());
                debug!("Levelization anomaly: forcing {} out of residual cycle", fallback);
                ready.push(fallback);
            }

            ready.sort_by_key(|name| (self.nodes[*name].startup_priority, *name));
            for name in &ready {
                remaining.remove(name);
            }
            groups.push(ready.iter().map(|s| s.to_string()).collect());
        }

        (groups, anomalies)
    }

    /// Longest dependency chain by estimated time over the selection.
    fn critical_path(
        &self,
        selected: &HashSet<&str>,
        estimates: &HashMap<String, f64>,
    ) -> Vec<String> {
        fn longest<'a>(
            graph: &'a DependencyGraph,
            name: &'a str,
            selected: &HashSet<&'a str>,
            estimates: &HashMap<String, f64>,
            memo: &mut HashMap<&'a str, (f64, Vec<String>)>,
        ) -> (f64, Vec<String>) {
            if let Some(cached) = memo.get(name) {
                return cached.clone();
            }
            let own = estimates.get(name).copied().unwrap_or(0.0);
            let mut best = (0.0_f64, Vec::new());
            for dep in &graph.nodes[name].dependencies {
                if selected.contains(dep.as_str()) {
                    let sub = longest(graph, dep, selected, estimates, memo);
                    if sub.0 > best.0 {
                        best = sub;
                    }
                }
            }
            let mut path = best.1;
            path.push(name.to_string());
            let result = (best.0 + own, path);
            memo.insert(name, result.clone());
            result
        }

        let mut memo = HashMap::new();
        let mut best: (f64, Vec<String>) = (0.0, Vec::new());
        let mut names: Vec<&str> = selected.iter().copied().collect();
        names.sort();
        for name in names {
            let candidate = longest(self, name, selected, estimates, &mut memo);
            if candidate.0 > best.0 {
                best = candidate;
            }
        }
        best.1
    }

    /// Shutdown order is the reverse of the startup order.
    pub fn shutdown_order(&self, included: &[String]) -> Vec<String> {
        let mut order = self.plan(included).order;
        order.reverse();
        order
    }

    /// Services sharing a declared consolidation_group label.
    pub fn consolidation_groups(&self) -> HashMap<String, Vec<String>> {
        let mut groups: HashMap<String, Vec<String>> = HashMap::new();
        for (name, node) in &self.nodes {
            if let Some(label) = &node.consolidation_group {
                groups.entry(label.clone()).or_default().push(name.clone());
            }
        }
        for members in groups.values_mut() {
            members.sort();
        }
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Classification, ServiceCatalog, ServiceConfig};

    fn catalog(configs: Vec<ServiceConfig>) -> ServiceCatalog {
        ServiceCatalog::from_configs(configs, "production").unwrap()
    }

    #[test]
    fn topological_order_respects_dependencies_and_priority() {
        let graph = DependencyGraph::build(&catalog(vec![
            ServiceConfig::new("a", Classification::Essential).with_priority(10),
            ServiceConfig::new("b", Classification::Essential)
                .with_priority(5)
                .with_dependencies(["a"]),
            ServiceConfig::new("c", Classification::Essential).with_priority(1),
        ]))
        .unwrap();

        let plan = graph.plan(&["a".into(), "b".into(), "c".into()]);
        assert_eq!(plan.order, vec!["c", "a", "b"]);
        assert_eq!(plan.groups, vec![vec!["c", "a"], vec!["b"]]);
        assert!(plan.anomalies.is_empty());
    }

    #[test]
    fn plan_is_stable_across_runs() {
        let configs = vec![
            ServiceConfig::new("x", Classification::Optional).with_priority(50),
            ServiceConfig::new("y", Classification::Optional).with_priority(50),
            ServiceConfig::new("z", Classification::Optional).with_priority(50),
        ];
        let graph = DependencyGraph::build(&catalog(configs)).unwrap();
        let included: Vec<String> = vec!["x".into(), "y".into(), "z".into()];
        let first = graph.plan(&included);
        let second = graph.plan(&included);
        assert_eq!(first.order, second.order);
        // Equal priorities break ties by name.
        assert_eq!(first.order, vec!["x", "y", "z"]);
    }

    #[test]
    fn cycles_are_fatal_and_reported() {
        let result = DependencyGraph::build(&catalog(vec![
            ServiceConfig::new("a", Classification::Optional).with_dependencies(["b"]),
            ServiceConfig::new("b", Classification::Optional).with_dependencies(["a"]),
        ]));
        let err = result.unwrap_err();
        assert!(err.to_string().contains("Circular dependency"));
    }

    #[test]
    fn unresolved_dependency_is_fatal() {
        let result = DependencyGraph::build(&catalog(vec![
            ServiceConfig::new("a", Classification::Optional).with_dependencies(["ghost"]),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn critical_path_follows_longest_chain() {
        let graph = DependencyGraph::build(&catalog(vec![
            ServiceConfig::new("base", Classification::Essential).with_memory_mb(100),
            ServiceConfig::new("mid", Classification::Optional)
                .with_dependencies(["base"])
                .with_memory_mb(200),
            ServiceConfig::new("top", Classification::Optional)
                .with_dependencies(["mid"])
                .with_memory_mb(100),
            ServiceConfig::new("leaf", Classification::Background),
        ]))
        .unwrap();

        let plan = graph.plan(&[
            "base".into(),
            "mid".into(),
            "top".into(),
            "leaf".into(),
        ]);
        assert_eq!(plan.critical_path, vec!["base", "mid", "top"]);
        assert!(plan.estimated_wall_clock_secs > 0.0);
    }

    #[test]
    fn estimate_formula_matches_definition() {
        let graph = DependencyGraph::build(&catalog(vec![
            ServiceConfig::new("dep", Classification::Essential),
            ServiceConfig::new("svc", Classification::Optional)
                .with_dependencies(["dep"])
                .with_memory_mb(500),
        ]))
        .unwrap();

        // 2.0 * (1 + 0.2*1) * (1 + 500/1000) = 3.6
        let estimate = graph.estimate_startup_secs("svc");
        assert!((estimate - 3.6).abs() < 1e-9);
    }

    #[test]
    fn shutdown_order_reverses_startup() {
        let graph = DependencyGraph::build(&catalog(vec![
            ServiceConfig::new("a", Classification::Essential),
            ServiceConfig::new("b", Classification::Optional).with_dependencies(["a"]),
        ]))
        .unwrap();
        let included: Vec<String> = vec!["a".into(), "b".into()];
        let startup = graph.plan(&included).order;
        let shutdown = graph.shutdown_order(&included);
        let reversed: Vec<String> = startup.into_iter().rev().collect();
        assert_eq!(shutdown, reversed);
    }

    #[test]
    fn declared_consolidation_groups_collected() {
        let graph = DependencyGraph::build(&catalog(vec![
            ServiceConfig::new("a", Classification::Optional).with_consolidation_group("media"),
            ServiceConfig::new("b", Classification::Optional).with_consolidation_group("media"),
            ServiceConfig::new("c", Classification::Optional),
        ]))
        .unwrap();
        let groups = graph.consolidation_groups();
        assert_eq!(groups["media"], vec!["a", "b"]);
        assert_eq!(groups.len(), 1);
    }
}
