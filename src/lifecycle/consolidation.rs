use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{Classification, ServiceCatalog};
use crate::error::{ConsolidationError, Result};
use crate::graph::DependencyGraph;
use crate::lazy::LazyController;
use crate::registry::{LifecycleState, ServiceRegistry};

/// How a consolidation candidate set was identified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsolidationType {
    /// Services sharing a declared consolidation_group label.
    Declared,
    /// Services bucketed together by memory footprint.
    MemoryBased,
    /// Services whose co-access sets overlap.
    DependencyBased,
}

impl ConsolidationType {
    fn savings_percent(&self) -> f64 {
        match self {
            ConsolidationType::Declared => 25.0,
            ConsolidationType::MemoryBased => 15.0,
            ConsolidationType::DependencyBased => 20.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsolidationOpportunity {
    pub label: String,
    pub consolidation_type: ConsolidationType,
    pub services: Vec<String>,
    pub estimated_savings_percent: f64,
    pub rationale: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsolidationPlan {
    pub id: String,
    pub consolidation_type: ConsolidationType,
    pub primary: String,
    pub secondaries: Vec<String>,
    pub estimated_memory_savings_mb: f64,
    pub risk: RiskLevel,
    pub migration_steps: Vec<String>,
    pub rollback_steps: Vec<String>,
    /// Union of the involved services' public operations; these must
    /// remain callable after the merge.
    pub api_contracts: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanValidation {
    pub can_execute: bool,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsolidationOutcome {
    pub plan_id: String,
    pub completed_steps: Vec<String>,
    pub rolled_back: bool,
}

struct RollbackState {
    /// Dependents each secondary had before edge rewiring.
    dependents: HashMap<String, Vec<String>>,
    aliased: Vec<String>,
}

/// Identifies merge opportunities, builds validated plans, and executes
/// them by rewiring the registry and dependency graph.
///
/// The merged shape is coordinator plus leaves: the primary owns the
/// combined surface and secondary names become registry aliases onto
/// it; nothing points back from the primary to the retired names.
pub struct ConsolidationManager {
    catalog: Arc<ServiceCatalog>,
    graph: Arc<RwLock<DependencyGraph>>,
    registry: Arc<ServiceRegistry>,
    lazy: Arc<LazyController>,
    plans: Mutex<HashMap<String, ConsolidationPlan>>,
    outcomes: Mutex<Vec<ConsolidationOutcome>>,
}

impl ConsolidationManager {
    pub fn new(
        catalog: Arc<ServiceCatalog>,
        graph: Arc<RwLock<DependencyGraph>>,
        registry: Arc<ServiceRegistry>,
        lazy: Arc<LazyController>,
    ) -> Self {
        Self {
            catalog,
            graph,
            registry,
            lazy,
            plans: Mutex::new(HashMap::new()),
            outcomes: Mutex::new(Vec::new()),
        }
    }

    /// Identify merge candidates: declared groups, memory-footprint
    /// buckets with at least three members, and services with
    /// overlapping co-access sets.
    pub async fn identify_opportunities(&self) -> Vec<ConsolidationOpportunity> {
        let mut opportunities = Vec::new();

        for (label, members) in self.graph.read().await.consolidation_groups() {
            if members.len() >= 2 {
                opportunities.push(ConsolidationOpportunity {
                    label: format!("declared:{label}"),
                    consolidation_type: ConsolidationType::Declared,
                    estimated_savings_percent: ConsolidationType::Declared.savings_percent(),
                    rationale: format!("services declare consolidation group {label:?}"),
                    services: members,
                });
            }
        }

        let mut buckets: HashMap<&'static str, Vec<String>> = HashMap::new();
        for config in self.catalog.services() {
            if config.classification == Classification::Essential {
                continue;
            }
            let bucket = match config.resources.memory_mb {
                0..=63 => "small",
                64..=256 => "medium",
                _ => "large",
            };
            buckets.entry(bucket).or_default().push(config.name.clone());
        }
        for (bucket, mut members) in buckets {
            if members.len() >= 3 {
                members.sort();
                opportunities.push(ConsolidationOpportunity {
                    label: format!("memory:{bucket}"),
                    consolidation_type: ConsolidationType::MemoryBased,
                    estimated_savings_percent: ConsolidationType::MemoryBased.savings_percent(),
                    rationale: format!("{} services share the {bucket} memory bucket", members.len()),
                    services: members,
                });
            }
        }

        let usage = self.lazy.usage_report().await;
        let mut names: Vec<&String> = usage.patterns.keys().collect();
        names.sort();
        for (index, a) in names.iter().enumerate() {
            for b in names.iter().skip(index + 1) {
                let co_a = &usage.patterns[*a].co_accessed_services;
                let co_b = &usage.patterns[*b].co_accessed_services;
                let overlap: HashSet<&String> = co_a.intersection(co_b).collect();
                if overlap.len() >= 2 {
                    opportunities.push(ConsolidationOpportunity {
                        label: format!("coaccess:{a}+{b}"),
                        consolidation_type: ConsolidationType::DependencyBased,
                        estimated_savings_percent: ConsolidationType::DependencyBased
                            .savings_percent(),
                        rationale: format!(
                            "co-access sets overlap in {} other services",
                            overlap.len()
                        ),
                        services: vec![(*a).clone(), (*b).clone()],
                    });
                }
            }
        }

        opportunities
    }

    /// Build a consolidation plan for a service set: pick the primary,
    /// estimate savings, assess risk, and record the API contracts that
    /// must survive.
    pub async fn plan(
        &self,
        services: &[String],
        consolidation_type: ConsolidationType,
    ) -> Result<ConsolidationPlan> {
        let primary = self.select_primary(services).await;
        let secondaries: Vec<String> = services
            .iter()
            .filter(|name| **name != primary)
            .cloned()
            .collect();

        let secondary_memory: u64 = secondaries
            .iter()
            .filter_map(|name| self.catalog.get(name))
            .map(|config| config.resources.memory_mb)
            .sum();
        let estimated_memory_savings_mb =
            secondary_memory as f64 * consolidation_type.savings_percent() / 100.0;

        let risk = self.assess_risk(services, consolidation_type).await;
        let api_contracts = self.collect_contracts(services).await;

        let plan = ConsolidationPlan {
            id: Uuid::new_v4().to_string(),
            consolidation_type,
            migration_steps: vec![
                format!("stop secondaries: {}", secondaries.join(", ")),
                format!("redirect secondary names to {primary}"),
                format!("rewire dependents onto {primary}"),
                format!("verify contracts answer under {primary}"),
            ],
            rollback_steps: vec![
                "remove secondary name redirects".to_string(),
                "restore original dependency edges".to_string(),
                "reload secondaries on next access".to_string(),
            ],
            primary,
            secondaries,
            estimated_memory_savings_mb,
            risk,
            api_contracts,
            created_at: Utc::now(),
        };

        self.plans
            .lock()
            .await
            .insert(plan.id.clone(), plan.clone());
        Ok(plan)
    }

    /// Primary choice: best classification, then lowest startup
    /// priority, then broadest API surface, then currently-active.
    async fn select_primary(&self, services: &[String]) -> String {
        let mut best: Option<(u8, Reverse<i32>, usize, bool, String)> = None;
        for name in services {
            let Some(config) = self.catalog.get(name) else {
                continue;
            };
            let rank = match config.classification {
                Classification::Essential => 3u8,
                Classification::Optional => 2,
                Classification::Background => 1,
            };
            let breadth = self
                .registry
                .api_contract(name)
                .await
                .map(|c| c.len())
                .unwrap_or(0);
            let active = matches!(
                self.registry.state_of(name).await,
                Ok(LifecycleState::Active)
            );
            let key = (
                rank,
                Reverse(config.startup_priority),
                breadth,
                active,
                name.clone(),
            );
            if best.as_ref().map(|b| key > *b).unwrap_or(true) {
                best = Some(key);
            }
        }
        best.map(|(_, _, _, _, name)| name)
            .unwrap_or_else(|| services.first().cloned().unwrap_or_default())
    }

    async fn assess_risk(
        &self,
        services: &[String],
        consolidation_type: ConsolidationType,
    ) -> RiskLevel {
        let mut factors = match consolidation_type {
            ConsolidationType::Declared => 1u32,
            ConsolidationType::MemoryBased => 2,
            ConsolidationType::DependencyBased => 2,
        };

        let graph = self.graph.read().await;
        for name in services {
            if let Some(config) = self.catalog.get(name) {
                if config.classification == Classification::Essential {
                    factors += 2;
                }
            }
            if graph.dependents_of(name).len() >= 3 {
                factors += 1;
            }
        }

        if factors >= 8 {
            RiskLevel::Critical
        } else if factors >= 6 {
            RiskLevel::High
        } else if factors >= 3 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    async fn collect_contracts(&self, services: &[String]) -> Vec<String> {
        let mut contracts = Vec::new();
        for name in services {
            if let Ok(methods) = self.registry.api_contract(name).await {
                for method in methods {
                    if !contracts.contains(&method) {
                        contracts.push(method);
                    }
                }
            }
        }
        contracts.sort();
        contracts
    }

    /// Gate execution: contracts must be collision-free, the dependency
    /// graph must stay satisfiable, and risk must be below critical.
    pub async fn validate(&self, plan: &ConsolidationPlan) -> PlanValidation {
        let mut reasons = Vec::new();

        let mut involved = plan.secondaries.clone();
        involved.push(plan.primary.clone());
        for name in &involved {
            if !self.registry.is_registered(name).await {
                reasons.push(format!("service {name} is not registered"));
            }
        }

        // A method claimed by two services cannot route unambiguously.
        let mut owners: HashMap<String, Vec<String>> = HashMap::new();
        for name in &involved {
            if let Ok(methods) = self.registry.api_contract(name).await {
                for method in methods {
                    owners.entry(method).or_default().push(name.clone());
                }
            }
        }
        for (method, claimants) in owners {
            if claimants.len() > 1 {
                reasons.push(format!(
                    "API contract collision on {method}: {}",
                    claimants.join(", ")
                ));
            }
        }

        {
            let graph = self.graph.read().await;
            let primary_deps: HashSet<&String> =
                graph.dependencies_of(&plan.primary).iter().collect();
            for secondary in &plan.secondaries {
                if primary_deps.contains(secondary) {
                    reasons.push(format!(
                        "primary {} depends on secondary {}; merge would self-depend",
                        plan.primary, secondary
                    ));
                }
            }
        }

        if plan.risk >= RiskLevel::Critical {
            reasons.push("risk level is critical".to_string());
        }

        PlanValidation {
            can_execute: reasons.is_empty(),
            reasons,
        }
    }

    /// Execute a plan: stop secondaries, redirect their names to the
    /// primary, and rewire graph edges. A step failure in a high-risk
    /// plan triggers rollback of everything done so far.
    pub async fn apply(&self, plan_id: &str) -> Result<ConsolidationOutcome> {
        let plan = self
            .plans
            .lock()
            .await
            .get(plan_id)
            .cloned()
            .ok_or_else(|| ConsolidationError::PlanNotFound {
                plan_id: plan_id.to_string(),
            })?;

        let validation = self.validate(&plan).await;
        if !validation.can_execute {
            return Err(ConsolidationError::ValidationBlocked {
                plan_id: plan_id.to_string(),
                reasons: validation.reasons,
            }
            .into());
        }

        info!(
            "Consolidating {} into {} (risk {:?})",
            plan.secondaries.join(", "),
            plan.primary,
            plan.risk
        );

        let mut rollback = RollbackState {
            dependents: HashMap::new(),
            aliased: Vec::new(),
        };
        {
            let graph = self.graph.read().await;
            for secondary in &plan.secondaries {
                rollback
                    .dependents
                    .insert(secondary.clone(), graph.dependents_of(secondary).to_vec());
            }
        }

        let mut completed = Vec::new();
        for secondary in &plan.secondaries {
            let has_live_state = matches!(
                self.registry.state_of(secondary).await,
                Ok(LifecycleState::Active | LifecycleState::Idle | LifecycleState::Suspended)
            );
            if has_live_state {
                if let Err(e) = self.registry.shutdown(secondary, None).await {
                    warn!("Consolidation stop of {} failed: {}", secondary, e);
                    if plan.risk >= RiskLevel::High {
                        self.rollback(&plan, &rollback).await;
                        self.record_outcome(&plan, completed, true).await;
                        return Err(ConsolidationError::ExecutionFailed {
                            plan_id: plan.id.clone(),
                            step: format!("stop {secondary}"),
                            reason: e.to_string(),
                        }
                        .into());
                    }
                    continue;
                }
                completed.push(format!("stopped {secondary}"));
            }

            self.registry.add_alias(secondary, &plan.primary).await;
            rollback.aliased.push(secondary.clone());
            completed.push(format!("aliased {secondary} -> {}", plan.primary));

            self.graph
                .write()
                .await
                .redirect_dependents(secondary, &plan.primary);
            completed.push(format!("rewired dependents of {secondary}"));
        }

        // The primary answers for every retired name from here on.
        if let Err(e) = self.registry.get(&plan.primary).await {
            warn!(
                "Primary {} not loadable after consolidation: {}",
                plan.primary, e
            );
            if plan.risk >= RiskLevel::High {
                self.rollback(&plan, &rollback).await;
                self.record_outcome(&plan, completed, true).await;
                return Err(ConsolidationError::ExecutionFailed {
                    plan_id: plan.id.clone(),
                    step: format!("activate primary {}", plan.primary),
                    reason: e.to_string(),
                }
                .into());
            }
        } else {
            completed.push(format!("activated primary {}", plan.primary));
        }

        let outcome = self.record_outcome(&plan, completed, false).await;
        Ok(outcome)
    }

    async fn rollback(&self, plan: &ConsolidationPlan, state: &RollbackState) {
        warn!("Rolling back consolidation plan {}", plan.id);
        for secondary in &state.aliased {
            self.registry.remove_alias(secondary).await;
        }
        let mut graph = self.graph.write().await;
        for (secondary, dependents) in &state.dependents {
            graph.restore_dependents(secondary, dependents.clone());
        }
    }

    async fn record_outcome(
        &self,
        plan: &ConsolidationPlan,
        completed_steps: Vec<String>,
        rolled_back: bool,
    ) -> ConsolidationOutcome {
        let outcome = ConsolidationOutcome {
            plan_id: plan.id.clone(),
            completed_steps,
            rolled_back,
        };
        self.outcomes.lock().await.push(outcome.clone());
        outcome
    }

    pub async fn plan_by_id(&self, plan_id: &str) -> Option<ConsolidationPlan> {
        self.plans.lock().await.get(plan_id).cloned()
    }

    pub async fn outcomes(&self) -> Vec<ConsolidationOutcome> {
        self.outcomes.lock().await.clone()
    }
}

impl std::fmt::Debug for ConsolidationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsolidationManager").finish()
    }
}
