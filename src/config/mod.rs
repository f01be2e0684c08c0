use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{ConfigError, Result};

/// Service classification controlling startup and suspension policy.
///
/// Essential services are always on and never idle-suspended, optional
/// services load lazily, background services carry the lowest priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Essential,
    Optional,
    Background,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Essential => "essential",
            Classification::Optional => "optional",
            Classification::Background => "background",
        }
    }

    /// Base startup-time estimate in seconds, used by the dependency
    /// analyzer's critical-path computation.
    pub fn base_startup_secs(&self) -> f64 {
        match self {
            Classification::Essential => 0.5,
            Classification::Optional => 2.0,
            Classification::Background => 1.0,
        }
    }
}

/// Per-service resource declaration from the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ResourceRequirements {
    pub memory_mb: u64,
    pub cpu_cores: f64,
    pub gpu_memory_mb: u64,
    pub disk_mb: u64,
    pub network_mbps: f64,
}

/// Immutable per-service configuration loaded from the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub classification: Classification,
    pub startup_priority: i32,
    pub dependencies: Vec<String>,
    pub resources: ResourceRequirements,
    /// Seconds of inactivity before idle suspension. `None` means the
    /// service never idle-suspends; essential services must be `None`.
    pub idle_timeout_secs: Option<u64>,
    pub graceful_shutdown_timeout_secs: u64,
    pub max_restart_attempts: u32,
    pub consolidation_group: Option<String>,
    pub gpu_compatible: bool,
    pub enabled: bool,
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>, classification: Classification) -> Self {
        Self {
            name: name.into(),
            classification,
            startup_priority: 100,
            dependencies: Vec::new(),
            resources: ResourceRequirements::default(),
            idle_timeout_secs: None,
            graceful_shutdown_timeout_secs: DEFAULT_GRACEFUL_SHUTDOWN_SECS,
            max_restart_attempts: DEFAULT_MAX_RESTART_ATTEMPTS,
            consolidation_group: None,
            gpu_compatible: false,
            enabled: true,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.startup_priority = priority;
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_memory_mb(mut self, memory_mb: u64) -> Self {
        self.resources.memory_mb = memory_mb;
        self
    }

    pub fn with_idle_timeout_secs(mut self, secs: u64) -> Self {
        self.idle_timeout_secs = Some(secs);
        self
    }

    pub fn with_consolidation_group(mut self, group: impl Into<String>) -> Self {
        self.consolidation_group = Some(group.into());
        self
    }
}

pub const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 10;
pub const DEFAULT_MAX_RESTART_ATTEMPTS: u32 = 3;

/// Named deployment profile selecting which classifications participate
/// and the hard caps applied to the selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentProfile {
    pub enabled_classifications: Vec<Classification>,
    pub max_memory_mb: u64,
    pub max_services: usize,
    #[serde(default)]
    pub flags: HashMap<String, bool>,
}

impl DeploymentProfile {
    pub fn permits(&self, classification: Classification) -> bool {
        self.enabled_classifications.contains(&classification)
    }
}

/// Raw on-disk service entry. Enum-valued fields are plain strings here
/// so unknown values can be normalized with a recorded warning instead
/// of failing deserialization.
#[derive(Debug, Clone, Deserialize)]
struct RawServiceEntry {
    name: String,
    #[serde(default)]
    classification: Option<String>,
    #[serde(default)]
    startup_priority: Option<i32>,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    resources: ResourceRequirements,
    #[serde(default)]
    idle_timeout_secs: Option<u64>,
    #[serde(default)]
    graceful_shutdown_timeout_secs: Option<u64>,
    #[serde(default)]
    max_restart_attempts: Option<u32>,
    #[serde(default)]
    consolidation_group: Option<String>,
    #[serde(default)]
    gpu_compatible: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct RawCatalogFile {
    #[serde(default)]
    services: Vec<RawServiceEntry>,
    #[serde(default)]
    profiles: HashMap<String, DeploymentProfile>,
}

/// Validation output for the loaded catalog.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CatalogValidation {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
}

impl CatalogValidation {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Aggregate resource totals grouped by classification.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResourceAnalysis {
    pub total_memory_mb: u64,
    pub total_cpu_cores: f64,
    pub total_gpu_memory_mb: u64,
    pub by_classification: HashMap<String, u64>,
    pub gpu_services: Vec<String>,
}

/// The service catalog: declarative service configs plus deployment
/// profiles, loaded once from an ordered search path. No I/O after load.
#[derive(Debug, Clone)]
pub struct ServiceCatalog {
    services: HashMap<String, ServiceConfig>,
    profiles: HashMap<String, DeploymentProfile>,
    active_profile: String,
    warnings: Vec<String>,
}

impl ServiceCatalog {
    /// Build a catalog from the built-in defaults plus any config files
    /// found on the search path. Later sources override earlier ones by
    /// service name.
    pub fn load(paths: &[PathBuf], profile: &str) -> Result<Self> {
        let mut catalog = Self::builtin_defaults();

        for path in Self::search_path(paths) {
            if path.exists() {
                catalog.merge_source(&path)?;
            } else {
                debug!("Catalog source {} not present, skipping", path.display());
            }
        }

        catalog.set_active_profile(profile)?;
        Ok(catalog)
    }

    /// Build a catalog from explicit service configs, bypassing files.
    /// Intended for embedding and tests.
    pub fn from_configs<I>(configs: I, profile: &str) -> Result<Self>
    where
        I: IntoIterator<Item = ServiceConfig>,
    {
        let mut services = HashMap::new();
        for config in configs {
            if services.contains_key(&config.name) {
                return Err(ConfigError::DuplicateService {
                    name: config.name.clone(),
                }
                .into());
            }
            services.insert(config.name.clone(), config);
        }

        let mut catalog = Self {
            services,
            profiles: Self::default_profiles(),
            active_profile: String::new(),
            warnings: Vec::new(),
        };
        catalog.set_active_profile(profile)?;
        Ok(catalog)
    }

    fn search_path(explicit: &[PathBuf]) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("vigil").join("services.toml"));
        }
        paths.push(PathBuf::from("vigil.toml"));
        paths.extend(explicit.iter().cloned());
        paths
    }

    fn merge_source(&mut self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog source {}", path.display()))?;

        let raw: RawCatalogFile = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
            _ => toml::from_str(&content)?,
        };

        let mut seen_in_source: Vec<&str> = Vec::new();
        for entry in &raw.services {
            if seen_in_source.contains(&entry.name.as_str()) {
                return Err(ConfigError::DuplicateService {
                    name: entry.name.clone(),
                }
                .into());
            }
            seen_in_source.push(&entry.name);
        }

        for entry in raw.services {
            let config = self.normalize_entry(entry);
            debug!("Catalog source {} defines {}", path.display(), config.name);
            self.services.insert(config.name.clone(), config);
        }

        for (name, profile) in raw.profiles {
            self.profiles.insert(name, profile);
        }

        Ok(())
    }

    fn normalize_entry(&mut self, entry: RawServiceEntry) -> ServiceConfig {
        let classification = match entry.classification.as_deref() {
            Some("essential") => Classification::Essential,
            Some("optional") | None => Classification::Optional,
            Some("background") => Classification::Background,
            Some(other) => {
                let warning = format!(
                    "Service {}: unknown classification {:?}, normalized to background",
                    entry.name, other
                );
                warn!("{warning}");
                self.warnings.push(warning);
                Classification::Background
            }
        };

        let mut idle_timeout_secs = entry.idle_timeout_secs;
        if classification == Classification::Essential && idle_timeout_secs.is_some() {
            let warning = format!(
                "Service {}: essential services never idle-suspend, clearing idle_timeout",
                entry.name
            );
            warn!("{warning}");
            self.warnings.push(warning);
            idle_timeout_secs = None;
        }

        ServiceConfig {
            name: entry.name,
            classification,
            startup_priority: entry.startup_priority.unwrap_or(100),
            dependencies: entry.dependencies,
            resources: entry.resources,
            idle_timeout_secs,
            graceful_shutdown_timeout_secs: entry
                .graceful_shutdown_timeout_secs
                .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS),
            max_restart_attempts: entry
                .max_restart_attempts
                .unwrap_or(DEFAULT_MAX_RESTART_ATTEMPTS),
            consolidation_group: entry.consolidation_group,
            gpu_compatible: entry.gpu_compatible.unwrap_or(false),
            enabled: true,
        }
    }

    /// Select the active deployment profile and recompute `enabled` for
    /// every service from the profile's permitted classifications.
    pub fn set_active_profile(&mut self, name: &str) -> Result<()> {
        let profile = self
            .profiles
            .get(name)
            .ok_or_else(|| ConfigError::UnknownProfile {
                name: name.to_string(),
            })?
            .clone();

        for service in self.services.values_mut() {
            service.enabled = profile.permits(service.classification);
        }
        self.active_profile = name.to_string();
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub fn services(&self) -> impl Iterator<Item = &ServiceConfig> {
        self.services.values()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn by_classification(&self, classification: Classification) -> Vec<&ServiceConfig> {
        let mut matched: Vec<&ServiceConfig> = self
            .services
            .values()
            .filter(|s| s.classification == classification)
            .collect();
        matched.sort_by_key(|s| (s.startup_priority, s.name.clone()));
        matched
    }

    /// Services a given profile would enable, capped by the profile's
    /// max_services limit in ascending priority order.
    pub fn for_profile(&self, profile_name: &str) -> Result<Vec<&ServiceConfig>> {
        let profile = self
            .profiles
            .get(profile_name)
            .ok_or_else(|| ConfigError::UnknownProfile {
                name: profile_name.to_string(),
            })?;

        let mut selected: Vec<&ServiceConfig> = self
            .services
            .values()
            .filter(|s| profile.permits(s.classification))
            .collect();
        selected.sort_by_key(|s| (s.startup_priority, s.name.clone()));
        selected.truncate(profile.max_services);
        Ok(selected)
    }

    pub fn active_profile(&self) -> &str {
        &self.active_profile
    }

    pub fn profile(&self, name: &str) -> Option<&DeploymentProfile> {
        self.profiles.get(name)
    }

    pub fn load_warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Validate the whole catalog: fatal errors, warnings, and sizing
    /// recommendations.
    pub fn validate_all(&self) -> CatalogValidation {
        let mut report = CatalogValidation {
            warnings: self.warnings.clone(),
            ..Default::default()
        };

        for service in self.services.values() {
            for dep in &service.dependencies {
                if !self.services.contains_key(dep) {
                    report.errors.push(format!(
                        "Service {} depends on unknown service {}",
                        service.name, dep
                    ));
                }
            }
        }

        for service in self.by_classification(Classification::Essential) {
            for dep in &service.dependencies {
                if let Some(dep_config) = self.services.get(dep) {
                    if dep_config.classification != Classification::Essential {
                        report.warnings.push(format!(
                            "Essential service {} depends on {} service {}",
                            service.name,
                            dep_config.classification.as_str(),
                            dep
                        ));
                    }
                }
            }
        }

        let analysis = self.analyze_resources();
        if let Some(profile) = self.profiles.get(&self.active_profile) {
            let enabled_memory: u64 = self
                .services
                .values()
                .filter(|s| s.enabled)
                .map(|s| s.resources.memory_mb)
                .sum();
            if enabled_memory > profile.max_memory_mb {
                report.warnings.push(format!(
                    "Enabled services declare {}MB but profile {} caps memory at {}MB",
                    enabled_memory, self.active_profile, profile.max_memory_mb
                ));
            }
            let enabled_count = self.services.values().filter(|s| s.enabled).count();
            if enabled_count > profile.max_services {
                report.warnings.push(format!(
                    "{} services enabled but profile {} caps the count at {}",
                    enabled_count, self.active_profile, profile.max_services
                ));
            }
        }

        let heavy: Vec<&str> = self
            .services
            .values()
            .filter(|s| s.resources.memory_mb > 256 && s.idle_timeout_secs.is_none())
            .filter(|s| s.classification != Classification::Essential)
            .map(|s| s.name.as_str())
            .collect();
        if !heavy.is_empty() {
            report.recommendations.push(format!(
                "Consider idle timeouts for memory-heavy services: {}",
                heavy.join(", ")
            ));
        }
        if analysis.total_gpu_memory_mb > 0 && analysis.gpu_services.len() > 1 {
            report.recommendations.push(format!(
                "Multiple GPU services ({}) may contend for GPU memory; consider consolidation",
                analysis.gpu_services.join(", ")
            ));
        }

        report
    }

    /// Aggregate declared resource requirements across the catalog.
    pub fn analyze_resources(&self) -> ResourceAnalysis {
        let mut analysis = ResourceAnalysis::default();
        for service in self.services.values() {
            analysis.total_memory_mb += service.resources.memory_mb;
            analysis.total_cpu_cores += service.resources.cpu_cores;
            analysis.total_gpu_memory_mb += service.resources.gpu_memory_mb;
            *analysis
                .by_classification
                .entry(service.classification.as_str().to_string())
                .or_insert(0) += service.resources.memory_mb;
            if service.gpu_compatible {
                analysis.gpu_services.push(service.name.clone());
            }
        }
        analysis.gpu_services.sort();
        analysis
    }

    fn default_profiles() -> HashMap<String, DeploymentProfile> {
        let mut profiles = HashMap::new();
        profiles.insert(
            "minimal".to_string(),
            DeploymentProfile {
                enabled_classifications: vec![Classification::Essential],
                max_memory_mb: 512,
                max_services: 10,
                flags: HashMap::from([("aggressive_idle_timeout".to_string(), true)]),
            },
        );
        profiles.insert(
            "development".to_string(),
            DeploymentProfile {
                enabled_classifications: vec![Classification::Essential, Classification::Optional],
                max_memory_mb: 2048,
                max_services: 50,
                flags: HashMap::from([("debug_services".to_string(), true)]),
            },
        );
        profiles.insert(
            "production".to_string(),
            DeploymentProfile {
                enabled_classifications: vec![
                    Classification::Essential,
                    Classification::Optional,
                    Classification::Background,
                ],
                max_memory_mb: 4096,
                max_services: 100,
                flags: HashMap::from([("performance_optimized".to_string(), true)]),
            },
        );
        profiles
    }

    /// The built-in service set shipped with the engine. File sources
    /// override these by name.
    pub fn builtin_defaults() -> Self {
        let services = [
            ServiceConfig::new("logging_service", Classification::Essential)
                .with_priority(1)
                .with_memory_mb(32),
            ServiceConfig::new("config_manager", Classification::Essential)
                .with_priority(5)
                .with_memory_mb(32),
            ServiceConfig::new("auth_service", Classification::Essential)
                .with_priority(10)
                .with_memory_mb(64),
            ServiceConfig::new("database_client", Classification::Essential)
                .with_priority(20)
                .with_dependencies(["config_manager"])
                .with_memory_mb(128),
            ServiceConfig::new("memory_service", Classification::Optional)
                .with_priority(50)
                .with_dependencies(["database_client"])
                .with_memory_mb(256)
                .with_idle_timeout_secs(300),
            ServiceConfig::new("conversation_service", Classification::Optional)
                .with_priority(60)
                .with_dependencies(["memory_service"])
                .with_memory_mb(128)
                .with_idle_timeout_secs(300),
            {
                let mut ai = ServiceConfig::new("ai_orchestrator", Classification::Optional)
                    .with_priority(70)
                    .with_dependencies(["memory_service"])
                    .with_memory_mb(512)
                    .with_idle_timeout_secs(600);
                ai.resources.gpu_memory_mb = 1024;
                ai.gpu_compatible = true;
                ai
            },
            ServiceConfig::new("plugin_service", Classification::Optional)
                .with_priority(80)
                .with_dependencies(["config_manager"])
                .with_memory_mb(128)
                .with_idle_timeout_secs(600),
            ServiceConfig::new("analytics_service", Classification::Background)
                .with_priority(200)
                .with_memory_mb(64)
                .with_idle_timeout_secs(1800),
            ServiceConfig::new("metrics_collector", Classification::Background)
                .with_priority(210)
                .with_memory_mb(32)
                .with_idle_timeout_secs(3600),
            ServiceConfig::new("cleanup_service", Classification::Background)
                .with_priority(220)
                .with_memory_mb(32)
                .with_idle_timeout_secs(7200),
        ];

        Self {
            services: services
                .into_iter()
                .map(|s| (s.name.clone(), s))
                .collect(),
            profiles: Self::default_profiles(),
            active_profile: "production".to_string(),
            warnings: Vec::new(),
        }
    }
}
