use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::metrics::RegressionDetection;
use crate::monitor::{OptimizationResult, ResourceAlert};

pub type AlertCallback = Box<dyn Fn(&ResourceAlert) + Send + Sync>;
pub type OptimizationCallback = Box<dyn Fn(&OptimizationResult) + Send + Sync>;
pub type RegressionCallback = Box<dyn Fn(&RegressionDetection) + Send + Sync>;
pub type TransitionCallback = Box<dyn Fn(&str, &str, &str) + Send + Sync>;

/// Observer hub for the events the engine publishes: resource alerts,
/// optimization results, regressions, and lifecycle transitions.
///
/// Callbacks run inline on the emitting task and must be cheap.
#[derive(Default)]
pub struct EventBus {
    alert_callbacks: RwLock<Vec<AlertCallback>>,
    optimization_callbacks: RwLock<Vec<OptimizationCallback>>,
    regression_callbacks: RwLock<Vec<RegressionCallback>>,
    transition_callbacks: RwLock<Vec<TransitionCallback>>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on_alert(&self, callback: AlertCallback) {
        self.alert_callbacks.write().unwrap().push(callback);
    }

    pub fn on_optimization(&self, callback: OptimizationCallback) {
        self.optimization_callbacks.write().unwrap().push(callback);
    }

    pub fn on_regression(&self, callback: RegressionCallback) {
        self.regression_callbacks.write().unwrap().push(callback);
    }

    pub fn on_lifecycle_transition(&self, callback: TransitionCallback) {
        self.transition_callbacks.write().unwrap().push(callback);
    }

    pub fn emit_alert(&self, alert: &ResourceAlert) {
        for callback in self.alert_callbacks.read().unwrap().iter() {
            callback(alert);
        }
    }

    pub fn emit_optimization(&self, result: &OptimizationResult) {
        for callback in self.optimization_callbacks.read().unwrap().iter() {
            callback(result);
        }
    }

    pub fn emit_regression(&self, detection: &RegressionDetection) {
        for callback in self.regression_callbacks.read().unwrap().iter() {
            callback(detection);
        }
    }

    pub fn emit_transition(&self, service: &str, from: &str, to: &str) {
        debug!("Lifecycle transition: {} {} -> {}", service, from, to);
        for callback in self.transition_callbacks.read().unwrap().iter() {
            callback(service, from, to);
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field(
                "alert_callbacks",
                &self.alert_callbacks.read().unwrap().len(),
            )
            .field(
                "optimization_callbacks",
                &self.optimization_callbacks.read().unwrap().len(),
            )
            .field(
                "regression_callbacks",
                &self.regression_callbacks.read().unwrap().len(),
            )
            .field(
                "transition_callbacks",
                &self.transition_callbacks.read().unwrap().len(),
            )
            .finish()
    }
}
