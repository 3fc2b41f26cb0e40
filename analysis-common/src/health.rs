use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::Duration;
use tracing::{info, warn};

/// Health reporting for components of the worker process.
///
/// The process runs several asynchronous loops (the fleet of worker loops,
/// the fleet monitor) and should only be trusted with jobs while all of them
/// are alive and reporting. Each component registers a handle and reports
/// healthy more often than its deadline; a component that goes quiet past
/// its deadline flips the process to unhealthy.

#[derive(Default, Debug)]
pub struct HealthStatus {
    /// The overall status: true if all components are healthy.
    pub healthy: bool,
    /// Current status of each registered component, for display.
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    /// Computes the axum status code based on the overall health status,
    /// and prints each component status in the body for debugging.
    fn into_response(self) -> Response {
        let body = format!("{:?}", self);
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Automatically set when a component is newly registered.
    Starting,
    /// Recently reported healthy, will need to report again before the date.
    HealthyUntil(time::OffsetDateTime),
    /// Reported unhealthy.
    Unhealthy,
    /// Automatically set when the HealthyUntil deadline is reached.
    Stalled,
}

type ComponentMap = Arc<RwLock<HashMap<String, ComponentStatus>>>;

pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: ComponentMap,
}

impl HealthHandle {
    /// Report healthy. Must be called more frequently than the configured
    /// deadline.
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            time::OffsetDateTime::now_utc().add(self.deadline),
        ))
    }

    pub fn report_status(&self, status: ComponentStatus) {
        if let Ok(mut components) = self.components.write() {
            _ = components.insert(self.component.clone(), status);
        } else {
            // Poisoned lock: just warn, the probes will fail and the process restart.
            warn!("poisoned HealthRegistry lock")
        }
    }
}

#[derive(Clone, Default)]
pub struct HealthRegistry {
    name: String,
    components: ComponentMap,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Default::default(),
        }
    }

    /// Registers a new component in the registry. The returned handle should
    /// be passed to the component, to allow it to frequently report its
    /// health status.
    pub fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting);
        handle
    }

    /// Returns the overall process status, computed from the status of all
    /// the components currently registered. Can be used as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let components = self
            .components
            .read()
            .expect("poisoned HealthRegistry lock");

        // Unhealthy if no component has registered yet.
        let mut result = HealthStatus {
            healthy: !components.is_empty(),
            components: Default::default(),
        };
        let now = time::OffsetDateTime::now_utc();

        for (name, status) in components.iter() {
            match status {
                ComponentStatus::HealthyUntil(until) if until.gt(&now) => {
                    _ = result.components.insert(name.clone(), status.clone());
                }
                ComponentStatus::HealthyUntil(_) => {
                    result.healthy = false;
                    _ = result
                        .components
                        .insert(name.clone(), ComponentStatus::Stalled);
                }
                _ => {
                    result.healthy = false;
                    _ = result.components.insert(name.clone(), status.clone());
                }
            }
        }

        match result.healthy {
            true => info!("{} health check ok", self.name),
            false => warn!("{} health check failed: {:?}", self.name, result.components),
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_registry_is_unhealthy() {
        let registry = HealthRegistry::new("liveness");

        assert!(!registry.get_status().healthy);
    }

    #[test]
    fn test_fresh_report_is_healthy_until_deadline() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("worker".to_string(), Duration::seconds(60));

        // Starting components are not healthy yet.
        assert!(!registry.get_status().healthy);

        handle.report_healthy();
        assert!(registry.get_status().healthy);
    }

    #[test]
    fn test_stalled_component_fails_the_process() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("worker".to_string(), Duration::seconds(-1));

        handle.report_healthy();

        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("worker"),
            Some(&ComponentStatus::Stalled)
        );
    }

    #[test]
    fn test_unhealthy_report_fails_the_process() {
        let registry = HealthRegistry::new("liveness");
        let healthy = registry.register("worker-1".to_string(), Duration::seconds(60));
        let unhealthy = registry.register("worker-2".to_string(), Duration::seconds(60));

        healthy.report_healthy();
        unhealthy.report_status(ComponentStatus::Unhealthy);

        assert!(!registry.get_status().healthy);
    }
}
