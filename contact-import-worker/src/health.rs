use std::{
    collections::HashMap,
    ops::Add,
    sync::{Arc, RwLock},
    time::Duration,
};

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::warn;

/// Liveness reporting for the worker's long running loops.
///
/// Each loop registers a component with a deadline and must report healthy more often
/// than that. The process is healthy only while every component is.
#[derive(Default, Debug)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    /// 200 when healthy, 500 otherwise, with each component status in the body.
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    Starting,
    HealthyUntil(time::OffsetDateTime),
    Unhealthy,
    /// Set on read once the HealthyUntil deadline has passed
    Stalled,
}

type Components = Arc<RwLock<HashMap<String, ComponentStatus>>>;

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Components,
}

impl HealthHandle {
    /// Must be called more frequently than the configured deadline.
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            time::OffsetDateTime::now_utc().add(self.deadline),
        ))
    }

    pub fn report_status(&self, status: ComponentStatus) {
        match self.components.write() {
            Ok(mut map) => {
                map.insert(self.component.clone(), status);
            }
            // Poisoned lock: the probes will fail and the process restart
            Err(_) => warn!("poisoned HealthRegistry lock"),
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Components,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Default::default(),
        }
    }

    pub fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting);
        handle
    }

    /// Overall process status. Can be used as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let Ok(components) = self.components.read() else {
            warn!("{} health check failed: poisoned lock", self.name);
            return HealthStatus::default();
        };

        let now = time::OffsetDateTime::now_utc();
        let mut result = HealthStatus {
            // Nothing registered yet counts as unhealthy
            healthy: !components.is_empty(),
            components: HashMap::with_capacity(components.len()),
        };
        for (name, status) in components.iter() {
            let status = match status {
                ComponentStatus::HealthyUntil(until) if until.gt(&now) => status.clone(),
                ComponentStatus::HealthyUntil(_) => ComponentStatus::Stalled,
                other => other.clone(),
            };
            if !matches!(status, ComponentStatus::HealthyUntil(_)) {
                result.healthy = false;
            }
            result.components.insert(name.clone(), status);
        }

        if !result.healthy {
            warn!("{} health check failed: {:?}", self.name, result.components);
        }
        result
    }
}
