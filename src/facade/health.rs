//! Facade health report

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

/// Health of one facade component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentHealth {
    /// "Operational" or "Not Configured"
    pub status: String,
    /// Whether this component is usable
    pub is_healthy: bool,
    /// When the check ran
    pub last_checked: DateTime<Utc>,
}

impl ComponentHealth {
    pub(crate) fn operational(now: DateTime<Utc>) -> Self {
        Self {
            status: "Operational".to_string(),
            is_healthy: true,
            last_checked: now,
        }
    }

    pub(crate) fn not_configured(now: DateTime<Utc>) -> Self {
        Self {
            status: "Not Configured".to_string(),
            is_healthy: false,
            last_checked: now,
        }
    }
}

/// Report over every facade component.
///
/// `is_healthy` considers configured components only: an absent optional
/// processor reports `Not Configured` without degrading overall health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    /// Overall health of the configured components
    pub is_healthy: bool,
    /// One entry per component, keyed by component name
    pub components: BTreeMap<String, ComponentHealth>,
}
