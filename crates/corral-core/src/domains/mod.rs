//! Built-in domain plugins.
//!
//! Each submodule implements [`crate::domain::Domain`] for one backend
//! family. The engine treats them all identically; new domains plug in the
//! same way.

pub mod alert;
pub mod k8s;
pub mod log;
pub mod metric;
pub mod mock;

use std::sync::Arc;

use crate::domain::Domain;

/// All built-in domains, plus a mock domain named `"mock"`.
pub fn all() -> Vec<Arc<dyn Domain>> {
    vec![
        Arc::new(k8s::K8sDomain::new()),
        Arc::new(log::LogDomain::new()),
        Arc::new(metric::MetricDomain::new()),
        Arc::new(alert::AlertDomain::new()),
        Arc::new(mock::MockDomain::new("mock")),
    ]
}
