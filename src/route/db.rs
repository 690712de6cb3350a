//! Blacklist of routes that recently failed.

use std::collections::HashSet;
use std::sync::Mutex;

use super::Route;

/// Remembers routes that failed so the selector can prefer fresh ones.
/// A route is removed again the first time a connection on it succeeds.
#[derive(Debug, Default)]
pub struct RouteDatabase {
    failed_routes: Mutex<HashSet<Route>>,
}

impl RouteDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connect failure on `route`.
    pub fn failed(&self, route: &Route) {
        let mut failed = self.failed_routes.lock().unwrap_or_else(|e| e.into_inner());
        failed.insert(route.clone());
    }

    /// Record that `route` connected; it is no longer postponed.
    pub fn connected(&self, route: &Route) {
        let mut failed = self.failed_routes.lock().unwrap_or_else(|e| e.into_inner());
        failed.remove(route);
    }

    /// Whether the selector should try `route` after fresher candidates.
    pub fn should_postpone(&self, route: &Route) -> bool {
        let failed = self.failed_routes.lock().unwrap_or_else(|e| e.into_inner());
        failed.contains(route)
    }
}
