//! Alarm Watcher
//!
//! Any-of evaluation of a deployment's alarm bindings.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let watcher = AlarmWatcher::new(source, Duration::from_secs(5));
//! watcher.bind(AlarmBinding {
//!     alarm_name: "api-5xx".into(),
//!     deployment_id: id.clone(),
//!     severity: Severity::Critical,
//! });
//!
//! if watcher.is_breached(&id).await? {
//!     // roll back
//! }
//! ```
//!
//! The cache is keyed by alarm name, not deployment: several deployments
//! bound to the same alarm share one cached state. Only successful lookups are
//! cached; a source error is returned to the caller every time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::metrics;
use crate::model::{AlarmBinding, AlarmState, DeploymentId};
use crate::ports::{AlarmSource, AlarmSourceError};

/// Cached alarm state with expiration
#[derive(Clone, Copy)]
struct CacheEntry {
    state: AlarmState,
    expires_at: Instant,
}

/// Evaluates alarm bindings against an [`AlarmSource`].
pub struct AlarmWatcher {
    source: Arc<dyn AlarmSource>,
    bindings: DashMap<DeploymentId, Vec<AlarmBinding>>,
    cache: DashMap<String, CacheEntry>,
    ttl: Duration,
}

impl AlarmWatcher {
    /// Create a watcher whose cached states live for `ttl`.
    ///
    /// A zero `ttl` disables caching.
    pub fn new(source: Arc<dyn AlarmSource>, ttl: Duration) -> Self {
        Self {
            source,
            bindings: DashMap::new(),
            cache: DashMap::new(),
            ttl,
        }
    }

    /// Add a binding. Binding the same alarm twice to a deployment is a no-op.
    pub fn bind(&self, binding: AlarmBinding) {
        let mut entry = self
            .bindings
            .entry(binding.deployment_id.clone())
            .or_default();
        if !entry.iter().any(|b| b.alarm_name == binding.alarm_name) {
            debug!(
                deployment_id = %binding.deployment_id,
                alarm = %binding.alarm_name,
                severity = ?binding.severity,
                "alarm bound"
            );
            entry.push(binding);
        }
    }

    /// Drop every binding of a deployment.
    pub fn unbind_deployment(&self, id: &DeploymentId) {
        self.bindings.remove(id);
    }

    /// Bindings of one deployment.
    pub fn bindings_for(&self, id: &DeploymentId) -> Vec<AlarmBinding> {
        self.bindings
            .get(id)
            .map(|b| b.value().clone())
            .unwrap_or_default()
    }

    /// Every binding, across all deployments.
    pub fn all_bindings(&self) -> Vec<AlarmBinding> {
        let mut all: Vec<_> = self
            .bindings
            .iter()
            .flat_map(|e| e.value().clone())
            .collect();
        all.sort_by(|a, b| {
            (&a.deployment_id, &a.alarm_name).cmp(&(&b.deployment_id, &b.alarm_name))
        });
        all
    }

    /// `true` if any alarm bound to `id` is currently `ALARM`.
    ///
    /// A deployment with no bindings is never breached. `INSUFFICIENT_DATA`
    /// and alarms unknown to the source count as not breached.
    ///
    /// # Errors
    /// Propagates [`AlarmSourceError`] when uncached states cannot be read.
    pub async fn is_breached(&self, id: &DeploymentId) -> Result<bool, AlarmSourceError> {
        Ok(!self.breached_alarms(id).await?.is_empty())
    }

    /// Names of the alarms bound to `id` that are currently `ALARM`.
    ///
    /// # Errors
    /// Propagates [`AlarmSourceError`] when uncached states cannot be read.
    pub async fn breached_alarms(
        &self,
        id: &DeploymentId,
    ) -> Result<Vec<String>, AlarmSourceError> {
        let names: Vec<String> = self
            .bindings_for(id)
            .into_iter()
            .map(|b| b.alarm_name)
            .collect();
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let states = self.states(&names).await?;
        Ok(names
            .into_iter()
            .filter(|n| states.get(n) == Some(&AlarmState::Alarm))
            .collect())
    }

    /// Resolve states for `names`, serving fresh entries from the cache.
    async fn states(
        &self,
        names: &[String],
    ) -> Result<HashMap<String, AlarmState>, AlarmSourceError> {
        let now = Instant::now();
        let mut resolved = HashMap::with_capacity(names.len());
        let mut misses = Vec::new();

        for name in names {
            match self.cache.get(name) {
                Some(entry) if entry.expires_at > now => {
                    metrics::inc_alarm_cache(true);
                    resolved.insert(name.clone(), entry.state);
                }
                _ => {
                    metrics::inc_alarm_cache(false);
                    misses.push(name.clone());
                }
            }
        }

        if misses.is_empty() {
            debug!(alarms = names.len(), "alarm states served from cache");
            return Ok(resolved);
        }

        let fetched = self.source.get_alarm_states(&misses).await.map_err(|e| {
            warn!(error = %e, alarms = ?misses, "alarm source query failed");
            e
        })?;

        let expires_at = Instant::now() + self.ttl;
        for name in misses {
            let state = fetched
                .get(&name)
                .map(|r| r.state)
                .unwrap_or(AlarmState::InsufficientData);
            if !self.ttl.is_zero() {
                self.cache.insert(name.clone(), CacheEntry { state, expires_at });
            }
            resolved.insert(name, state);
        }
        Ok(resolved)
    }

    /// Forget every cached state.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inmemory::InMemoryAlarmSource;
    use crate::model::Severity;
    use chrono::Utc;

    fn binding(alarm: &str, dep: &str) -> AlarmBinding {
        AlarmBinding {
            alarm_name: alarm.to_string(),
            deployment_id: DeploymentId::new(dep),
            severity: Severity::Critical,
        }
    }

    fn setup(ttl: Duration) -> (Arc<InMemoryAlarmSource>, AlarmWatcher) {
        let source = Arc::new(InMemoryAlarmSource::new());
        let watcher = AlarmWatcher::new(source.clone(), ttl);
        (source, watcher)
    }

    #[tokio::test]
    async fn test_unbound_deployment_is_never_breached() {
        let (source, watcher) = setup(Duration::from_secs(5));
        source.set_state("api-5xx", AlarmState::Alarm, Utc::now());
        assert!(!watcher.is_breached(&DeploymentId::new("d")).await.unwrap());
        assert_eq!(source.query_count(), 0);
    }

    #[tokio::test]
    async fn test_any_bound_alarm_breaches() {
        let (source, watcher) = setup(Duration::ZERO);
        watcher.bind(binding("api-5xx", "d"));
        watcher.bind(binding("latency-p99", "d"));
        source.set_state("api-5xx", AlarmState::Ok, Utc::now());
        source.set_state("latency-p99", AlarmState::Alarm, Utc::now());
        let breached = watcher.breached_alarms(&DeploymentId::new("d")).await.unwrap();
        assert_eq!(breached, vec!["latency-p99".to_string()]);
    }

    #[tokio::test]
    async fn test_insufficient_data_and_missing_are_not_breached() {
        let (source, watcher) = setup(Duration::ZERO);
        watcher.bind(binding("a", "d"));
        watcher.bind(binding("unknown", "d"));
        source.set_state("a", AlarmState::InsufficientData, Utc::now());
        assert!(!watcher.is_breached(&DeploymentId::new("d")).await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_binding_ignored() {
        let (_source, watcher) = setup(Duration::ZERO);
        watcher.bind(binding("a", "d"));
        watcher.bind(binding("a", "d"));
        assert_eq!(watcher.bindings_for(&DeploymentId::new("d")).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_bounds_queries_until_ttl() {
        let (source, watcher) = setup(Duration::from_secs(5));
        watcher.bind(binding("a", "d"));
        let id = DeploymentId::new("d");
        source.set_state("a", AlarmState::Ok, Utc::now());

        assert!(!watcher.is_breached(&id).await.unwrap());
        source.set_state("a", AlarmState::Alarm, Utc::now());
        // Still cached
        assert!(!watcher.is_breached(&id).await.unwrap());
        assert_eq!(source.query_count(), 1);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(watcher.is_breached(&id).await.unwrap());
        assert_eq!(source.query_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_is_shared_across_deployments() {
        let (source, watcher) = setup(Duration::from_secs(5));
        watcher.bind(binding("shared", "d1"));
        watcher.bind(binding("shared", "d2"));
        source.set_state("shared", AlarmState::Alarm, Utc::now());

        assert!(watcher.is_breached(&DeploymentId::new("d1")).await.unwrap());
        assert!(watcher.is_breached(&DeploymentId::new("d2")).await.unwrap());
        assert_eq!(source.query_count(), 1);
    }

    #[tokio::test]
    async fn test_source_error_is_propagated_and_not_cached() {
        let (source, watcher) = setup(Duration::from_secs(5));
        watcher.bind(binding("a", "d"));
        let id = DeploymentId::new("d");
        source.set_unavailable(true);
        assert!(watcher.is_breached(&id).await.is_err());
        source.set_unavailable(false);
        source.set_state("a", AlarmState::Ok, Utc::now());
        assert!(!watcher.is_breached(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_unbind_removes_bindings() {
        let (_source, watcher) = setup(Duration::ZERO);
        watcher.bind(binding("a", "d"));
        watcher.unbind_deployment(&DeploymentId::new("d"));
        assert!(watcher.all_bindings().is_empty());
    }
}
