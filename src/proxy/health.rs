//! Per-service health tracking with a half-open retry circuit.
//!
//! Each service moves between three states:
//! - **Healthy**: no recent failures
//! - **Degraded**: at least one failure, below the threshold; still routed
//! - **Unhealthy**: threshold reached; rejected until the recovery time has
//!   elapsed since the last failure, then exactly one probe is admitted
//!
//! Failures further apart than the failure window do not accumulate. Any
//! success resets the service to Healthy. State lives in a [`DashMap`] with a
//! per-service mutex, so services never contend with each other.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::HealthConfig;
use crate::error::ErrorKind;

/// Coarse health of one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

/// Thresholds driving the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    pub max_failures: u32,
    pub failure_window: Duration,
    pub recovery_time: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self::from(&HealthConfig::default())
    }
}

impl From<&HealthConfig> for HealthPolicy {
    fn from(config: &HealthConfig) -> Self {
        Self {
            max_failures: config.max_failures.max(1),
            failure_window: Duration::from_secs(config.failure_window_secs),
            recovery_time: Duration::from_secs(config.recovery_time_secs),
        }
    }
}

/// The most recent failure recorded for a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastError {
    pub kind: ErrorKind,
    /// Raw provider text. Logged, never returned to clients.
    pub message: String,
}

/// Outcome of asking whether a request may reach a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The single recovery probe. Its outcome must be recorded, or the probe
    /// released, by the caller.
    Probe,
    Rejected {
        consecutive_failures: u32,
        last_error: Option<LastError>,
    },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Admission::Rejected { .. })
    }
}

/// Point-in-time view of one service, as reported by `/health/services`.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub service_id: String,
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<ErrorKind>,
    #[serde(skip)]
    pub last_error_message: Option<String>,
}

/// Health state machine for one service (not thread-safe on its own).
#[derive(Debug)]
pub(crate) struct HealthInner {
    pub(crate) status: HealthStatus,
    pub(crate) consecutive_failures: u32,
    /// Monotonic time of the last failure, for window and cooldown math.
    pub(crate) last_failure: Option<Instant>,
    pub(crate) last_failure_at: Option<DateTime<Utc>>,
    pub(crate) last_success_at: Option<DateTime<Utc>>,
    pub(crate) last_error: Option<LastError>,
    /// When the outstanding recovery probe was admitted.
    pub(crate) probe_started: Option<Instant>,
}

impl HealthInner {
    pub(crate) fn new() -> Self {
        Self {
            status: HealthStatus::Healthy,
            consecutive_failures: 0,
            last_failure: None,
            last_failure_at: None,
            last_success_at: None,
            last_error: None,
            probe_started: None,
        }
    }

    /// Decide admission. An Unhealthy service past its cooldown admits one
    /// probe; a probe that never reports back is forgotten after another
    /// recovery period.
    pub(crate) fn admit(&mut self, policy: &HealthPolicy, service_id: &str) -> Admission {
        if self.status != HealthStatus::Unhealthy {
            return Admission::Allowed;
        }

        let now = Instant::now();
        let cooled_down = self
            .last_failure
            .map_or(true, |at| now.duration_since(at) > policy.recovery_time);

        let probe_outstanding = self
            .probe_started
            .is_some_and(|at| now.duration_since(at) <= policy.recovery_time);

        if cooled_down && !probe_outstanding {
            self.probe_started = Some(now);
            tracing::info!(
                service = %service_id,
                consecutive_failures = self.consecutive_failures,
                "Admitting recovery probe"
            );
            return Admission::Probe;
        }

        Admission::Rejected {
            consecutive_failures: self.consecutive_failures,
            last_error: self.last_error.clone(),
        }
    }

    pub(crate) fn record_success(&mut self, service_id: &str) {
        let was = self.status;
        self.status = HealthStatus::Healthy;
        self.consecutive_failures = 0;
        self.probe_started = None;
        self.last_success_at = Some(Utc::now());

        if was == HealthStatus::Unhealthy {
            tracing::info!(service = %service_id, "Service recovered");
        } else {
            tracing::debug!(service = %service_id, "Success recorded");
        }
    }

    pub(crate) fn record_failure(
        &mut self,
        policy: &HealthPolicy,
        service_id: &str,
        kind: ErrorKind,
        message: &str,
    ) {
        let now = Instant::now();
        if let Some(last) = self.last_failure {
            if now.duration_since(last) > policy.failure_window {
                self.consecutive_failures = 0;
            }
        }

        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure = Some(now);
        self.last_failure_at = Some(Utc::now());
        self.last_error = Some(LastError {
            kind,
            message: message.to_string(),
        });
        self.probe_started = None;

        let was = self.status;
        self.status = if self.consecutive_failures >= policy.max_failures {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        };

        if self.status == HealthStatus::Unhealthy && was != HealthStatus::Unhealthy {
            tracing::warn!(
                service = %service_id,
                consecutive_failures = self.consecutive_failures,
                error_kind = %kind,
                "Service marked unhealthy"
            );
        } else {
            tracing::debug!(
                service = %service_id,
                consecutive_failures = self.consecutive_failures,
                status = self.status.as_str(),
                error_kind = %kind,
                "Failure recorded"
            );
        }
    }

    fn snapshot(&self, service_id: &str) -> ServiceHealth {
        ServiceHealth {
            service_id: service_id.to_string(),
            status: self.status,
            consecutive_failures: self.consecutive_failures,
            last_failure_at: self.last_failure_at,
            last_success_at: self.last_success_at,
            last_error: self.last_error.as_ref().map(|e| e.kind),
            last_error_message: self.last_error.as_ref().map(|e| e.message.clone()),
        }
    }
}

// ── Tracker ──────────────────────────────────────────────────────────

/// Concurrent health tracker keyed by service id.
///
/// Entries are created lazily on the first recorded outcome and are never
/// removed, so health survives registry reloads.
pub struct HealthTracker {
    policy: HealthPolicy,
    services: DashMap<String, Mutex<HealthInner>>,
}

impl HealthTracker {
    pub fn new(policy: HealthPolicy) -> Self {
        Self {
            policy,
            services: DashMap::new(),
        }
    }

    pub fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    /// Check whether a request may reach `service_id`. May hand out the
    /// recovery probe. Unknown services are always admitted.
    pub fn admit(&self, service_id: &str) -> Admission {
        let Some(entry) = self.services.get(service_id) else {
            return Admission::Allowed;
        };
        let mut inner = lock(entry.value());
        inner.admit(&self.policy, service_id)
    }

    pub fn is_available(&self, service_id: &str) -> bool {
        self.admit(service_id).is_admitted()
    }

    pub fn record_success(&self, service_id: &str) {
        let entry = self
            .services
            .entry(service_id.to_string())
            .or_insert_with(|| Mutex::new(HealthInner::new()));
        lock(entry.value()).record_success(service_id);
    }

    pub fn record_failure(&self, service_id: &str, kind: ErrorKind, message: &str) {
        let entry = self
            .services
            .entry(service_id.to_string())
            .or_insert_with(|| Mutex::new(HealthInner::new()));
        lock(entry.value()).record_failure(&self.policy, service_id, kind, message);
    }

    /// Give back a probe whose request ended without a verdict.
    pub fn release_probe(&self, service_id: &str) {
        if let Some(entry) = self.services.get(service_id) {
            let mut inner = lock(entry.value());
            if inner.probe_started.take().is_some() {
                tracing::debug!(service = %service_id, "Recovery probe released");
            }
        }
    }

    pub fn service(&self, service_id: &str) -> Option<ServiceHealth> {
        self.services
            .get(service_id)
            .map(|entry| lock(entry.value()).snapshot(service_id))
    }

    /// Snapshot of every tracked service, ordered by id.
    pub fn all(&self) -> Vec<ServiceHealth> {
        let mut all: Vec<ServiceHealth> = self
            .services
            .iter()
            .map(|entry| lock(entry.value()).snapshot(entry.key()))
            .collect();
        all.sort_by(|a, b| a.service_id.cmp(&b.service_id));
        all
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(HealthPolicy::default())
    }
}

impl std::fmt::Debug for HealthTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthTracker")
            .field("policy", &self.policy)
            .field("services", &self.services.len())
            .finish()
    }
}

/// A poisoned lock still holds consistent counters; keep using it.
fn lock(mutex: &Mutex<HealthInner>) -> std::sync::MutexGuard<'_, HealthInner> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SVC: &str = "openai_svc-a";

    fn fail_times(tracker: &HealthTracker, n: u32) {
        for _ in 0..n {
            tracker.record_failure(SVC, ErrorKind::ServiceUnavailable, "502 Bad Gateway");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_service_is_available() {
        let tracker = HealthTracker::default();
        assert!(tracker.is_available("never-seen"));
        assert!(tracker.service("never-seen").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_degrade_then_trip() {
        let tracker = HealthTracker::default();

        fail_times(&tracker, 1);
        assert_eq!(tracker.service(SVC).unwrap().status, HealthStatus::Degraded);
        assert!(tracker.is_available(SVC));

        fail_times(&tracker, 3);
        assert_eq!(tracker.service(SVC).unwrap().consecutive_failures, 4);
        assert!(tracker.is_available(SVC));

        fail_times(&tracker, 1);
        let health = tracker.service(SVC).unwrap();
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert_eq!(health.last_error, Some(ErrorKind::ServiceUnavailable));
        assert!(!tracker.is_available(SVC));
    }

    #[tokio::test(start_paused = true)]
    async fn test_five_failures_within_two_minutes_then_one_probe() {
        let tracker = HealthTracker::default();
        for _ in 0..5 {
            tracker.record_failure(SVC, ErrorKind::TimeoutError, "timed out");
            tokio::time::advance(Duration::from_secs(24)).await;
        }
        assert!(!tracker.is_available(SVC));

        // Still inside the ten minute cooldown
        tokio::time::advance(Duration::from_secs(5 * 60)).await;
        assert!(!tracker.is_available(SVC));

        tokio::time::advance(Duration::from_secs(6 * 60)).await;
        assert_eq!(tracker.admit(SVC), Admission::Probe);
        // Only one probe at a time
        assert!(!tracker.is_available(SVC));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_is_strictly_greater() {
        let tracker = HealthTracker::default();
        fail_times(&tracker, 5);

        tokio::time::advance(Duration::from_secs(600)).await;
        assert!(!tracker.is_available(SVC));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(tracker.is_available(SVC));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_everything() {
        let tracker = HealthTracker::default();
        fail_times(&tracker, 5);
        tokio::time::advance(Duration::from_secs(11 * 60)).await;
        assert_eq!(tracker.admit(SVC), Admission::Probe);

        tracker.record_success(SVC);
        let health = tracker.service(SVC).unwrap();
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.consecutive_failures, 0);
        assert!(health.last_success_at.is_some());
        assert_eq!(tracker.admit(SVC), Admission::Allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_do_not_accumulate() {
        let tracker = HealthTracker::default();
        fail_times(&tracker, 4);

        tokio::time::advance(Duration::from_secs(5 * 60 + 1)).await;
        fail_times(&tracker, 1);

        let health = tracker.service(SVC).unwrap();
        assert_eq!(health.consecutive_failures, 1);
        assert_eq!(health.status, HealthStatus::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_outside_window_restarts_count() {
        let tracker = HealthTracker::default();
        fail_times(&tracker, 5);
        tokio::time::advance(Duration::from_secs(11 * 60)).await;
        assert_eq!(tracker.admit(SVC), Admission::Probe);

        // The probe's failure is the first one inside a fresh window
        fail_times(&tracker, 1);
        let health = tracker.service(SVC).unwrap();
        assert_eq!(health.consecutive_failures, 1);
        assert_eq!(health.status, HealthStatus::Degraded);
        assert!(tracker.is_available(SVC));
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_probe_can_be_reissued() {
        let tracker = HealthTracker::default();
        fail_times(&tracker, 5);
        tokio::time::advance(Duration::from_secs(11 * 60)).await;

        assert_eq!(tracker.admit(SVC), Admission::Probe);
        assert!(!tracker.is_available(SVC));

        tracker.release_probe(SVC);
        assert_eq!(tracker.admit(SVC), Admission::Probe);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_probe_expires() {
        let tracker = HealthTracker::default();
        fail_times(&tracker, 5);
        tokio::time::advance(Duration::from_secs(11 * 60)).await;
        assert_eq!(tracker.admit(SVC), Admission::Probe);

        tokio::time::advance(Duration::from_secs(10 * 60 + 1)).await;
        assert_eq!(tracker.admit(SVC), Admission::Probe);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_reports_last_error() {
        let tracker = HealthTracker::default();
        for _ in 0..5 {
            tracker.record_failure(SVC, ErrorKind::RateLimitError, "429 Too Many Requests");
        }

        match tracker.admit(SVC) {
            Admission::Rejected {
                consecutive_failures,
                last_error,
            } => {
                assert_eq!(consecutive_failures, 5);
                let last = last_error.unwrap();
                assert_eq!(last.kind, ErrorKind::RateLimitError);
                assert_eq!(last.message, "429 Too Many Requests");
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_services_are_independent() {
        let tracker = HealthTracker::default();
        fail_times(&tracker, 5);
        tracker.record_success("anthropic_svc-b");

        assert!(!tracker.is_available(SVC));
        assert!(tracker.is_available("anthropic_svc-b"));

        let all = tracker.all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].service_id, "anthropic_svc-b");
        assert_eq!(all[1].service_id, SVC);
    }

    #[tokio::test(start_paused = true)]
    async fn test_policy_from_config() {
        let config = HealthConfig {
            max_failures: 2,
            failure_window_secs: 10,
            recovery_time_secs: 20,
        };
        let tracker = HealthTracker::new(HealthPolicy::from(&config));
        fail_times(&tracker, 2);
        assert!(!tracker.is_available(SVC));

        tokio::time::advance(Duration::from_secs(21)).await;
        assert!(tracker.is_available(SVC));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_failures_are_all_counted() {
        const TASKS: u32 = 32;
        const PER_TASK: u32 = 100;

        let tracker = std::sync::Arc::new(HealthTracker::new(HealthPolicy {
            max_failures: u32::MAX,
            failure_window: Duration::from_secs(3600),
            recovery_time: Duration::from_secs(3600),
        }));

        let handles: Vec<_> = (0..TASKS)
            .map(|_| {
                let tracker = tracker.clone();
                tokio::spawn(async move {
                    for _ in 0..PER_TASK {
                        tracker.record_failure(SVC, ErrorKind::TimeoutError, "timed out");
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let health = tracker.service(SVC).unwrap();
        assert_eq!(health.consecutive_failures, TASKS * PER_TASK);
        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!(tracker.all().len(), 1);
    }
}
