//! Per-capability availability tracking.
//!
//! A probe result is cached for a short TTL so hot paths do not pay a network
//! round trip per call. The lock is only held to read or replace the cached
//! result, never while a probe is in flight.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::future::Future;
use std::time::{Duration, Instant};

use super::{AiError, Capability};

/// Availability as reported by `AiServices::status`.
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityStatus {
    pub enabled: bool,
    pub available: bool,
    /// Model or backend version reported by the last successful probe.
    pub model: Option<String>,
    pub error: Option<String>,
    pub checked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct Observation {
    available: bool,
    model: Option<String>,
    error: Option<String>,
    at: Instant,
    checked_at: DateTime<Utc>,
}

#[derive(Debug)]
pub(crate) struct Availability {
    capability: Capability,
    enabled: bool,
    ttl: Duration,
    probe_timeout: Duration,
    last: RwLock<Option<Observation>>,
}

impl Availability {
    pub(crate) fn new(
        capability: Capability,
        enabled: bool,
        ttl: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            capability,
            enabled,
            ttl,
            probe_timeout,
            last: RwLock::new(None),
        }
    }

    pub(crate) fn capability(&self) -> Capability {
        self.capability
    }

    fn fresh(&self) -> Option<Observation> {
        self.last
            .read()
            .as_ref()
            .filter(|o| o.at.elapsed() < self.ttl)
            .cloned()
    }

    /// Cached availability, probing first if the cache is empty or stale.
    pub(crate) async fn check<F, Fut>(&self, probe: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, AiError>>,
    {
        if !self.enabled {
            return false;
        }
        if let Some(obs) = self.fresh() {
            return obs.available;
        }

        let started = Instant::now();
        let outcome = match tokio::time::timeout(self.probe_timeout, probe()).await {
            Ok(result) => result,
            Err(_) => Err(AiError::Timeout {
                capability: self.capability,
                after: self.probe_timeout,
            }),
        };

        let available = outcome.is_ok();
        match &outcome {
            Ok(model) => tracing::debug!(
                capability = %self.capability,
                model = %model,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "capability available"
            ),
            Err(e) => tracing::warn!(capability = %self.capability, error = %e, "capability unavailable"),
        }
        self.record(outcome.map_err(|e| e.to_string()));
        available
    }

    /// Record an outage seen by a real call, so callers fall back until the TTL expires.
    pub(crate) fn mark_failed(&self, err: &AiError) {
        if err.is_outage() {
            self.record(Err(err.to_string()));
        }
    }

    fn record(&self, outcome: Result<String, String>) {
        let previous_model = self.last.read().as_ref().and_then(|o| o.model.clone());
        let observation = match outcome {
            Ok(model) => Observation {
                available: true,
                model: Some(model),
                error: None,
                at: Instant::now(),
                checked_at: Utc::now(),
            },
            Err(error) => Observation {
                available: false,
                model: previous_model,
                error: Some(error),
                at: Instant::now(),
                checked_at: Utc::now(),
            },
        };
        *self.last.write() = Some(observation);
    }

    /// Cached view without probing.
    pub(crate) fn snapshot(&self) -> CapabilityStatus {
        let last = self.last.read().clone();
        match last {
            Some(obs) if self.enabled => CapabilityStatus {
                enabled: true,
                available: obs.available,
                model: obs.model,
                error: obs.error,
                checked_at: Some(obs.checked_at),
            },
            _ => CapabilityStatus {
                enabled: self.enabled,
                available: false,
                model: None,
                error: None,
                checked_at: None,
            },
        }
    }
}
