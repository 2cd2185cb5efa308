//! Outbound proxy pool with health tracking and rotation.
//!
//! Each proxy owns its own health guard, so recording an outcome for one proxy
//! never contends with selection or recording on another. Selection only
//! snapshots records; it never mutates them.
//!
//! A proxy is deactivated when its consecutive failure count reaches
//! [`FAILURE_THRESHOLD`] and stays inactive until [`ProxyPool::reactivate`]
//! is called.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use docfetch_core::proxy::{ProxyEndpoint, ProxyPool, RotationStrategy};
//!
//! # fn example() -> Result<(), docfetch_core::proxy::ProxyError> {
//! let pool = ProxyPool::new(vec![
//!     ProxyEndpoint::parse("10.0.0.1:8080")?,
//!     ProxyEndpoint::parse("10.0.0.2:8080")?,
//! ]);
//!
//! let proxy = pool.get_next(RotationStrategy::RoundRobin)?;
//! pool.record_success(&proxy, Duration::from_millis(120));
//! # Ok(())
//! # }
//! ```

mod error;
mod provider;
mod record;

pub use error::ProxyError;
pub use provider::{MAX_PROVIDER_PAGES, ProxyProvider, parse_proxy_list};
pub use record::{
    FAILURE_THRESHOLD, LATENCY_WINDOW, ProxyCredentials, ProxyEndpoint, ProxyProtocol, ProxyRecord,
};

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::download::{FetchRequest, Fetcher};
use record::ProxyHealth;

/// Weight of the success rate in the best-performing score.
const SUCCESS_WEIGHT: f64 = 0.7;

/// Weight of the normalized inverse latency in the best-performing score.
const LATENCY_WEIGHT: f64 = 0.3;

/// How proxies are chosen for the next request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    /// Cycle through active proxies in order.
    #[default]
    RoundRobin,
    /// Pick the active proxy with the fewest total requests.
    LeastUsed,
    /// Pick the active proxy with the highest weighted success/latency score.
    BestPerforming,
}

impl RotationStrategy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::LeastUsed => "least_used",
            Self::BestPerforming => "best_performing",
        }
    }
}

impl fmt::Display for RotationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RotationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" => Ok(Self::RoundRobin),
            "least_used" => Ok(Self::LeastUsed),
            "best_performing" | "best" => Ok(Self::BestPerforming),
            other => Err(format!(
                "unknown rotation strategy '{other}' (expected round_robin, least_used or best_performing)"
            )),
        }
    }
}

#[derive(Debug)]
struct ProxyEntry {
    endpoint: ProxyEndpoint,
    health: Mutex<ProxyHealth>,
}

impl ProxyEntry {
    fn lock(&self) -> MutexGuard<'_, ProxyHealth> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A proxy handed out by the pool. Cheap to clone; pass it back to
/// `record_success` / `record_failure`.
#[derive(Debug, Clone)]
pub struct ProxyHandle {
    entry: Arc<ProxyEntry>,
}

impl ProxyHandle {
    #[must_use]
    pub fn endpoint(&self) -> &ProxyEndpoint {
        &self.entry.endpoint
    }

    #[must_use]
    pub fn id(&self) -> String {
        self.entry.endpoint.id()
    }
}

/// Aggregate pool health.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub active: usize,
    pub inactive: usize,
    /// Mean success rate across all proxies (1.0 for an empty pool).
    pub avg_success_rate: f64,
    /// Mean of per-proxy average latencies, over proxies with samples.
    pub avg_latency_ms: Option<f64>,
}

/// Shared pool of outbound proxies.
#[derive(Debug, Default)]
pub struct ProxyPool {
    entries: Vec<Arc<ProxyEntry>>,
    cursor: AtomicUsize,
}

impl ProxyPool {
    /// Creates a pool from endpoints, dropping duplicate `host:port` ids.
    #[must_use]
    pub fn new(endpoints: Vec<ProxyEndpoint>) -> Self {
        let mut seen = std::collections::HashSet::new();
        let entries: Vec<Arc<ProxyEntry>> = endpoints
            .into_iter()
            .filter(|e| seen.insert(e.id()))
            .map(|endpoint| {
                Arc::new(ProxyEntry {
                    endpoint,
                    health: Mutex::new(ProxyHealth::default()),
                })
            })
            .collect();
        info!(proxies = entries.len(), "proxy pool initialised");
        Self {
            entries,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Builds a pool from a static list, one address per line.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::InvalidAddress`] for the first bad line.
    pub fn from_list<I, S>(addresses: I) -> Result<Self, ProxyError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let endpoints = addresses
            .into_iter()
            .map(|a| ProxyEndpoint::parse(a.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(endpoints))
    }

    /// Reads a proxy list file (blank lines and `#` comments ignored).
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Io`] if the file cannot be read or
    /// [`ProxyError::InvalidAddress`] for a malformed entry.
    pub fn from_file(path: &Path) -> Result<Self, ProxyError> {
        let text = std::fs::read_to_string(path).map_err(|source| ProxyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::new(parse_proxy_list(&text)?))
    }

    /// Fetches every page from a provider and builds a pool.
    ///
    /// # Errors
    ///
    /// Propagates provider errors.
    pub async fn from_provider(provider: &ProxyProvider) -> Result<Self, ProxyError> {
        Ok(Self::new(provider.fetch_all().await?))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of proxies currently eligible for selection.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.entries.iter().filter(|e| e.lock().is_active).count()
    }

    /// Selects the next active proxy.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Exhausted`] when no proxy is active.
    pub fn get_next(&self, strategy: RotationStrategy) -> Result<ProxyHandle, ProxyError> {
        self.get_next_excluding(strategy, &[])
    }

    /// Whether an active proxy outside `exclude` exists. Leaves rotation state alone.
    #[must_use]
    pub fn has_eligible(&self, exclude: &[String]) -> bool {
        self.entries
            .iter()
            .any(|entry| !exclude.contains(&entry.endpoint.id()) && entry.lock().is_active)
    }

    /// Selects the next active proxy whose id is not in `exclude`.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Exhausted`] when no eligible proxy remains.
    #[instrument(level = "trace", skip(self, exclude))]
    pub fn get_next_excluding(
        &self,
        strategy: RotationStrategy,
        exclude: &[String],
    ) -> Result<ProxyHandle, ProxyError> {
        let candidates: Vec<(usize, ProxyRecord)> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| !exclude.contains(&entry.endpoint.id()))
            .map(|(i, entry)| (i, ProxyRecord::snapshot(&entry.endpoint, &entry.lock())))
            .filter(|(_, record)| record.is_active)
            .collect();

        if candidates.is_empty() {
            return Err(ProxyError::Exhausted);
        }

        let index = match strategy {
            RotationStrategy::RoundRobin => {
                let turn = self.cursor.fetch_add(1, Ordering::Relaxed);
                candidates[turn % candidates.len()].0
            }
            RotationStrategy::LeastUsed => candidates
                .iter()
                .min_by_key(|(i, record)| (record.total_requests, *i))
                .map_or(candidates[0].0, |(i, _)| *i),
            RotationStrategy::BestPerforming => best_performing(&candidates),
        };

        let entry = Arc::clone(&self.entries[index]);
        debug!(proxy = %entry.endpoint, %strategy, "proxy selected");
        Ok(ProxyHandle { entry })
    }

    /// Records a successful request through `proxy`.
    pub fn record_success(&self, proxy: &ProxyHandle, latency: Duration) {
        proxy.entry.lock().record_success(latency);
    }

    /// Records a failed request through `proxy`, deactivating it at the threshold.
    pub fn record_failure(&self, proxy: &ProxyHandle) {
        let deactivated = proxy.entry.lock().record_failure();
        if deactivated {
            warn!(
                proxy = %proxy.endpoint(),
                threshold = FAILURE_THRESHOLD,
                "proxy deactivated after consecutive failures"
            );
        }
    }

    /// Looks a proxy up by its `host:port` id.
    #[must_use]
    pub fn find(&self, id: &str) -> Option<ProxyHandle> {
        self.entries
            .iter()
            .find(|e| e.endpoint.id() == id)
            .map(|entry| ProxyHandle {
                entry: Arc::clone(entry),
            })
    }

    /// Reactivates a proxy and clears its consecutive failure count.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::UnknownProxy`] if the id is not in the pool.
    pub fn reactivate(&self, id: &str) -> Result<(), ProxyError> {
        let handle = self.find(id).ok_or_else(|| ProxyError::unknown(id))?;
        handle.entry.lock().reactivate();
        info!(proxy = %handle.endpoint(), "proxy reactivated");
        Ok(())
    }

    /// Takes a proxy out of rotation until reactivated.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::UnknownProxy`] if the id is not in the pool.
    pub fn disable(&self, id: &str) -> Result<(), ProxyError> {
        let handle = self.find(id).ok_or_else(|| ProxyError::unknown(id))?;
        handle.entry.lock().is_active = false;
        info!(proxy = %handle.endpoint(), "proxy disabled");
        Ok(())
    }

    /// Probes `probe_url` through `proxy` and records the outcome.
    ///
    /// Returns whether the probe succeeded.
    #[instrument(skip(self, fetcher, proxy), fields(proxy = %proxy.endpoint()))]
    pub async fn health_check(
        &self,
        fetcher: &dyn Fetcher,
        proxy: &ProxyHandle,
        probe_url: &str,
    ) -> bool {
        let started = Instant::now();
        let outcome = fetcher
            .fetch(FetchRequest::via(probe_url, proxy.endpoint()))
            .await;
        match outcome {
            Ok(response) if response.is_success() => {
                self.record_success(proxy, started.elapsed());
                debug!("health check passed");
                true
            }
            Ok(response) => {
                self.record_failure(proxy);
                debug!(status = response.status, "health check failed");
                false
            }
            Err(error) => {
                self.record_failure(proxy);
                debug!(%error, "health check failed");
                false
            }
        }
    }

    /// Probes every proxy, active or not. Returns the number that passed.
    pub async fn health_check_all(&self, fetcher: &dyn Fetcher, probe_url: &str) -> usize {
        let handles: Vec<ProxyHandle> = self
            .entries
            .iter()
            .map(|entry| ProxyHandle {
                entry: Arc::clone(entry),
            })
            .collect();

        let checks = handles
            .iter()
            .map(|handle| self.health_check(fetcher, handle, probe_url));
        let passed = futures_util::future::join_all(checks)
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count();
        info!(passed, total = handles.len(), "proxy health check complete");
        passed
    }

    /// Snapshot of every proxy record.
    #[must_use]
    pub fn records(&self) -> Vec<ProxyRecord> {
        self.entries
            .iter()
            .map(|entry| ProxyRecord::snapshot(&entry.endpoint, &entry.lock()))
            .collect()
    }

    /// Aggregate health, computed from per-proxy snapshots.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> PoolStats {
        let records = self.records();
        let total = records.len();
        let active = records.iter().filter(|r| r.is_active).count();

        let avg_success_rate = if total == 0 {
            1.0
        } else {
            records.iter().map(ProxyRecord::success_rate).sum::<f64>() / total as f64
        };

        let latencies: Vec<f64> = records
            .iter()
            .filter_map(|r| r.avg_latency)
            .map(|d| d.as_secs_f64() * 1000.0)
            .collect();
        let avg_latency_ms = if latencies.is_empty() {
            None
        } else {
            Some(latencies.iter().sum::<f64>() / latencies.len() as f64)
        };

        PoolStats {
            total,
            active,
            inactive: total - active,
            avg_success_rate,
            avg_latency_ms,
        }
    }
}

/// Index of the candidate with the highest weighted score.
///
/// Inverse latency is normalized against the fastest candidate, so the
/// fastest scores 1.0. Candidates without samples also score 1.0.
fn best_performing(candidates: &[(usize, ProxyRecord)]) -> usize {
    let fastest = candidates
        .iter()
        .filter_map(|(_, r)| r.avg_latency)
        .min()
        .map(|d| d.as_secs_f64());

    let score = |record: &ProxyRecord| -> f64 {
        let latency_score = match (record.avg_latency, fastest) {
            (Some(latency), Some(fastest)) if latency.as_secs_f64() > 0.0 => {
                (fastest / latency.as_secs_f64()).min(1.0)
            }
            _ => 1.0,
        };
        SUCCESS_WEIGHT * record.success_rate() + LATENCY_WEIGHT * latency_score
    };

    candidates
        .iter()
        .max_by(|(ia, a), (ib, b)| {
            score(a)
                .total_cmp(&score(b))
                // ties go to the earlier proxy
                .then_with(|| ib.cmp(ia))
        })
        .map_or(candidates[0].0, |(i, _)| *i)
}
