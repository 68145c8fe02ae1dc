//! Per-run network policy handed to the executor.
//!
//! Rate limits are spacing locks in the store: a request to a limited host
//! takes `domain:<host>` with an expiry of `60000 / rpm` ms and never
//! releases it, so requests from every process sharing the database are
//! spaced at least that far apart.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{Duration, Utc};
use recur_core::{Lock, NetworkScope, ResourceLimits};
use recur_store::{Store, StoreError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::executor::ExecutorError;

const MIN_WAIT_MS: i64 = 10;

pub struct NetworkGate {
    store: Arc<Store>,
    job_id: String,
    run_id: String,
    scope: NetworkScope,
    allowlist: Vec<String>,
    rate_limits: BTreeMap<String, u32>,
    max_bandwidth: Option<u64>,
    bandwidth: AtomicU64,
}

impl NetworkGate {
    pub fn new(store: Arc<Store>, job_id: &str, run_id: &str, limits: &ResourceLimits) -> Self {
        Self {
            store,
            job_id: job_id.to_string(),
            run_id: run_id.to_string(),
            scope: limits.network,
            allowlist: limits.domain_allowlist.clone(),
            rate_limits: limits.rate_limits.clone(),
            max_bandwidth: limits.max_bandwidth_bytes,
            bandwidth: AtomicU64::new(0),
        }
    }

    /// Is `host` (or a URL) reachable under this run's network scope?
    pub fn check_host(&self, host: &str) -> Result<(), ExecutorError> {
        let host = normalize_host(host);
        match self.scope {
            NetworkScope::Open => Ok(()),
            NetworkScope::None => Err(ExecutorError::NetworkDenied(format!(
                "job {} has no network access ({host})",
                self.job_id
            ))),
            NetworkScope::Allowlist => {
                if self.allowlist.iter().any(|d| domain_matches(&host, d)) {
                    Ok(())
                } else {
                    Err(ExecutorError::NetworkDenied(format!(
                        "{host} is not in the allowlist of job {}",
                        self.job_id
                    )))
                }
            }
        }
    }

    /// Check the host and take its rate-limit slot without waiting.
    pub fn try_acquire(&self, host: &str) -> Result<(), ExecutorError> {
        self.check_host(host)?;
        let host = normalize_host(host);
        let Some((domain, rpm)) = self.rate_limit_for(&host) else {
            return Ok(());
        };
        let spacing = Duration::milliseconds(60_000 / i64::from(rpm.max(1)));
        let lock = Lock::new(&format!("domain:{domain}"), &self.run_id, Utc::now(), Some(spacing));
        if self.store.acquire_lock(&lock).map_err(store_failure)? {
            debug!(%domain, run_id = %self.run_id, "rate-limit slot taken");
            Ok(())
        } else {
            Err(ExecutorError::RateLimited { host })
        }
    }

    /// Like [`try_acquire`](Self::try_acquire) but waits for the slot to
    /// free up. Returns `Cancelled` if `cancel` fires first.
    pub async fn acquire(&self, host: &str, cancel: &CancellationToken) -> Result<(), ExecutorError> {
        loop {
            match self.try_acquire(host) {
                Err(ExecutorError::RateLimited { host: limited }) => {
                    let wait = self.slot_wait(&limited)?;
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = cancel.cancelled() => return Err(ExecutorError::Cancelled),
                    }
                }
                other => return other,
            }
        }
    }

    /// Account `bytes` of transfer; fails once the cap is crossed.
    pub fn record_bandwidth(&self, bytes: u64) -> Result<u64, ExecutorError> {
        let total = self.bandwidth.fetch_add(bytes, Ordering::SeqCst) + bytes;
        match self.max_bandwidth {
            Some(limit) if total > limit => Err(ExecutorError::BandwidthExceeded { limit }),
            _ => Ok(total),
        }
    }

    pub fn bandwidth_used(&self) -> u64 {
        self.bandwidth.load(Ordering::SeqCst)
    }

    /// The configured limit covering `host`: an exact entry or the closest
    /// parent domain, so subdomains share their parent's budget.
    fn rate_limit_for<'a>(&'a self, host: &str) -> Option<(&'a str, u32)> {
        self.rate_limits
            .iter()
            .filter(|(domain, _)| domain_matches(host, domain))
            .max_by_key(|(domain, _)| domain.len())
            .map(|(domain, rpm)| (domain.as_str(), *rpm))
    }

    fn slot_wait(&self, host: &str) -> Result<std::time::Duration, ExecutorError> {
        let now = Utc::now();
        let Some((domain, _)) = self.rate_limit_for(host) else {
            return Ok(std::time::Duration::from_millis(MIN_WAIT_MS as u64));
        };
        let lock = self
            .store
            .get_lock(&format!("domain:{domain}"), now)
            .map_err(store_failure)?;
        let ms = lock
            .and_then(|l| l.expires_at)
            .map(|exp| (exp - now).num_milliseconds())
            .unwrap_or(0)
            .max(MIN_WAIT_MS);
        Ok(std::time::Duration::from_millis(ms as u64))
    }
}

fn store_failure(e: StoreError) -> ExecutorError {
    ExecutorError::failed(e.code(), e.to_string())
}

/// Lower-cased host of a host name or URL, without scheme, path,
/// credentials or port.
pub fn normalize_host(raw: &str) -> String {
    let rest = raw.trim().split_once("://").map_or(raw.trim(), |(_, r)| r);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host = authority.rsplit_once('@').map_or(authority, |(_, h)| h);
    let host = match host.rsplit_once(':') {
        Some((h, port)) if port.chars().all(|c| c.is_ascii_digit()) => h,
        _ => host,
    };
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn domain_matches(host: &str, domain: &str) -> bool {
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}
