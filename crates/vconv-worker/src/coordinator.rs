//! Claim coordinator.
//!
//! Decides which worker converts which item. Two mechanisms work
//! together:
//!
//! - **Claim markers**: `claims/<sha256(item)>/<attempt>.json`, created
//!   with a conditional create. Whoever creates marker `(item, n)` owns
//!   attempt `n`, so two workers can never convert the same attempt.
//! - **The bookkeeping lock**: a lease object guarding every
//!   read-modify-write of the catalog and the cumulative stats. It is
//!   never held across a transfer or a conversion.
//!
//! The attempt number doubles as a fencing token: a commit is applied only
//! while the catalog still records our attempt as `processing`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vconv_models::{
    CatalogIndex, ClaimMarker, ConversionResult, CumulativeStats, LockMarker, ProcessingRecord,
    ProcessingStatus, RunCounts, RunLog,
};
use vconv_storage::{Backend, StorageError, StorageLayout};

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::metrics;
use crate::retry::{FailureTracker, RetryConfig};

/// Lease and retry settings of the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub max_attempts: u32,
    pub claim_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub lock_ttl: Duration,
    pub lock_retries: u32,
    pub lock_backoff: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

impl From<&WorkerConfig> for CoordinatorSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            claim_ttl: config.claim_ttl,
            heartbeat_interval: config.heartbeat_interval,
            lock_ttl: config.lock_ttl,
            lock_retries: config.lock_retries,
            lock_backoff: config.lock_backoff,
        }
    }
}

/// Why an item was selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimKind {
    /// No record yet
    New,
    /// A `processing` record whose claimant stopped renewing its lease
    Reclaim,
    /// A `failed` record with attempts left
    Retry,
}

impl ClaimKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimKind::New => "new",
            ClaimKind::Reclaim => "reclaim",
            ClaimKind::Retry => "retry",
        }
    }
}

/// Attempt that would be claimed next for an item, if any.
///
/// Abandoned attempts count against `max_attempts` like failed ones.
/// Staleness of `processing` records is not checked here; the caller
/// consults the claim marker for that.
pub fn next_attempt(record: Option<&ProcessingRecord>, max_attempts: u32) -> Option<(u32, ClaimKind)> {
    let Some(record) = record else {
        return Some((1, ClaimKind::New));
    };

    match record.status() {
        ProcessingStatus::Done => None,
        ProcessingStatus::Failed => {
            // Records without an attempt counter consumed one attempt
            let used = record.attempt.max(1);
            (used < max_attempts).then_some((used + 1, ClaimKind::Retry))
        }
        ProcessingStatus::Processing => {
            (record.attempt < max_attempts).then_some((record.attempt + 1, ClaimKind::Reclaim))
        }
    }
}

/// A `processing` record that used up every attempt. Once its lease
/// lapses it is turned into a `failed` tombstone instead of reclaimed.
fn attempts_exhausted(record: &ProcessingRecord, max_attempts: u32) -> bool {
    record.status() == ProcessingStatus::Processing
        && record.attempt >= 1
        && record.attempt >= max_attempts
}

/// An attempt owned by this worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub item: String,
    pub attempt: u32,
    pub kind: ClaimKind,
    pub claimed_at: DateTime<Utc>,
}

/// Renews a claim lease in the background until stopped or dropped.
pub struct Heartbeat {
    handle: JoinHandle<()>,
}

impl Heartbeat {
    pub fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Serializes bookkeeping writes and hands out item claims.
#[derive(Clone)]
pub struct ClaimCoordinator {
    backend: Arc<dyn Backend>,
    layout: StorageLayout,
    worker_id: String,
    settings: CoordinatorSettings,
}

fn chrono_ttl(ttl: Duration) -> chrono::Duration {
    chrono::Duration::seconds(ttl.as_secs().min(i64::MAX as u64 / 1000) as i64)
        + chrono::Duration::milliseconds(i64::from(ttl.subsec_millis()))
}

fn to_json<T: Serialize>(value: &T) -> WorkerResult<Vec<u8>> {
    serde_json::to_vec_pretty(value).map_err(|e| WorkerError::Storage(StorageError::Json(e)))
}

impl ClaimCoordinator {
    pub fn new(
        backend: Arc<dyn Backend>,
        layout: StorageLayout,
        worker_id: impl Into<String>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            backend,
            layout,
            worker_id: worker_id.into(),
            settings,
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    // =========================================================================
    // Lock
    // =========================================================================

    /// Run `body` while holding the bookkeeping lock.
    ///
    /// The lock is released on every exit path; a failed release is logged
    /// and never replaces the body's result.
    pub async fn with_lock<F, Fut, T>(&self, body: F) -> WorkerResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = WorkerResult<T>>,
    {
        let lock = self.acquire_lock().await?;
        let result = body().await;
        self.release_lock(&lock).await;
        result
    }

    async fn acquire_lock(&self) -> WorkerResult<LockMarker> {
        let key = self.layout.lock_key();
        let backoff = RetryConfig::new("lock_acquire")
            .with_base_delay(self.settings.lock_backoff)
            .with_max_retries(self.settings.lock_retries);
        let mut retries = 0u32;

        loop {
            let now = Utc::now();
            let marker = LockMarker::new(&self.worker_id, chrono_ttl(self.settings.lock_ttl), now);
            if self.backend.create_if_absent(&key, to_json(&marker)?).await?.is_created() {
                debug!(token = %marker.token, "Acquired lock");
                return Ok(marker);
            }

            metrics::record_lock_contention();
            if self.break_stale_lock(&key, now).await? {
                continue;
            }

            if retries >= backoff.max_retries {
                return Err(WorkerError::lock_busy(format!(
                    "{} still held after {} retries",
                    key, retries
                )));
            }
            retries += 1;
            tokio::time::sleep(backoff.delay_for_attempt(retries)).await;
        }
    }

    /// Remove the lock if its lease lapsed. Returns `true` when the caller
    /// should retry acquisition immediately.
    async fn break_stale_lock(&self, key: &str, now: DateTime<Utc>) -> WorkerResult<bool> {
        let Some(bytes) = self.backend.get_optional(key).await? else {
            // Released between our create and read
            return Ok(true);
        };

        let current: LockMarker = match serde_json::from_slice(&bytes) {
            Ok(marker) => marker,
            Err(e) => {
                warn!(key, error = %e, "Lock body is unreadable; treating it as held");
                return Ok(false);
            }
        };

        if !current.is_expired(now) {
            return Ok(false);
        }

        // One contender wins the right to break this particular token
        let break_key = self.layout.lock_break_key(&current.token);
        let won = self
            .backend
            .create_if_absent(&break_key, self.worker_id.clone().into_bytes())
            .await?
            .is_created();
        if !won {
            return Ok(false);
        }

        let outcome = self.remove_expired_lock(key, &current).await;

        // The token is gone or still expired; either way the marker has
        // done its job and a later contender may need it again
        if let Err(e) = self.backend.delete(&break_key).await {
            warn!(key = %break_key, error = %e, "Failed to remove lock break marker");
        }
        outcome
    }

    async fn remove_expired_lock(&self, key: &str, current: &LockMarker) -> WorkerResult<bool> {
        // The holder may have released meanwhile and a new lease been taken
        match self.read_lock(key).await {
            Some(latest) if latest.token == current.token => {
                warn!(
                    owner = %current.owner,
                    token = %current.token,
                    expired_at = %current.expires_at,
                    "Breaking expired lock"
                );
                self.backend.delete(key).await?;
                metrics::record_lock_broken();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Ok(true),
        }
    }

    async fn read_lock(&self, key: &str) -> Option<LockMarker> {
        match self.backend.get_optional(key).await {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(key, error = %e, "Failed to read lock");
                None
            }
        }
    }

    async fn release_lock(&self, lock: &LockMarker) {
        let key = self.layout.lock_key();

        // Never delete a lease that was broken and re-acquired by someone else
        if let Some(current) = self.read_lock(&key).await {
            if current.token != lock.token {
                warn!(
                    token = %lock.token,
                    holder = %current.owner,
                    "Lock was taken over before release"
                );
                return;
            }
        }

        if let Err(e) = self.backend.delete(&key).await {
            warn!(key = %key, error = %e, "Failed to release lock");
        } else {
            debug!(token = %lock.token, "Released lock");
        }
    }

    // =========================================================================
    // Documents
    // =========================================================================

    async fn read_document<D>(&self, key: &str) -> WorkerResult<D>
    where
        D: DeserializeOwned + Default,
    {
        match self.backend.get_optional(key).await? {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| WorkerError::malformed(key, e)),
            None => Ok(D::default()),
        }
    }

    /// Read-modify-write of one document under the lock.
    ///
    /// Nothing is written when `mutate` fails.
    async fn update_document<D, F, T>(&self, key: String, mutate: F) -> WorkerResult<T>
    where
        D: DeserializeOwned + Serialize + Default,
        F: FnOnce(&mut D) -> WorkerResult<T>,
    {
        let key = key.as_str();
        self.with_lock(move || async move {
            let mut document: D = self.read_document(key).await?;
            let output = mutate(&mut document)?;
            self.backend.put(key, to_json(&document)?).await?;
            Ok(output)
        })
        .await
    }

    /// Current catalog, read without the lock.
    pub async fn load_catalog(&self) -> WorkerResult<CatalogIndex> {
        self.read_document(&self.layout.catalog_key()).await
    }

    pub async fn update_catalog<F, T>(&self, mutate: F) -> WorkerResult<T>
    where
        F: FnOnce(&mut CatalogIndex) -> WorkerResult<T>,
    {
        self.update_document(self.layout.catalog_key(), mutate).await
    }

    /// Append a run's entries to the log document of its day.
    pub async fn append_run_log(&self, run: RunLog) -> WorkerResult<RunLog> {
        self.update_document(self.layout.run_log_key(&run.date), |day: &mut Option<RunLog>| {
            let merged = match day.take() {
                Some(mut existing) => {
                    existing.extend(run);
                    existing
                }
                None => run,
            };
            *day = Some(merged.clone());
            Ok(merged)
        })
        .await
    }

    /// Add a run's counters to the cumulative stats.
    pub async fn merge_stats(&self, counts: &RunCounts) -> WorkerResult<CumulativeStats> {
        self.update_document(self.layout.stats_key(), |stats: &mut CumulativeStats| {
            stats.merge(counts, Utc::now());
            Ok(stats.clone())
        })
        .await
    }

    // =========================================================================
    // Claims
    // =========================================================================

    /// Media items under the input prefix.
    pub async fn list_items(&self) -> WorkerResult<Vec<String>> {
        let mut items = self.backend.list(self.layout.input_prefix()).await?;
        items.sort();
        Ok(items)
    }

    /// Claim the next item needing work, or `None` when nothing is left.
    pub async fn claim_next(&self) -> WorkerResult<Option<Claim>> {
        let items = self.list_items().await?;
        let catalog = self.load_catalog().await?;

        for item in items {
            let record = catalog.get(&item);
            if let Some(record) = record.filter(|r| attempts_exhausted(r, self.settings.max_attempts)) {
                if self.claim_is_stale(&item, record.attempt).await {
                    if let Err(e) = self.expire_claim(&item, record.attempt).await {
                        warn!(item = %item, attempt = record.attempt, error = %e, "Failed to expire abandoned claim");
                    }
                }
                continue;
            }

            let Some((attempt, kind)) = next_attempt(record, self.settings.max_attempts) else {
                continue;
            };

            if kind == ClaimKind::Reclaim && !self.claim_is_stale(&item, attempt - 1).await {
                continue;
            }

            match self.try_claim(&item, attempt, kind).await {
                Ok(Some(claim)) => return Ok(Some(claim)),
                Ok(None) => {}
                Err(e) => warn!(item = %item, attempt, error = %e, "Claim failed, moving on"),
            }
        }

        Ok(None)
    }

    /// Check whether the claimant of `attempt` stopped renewing its lease.
    async fn claim_is_stale(&self, item: &str, attempt: u32) -> bool {
        let key = self.layout.claim_key(item, attempt);
        match self.backend.get_optional(&key).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<ClaimMarker>(&bytes) {
                Ok(marker) => marker.is_expired(Utc::now()),
                Err(_) => true,
            },
            Ok(None) => true,
            Err(e) => {
                warn!(item, attempt, error = %e, "Failed to read claim marker");
                false
            }
        }
    }

    /// Record an abandoned last attempt as failed.
    async fn expire_claim(&self, item: &str, attempt: u32) -> WorkerResult<()> {
        let expired = self
            .update_catalog(|catalog| match catalog.get_mut(item) {
                Some(record)
                    if record.attempt == attempt
                        && record.status() == ProcessingStatus::Processing =>
                {
                    record.mark_failed(format!(
                        "attempt {} abandoned without a commit; no attempts left",
                        attempt
                    ));
                    Ok(true)
                }
                _ => Ok(false),
            })
            .await?;

        if expired {
            warn!(item, attempt, "Abandoned claim expired, item marked failed");
            metrics::record_claim_expired();
        }
        Ok(())
    }

    async fn try_claim(&self, item: &str, attempt: u32, kind: ClaimKind) -> WorkerResult<Option<Claim>> {
        let now = Utc::now();
        let marker = ClaimMarker::new(
            item,
            attempt,
            &self.worker_id,
            chrono_ttl(self.settings.claim_ttl),
            now,
        );
        let marker_key = self.layout.claim_key(item, attempt);

        if !self.backend.create_if_absent(&marker_key, to_json(&marker)?).await?.is_created() {
            debug!(item, attempt, "Attempt already claimed by another worker");
            metrics::record_claim_conflict();
            return Ok(None);
        }

        let max_attempts = self.settings.max_attempts;
        let worker_id = self.worker_id.clone();
        let recorded = self
            .update_catalog(|catalog| {
                let existing = catalog.get(item);
                if next_attempt(existing, max_attempts).map(|(n, _)| n) != Some(attempt) {
                    return Err(WorkerError::claim_lost(item, attempt));
                }

                let mut record = ProcessingRecord::processing(attempt, worker_id, now);
                if let Some(existing) = existing {
                    record.extra = existing.extra.clone();
                }
                catalog.insert(item, record);
                Ok(())
            })
            .await;

        match recorded {
            Ok(()) => {
                info!(item, attempt, kind = kind.as_str(), "Claimed item");
                metrics::record_claim(kind.as_str());
                Ok(Some(Claim {
                    item: item.to_string(),
                    attempt,
                    kind,
                    claimed_at: now,
                }))
            }
            Err(e) => {
                if let Err(del) = self.backend.delete(&marker_key).await {
                    warn!(item, attempt, error = %del, "Failed to remove abandoned claim marker");
                }
                if e.is_claim_lost() {
                    debug!(item, attempt, "Catalog moved on since the scan");
                    return Ok(None);
                }
                Err(e)
            }
        }
    }

    /// Keep the claim's lease alive while the item is processed.
    pub fn spawn_heartbeat(&self, claim: &Claim) -> Heartbeat {
        let backend = Arc::clone(&self.backend);
        let key = self.layout.claim_key(&claim.item, claim.attempt);
        let ttl = chrono_ttl(self.settings.claim_ttl);
        let period = self.settings.heartbeat_interval;
        let mut marker = ClaimMarker::new(&claim.item, claim.attempt, &self.worker_id, ttl, claim.claimed_at);

        let handle = tokio::spawn(async move {
            let mut failures = FailureTracker::new(3);
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                marker.renew(ttl, Utc::now());

                let body = match serde_json::to_vec_pretty(&marker) {
                    Ok(body) => body,
                    Err(e) => {
                        warn!(key = %key, error = %e, "Failed to encode claim marker");
                        continue;
                    }
                };

                match backend.put(&key, body).await {
                    Ok(()) => {
                        failures.record_success();
                        debug!(key = %key, "Renewed claim lease");
                    }
                    Err(e) => {
                        if failures.record_failure() {
                            warn!(key = %key, error = %e, "Failed to renew claim lease");
                        }
                    }
                }
            }
        });

        Heartbeat { handle }
    }

    // =========================================================================
    // Commits
    // =========================================================================

    /// Record a successful conversion.
    pub async fn commit_done(
        &self,
        claim: &Claim,
        processed_date: &str,
        output_path: &str,
        results: ConversionResult,
    ) -> WorkerResult<()> {
        self.commit(claim, |record| record.mark_done(processed_date, output_path, results))
            .await
    }

    /// Record a failed attempt.
    pub async fn commit_failed(&self, claim: &Claim, error: &str) -> WorkerResult<()> {
        self.commit(claim, |record| record.mark_failed(error)).await
    }

    async fn commit<F>(&self, claim: &Claim, apply: F) -> WorkerResult<()>
    where
        F: FnOnce(&mut ProcessingRecord),
    {
        self.update_catalog(|catalog| match catalog.get_mut(&claim.item) {
            Some(record)
                if record.attempt == claim.attempt
                    && record.status() == ProcessingStatus::Processing =>
            {
                apply(record);
                Ok(())
            }
            _ => Err(WorkerError::claim_lost(&claim.item, claim.attempt)),
        })
        .await
    }
}
