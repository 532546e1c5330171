//! Retention maintenance
//!
//! Three passes per run: expire stale records, age out low-confidence
//! records one window early, promote frequently-used records. Expiry action
//! depends on tier: the bottom two tiers delete, the middle tiers demote,
//! permanent is exempt. Age is measured from the later of last use and the
//! last tier change, so a record demoted in one run gets a full window in
//! its new tier before the next run touches it; an immediately repeated run
//! is a no-op.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::RetentionConfig;
use crate::error::Result;
use crate::memory::tombstone::DeleteReason;
use crate::memory::types::{MemoryRecord, RecordType, Tier};
use crate::storage::{LanceStore, RecordFilter};

/// What expiry does to a record in a given tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryAction {
    Delete,
    Demote,
    None,
}

/// Retention windows and thresholds, derived from config
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub session_max_age: Duration,
    pub short_term_window: Duration,
    pub medium_term_window: Duration,
    pub long_term_window: Duration,
    pub low_confidence_threshold: f32,
    pub promote_access_threshold: u32,
    pub batch_limit: usize,
}

impl RetentionPolicy {
    pub fn from_config(config: &RetentionConfig) -> Self {
        Self {
            session_max_age: Duration::seconds(config.session_max_age_secs as i64),
            short_term_window: Duration::days(config.short_term_days as i64),
            medium_term_window: Duration::days(config.medium_term_days as i64),
            long_term_window: Duration::days(config.long_term_days as i64),
            low_confidence_threshold: config.low_confidence_threshold,
            promote_access_threshold: config.promote_access_threshold,
            batch_limit: config.batch_limit,
        }
    }

    /// Retention window for a tier; `None` means the tier never expires
    pub fn window(&self, tier: Tier) -> Option<Duration> {
        match tier {
            Tier::Session => Some(self.session_max_age),
            Tier::ShortTerm => Some(self.short_term_window),
            Tier::MediumTerm => Some(self.medium_term_window),
            Tier::LongTerm => Some(self.long_term_window),
            Tier::Permanent => None,
        }
    }

    /// The shorter window applied to low-confidence records: the next tier
    /// down's window. Session already has the shortest window and keeps it.
    pub fn early_window(&self, tier: Tier) -> Option<Duration> {
        match tier.demoted() {
            Some(lower) => self.window(lower),
            None => self.window(tier),
        }
    }

    pub fn expiry_action(tier: Tier) -> ExpiryAction {
        match tier {
            Tier::Session | Tier::ShortTerm => ExpiryAction::Delete,
            Tier::MediumTerm | Tier::LongTerm => ExpiryAction::Demote,
            Tier::Permanent => ExpiryAction::None,
        }
    }
}

/// Counts from one maintenance run
#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceSummary {
    pub evicted: usize,
    pub demoted: usize,
    pub promoted: usize,
    pub failed: usize,
    pub duration_ms: u64,
}

/// Executes the retention passes against a store
pub struct MaintenanceRunner {
    store: Arc<LanceStore>,
    policy: RetentionPolicy,
}

impl MaintenanceRunner {
    pub fn new(store: Arc<LanceStore>, policy: RetentionPolicy) -> Self {
        Self { store, policy }
    }

    pub async fn run(&self) -> Result<MaintenanceSummary> {
        self.run_at(Utc::now()).await
    }

    /// Run all passes as of the given instant. Taking the clock as an
    /// argument keeps retention behavior testable without sleeping.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<MaintenanceSummary> {
        let started = std::time::Instant::now();
        let mut summary = MaintenanceSummary::default();

        for tier in [Tier::Session, Tier::ShortTerm, Tier::MediumTerm, Tier::LongTerm] {
            self.expire_tier(tier, now, &mut summary).await?;
            self.expire_low_confidence(tier, now, &mut summary).await?;
        }

        for tier in [Tier::Session, Tier::ShortTerm, Tier::MediumTerm] {
            self.promote_tier(tier, now, &mut summary).await?;
        }

        summary.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            evicted = summary.evicted,
            demoted = summary.demoted,
            promoted = summary.promoted,
            failed = summary.failed,
            duration_ms = summary.duration_ms,
            "Maintenance run complete"
        );
        Ok(summary)
    }

    /// Normal expiry: unpinned records at or above the confidence threshold
    /// whose age exceeds the tier window.
    async fn expire_tier(
        &self,
        tier: Tier,
        now: DateTime<Utc>,
        summary: &mut MaintenanceSummary,
    ) -> Result<()> {
        let Some(window) = self.policy.window(tier) else {
            return Ok(());
        };
        let action = RetentionPolicy::expiry_action(tier);
        if action == ExpiryAction::None {
            return Ok(());
        }

        let filter = RecordFilter::new()
            .with_tiers(vec![tier])
            .with_pinned(false)
            .with_min_confidence(self.policy.low_confidence_threshold)
            .with_forgotten_included()
            .stale_before(now - window);

        self.apply_expiry(&filter, action, DeleteReason::Expired, now, summary)
            .await
    }

    /// Early aging for records below the confidence threshold: the next
    /// tier down's window and action apply. Unpinned short and medium
    /// records therefore delete; pinned records are only ever demoted.
    async fn expire_low_confidence(
        &self,
        tier: Tier,
        now: DateTime<Utc>,
        summary: &mut MaintenanceSummary,
    ) -> Result<()> {
        let Some(window) = self.policy.early_window(tier) else {
            return Ok(());
        };
        let action = RetentionPolicy::expiry_action(tier.demoted().unwrap_or(tier));
        if action == ExpiryAction::None {
            return Ok(());
        }
        let cutoff = now - window;

        let unpinned = RecordFilter::new()
            .with_tiers(vec![tier])
            .with_pinned(false)
            .with_below_confidence(self.policy.low_confidence_threshold)
            .with_forgotten_included()
            .stale_before(cutoff);
        self.apply_expiry(&unpinned, action, DeleteReason::LowConfidence, now, summary)
            .await?;

        if tier.demoted().is_some() {
            let pinned = RecordFilter::new()
                .with_tiers(vec![tier])
                .with_pinned(true)
                .with_below_confidence(self.policy.low_confidence_threshold)
                .with_forgotten_included()
                .stale_before(cutoff);
            self.apply_expiry(&pinned, ExpiryAction::Demote, DeleteReason::LowConfidence, now, summary)
                .await?;
        }

        Ok(())
    }

    /// Process matching records in batches until none remain. Both actions
    /// remove records from the filter's result set (deletes outright,
    /// demotes via the tier change resetting the staleness basis), so each
    /// iteration re-queries from offset zero.
    async fn apply_expiry(
        &self,
        filter: &RecordFilter,
        action: ExpiryAction,
        reason: DeleteReason,
        now: DateTime<Utc>,
        summary: &mut MaintenanceSummary,
    ) -> Result<()> {
        loop {
            let batch = self
                .store
                .list_filtered(filter, self.policy.batch_limit, 0)
                .await?;
            if batch.is_empty() {
                break;
            }

            let batch_len = batch.len();
            let mut batch_failed = 0;

            for record in batch {
                let outcome = match action {
                    ExpiryAction::Delete => self
                        .store
                        .delete_with_tombstone(&record, reason.clone(), None)
                        .await
                        .map(|deleted| {
                            if deleted {
                                summary.evicted += 1;
                            }
                        }),
                    ExpiryAction::Demote => match record.tier.demoted() {
                        Some(lower) => self
                            .store
                            .update_tier(record.id, lower, now)
                            .await
                            .map(|updated| {
                                if updated {
                                    summary.demoted += 1;
                                }
                            }),
                        None => Ok(()),
                    },
                    ExpiryAction::None => Ok(()),
                };

                if let Err(e) = outcome {
                    warn!(record = %record.id, "Maintenance action failed: {e}");
                    summary.failed += 1;
                    batch_failed += 1;
                }
            }

            // Nothing in the batch made progress; stop rather than spin
            if batch_failed == batch_len {
                error!("Entire maintenance batch failed, aborting pass");
                break;
            }
            if batch_len < self.policy.batch_limit {
                break;
            }
        }

        Ok(())
    }

    /// Promote records accessed often enough within their tier's window.
    /// Promotion resets the access counter, so the criterion has to be met
    /// again from scratch in the new tier.
    async fn promote_tier(
        &self,
        tier: Tier,
        now: DateTime<Utc>,
        summary: &mut MaintenanceSummary,
    ) -> Result<()> {
        let Some(window) = self.policy.window(tier) else {
            return Ok(());
        };
        let Some(target) = tier.promoted() else {
            return Ok(());
        };

        let filter = RecordFilter::new()
            .with_tiers(vec![tier])
            .with_min_access_count(self.policy.promote_access_threshold)
            .used_since(now - window);

        loop {
            let batch = self
                .store
                .list_filtered(&filter, self.policy.batch_limit, 0)
                .await?;
            if batch.is_empty() {
                break;
            }

            let batch_len = batch.len();
            let mut batch_failed = 0;

            for record in &batch {
                match self.store.promote_tier(record.id, target, now).await {
                    Ok(true) => {
                        debug!(record = %record.id, from = tier.as_str(), to = target.as_str(), "Promoted record");
                        summary.promoted += 1;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(record = %record.id, "Promotion failed: {e}");
                        summary.failed += 1;
                        batch_failed += 1;
                    }
                }
            }

            if batch_failed == batch_len {
                error!("Entire promotion batch failed, aborting pass");
                break;
            }
            if batch_len < self.policy.batch_limit {
                break;
            }
        }

        Ok(())
    }

    /// Store the run summary as a session-tier record so it shows up in
    /// recent-activity queries and ages out with the session.
    pub async fn record_summary(&self, summary: &MaintenanceSummary) -> Result<()> {
        let mut record = MemoryRecord::new(
            "Maintenance run".to_string(),
            format!(
                "Maintenance: {} evicted, {} demoted, {} promoted, {} failed",
                summary.evicted, summary.demoted, summary.promoted, summary.failed
            ),
            RecordType::Event,
        );
        record.tier = Tier::Session;
        record.source = vec!["maintenance".to_string()];
        record.meta.insert(
            "summary".to_string(),
            serde_json::to_value(summary).unwrap_or(serde_json::Value::Null),
        );

        self.store.insert(&record).await
    }
}

/// Background scheduler. The guard makes one runner the designated one:
/// if a manual run holds the lock when the interval fires, the scheduled
/// run is skipped instead of queued.
pub fn spawn_scheduler(
    runner: Arc<MaintenanceRunner>,
    guard: Arc<Mutex<()>>,
    interval: StdDuration,
    record_summary: bool,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // consume the immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let Ok(_permit) = guard.try_lock() else {
                debug!("Maintenance already running, skipping scheduled run");
                continue;
            };

            match runner.run().await {
                Ok(summary) => {
                    if record_summary {
                        if let Err(e) = runner.record_summary(&summary).await {
                            warn!("Failed to record maintenance summary: {e}");
                        }
                    }
                }
                Err(e) => error!("Scheduled maintenance failed: {e}"),
            }
        }
    })
}
