//! Background trigger scheduler.
//!
//! A distributed periodic scanner for subscription firings. Every cycle
//! runs under the `check_due_subscriptions` lock: recover orphaned
//! PENDING executions, reap stuck RUNNING ones, then dispatch everything
//! due, batch by batch, refreshing the lock as it goes.

pub mod breaker;
pub mod execute;
pub mod schedule;

pub use breaker::CircuitBreaker;

use crate::config::Settings;
use crate::shutdown::ShutdownCoordinator;
use crate::store::resources::{ResourceSpec, SubscriptionDoc};
use crate::store::{
    executions::NewExecution, Database, ExecutionStatus, ResourceKind, ResourceRow, StoreResult,
};
use crate::streaming::StreamingEngine;
use crate::sync::{LockService, LockToken, LOCK_CHECK_DUE_SUBSCRIPTIONS};
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Cycle cadence and lock lease parameters.
const SCAN_INTERVAL: Duration = Duration::from_secs(60);
const LOCK_TTL_SECS: i64 = 120;
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(30);
const SCAN_BATCH: usize = 100;

/// Counters from one scheduler cycle, for logs and tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleStats {
    pub lock_held: bool,
    pub recovered_pending: usize,
    pub cancelled_orphans: usize,
    pub reaped_running: usize,
    pub dispatched: usize,
}

pub struct TriggerScheduler {
    pub(crate) db: Database,
    locks: LockService,
    pub(crate) streaming: Arc<StreamingEngine>,
    pub(crate) settings: Arc<Settings>,
    pub(crate) breaker: CircuitBreaker,
}

impl TriggerScheduler {
    pub fn new(
        db: Database,
        locks: LockService,
        streaming: Arc<StreamingEngine>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            db,
            locks,
            streaming,
            settings,
            breaker: CircuitBreaker::default(),
        }
    }

    pub async fn run_loop(self: Arc<Self>, shutdown: Arc<ShutdownCoordinator>) {
        tracing::info!("trigger scheduler started");
        loop {
            if !shutdown.is_accepting() {
                break;
            }
            match self.run_cycle().await {
                Ok(stats) if stats.lock_held => {
                    tracing::info!(
                        recovered = stats.recovered_pending,
                        cancelled = stats.cancelled_orphans,
                        reaped = stats.reaped_running,
                        dispatched = stats.dispatched,
                        "trigger cycle complete"
                    );
                }
                Ok(_) => tracing::debug!("trigger cycle skipped, lock held elsewhere"),
                Err(e) => tracing::error!(error = %e, "trigger cycle failed"),
            }
            tokio::time::sleep(SCAN_INTERVAL).await;
        }
        tracing::info!("trigger scheduler stopped");
    }

    /// One full cycle under the scan lock.
    pub async fn run_cycle(self: &Arc<Self>) -> StoreResult<CycleStats> {
        let mut stats = CycleStats::default();
        let Some(token) = self
            .locks
            .acquire(LOCK_CHECK_DUE_SUBSCRIPTIONS, ChronoDuration::seconds(LOCK_TTL_SECS))?
        else {
            return Ok(stats);
        };
        stats.lock_held = true;

        let result = self.run_locked(&token, &mut stats).await;
        self.locks.release(LOCK_CHECK_DUE_SUBSCRIPTIONS, &token)?;
        result?;
        Ok(stats)
    }

    async fn run_locked(
        self: &Arc<Self>,
        token: &LockToken,
        stats: &mut CycleStats,
    ) -> StoreResult<()> {
        self.recover_orphaned_pending(stats)?;
        self.cleanup_stuck_running(stats)?;
        self.scan_due(token, stats)?;
        Ok(())
    }

    /// PENDING executions that never got a task and are older than H1:
    /// their execute job was lost. Re-dispatch, unless the subscription is
    /// gone.
    fn recover_orphaned_pending(self: &Arc<Self>, stats: &mut CycleStats) -> StoreResult<()> {
        let cutoff = Utc::now() - ChronoDuration::hours(self.settings.flow_stale_pending_hours);
        for execution in self.db.stale_pending_executions(cutoff)? {
            let subscription = self.subscription(execution.subscription_id);
            if subscription.is_none() {
                self.db.update_execution_status(
                    execution.id,
                    ExecutionStatus::Cancelled,
                    Some("subscription was deleted"),
                )?;
                stats.cancelled_orphans += 1;
                continue;
            }
            self.db
                .update_execution_status(execution.id, ExecutionStatus::Running, None)?;
            stats.recovered_pending += 1;
            tracing::info!(
                execution_id = execution.id,
                subscription_id = execution.subscription_id,
                "re-dispatching orphaned execution"
            );
            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.execute_subscription(execution.subscription_id, execution.id)
                    .await;
            });
        }
        Ok(())
    }

    /// RUNNING executions older than H2 have lost their worker; fail them
    /// with a timeout message.
    fn cleanup_stuck_running(&self, stats: &mut CycleStats) -> StoreResult<()> {
        let hours = self.settings.flow_stale_running_hours;
        let cutoff = Utc::now() - ChronoDuration::hours(hours);
        for execution in self.db.stale_running_executions(cutoff)? {
            self.db.update_execution_status(
                execution.id,
                ExecutionStatus::Failed,
                Some(&format!("execution timed out after {hours} hours")),
            )?;
            stats.reaped_running += 1;
        }
        Ok(())
    }

    /// Dispatch every enabled subscription whose next execution time has
    /// arrived. Works in batches, refreshing the lock lease between them.
    fn scan_due(self: &Arc<Self>, token: &LockToken, stats: &mut CycleStats) -> StoreResult<()> {
        let now = Utc::now();
        let mut due = Vec::new();

        for (row, doc) in self.subscriptions()? {
            if !doc.enabled {
                continue;
            }
            match doc.internal.next_execution_time {
                Some(next) if next <= now => due.push((row, doc)),
                Some(_) => {}
                None => {
                    // Newly enabled: initialize the schedule; it fires on a
                    // later scan.
                    self.store_next_execution(row.id, schedule::next_execution(&doc.trigger, now))?;
                }
            }
        }

        let mut last_refresh = Instant::now();
        for batch in due.chunks(SCAN_BATCH) {
            if last_refresh.elapsed() >= WATCHDOG_INTERVAL {
                if !self.locks.extend(
                    LOCK_CHECK_DUE_SUBSCRIPTIONS,
                    token,
                    ChronoDuration::seconds(LOCK_TTL_SECS),
                )? {
                    tracing::warn!("scan lock lost mid-cycle, stopping early");
                    return Ok(());
                }
                last_refresh = Instant::now();
            }
            for (row, doc) in batch {
                self.fire_subscription(row, doc, stats)?;
            }
        }
        Ok(())
    }

    fn fire_subscription(
        self: &Arc<Self>,
        row: &ResourceRow,
        doc: &SubscriptionDoc,
        stats: &mut CycleStats,
    ) -> StoreResult<()> {
        let execution = self.db.create_execution(&NewExecution {
            subscription_id: row.id,
            user_id: row.owner_id,
            trigger_type: doc.trigger.type_name().to_string(),
            trigger_reason: "scheduled".to_string(),
            prompt: doc.prompt.clone(),
        })?;
        stats.dispatched += 1;

        let next = schedule::next_execution(&doc.trigger, Utc::now())
            .filter(|_| schedule::reschedules(&doc.trigger));
        let one_time = !schedule::reschedules(&doc.trigger);
        self.db.update_json(row.id, |json| {
            if let Some(internal) = ensure_internal(json) {
                match next {
                    Some(next) => {
                        internal.insert(
                            "nextExecutionTime".into(),
                            serde_json::json!(next.to_rfc3339()),
                        );
                    }
                    None => {
                        internal.remove("nextExecutionTime");
                    }
                }
            }
            if one_time {
                // One-shots must never fire twice.
                json["enabled"] = serde_json::json!(false);
            }
            Ok(())
        })?;

        let this = Arc::clone(self);
        let (subscription_id, execution_id) = (row.id, execution.id);
        tokio::spawn(async move {
            this.execute_subscription(subscription_id, execution_id).await;
        });
        Ok(())
    }

    fn store_next_execution(
        &self,
        subscription_id: i64,
        next: Option<chrono::DateTime<Utc>>,
    ) -> StoreResult<()> {
        self.db.update_json(subscription_id, |json| {
            if let (Some(internal), Some(next)) = (ensure_internal(json), next) {
                internal.insert(
                    "nextExecutionTime".into(),
                    serde_json::json!(next.to_rfc3339()),
                );
            }
            Ok(())
        })?;
        Ok(())
    }

    pub(crate) fn subscription(&self, id: i64) -> Option<(ResourceRow, SubscriptionDoc)> {
        let row = self.db.get_resource(id).ok()?;
        if row.kind != ResourceKind::Subscription {
            return None;
        }
        match row.spec().ok()? {
            ResourceSpec::Subscription(doc) => Some((row, *doc)),
            _ => None,
        }
    }

    fn subscriptions(&self) -> StoreResult<Vec<(ResourceRow, SubscriptionDoc)>> {
        let rows = self.db.list_all_of_kind(ResourceKind::Subscription)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            match row.spec() {
                Ok(ResourceSpec::Subscription(doc)) => out.push((row, *doc)),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(resource_id = row.id, error = %e, "skipping malformed subscription");
                }
            }
        }
        Ok(out)
    }
}

/// Get (or create) the `_internal` object inside a subscription document.
fn ensure_internal(json: &mut serde_json::Value) -> Option<&mut serde_json::Map<String, serde_json::Value>> {
    let obj = json.as_object_mut()?;
    obj.entry("_internal")
        .or_insert_with(|| serde_json::json!({}))
        .as_object_mut()
}
