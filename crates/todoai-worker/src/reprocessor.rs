//! Twice-daily reprocessing scheduler.
//!
//! Each run enqueues one `reprocess_user` job per eligible user and upcoming
//! daily anchor. A job becomes visible at its anchor and expires a day later,
//! so a worker outage never replays a backlog of stale sweeps. Job ids are
//! derived from (user, anchor) and published once, so restarts and replicas
//! do not schedule the same sweep twice.

use std::sync::Arc;

use chrono::{DateTime, Days, FixedOffset, TimeZone, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use todoai_models::{to_chrono, Job, DEFAULT_MAX_RETRIES};
use todoai_queue::JobQueue;
use todoai_store::ActivityRepository;

use crate::config::ReprocessConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::metrics;
use crate::retry::OutageLog;

/// The next occurrence of each anchor hour strictly after `now`, in `now`'s
/// timezone, returned in UTC and sorted.
///
/// Anchors falling into a DST gap are skipped.
pub fn next_anchors<Tz: TimeZone>(now: &DateTime<Tz>, hours: &[u32]) -> Vec<DateTime<Utc>> {
    let tz = now.timezone();
    let today = now.date_naive();

    let mut anchors: Vec<DateTime<Utc>> = hours
        .iter()
        .filter_map(|&hour| {
            [today, today.checked_add_days(Days::new(1))?]
                .into_iter()
                .filter_map(|date| date.and_hms_opt(hour, 0, 0))
                .filter_map(|naive| tz.from_local_datetime(&naive).earliest())
                .find(|anchor| anchor > now)
                .map(|anchor| anchor.with_timezone(&Utc))
        })
        .collect();
    anchors.sort();
    anchors.dedup();
    anchors
}

pub struct Reprocessor {
    activity: Arc<dyn ActivityRepository>,
    queue: Arc<dyn JobQueue>,
    config: ReprocessConfig,
    max_retries: u32,
}

impl Reprocessor {
    pub fn new(
        activity: Arc<dyn ActivityRepository>,
        queue: Arc<dyn JobQueue>,
        config: ReprocessConfig,
    ) -> Self {
        Self {
            activity,
            queue,
            config,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    fn timezone(&self) -> WorkerResult<FixedOffset> {
        FixedOffset::east_opt(self.config.utc_offset_minutes * 60).ok_or_else(|| {
            WorkerError::config_error(format!(
                "invalid UTC offset: {} minutes",
                self.config.utc_offset_minutes
            ))
        })
    }

    /// Schedule the anchors following `now`. Returns how many jobs were
    /// enqueued; jobs already scheduled by an earlier run are skipped, and
    /// per-job enqueue failures are logged and skipped.
    pub async fn run_once(&self, now: DateTime<Utc>) -> WorkerResult<usize> {
        let tz = self.timezone()?;
        let anchors = next_anchors(&now.with_timezone(&tz), &self.config.anchor_hours);
        let users = self.activity.get_eligible_for_reprocessing().await?;
        let validity = to_chrono(self.config.validity);

        let mut enqueued = 0;
        for user_id in &users {
            for anchor in &anchors {
                let expires = *anchor + validity;
                let job = Job::reprocess_user(user_id.as_str())
                    .with_id(format!("reprocess:{}:{}", user_id, anchor.timestamp()))
                    .with_not_before(*anchor)
                    .with_not_after(expires)
                    .with_max_retries(self.max_retries);
                let window = (expires - now).to_std().unwrap_or(self.config.validity);
                match self.queue.enqueue_once(&job, window).await {
                    Ok(true) => enqueued += 1,
                    Ok(false) => {}
                    Err(e) => warn!(
                        user_id = %user_id,
                        anchor = %anchor,
                        "Failed to schedule reprocessing: {}", e
                    ),
                }
            }
        }

        metrics::record_reprocess_enqueued(enqueued as u64);
        info!(
            users = users.len(),
            anchors = anchors.len(),
            enqueued,
            "Reprocessing scheduled"
        );
        Ok(enqueued)
    }

    /// Run now and then every `interval` until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            anchor_hours = ?self.config.anchor_hours,
            utc_offset_minutes = self.config.utc_offset_minutes,
            "Starting reprocessing scheduler"
        );
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut outage = OutageLog::new("reprocess_scheduler", 3);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.run_once(Utc::now()).await {
                Ok(_) => outage.succeeded(),
                Err(e) => outage.failed(&e),
            }
        }
        info!("Reprocessing scheduler stopped");
    }
}
