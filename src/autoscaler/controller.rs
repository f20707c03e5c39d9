//! Autoscaler control loop.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::job::JobType;
use crate::metrics;
use crate::store::JobStore;

use super::pool::WorkerPoolManager;
use super::ScaleError;

/// Controller tuning knobs.
#[derive(Debug, Clone)]
pub struct AutoscalerConfig {
    /// Control loop tick interval.
    pub poll_interval: Duration,
    /// Minimum elapsed time between two applied scaling actions per class.
    pub cooldown: Duration,
    /// Load at or above this scales up.
    pub scale_up_threshold: u64,
    /// Load at or below this scales down.
    pub scale_down_threshold: u64,
    /// Lower replica bound.
    pub min_workers: u32,
    /// Upper replica bound.
    pub max_workers: u32,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            cooldown: Duration::from_secs(120),
            scale_up_threshold: 5,
            scale_down_threshold: 1,
            min_workers: 1,
            max_workers: 8,
        }
    }
}

impl AutoscalerConfig {
    /// Rejects configurations that cannot be stable.
    pub fn validate(&self) -> Result<(), ScaleError> {
        if self.scale_up_threshold <= self.scale_down_threshold {
            return Err(ScaleError::InvalidConfig(format!(
                "scale_up_threshold ({}) must be strictly greater than scale_down_threshold ({})",
                self.scale_up_threshold, self.scale_down_threshold
            )));
        }
        if self.min_workers > self.max_workers {
            return Err(ScaleError::InvalidConfig(format!(
                "min_workers ({}) must not exceed max_workers ({})",
                self.min_workers, self.max_workers
            )));
        }
        Ok(())
    }
}

/// What one evaluation decided for a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    Up { from: u32, to: u32 },
    Down { from: u32, to: u32 },
    Hold,
}

/// Snapshot of autoscaling state for one class.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AutoscalingMetrics {
    pub class: JobType,
    pub pending: u64,
    pub running: u64,
    /// Running jobs per replica, as a percentage.
    pub utilization_percent: f64,
    pub current_replicas: u32,
    pub last_scale_action: Option<DateTime<Utc>>,
}

/// Hysteresis-based per-class replica controller.
pub struct AutoscalerController {
    store: Arc<dyn JobStore>,
    pool: Arc<dyn WorkerPoolManager>,
    config: AutoscalerConfig,
    last_scale_action: Mutex<BTreeMap<JobType, DateTime<Utc>>>,
}

impl AutoscalerController {
    /// Creates a controller, rejecting unstable configurations.
    pub fn new(
        store: Arc<dyn JobStore>,
        pool: Arc<dyn WorkerPoolManager>,
        config: AutoscalerConfig,
    ) -> Result<Self, ScaleError> {
        config.validate()?;
        Ok(Self {
            store,
            pool,
            config,
            last_scale_action: Mutex::new(BTreeMap::new()),
        })
    }

    /// Runs the control loop until a shutdown signal arrives.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            cooldown_secs = self.config.cooldown.as_secs(),
            up_threshold = self.config.scale_up_threshold,
            down_threshold = self.config.scale_down_threshold,
            "Autoscaler started"
        );
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick_at(Utc::now()).await;
                }
                _ = shutdown.recv() => {
                    info!("Autoscaler stopped");
                    break;
                }
            }
        }
    }

    /// Evaluates every worker class once against the given instant.
    ///
    /// Classes are independent; an error in one class is logged and the
    /// rest are still evaluated.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Vec<(JobType, ScaleDecision)> {
        let mut decisions = Vec::with_capacity(JobType::ALL.len());
        for class in JobType::ALL {
            match self.evaluate_class(class, now).await {
                Ok(decision) => decisions.push((class, decision)),
                Err(e) => {
                    error!(class = %class, error = %e, "Autoscaler evaluation failed");
                    decisions.push((class, ScaleDecision::Hold));
                }
            }
        }
        decisions
    }

    async fn evaluate_class(
        &self,
        class: JobType,
        now: DateTime<Utc>,
    ) -> Result<ScaleDecision, ScaleError> {
        // Both inputs are read fresh every tick. Caching the replica count
        // would overwrite manual operator adjustments on the next action;
        // reading it back reconciles them instead.
        let counts = self.store.count_active(class).await?;
        let load = counts.load();
        let current = self.pool.replica_count(class).await?;

        let decision = if load >= self.config.scale_up_threshold
            && current < self.config.max_workers
            && self.cooldown_elapsed(class, now)
        {
            ScaleDecision::Up {
                from: current,
                to: (current + 1).min(self.config.max_workers),
            }
        } else if load <= self.config.scale_down_threshold
            && current > self.config.min_workers
            && self.cooldown_elapsed(class, now)
        {
            ScaleDecision::Down {
                from: current,
                to: (current - 1).max(self.config.min_workers),
            }
        } else {
            ScaleDecision::Hold
        };

        let (target, direction) = match decision {
            ScaleDecision::Up { to, .. } => (to, "up"),
            ScaleDecision::Down { to, .. } => (to, "down"),
            ScaleDecision::Hold => {
                debug!(class = %class, load, current, "No scaling action");
                return Ok(decision);
            }
        };

        self.pool.set_replica_count(class, target).await?;
        // The cooldown clock restarts only here, after an applied change.
        // Refreshing it on no-change ticks would keep a continuously
        // evaluated class in permanent cooldown and suppress scaling under
        // sustained load.
        self.last_scale_action
            .lock()
            .expect("autoscaler lock poisoned")
            .insert(class, now);
        metrics::record_scale_event(class, direction);
        info!(class = %class, load, from = current, to = target, direction, "Scaled worker pool");

        Ok(decision)
    }

    fn cooldown_elapsed(&self, class: JobType, now: DateTime<Utc>) -> bool {
        let cooldown =
            ChronoDuration::from_std(self.config.cooldown).unwrap_or(ChronoDuration::MAX);
        let last = self
            .last_scale_action
            .lock()
            .expect("autoscaler lock poisoned")
            .get(&class)
            .copied();
        match last {
            Some(last) => now - last >= cooldown,
            None => true,
        }
    }

    /// Autoscaling state snapshot for one class.
    pub async fn metrics(&self, class: JobType) -> Result<AutoscalingMetrics, ScaleError> {
        let counts = self.store.count_active(class).await?;
        let current_replicas = self.pool.replica_count(class).await?;
        let last_scale_action = self
            .last_scale_action
            .lock()
            .expect("autoscaler lock poisoned")
            .get(&class)
            .copied();

        let utilization_percent = if current_replicas == 0 {
            0.0
        } else {
            counts.running as f64 / current_replicas as f64 * 100.0
        };

        Ok(AutoscalingMetrics {
            class,
            pending: counts.pending,
            running: counts.running,
            utilization_percent,
            current_replicas,
            last_scale_action,
        })
    }
}
