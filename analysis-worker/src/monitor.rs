//! Fleet-level supervision: periodic aggregation of per-worker stats.

use std::sync::Arc;
use std::time;

use serde::Serialize;
use tracing::{info, warn};

use crate::worker::{QueueWorker, StatsSnapshot};

const MONITOR_INTERVAL: time::Duration = time::Duration::from_secs(60);

/// Aggregated view of the whole fleet at one instant.
#[derive(Debug, Clone, Serialize)]
pub struct FleetStatus {
    pub total_workers: usize,
    pub healthy_workers: usize,
    pub total_jobs_processed: u64,
    pub total_jobs_failed: u64,
    pub workers: Vec<StatsSnapshot>,
}

impl FleetStatus {
    /// Share of workers still running their loop.
    pub fn healthy_ratio(&self) -> f64 {
        if self.total_workers == 0 {
            return 0.0;
        }
        self.healthy_workers as f64 / self.total_workers as f64
    }
}

pub struct WorkerHealthMonitor {
    workers: Vec<Arc<QueueWorker>>,
    interval: time::Duration,
}

impl WorkerHealthMonitor {
    pub fn new(workers: Vec<Arc<QueueWorker>>) -> Self {
        Self {
            workers,
            interval: MONITOR_INTERVAL,
        }
    }

    /// Report fleet health once a minute until the process exits.
    pub async fn start_monitoring(self) {
        loop {
            let status = self.check_worker_health();

            info!(
                total_workers = status.total_workers,
                healthy_workers = status.healthy_workers,
                jobs_processed = status.total_jobs_processed,
                jobs_failed = status.total_jobs_failed,
                "fleet health"
            );
            if status.healthy_ratio() < 0.5 {
                warn!(
                    healthy_workers = status.healthy_workers,
                    total_workers = status.total_workers,
                    "less than half of the fleet is running"
                );
            }

            tokio::time::sleep(self.interval).await;
        }
    }

    pub fn check_worker_health(&self) -> FleetStatus {
        let workers: Vec<StatsSnapshot> =
            self.workers.iter().map(|worker| worker.stats()).collect();

        FleetStatus {
            total_workers: workers.len(),
            healthy_workers: workers.iter().filter(|stats| stats.running).count(),
            total_jobs_processed: workers.iter().map(|stats| stats.jobs_processed).sum(),
            total_jobs_failed: workers.iter().map(|stats| stats.jobs_failed).sum(),
            workers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditNotifier;
    use crate::failure::FailurePolicy;
    use crate::testing::{make_job, FakeDispatcher, FakeHandler, FakeQueue, FakeRegistry};
    use crate::worker::WorkerSettings;
    use analysis_common::clock::SystemClock;
    use analysis_common::registry::ClaimRegistry;
    use analysis_common::retry::RetryPolicy;

    fn worker(worker_id: &str, queue: Arc<FakeQueue>) -> Arc<QueueWorker> {
        let dispatcher = Arc::new(FakeDispatcher::default());
        let registry: Arc<dyn ClaimRegistry> = Arc::new(FakeRegistry::qualifying());

        Arc::new(QueueWorker::new(
            worker_id,
            queue.clone(),
            Some(registry),
            Arc::new(FakeHandler::succeeding_with_email("u@x")),
            AuditNotifier::new(dispatcher, vec!["audit@x.com".to_owned()]),
            FailurePolicy::new(queue, RetryPolicy::default()),
            WorkerSettings::default(),
            Arc::new(SystemClock),
        ))
    }

    #[tokio::test]
    async fn test_idle_fleet_reports_no_healthy_workers() {
        let queue = Arc::new(FakeQueue::default());
        let monitor = WorkerHealthMonitor::new(vec![
            worker("worker-1", queue.clone()),
            worker("worker-2", queue),
        ]);

        let status = monitor.check_worker_health();

        assert_eq!(status.total_workers, 2);
        assert_eq!(status.healthy_workers, 0);
        assert_eq!(status.healthy_ratio(), 0.0);
        assert_eq!(status.total_jobs_processed, 0);
    }

    #[tokio::test]
    async fn test_fleet_totals_sum_worker_stats() {
        let queue = Arc::new(FakeQueue::default());
        let busy = worker("worker-1", queue.clone());
        let idle = worker("worker-2", queue.clone());

        queue.push_job(make_job(1, 3));
        // Drive one job through the busy worker without starting its loop.
        busy.run_iteration_for_tests().await;

        let monitor = WorkerHealthMonitor::new(vec![busy, idle]);
        let status = monitor.check_worker_health();

        assert_eq!(status.total_jobs_processed, 1);
        assert_eq!(status.total_jobs_failed, 0);
        assert_eq!(status.workers.len(), 2);
    }

    #[test]
    fn test_empty_fleet_ratio_is_zero() {
        let monitor = WorkerHealthMonitor::new(Vec::new());

        assert_eq!(monitor.check_worker_health().healthy_ratio(), 0.0);
    }
}
