//! Prometheus metrics collection and formatting.
//!
//! This module provides metrics in Prometheus text exposition format.

use std::fmt::Write;
use std::sync::Arc;

use tracing::warn;

use fleetspec_core::TasksetStatus;

use crate::state::AppState;
use crate::store::TasksetFilter;

const TASKSET_STATUSES: [TasksetStatus; 6] = [
    TasksetStatus::RsyncWaiting,
    TasksetStatus::Waiting,
    TasksetStatus::Running,
    TasksetStatus::Succeeded,
    TasksetStatus::Failed,
    TasksetStatus::Cancelled,
];

/// Collect all metrics from AppState and format as Prometheus text.
pub async fn collect_metrics(state: &Arc<AppState>) -> String {
    let mut output = String::new();

    collect_taskset_metrics(state, &mut output).await;
    collect_worker_metrics(state, &mut output).await;
    collect_subscriber_metrics(state, &mut output).await;

    output
}

/// Tasksets by status, plus queue depth of the active ones.
async fn collect_taskset_metrics(state: &Arc<AppState>, output: &mut String) {
    let tasksets = match state.store.tasksets(&TasksetFilter::default()).await {
        Ok(tasksets) => tasksets,
        Err(e) => {
            warn!(error = %e, "Failed to read tasksets for metrics");
            Vec::new()
        }
    };

    writeln!(
        output,
        "# HELP fleetspec_tasksets_total Number of tasksets by status"
    )
    .ok();
    writeln!(output, "# TYPE fleetspec_tasksets_total gauge").ok();
    for status in TASKSET_STATUSES {
        let count = tasksets.iter().filter(|t| t.status == status).count();
        writeln!(output, "fleetspec_tasksets_total{{status=\"{status}\"}} {count}").ok();
    }

    let mut queued = 0usize;
    for taskset in tasksets.iter().filter(|t| t.status.is_active()) {
        match state.queue(taskset.id).size().await {
            Ok(size) => queued += size,
            Err(e) => warn!(taskset_id = %taskset.id, error = %e, "Failed to read queue size"),
        }
    }

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP fleetspec_queued_tasks Tasks waiting for dispatch across active tasksets"
    )
    .ok();
    writeln!(output, "# TYPE fleetspec_queued_tasks gauge").ok();
    writeln!(output, "fleetspec_queued_tasks {queued}").ok();
}

/// Live workers after staleness eviction.
async fn collect_worker_metrics(state: &Arc<AppState>, output: &mut String) {
    let workers = state.workers.all().await;
    let assigned = workers
        .iter()
        .filter(|w| w.current_taskset.is_some())
        .count();
    let idle = workers.len() - assigned;

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP fleetspec_workers_live Number of live workers by assignment"
    )
    .ok();
    writeln!(output, "# TYPE fleetspec_workers_live gauge").ok();
    writeln!(output, "fleetspec_workers_live{{state=\"assigned\"}} {assigned}").ok();
    writeln!(output, "fleetspec_workers_live{{state=\"idle\"}} {idle}").ok();
}

async fn collect_subscriber_metrics(state: &Arc<AppState>, output: &mut String) {
    let subscribers = state.bus.subscriber_count().await;

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP fleetspec_push_subscribers Connected peers registered for pushes"
    )
    .ok();
    writeln!(output, "# TYPE fleetspec_push_subscribers gauge").ok();
    writeln!(output, "fleetspec_push_subscribers {subscribers}").ok();
}
