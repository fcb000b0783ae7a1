// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Stale Assignment Reaper
//!
//! Background task that returns capacity held by clients that went away
//! without releasing their assignment.
//!
//! ## Strategy
//!
//! Every `interval` (default 5 min) the reaper:
//! 1. Lists live assignments whose `last_activity_at` is older than
//!    `stale_after` (default 15 min).
//! 2. Releases each through the registry release path. The staleness check is
//!    repeated inside the release transaction, so a heartbeat that lands
//!    between listing and releasing keeps the assignment alive.
//! 3. Logs and skips per-assignment failures; a sweep never aborts early.
//!
//! ## Shutdown
//!
//! Uses `tokio_util::sync::CancellationToken` for graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::registry::{EnclaveRegistry, RegistryError};
use crate::clock::Clock;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(15 * 60);

/// Outcome counters of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub released: usize,
    /// Released concurrently or refreshed by a heartbeat
    pub skipped: usize,
    pub failed: usize,
}

pub struct AssignmentReaper {
    registry: Arc<EnclaveRegistry>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    stale_after: Duration,
}

impl AssignmentReaper {
    pub fn new(registry: Arc<EnclaveRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry,
            clock,
            interval: DEFAULT_SWEEP_INTERVAL,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Run the reaper loop until the cancellation token is triggered.
    ///
    /// ```rust,ignore
    /// tokio::spawn(reaper.run(shutdown.clone()));
    /// ```
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            stale_after_secs = self.stale_after.as_secs(),
            "Assignment reaper starting"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {},
                _ = shutdown.cancelled() => {
                    info!("Assignment reaper shutting down");
                    return;
                }
            }

            let report = self.sweep();
            if report.examined > 0 {
                info!(
                    examined = report.examined,
                    released = report.released,
                    skipped = report.skipped,
                    failed = report.failed,
                    "Assignment reaper sweep finished"
                );
            }
        }
    }

    /// Execute one sweep.
    pub fn sweep(&self) -> SweepReport {
        let stale_after =
            chrono::Duration::from_std(self.stale_after).unwrap_or(chrono::Duration::MAX);
        let cutoff = self
            .clock
            .now()
            .checked_sub_signed(stale_after)
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);

        let stale = match self.registry.stale_assignments(cutoff) {
            Ok(stale) => stale,
            Err(e) => {
                warn!(error = %e, "Assignment reaper: failed to list stale assignments");
                return SweepReport {
                    failed: 1,
                    ..SweepReport::default()
                };
            }
        };

        let mut report = SweepReport {
            examined: stale.len(),
            ..SweepReport::default()
        };

        for assignment in &stale {
            match self
                .registry
                .release_if_stale(&assignment.id, &assignment.user_id, cutoff)
            {
                Ok(true) => report.released += 1,
                Ok(false) => {
                    debug!(
                        assignment_id = %assignment.id,
                        "Assignment reaper: heartbeat arrived, keeping assignment"
                    );
                    report.skipped += 1;
                }
                Err(RegistryError::NotFound) => {
                    debug!(
                        assignment_id = %assignment.id,
                        "Assignment reaper: already released"
                    );
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(
                        assignment_id = %assignment.id,
                        enclave_id = %assignment.enclave_id,
                        error = %e,
                        "Assignment reaper: failed to release assignment"
                    );
                    report.failed += 1;
                }
            }
        }

        report
    }
}
