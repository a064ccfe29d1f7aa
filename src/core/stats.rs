use std::{
    sync::atomic::{AtomicI64, AtomicU64, Ordering},
    time::Duration,
};

use chrono::{DateTime, Utc};

use crate::core::domain::ExecutionStatistics;

const NEVER: i64 = i64::MIN;

/// Lock-free execution counters. Each field is updated independently, so a
/// snapshot taken under load may show `total` ahead of `successful + failed`
/// until the in-flight executions finish.
#[derive(Debug)]
pub struct StatsRecorder {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    total_micros: AtomicU64,
    last_execution_micros: AtomicI64,
}

impl Default for StatsRecorder {
    fn default() -> Self {
        Self {
            total: AtomicU64::new(0),
            successful: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            total_micros: AtomicU64::new(0),
            last_execution_micros: AtomicI64::new(NEVER),
        }
    }
}

/// One counted execution. Dropping it unfinished (the caller abandoned the
/// future) counts the execution as failed so `total` never runs ahead for good.
#[derive(Debug)]
pub struct ExecutionRecord<'a> {
    stats: &'a StatsRecorder,
    finished: bool,
}

impl ExecutionRecord<'_> {
    pub fn finish(mut self, success: bool, duration: Duration, completed_at: DateTime<Utc>) {
        self.finished = true;
        self.stats.record_finish(success, duration, completed_at);
    }
}

impl Drop for ExecutionRecord<'_> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!("Execution abandoned before completion, counting it as failed");
            self.stats.record_finish(false, Duration::ZERO, Utc::now());
        }
    }
}

impl StatsRecorder {
    /// Counts a new execution; the returned record must be finished or dropped.
    pub fn begin(&self) -> ExecutionRecord<'_> {
        self.record_start();
        ExecutionRecord {
            stats: self,
            finished: false,
        }
    }

    pub fn record_start(&self) {
        self.total.fetch_add(1, Ordering::AcqRel);
    }

    pub fn record_finish(&self, success: bool, duration: Duration, completed_at: DateTime<Utc>) {
        if success {
            self.successful.fetch_add(1, Ordering::AcqRel);
        } else {
            self.failed.fetch_add(1, Ordering::AcqRel);
        }
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.total_micros.fetch_add(micros, Ordering::AcqRel);
        // Last writer wins.
        self.last_execution_micros
            .store(completed_at.timestamp_micros(), Ordering::Release);
    }

    pub fn snapshot(&self) -> ExecutionStatistics {
        let total = self.total.load(Ordering::Acquire);
        let successful = self.successful.load(Ordering::Acquire);
        let failed = self.failed.load(Ordering::Acquire);
        let total_micros = self.total_micros.load(Ordering::Acquire);
        let total_execution_time = Duration::from_micros(total_micros);
        let average_execution_time = match u32::try_from(total) {
            Ok(0) => Duration::ZERO,
            Ok(count) => total_execution_time / count,
            Err(_) => Duration::from_micros(total_micros / total),
        };
        let last_execution_at = match self.last_execution_micros.load(Ordering::Acquire) {
            NEVER => None,
            micros => DateTime::from_timestamp_micros(micros),
        };

        ExecutionStatistics {
            total,
            successful,
            failed,
            total_execution_time,
            average_execution_time,
            last_execution_at,
        }
    }
}
