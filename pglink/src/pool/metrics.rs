//! Pool metrics accumulation and reporting.
use std::{fmt, time::Duration};

use crate::datetime::Timestamp;

/// A snapshot of pool activity over one reporting period.
///
/// The request counters partition the acquires issued in the period:
/// `successful_requests + unsuccessful_requests_too_busy +
/// unsuccessful_requests_timed_out + unsuccessful_requests_error` equals the
/// number of acquires.
#[derive(Clone, Debug)]
pub struct PoolMetrics {
    /// Start of the period, milliseconds since the unix epoch.
    pub period_start_millis: i64,
    /// End of the period (the snapshot moment).
    pub period_end_millis: i64,
    pub successful_requests: u64,
    pub unsuccessful_requests_too_busy: u64,
    pub unsuccessful_requests_timed_out: u64,
    pub unsuccessful_requests_error: u64,
    /// Mean wall-clock time from acquire to session handoff.
    pub average_time_to_acquire_connection: Duration,
    pub minimum_pending_requests: usize,
    pub maximum_pending_requests: usize,
    pub connections_at_start_of_period: usize,
    pub connections_at_end_of_period: usize,
    pub connections_created: u64,
    pub allocated_connections_closed_by_requestor: u64,
    pub allocated_connections_timed_out: u64,
}

impl fmt::Display for PoolMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let start = Timestamp::from_unix_millis(self.period_start_millis);
        let end = Timestamp::from_unix_millis(self.period_end_millis);
        writeln!(f, "connection pool metrics")?;
        writeln!(f, "    period: {start} to {end} UTC")?;
        writeln!(f, "    successful requests: {}", self.successful_requests)?;
        writeln!(
            f,
            "    unsuccessful requests, too busy: {}",
            self.unsuccessful_requests_too_busy
        )?;
        writeln!(
            f,
            "    unsuccessful requests, timed out: {}",
            self.unsuccessful_requests_timed_out
        )?;
        writeln!(
            f,
            "    unsuccessful requests, error: {}",
            self.unsuccessful_requests_error
        )?;
        writeln!(
            f,
            "    average time to acquire connection: {} ms",
            self.average_time_to_acquire_connection.as_millis()
        )?;
        writeln!(f, "    minimum pending requests: {}", self.minimum_pending_requests)?;
        writeln!(f, "    maximum pending requests: {}", self.maximum_pending_requests)?;
        writeln!(
            f,
            "    connections at start of period: {}",
            self.connections_at_start_of_period
        )?;
        writeln!(
            f,
            "    connections at end of period: {}",
            self.connections_at_end_of_period
        )?;
        writeln!(f, "    connections created: {}", self.connections_created)?;
        writeln!(
            f,
            "    allocated connections closed by requestor: {}",
            self.allocated_connections_closed_by_requestor
        )?;
        write!(
            f,
            "    allocated connections timed out: {}",
            self.allocated_connections_timed_out
        )
    }
}

/// Running counters, guarded by the pool mutex.
pub(super) struct MetricsAccum {
    period_start_millis: i64,
    successful_requests: u64,
    total_time_to_acquire: Duration,
    pub(super) unsuccessful_requests_too_busy: u64,
    pub(super) unsuccessful_requests_timed_out: u64,
    pub(super) unsuccessful_requests_error: u64,
    minimum_pending_requests: usize,
    maximum_pending_requests: usize,
    connections_at_start_of_period: usize,
    pub(super) connections_created: u64,
    pub(super) allocated_connections_closed_by_requestor: u64,
    pub(super) allocated_connections_timed_out: u64,
}

impl MetricsAccum {
    pub(super) fn new(now_millis: i64, pending: usize, connections: usize) -> MetricsAccum {
        MetricsAccum {
            period_start_millis: now_millis,
            successful_requests: 0,
            total_time_to_acquire: Duration::ZERO,
            unsuccessful_requests_too_busy: 0,
            unsuccessful_requests_timed_out: 0,
            unsuccessful_requests_error: 0,
            minimum_pending_requests: pending,
            maximum_pending_requests: pending,
            connections_at_start_of_period: connections,
            connections_created: 0,
            allocated_connections_closed_by_requestor: 0,
            allocated_connections_timed_out: 0,
        }
    }

    pub(super) fn record_success(&mut self, time_to_acquire: Duration) {
        self.successful_requests += 1;
        self.total_time_to_acquire += time_to_acquire;
    }

    /// Track the pending-queue extremes; call on every queue length change.
    pub(super) fn record_pending_level(&mut self, pending: usize) {
        self.minimum_pending_requests = self.minimum_pending_requests.min(pending);
        self.maximum_pending_requests = self.maximum_pending_requests.max(pending);
    }

    pub(super) fn snapshot(&self, now_millis: i64, connections: usize) -> PoolMetrics {
        let average = match self.successful_requests {
            0 => Duration::ZERO,
            n => self.total_time_to_acquire / n as u32,
        };
        PoolMetrics {
            period_start_millis: self.period_start_millis,
            period_end_millis: now_millis,
            successful_requests: self.successful_requests,
            unsuccessful_requests_too_busy: self.unsuccessful_requests_too_busy,
            unsuccessful_requests_timed_out: self.unsuccessful_requests_timed_out,
            unsuccessful_requests_error: self.unsuccessful_requests_error,
            average_time_to_acquire_connection: average,
            minimum_pending_requests: self.minimum_pending_requests,
            maximum_pending_requests: self.maximum_pending_requests,
            connections_at_start_of_period: self.connections_at_start_of_period,
            connections_at_end_of_period: connections,
            connections_created: self.connections_created,
            allocated_connections_closed_by_requestor: self
                .allocated_connections_closed_by_requestor,
            allocated_connections_timed_out: self.allocated_connections_timed_out,
        }
    }

    /// Start a new period. The new period's start-of-period connection count
    /// is the previous period's end-of-period count.
    pub(super) fn reset(&mut self, now_millis: i64, pending: usize, connections: usize) {
        *self = MetricsAccum::new(now_millis, pending, connections);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn conservation_and_average() {
        let mut m = MetricsAccum::new(0, 0, 0);
        m.record_success(Duration::from_millis(10));
        m.record_success(Duration::from_millis(30));
        m.unsuccessful_requests_too_busy += 1;
        m.unsuccessful_requests_timed_out += 2;
        m.unsuccessful_requests_error += 1;

        let snap = m.snapshot(1000, 3);
        let acquires = snap.successful_requests
            + snap.unsuccessful_requests_too_busy
            + snap.unsuccessful_requests_timed_out
            + snap.unsuccessful_requests_error;
        assert_eq!(acquires, 6);
        assert_eq!(snap.average_time_to_acquire_connection, Duration::from_millis(20));
        assert_eq!(snap.connections_at_end_of_period, 3);
    }

    #[test]
    fn pending_extremes() {
        let mut m = MetricsAccum::new(0, 2, 0);
        m.record_pending_level(5);
        m.record_pending_level(0);
        m.record_pending_level(3);
        let snap = m.snapshot(0, 0);
        assert_eq!(snap.minimum_pending_requests, 0);
        assert_eq!(snap.maximum_pending_requests, 5);
    }

    #[test]
    fn reset_carries_connection_count() {
        let mut m = MetricsAccum::new(0, 0, 1);
        m.connections_created += 4;
        let end = m.snapshot(10, 5);
        m.reset(10, 0, end.connections_at_end_of_period);
        let snap = m.snapshot(20, 5);
        assert_eq!(snap.connections_at_start_of_period, 5);
        assert_eq!(snap.connections_created, 0);
        assert_eq!(snap.period_start_millis, 10);
    }

    #[test]
    fn report_format() {
        let m = MetricsAccum::new(0, 0, 0);
        let report = m.snapshot(1000, 0).to_string();
        assert!(report.starts_with("connection pool metrics"));
        assert!(report.contains("period: 1970-01-01 00:00:00.000 to 1970-01-01 00:00:01.000 UTC"));
        assert!(report.contains("successful requests: 0"));
    }
}
