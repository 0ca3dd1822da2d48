//! Request statistics

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Report for each request
#[derive(Debug, Clone)]
pub struct Report {
    id: usize,
    key: String,
    elapsed: Duration,
    /// Body size, or the rendered error.
    outcome: Result<usize, String>,
}

impl Report {
    /// Creates a new report for request `id` on `key` that took `elapsed`.
    pub fn new(id: usize, key: String, elapsed: Duration, outcome: Result<usize, String>) -> Self {
        Report {
            id,
            key,
            elapsed,
            outcome,
        }
    }

    /// The request id.
    pub fn id(&self) -> usize {
        self.id
    }

    /// The requested key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// How long the request took, including any wait for another request's computation.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Size of the result, or the error it failed with.
    pub fn outcome(&self) -> Result<usize, &str> {
        self.outcome.as_ref().copied().map_err(String::as_str)
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            Ok(len) => write!(f, "{} {:?} {len} bytes", self.key, self.elapsed),
            Err(err) => write!(f, "{} {:?} error: {err}", self.key, self.elapsed),
        }
    }
}

/// Aggregated request statistics
#[derive(Debug, Default)]
pub struct Statistics {
    hits: HashMap<String, usize>,
    failures: usize,
    slowest: Option<(String, Duration)>,
}

impl Statistics {
    /// Add a report to the statistics.
    pub fn add_report(&mut self, report: &Report) {
        *self.hits.entry(report.key.clone()).or_default() += 1;
        if report.outcome.is_err() {
            self.failures += 1;
        }
        if self
            .slowest
            .as_ref()
            .map_or(true, |(_, elapsed)| report.elapsed > *elapsed)
        {
            self.slowest = Some((report.key.clone(), report.elapsed));
        }
    }

    /// Number of reports recorded for `key`.
    pub fn requests_for(&self, key: &str) -> usize {
        self.hits.get(key).copied().unwrap_or_default()
    }

    /// Total number of reports.
    pub fn requests(&self) -> usize {
        self.hits.values().sum()
    }

    /// Number of distinct keys requested.
    pub fn distinct_keys(&self) -> usize {
        self.hits.len()
    }

    /// Number of reports that ended in an error.
    pub fn failures(&self) -> usize {
        self.failures
    }

    /// The key and duration of the slowest request.
    pub fn slowest(&self) -> Option<(&str, Duration)> {
        self.slowest
            .as_ref()
            .map(|(key, elapsed)| (key.as_str(), *elapsed))
    }
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} requests for {} keys, {} failed",
            self.requests(),
            self.distinct_keys(),
            self.failures
        )?;
        if let Some((key, elapsed)) = self.slowest() {
            write!(f, ", slowest {key} ({elapsed:?})")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{Report, Statistics};

    #[test]
    fn statistics_aggregate_reports() {
        let mut stats = Statistics::default();
        let reports = [
            Report::new(0, "a".into(), Duration::from_millis(30), Ok(10)),
            Report::new(1, "b".into(), Duration::from_millis(50), Err("boom".into())),
            Report::new(2, "a".into(), Duration::from_millis(40), Ok(10)),
        ];
        for report in &reports {
            stats.add_report(report);
        }

        assert_eq!(stats.requests(), 3);
        assert_eq!(stats.requests_for("a"), 2);
        assert_eq!(stats.requests_for("c"), 0);
        assert_eq!(stats.distinct_keys(), 2);
        assert_eq!(stats.failures(), 1);
        assert_eq!(stats.slowest(), Some(("b", Duration::from_millis(50))));
        assert_eq!(
            stats.to_string(),
            "3 requests for 2 keys, 1 failed, slowest b (50ms)"
        );
    }

    #[test]
    fn report_display() {
        let ok = Report::new(0, "a".into(), Duration::from_millis(3), Ok(1256));
        assert_eq!(ok.to_string(), "a 3ms 1256 bytes");
        assert_eq!(ok.outcome(), Ok(1256));

        let err = Report::new(1, "b".into(), Duration::from_millis(3), Err("boom".into()));
        assert_eq!(err.to_string(), "b 3ms error: boom");
        assert_eq!(err.outcome(), Err("boom"));
    }
}
