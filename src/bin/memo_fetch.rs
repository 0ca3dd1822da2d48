use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use crossbeam_channel::unbounded;
use memo::{FailurePolicy, HttpFetcher, Memo, Report, Statistics};
use tracing_subscriber::EnvFilter;

/// Fetches URLs concurrently through a single-flight cache.
///
/// Every URL is requested `--repeat` times, each request from its own thread. Each distinct URL is
/// downloaded once; the other requests wait for that download and share its result.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about)]
struct Cli {
    /// The URLs to fetch.
    #[arg(required = true)]
    urls: Vec<String>,

    /// How many times each URL is requested.
    #[arg(long, default_value_t = 2)]
    repeat: usize,

    /// Fetch a URL again on the next request if it failed, instead of remembering the failure.
    #[arg(long)]
    retry_failures: bool,

    /// Request timeout, in seconds (at most one day).
    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..=86_400))]
    timeout: u64,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let policy = if cli.retry_failures {
        FailurePolicy::Retry
    } else {
        FailurePolicy::Permanent
    };
    let fetcher = HttpFetcher::with_timeout(Duration::from_secs(cli.timeout))?;
    let memo = Memo::with_policy(fetcher, policy);

    // The (MPSC) channel of reports between workers and the reporter.
    let (report_sender, report_receiver) = unbounded();

    let requests: Vec<String> = (0..cli.repeat)
        .flat_map(|_| cli.urls.iter().cloned())
        .collect();

    let stats = thread::scope(|s| {
        let memo = &memo;

        // One worker per request, all started at once.
        for (id, url) in requests.into_iter().enumerate() {
            let report_sender = report_sender.clone();
            let _ = s.spawn(move || {
                let start = Instant::now();
                let outcome = memo
                    .get(url.clone())
                    .map(|body| body.len())
                    .map_err(|err| format!("{:#}", anyhow::Error::new(err)));
                // The reporter outlives every worker.
                let _ = report_sender.send(Report::new(id, url, start.elapsed(), outcome));
            });
        }
        drop(report_sender);

        // The reporter: runs until every worker has dropped its sender.
        let mut stats = Statistics::default();
        for report in report_receiver {
            println!("{report}");
            stats.add_report(&report);
        }
        stats
    });

    println!("[stat] {stats}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::{CommandFactory, Parser};

    use super::Cli;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn cli_defaults() {
        let cli = Cli::try_parse_from(["memo-fetch", "https://example.com"]).unwrap();
        assert_eq!(cli.urls, ["https://example.com"]);
        assert_eq!(cli.repeat, 2);
        assert_eq!(cli.timeout, 30);
        assert!(!cli.retry_failures);
    }

    #[test]
    fn cli_timeout_is_bounded() {
        let parse = |timeout: &str| {
            Cli::try_parse_from(["memo-fetch", "--timeout", timeout, "https://example.com"])
        };
        assert_eq!(parse("1").unwrap().timeout, 1);
        assert_eq!(parse("86400").unwrap().timeout, 86_400);
        assert!(parse("0").is_err());
        assert!(parse("86401").is_err());
        assert!(parse("18446744073709551615").is_err());
    }
}
