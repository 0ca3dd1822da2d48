//! Concurrent memoizing cache with single-flight execution.
//!
//! A [`Memo`] wraps an expensive [`Producer`] and guarantees that, for every key, the producer runs
//! at most once no matter how many threads ask for that key at the same time. Requests for
//! different keys never wait on each other's computations.

#![warn(missing_docs, missing_debug_implementations)]

pub mod fetch;
mod memo;
pub mod report;

pub use fetch::{ClientError, FetchError, HttpFetcher};
pub use memo::{FailurePolicy, Memo, Producer};
pub use report::{Report, Statistics};
