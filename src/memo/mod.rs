//! Thread-safe memoizing cache.

mod record;

use std::collections::hash_map::{Entry, HashMap};
use std::fmt;
use std::hash::Hash;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, trace};

use self::record::{Record, Settled};

/// The expensive computation behind a [`Memo`]: turns a key into a value or an error.
///
/// Implemented for every `Fn(&K) -> Result<V, E>`, so plain closures can be handed to
/// [`Memo::new`].
///
/// A producer must not call back into the [`Memo`] that owns it with the key it is computing: the
/// key is already marked as in flight, so the inner call would wait for itself forever.
pub trait Producer<K> {
    /// The computed value.
    type Value;
    /// The failure the computation may report.
    type Error;

    /// Computes the result for `key`.
    fn produce(&self, key: &K) -> Result<Self::Value, Self::Error>;
}

impl<K, V, E, F> Producer<K> for F
where
    F: Fn(&K) -> Result<V, E>,
{
    type Value = V;
    type Error = E;

    fn produce(&self, key: &K) -> Result<V, E> {
        self(key)
    }
}

/// What a [`Memo`] does with a key whose computation failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// The error is remembered like any value, and returned to every later caller without running
    /// the producer again.
    #[default]
    Permanent,
    /// The error is handed to every caller attached to that computation, then forgotten, so that
    /// a later request for the key runs the producer again.
    ///
    /// A caller that arrives between the error being published and the key being forgotten still
    /// attaches to the failed computation and gets its error without a new attempt.
    Retry,
}

type Slot<P, K> = Record<Result<<P as Producer<K>>::Value, <P as Producer<K>>::Error>>;

/// Cache that remembers the result of a [`Producer`] for each key.
///
/// For every key the producer runs at most once, even for concurrent invocations of
/// [`Memo::get`] with that key; the other callers wait for the result of the running computation.
/// An invocation never blocks another invocation with a different key: if one thread calls
/// `get(key1)` and another calls `get(key2)` (`key1≠key2`, both not cached yet) concurrently, the
/// two computations run concurrently.
pub struct Memo<K, P: Producer<K>> {
    producer: P,
    policy: FailurePolicy,
    /// Only held for lookups and inserts, never while the producer runs.
    records: Mutex<HashMap<K, Arc<Slot<P, K>>>>,
}

impl<K, P: Producer<K>> fmt::Debug for Memo<K, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memo")
            .field("policy", &self.policy)
            .field("records", &self.lock_records().len())
            .finish_non_exhaustive()
    }
}

impl<K, P: Producer<K>> Memo<K, P> {
    /// Creates an empty cache that remembers failures permanently.
    pub fn new(producer: P) -> Self {
        Self::with_policy(producer, FailurePolicy::default())
    }

    /// Creates an empty cache with the given failure policy.
    pub fn with_policy(producer: P, policy: FailurePolicy) -> Self {
        Self {
            producer,
            policy,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// The failure policy this cache was created with.
    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Number of keys that have been requested and are still remembered, including the ones whose
    /// computation is in flight.
    pub fn len(&self) -> usize {
        self.lock_records().len()
    }

    /// Whether no key has been requested yet.
    pub fn is_empty(&self) -> bool {
        self.lock_records().is_empty()
    }

    fn lock_records(&self) -> MutexGuard<'_, HashMap<K, Arc<Slot<P, K>>>> {
        // Critical sections only look up or insert; a poisoned map is still consistent.
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K, P> Memo<K, P>
where
    K: Eq + Hash + Clone + fmt::Debug,
    P: Producer<K>,
    P::Value: Clone,
    P::Error: Clone,
{
    /// Returns the result for `key`, running the producer if no one has requested `key` before.
    ///
    /// If another thread is already computing `key`, blocks until that computation finishes and
    /// returns its result. Every caller for the same key gets the same value or the same error.
    ///
    /// # Panics
    ///
    /// Panics if the producer panics, both in the thread running it and in every thread waiting
    /// for it. With [`FailurePolicy::Permanent`], later calls for the key panic as well.
    pub fn get(&self, key: K) -> Result<P::Value, P::Error> {
        match self.claim(key) {
            Claim::Owner(key, record) => self.compute(&key, &record).clone(),
            Claim::Waiter(key, record) => {
                trace!(?key, "waiting for in-flight computation");
                Self::settled(&key, record.wait())
            }
        }
    }

    /// Like [`Memo::get`], but gives up waiting for another thread's computation after `timeout`
    /// and returns `None`.
    ///
    /// The timeout bounds only the wait: if this call is the first request for `key`, it runs the
    /// producer to completion itself. A waiter giving up doesn't affect the computation, whose
    /// result is still cached.
    pub fn get_timeout(&self, key: K, timeout: Duration) -> Option<Result<P::Value, P::Error>> {
        match self.claim(key) {
            Claim::Owner(key, record) => Some(self.compute(&key, &record).clone()),
            Claim::Waiter(key, record) => {
                trace!(?key, ?timeout, "waiting for in-flight computation");
                let settled = record.wait_timeout(timeout);
                if settled.is_none() {
                    debug!(?key, ?timeout, "gave up waiting for computation");
                }
                settled.map(|settled| Self::settled(&key, settled))
            }
        }
    }

    /// Returns the result for `key` if its computation has already finished.
    ///
    /// Never blocks and never runs the producer. Panics like [`Memo::get`] if the computation was
    /// abandoned.
    pub fn peek(&self, key: &K) -> Option<Result<P::Value, P::Error>> {
        let record = self.lock_records().get(key).cloned()?;
        let settled = record.peek()?;
        Some(Self::settled(key, settled))
    }

    /// Looks `key` up, inserting a pending record if it is missing.
    fn claim(&self, key: K) -> Claim<K, Arc<Slot<P, K>>> {
        let mut records = self.lock_records();
        match records.entry(key) {
            Entry::Occupied(entry) => Claim::Waiter(entry.key().clone(), Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                // Inserted before the lock is released, so concurrent callers for this key find it
                // and wait instead of computing it again.
                let key = entry.key().clone();
                let record = Arc::clone(entry.insert(Arc::new(Record::new())));
                Claim::Owner(key, record)
            }
        }
    }

    /// Runs the producer for a freshly claimed record and publishes its result.
    fn compute<'r>(&self, key: &K, record: &'r Slot<P, K>) -> &'r Result<P::Value, P::Error> {
        debug!(?key, "computing value");
        let in_flight = InFlight {
            memo: self,
            key,
            record,
        };
        let result = self.producer.produce(key);
        in_flight.finish(result)
    }

    fn settled(
        key: &K,
        settled: Settled<'_, Result<P::Value, P::Error>>,
    ) -> Result<P::Value, P::Error> {
        match settled {
            Settled::Ready(result) => {
                trace!(?key, ok = result.is_ok(), "served from cache");
                result.clone()
            }
            Settled::Abandoned => {
                panic!("the computation for key {key:?} was abandoned because its producer panicked")
            }
        }
    }

    fn forget(&self, key: &K) {
        let _ = self.lock_records().remove(key);
    }
}

/// Outcome of looking a key up.
enum Claim<K, R> {
    /// This caller inserted the record and must compute it.
    Owner(K, R),
    /// Someone else inserted the record first.
    Waiter(K, R),
}

/// Owner-side handle of a computation in flight.
///
/// Dropping it without calling [`InFlight::finish`] (i.e., when the producer unwinds) abandons the
/// record, so waiters don't block forever.
struct InFlight<'a, 'r, K, P>
where
    K: Eq + Hash + Clone + fmt::Debug,
    P: Producer<K>,
    P::Value: Clone,
    P::Error: Clone,
{
    memo: &'a Memo<K, P>,
    key: &'a K,
    record: &'r Slot<P, K>,
}

impl<'a, 'r, K, P> InFlight<'a, 'r, K, P>
where
    K: Eq + Hash + Clone + fmt::Debug,
    P: Producer<K>,
    P::Value: Clone,
    P::Error: Clone,
{
    fn finish(self, result: Result<P::Value, P::Error>) -> &'r Result<P::Value, P::Error> {
        let (memo, key, record) = (self.memo, self.key, self.record);
        mem::forget(self);

        let failed = result.is_err();
        let published = record.publish(result);
        if failed {
            debug!(?key, policy = ?memo.policy, "computation failed");
            if memo.policy == FailurePolicy::Retry {
                memo.forget(key);
            }
        }
        published
    }
}

impl<K, P> Drop for InFlight<'_, '_, K, P>
where
    K: Eq + Hash + Clone + fmt::Debug,
    P: Producer<K>,
    P::Value: Clone,
    P::Error: Clone,
{
    fn drop(&mut self) {
        if self.record.abandon() {
            debug!(key = ?self.key, "producer panicked, abandoning computation");
            if self.memo.policy == FailurePolicy::Retry {
                self.memo.forget(self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::{FailurePolicy, Memo};

    #[test]
    fn len_counts_requested_keys() {
        let memo = Memo::new(|key: &u32| Ok::<_, ()>(key * 2));
        assert!(memo.is_empty());
        assert_eq!(memo.get(1), Ok(2));
        assert_eq!(memo.get(2), Ok(4));
        assert_eq!(memo.get(1), Ok(2));
        assert_eq!(memo.len(), 2);
    }

    #[test]
    fn peek_never_computes() {
        let calls = AtomicUsize::new(0);
        let memo = Memo::new(|key: &u32| {
            let _ = calls.fetch_add(1, Ordering::Relaxed);
            Ok::<_, ()>(*key)
        });

        assert_eq!(memo.peek(&7), None);
        assert_eq!(calls.load(Ordering::Relaxed), 0);
        assert_eq!(memo.get(7), Ok(7));
        assert_eq!(memo.peek(&7), Some(Ok(7)));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn retry_forgets_failures_only() {
        let calls = AtomicUsize::new(0);
        let memo = Memo::with_policy(
            |key: &u32| {
                let _ = calls.fetch_add(1, Ordering::Relaxed);
                if *key == 0 {
                    Err("zero")
                } else {
                    Ok(*key)
                }
            },
            FailurePolicy::Retry,
        );

        assert_eq!(memo.get(0), Err("zero"));
        assert_eq!(memo.peek(&0), None);
        assert_eq!(memo.get(1), Ok(1));
        assert_eq!(memo.get(1), Ok(1));
        assert_eq!(memo.len(), 1);
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }
}
