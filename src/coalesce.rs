//! Single-flight coalescing of keyed operations.
//!
//! A [`FlightGroup`] holds at most one in-flight future per key. The first
//! caller installs the flight; callers arriving while it runs await a shared
//! handle to the same future instead of starting their own. Every waiter
//! receives a clone of the one output, which is why fallible instantiations
//! use `Result<_, Arc<E>>`. A flight unregisters itself as its final step, so
//! the next caller after completion starts a fresh one.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

type FlightFuture<T> = Shared<BoxFuture<'static, T>>;

/// Keyed single-flight table.
///
/// Clones share the same table; the gateway clones one per request task.
#[derive(Debug)]
pub struct FlightGroup<T> {
    flights: Arc<DashMap<String, FlightFuture<T>>>,
}

impl<T> Clone for FlightGroup<T> {
    fn clone(&self) -> Self {
        Self {
            flights: Arc::clone(&self.flights),
        }
    }
}

impl<T> Default for FlightGroup<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FlightGroup<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            flights: Arc::new(DashMap::new()),
        }
    }

    /// Runs the future produced by `make` under single-flight semantics for
    /// `key`.
    ///
    /// If a flight for `key` is already in progress, `make` is not called and
    /// this caller awaits the existing flight's output. The flight future
    /// must not panic; a panicking flight poisons every waiter.
    pub async fn run<F, Fut>(&self, key: &str, make: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let flight = match self.flights.entry(key.to_owned()) {
            Entry::Occupied(existing) => existing.get().clone(),
            Entry::Vacant(slot) => {
                let flights = Arc::clone(&self.flights);
                let owned_key = key.to_owned();
                let future = make();
                let flight = async move {
                    let output = future.await;
                    // The flight unregisters itself exactly once; waiters
                    // already holding clones still resolve.
                    flights.remove(&owned_key);
                    output
                }
                .boxed()
                .shared();
                slot.insert(flight.clone());
                flight
            }
        };
        flight.await
    }

    /// Number of flights currently in progress.
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }
}
