//! Single-flight deduplication
//!
//! Concurrent calls to [`Group::work`] with the same key share a single
//! execution; every caller gets a copy of the result.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use tracing::error;

use crate::jsonrpc::CaughtPanic;

type Outcome = Result<Value, Arc<anyhow::Error>>;
type Flight = Shared<BoxFuture<'static, Outcome>>;

/// Failure of a shared execution, as seen by one of its callers
///
/// The original error stays reachable through `source()` so it can still be
/// classified.
#[derive(Debug)]
pub struct SharedError(Arc<anyhow::Error>);

impl SharedError {
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.0)
    }
}

impl std::error::Error for SharedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let inner: &(dyn std::error::Error + Send + Sync + 'static) = &**self.0;
        Some(inner)
    }
}

#[derive(Default)]
pub struct Group {
    flights: Mutex<HashMap<String, Flight>>,
}

impl Group {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` unless an execution for `key` is already in flight, in
    /// which case wait for that one instead
    pub async fn work<F>(&self, key: &str, work: F) -> anyhow::Result<Value>
    where
        F: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let flight = {
            let mut flights = self.flights.lock();
            match flights.get(key) {
                Some(flight) => flight.clone(),
                None => {
                    let flight = AssertUnwindSafe(work)
                        .catch_unwind()
                        .map(|caught| match caught {
                            Ok(Ok(value)) => Ok(value),
                            Ok(Err(e)) => Err(Arc::new(e)),
                            Err(payload) => {
                                let caught = CaughtPanic::new(payload.as_ref());
                                error!("Shared work panicked: {}\n{}", caught.message, caught.backtrace);
                                Err(Arc::new(anyhow::anyhow!(
                                    "single-flight work panicked: {}",
                                    caught.message
                                )))
                            }
                        })
                        .boxed()
                        .shared();
                    flights.insert(key.to_string(), flight.clone());
                    flight
                }
            }
        };

        let outcome = flight.clone().await;

        {
            let mut flights = self.flights.lock();
            if flights.get(key).is_some_and(|f| f.ptr_eq(&flight)) {
                flights.remove(key);
            }
        }

        outcome.map_err(|e| SharedError(e).into())
    }

    /// Number of keys currently executing
    pub fn in_flight(&self) -> usize {
        self.flights.lock().len()
    }
}
