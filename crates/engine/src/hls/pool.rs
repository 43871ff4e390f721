use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::TidalError;

/// Bounded-concurrency executor for segment fetches.
///
/// `submit` waits for a free permit, so at most `limit` units run at once.
/// Once the admission token is cancelled no further unit is started; units
/// already admitted run to completion. With `fail_fast`, the first failing
/// unit closes admission.
pub struct FetchPool {
    semaphore: Arc<Semaphore>,
    tasks: JoinSet<Result<(), TidalError>>,
    admission: CancellationToken,
    fail_fast: bool,
    failures: Vec<TidalError>,
}

impl FetchPool {
    pub fn new(limit: usize, token: &CancellationToken) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit.max(1))),
            tasks: JoinSet::new(),
            admission: token.child_token(),
            fail_fast: false,
            failures: Vec::new(),
        }
    }

    pub fn fail_fast(mut self, enabled: bool) -> Self {
        self.fail_fast = enabled;
        self
    }

    /// Admit `unit` once a permit is free. Returns `Cancelled` when admission
    /// closed first.
    pub async fn submit<F>(&mut self, unit: F) -> Result<(), TidalError>
    where
        F: Future<Output = Result<(), TidalError>> + Send + 'static,
    {
        self.reap();

        let permit = tokio::select! {
            biased;
            _ = self.admission.cancelled() => return Err(TidalError::Cancelled),
            permit = self.semaphore.clone().acquire_owned() => {
                permit.map_err(|_| TidalError::internal("fetch pool semaphore closed"))?
            }
        };
        // a failure may have closed admission while we waited
        if self.admission.is_cancelled() {
            return Err(TidalError::Cancelled);
        }

        let admission = self.admission.clone();
        let fail_fast = self.fail_fast;
        self.tasks.spawn(async move {
            let _permit = permit;
            let result = unit.await;
            if result.is_err() && fail_fast {
                admission.cancel();
            }
            result
        });
        Ok(())
    }

    /// Wait for every admitted unit and return the failures, oldest first.
    pub async fn join(mut self) -> Vec<TidalError> {
        while let Some(joined) = self.tasks.join_next().await {
            Self::record(&mut self.failures, joined);
        }
        debug!(failures = self.failures.len(), "fetch pool drained");
        self.failures
    }

    fn reap(&mut self) {
        while let Some(joined) = self.tasks.try_join_next() {
            Self::record(&mut self.failures, joined);
        }
    }

    fn record(
        failures: &mut Vec<TidalError>,
        joined: Result<Result<(), TidalError>, tokio::task::JoinError>,
    ) {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => failures.push(e),
            Err(e) => {
                error!(error = %e, "fetch task panicked");
                failures.push(TidalError::internal(format!("fetch task failed: {e}")));
            }
        }
    }
}
