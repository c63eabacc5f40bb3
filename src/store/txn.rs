use std::time::Duration;

use log::warn;

use crate::error::{EngineError, EngineResult};
use crate::store::traits::StoreTx;

pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Transaction coordinator: commits operation bodies and decides when a
/// failed attempt is replayed.
///
/// Callers drive the loop; retrying replays the whole body from scratch
/// against a fresh transaction, never just the conflicting statement, so
/// bodies must not hold state from a previous attempt:
///
/// ```ignore
/// let mut attempt = 0;
/// loop {
///     let mut tx = store.begin().await?;
///     let result = body(tx.as_mut()).await;
///     if let Some(outcome) = runner.settle(tx, result, &mut attempt).await {
///         break outcome;
///     }
/// }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct TxnRunner {
    max_retries: u32,
}

impl TxnRunner {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Finish one attempt: commit on success, roll back on failure.
    /// Returns `None` when the attempt should be replayed (after a short
    /// jittered backoff), `Some(outcome)` when the operation is settled.
    pub async fn settle<T>(
        &self,
        tx: Box<dyn StoreTx>,
        result: EngineResult<T>,
        attempt: &mut u32,
    ) -> Option<EngineResult<T>> {
        match result {
            Ok(value) => match tx.commit().await {
                Ok(()) => Some(Ok(value)),
                Err(err) => {
                    if self.should_retry(&err, attempt).await {
                        None
                    } else {
                        Some(Err(err))
                    }
                }
            },
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!("transaction rollback failed: {rollback_err}");
                }
                if self.should_retry(&err, attempt).await {
                    None
                } else {
                    Some(Err(err))
                }
            }
        }
    }

    async fn should_retry(&self, err: &EngineError, attempt: &mut u32) -> bool {
        if !err.is_retryable() || *attempt >= self.max_retries {
            return false;
        }
        *attempt += 1;
        warn!(
            "serialization conflict, replaying transaction (attempt {}/{})",
            attempt, self.max_retries
        );
        tokio::time::sleep(backoff_delay(*attempt)).await;
        true
    }
}

impl Default for TxnRunner {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let base_ms = 5u64.saturating_mul(1 << attempt.min(5));
    // Spread contending retries apart without pulling in an RNG.
    let jitter_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64 % 5)
        .unwrap_or(0);
    Duration::from_millis(base_ms.min(160) + jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::traits::Store;

    #[tokio::test]
    async fn successful_body_settles_first_attempt() {
        let store = MemoryStore::new();
        let runner = TxnRunner::default();
        let mut attempt = 0;

        let tx = store.begin().await.unwrap();
        let outcome = runner.settle(tx, Ok(7), &mut attempt).await;
        assert_eq!(outcome.unwrap().unwrap(), 7);
        assert_eq!(attempt, 0);
    }

    #[tokio::test]
    async fn retryable_failures_are_replayed_up_to_the_bound() {
        let store = MemoryStore::new();
        let runner = TxnRunner::new(3);
        let mut attempt = 0;
        let mut calls = 0u32;

        let outcome = loop {
            let tx = store.begin().await.unwrap();
            calls += 1;
            let result: EngineResult<u32> = if calls < 3 {
                Err(EngineError::SerializationConflict)
            } else {
                Ok(calls)
            };
            if let Some(outcome) = runner.settle(tx, result, &mut attempt).await {
                break outcome;
            }
        };
        assert_eq!(outcome.unwrap(), 3);
        assert_eq!(calls, 3);
        assert_eq!(attempt, 2);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_conflict() {
        let store = MemoryStore::new();
        let runner = TxnRunner::new(2);
        let mut attempt = 0;
        let mut calls = 0u32;

        let outcome: EngineResult<()> = loop {
            let tx = store.begin().await.unwrap();
            calls += 1;
            let result = Err(EngineError::SerializationConflict);
            if let Some(outcome) = runner.settle(tx, result, &mut attempt).await {
                break outcome;
            }
        };
        assert!(matches!(outcome, Err(EngineError::SerializationConflict)));
        // Initial attempt plus two replays.
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn non_retryable_failures_settle_immediately() {
        let store = MemoryStore::new();
        let runner = TxnRunner::default();
        let mut attempt = 0;

        let tx = store.begin().await.unwrap();
        let outcome = runner
            .settle::<()>(
                tx,
                Err(EngineError::PreconditionFailed("no changes".into())),
                &mut attempt,
            )
            .await;
        assert!(matches!(
            outcome,
            Some(Err(EngineError::PreconditionFailed(_)))
        ));
        assert_eq!(attempt, 0);
    }
}
