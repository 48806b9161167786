//! Saga persistence contract and optimistic in-memory implementation

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::{MessagingError, MessagingResult};
use crate::saga::Saga;
use crate::timebase::Timebase;

/// Persistence seam for saga instances.
///
/// `save` initializes `created_at`, `updated_at`, and `version = 0`;
/// `update` refreshes `updated_at` and increments `version` by exactly
/// one, failing with a concurrency error when the stored version differs
/// from the caller's.
#[async_trait]
pub trait SagaRepository<TSaga: Saga>: Send + Sync {
    /// Persist a new saga; duplicate correlation ids are an error.
    async fn save(&self, saga: &mut TSaga) -> MessagingResult<()>;

    /// Look up a saga by correlation id.
    async fn find(&self, correlation_id: Uuid) -> MessagingResult<Option<TSaga>>;

    /// Persist changes to an existing saga under a version check.
    async fn update(&self, saga: &mut TSaga) -> MessagingResult<()>;

    /// Remove a saga; false if it did not exist.
    async fn delete(&self, correlation_id: Uuid) -> MessagingResult<bool>;

    /// All sagas currently in the named state.
    async fn find_by_state(&self, state: &str) -> MessagingResult<Vec<TSaga>>;

    /// Non-completed sagas whose `updated_at` is older than `age`.
    async fn find_stale(&self, age: Duration) -> MessagingResult<Vec<TSaga>>;
}

/// Thread-safe in-memory repository with strict version checking.
pub struct InMemorySagaRepository<TSaga> {
    sagas: DashMap<Uuid, TSaga>,
    clock: Arc<dyn Timebase>,
}

impl<TSaga: Saga + Clone> InMemorySagaRepository<TSaga> {
    /// Create an empty repository.
    pub fn new(clock: Arc<dyn Timebase>) -> Self {
        Self {
            sagas: DashMap::new(),
            clock,
        }
    }

    /// Number of stored sagas.
    pub fn len(&self) -> usize {
        self.sagas.len()
    }

    /// Whether the repository is empty.
    pub fn is_empty(&self) -> bool {
        self.sagas.is_empty()
    }

    /// Purge completed sagas; returns how many were removed.
    ///
    /// Explicit by design: completed sagas stay readable until the
    /// embedding application decides otherwise.
    pub fn remove_completed(&self) -> usize {
        let before = self.sagas.len();
        self.sagas.retain(|_, saga| !saga.is_completed());
        before - self.sagas.len()
    }
}

#[async_trait]
impl<TSaga: Saga + Clone> SagaRepository<TSaga> for InMemorySagaRepository<TSaga> {
    async fn save(&self, saga: &mut TSaga) -> MessagingResult<()> {
        let correlation_id = saga.correlation_id();
        let now = self.clock.now_utc();
        match self.sagas.entry(correlation_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(MessagingError::Duplicate {
                kind: "saga",
                id: correlation_id.to_string(),
                hint: "; use update() for existing sagas",
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                saga.set_created_at(now);
                saga.set_updated_at(now);
                saga.set_version(0);
                slot.insert(saga.clone());
                Ok(())
            }
        }
    }

    async fn find(&self, correlation_id: Uuid) -> MessagingResult<Option<TSaga>> {
        Ok(self.sagas.get(&correlation_id).map(|saga| saga.value().clone()))
    }

    async fn update(&self, saga: &mut TSaga) -> MessagingResult<()> {
        let correlation_id = saga.correlation_id();
        let now = self.clock.now_utc();
        // The map entry lock makes the compare-and-bump atomic.
        match self.sagas.get_mut(&correlation_id) {
            None => Err(MessagingError::NotFound {
                kind: "saga",
                id: correlation_id.to_string(),
                hint: "; use save() for new sagas",
            }),
            Some(mut stored) => {
                if stored.version() != saga.version() {
                    return Err(MessagingError::ConcurrencyConflict {
                        correlation_id,
                        expected: saga.version(),
                        actual: stored.version(),
                    });
                }
                saga.set_version(saga.version() + 1);
                saga.set_updated_at(now);
                *stored = saga.clone();
                Ok(())
            }
        }
    }

    async fn delete(&self, correlation_id: Uuid) -> MessagingResult<bool> {
        Ok(self.sagas.remove(&correlation_id).is_some())
    }

    async fn find_by_state(&self, state: &str) -> MessagingResult<Vec<TSaga>> {
        Ok(self
            .sagas
            .iter()
            .filter(|saga| saga.current_state() == state)
            .map(|saga| saga.value().clone())
            .collect())
    }

    async fn find_stale(&self, age: Duration) -> MessagingResult<Vec<TSaga>> {
        let cutoff = self.clock.now_utc()
            - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::zero());
        Ok(self
            .sagas
            .iter()
            .filter(|saga| !saga.is_completed() && saga.updated_at() < cutoff)
            .map(|saga| saga.value().clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saga::testing::TestSaga;
    use crate::timebase::SimClock;

    fn repository() -> (InMemorySagaRepository<TestSaga>, SimClock) {
        let clock = SimClock::starting_now();
        (
            InMemorySagaRepository::new(Arc::new(clock.clone())),
            clock,
        )
    }

    fn saga() -> TestSaga {
        TestSaga {
            correlation_id: Uuid::new_v4(),
            ..TestSaga::default()
        }
    }

    #[tokio::test]
    async fn test_save_then_update_versions_monotonically() {
        let (repository, _clock) = repository();
        let mut saga = saga();
        repository.save(&mut saga).await.unwrap();
        assert_eq!(
            repository
                .find(saga.correlation_id())
                .await
                .unwrap()
                .unwrap()
                .version(),
            0
        );

        saga.set_current_state("Shipping".to_string());
        repository.update(&mut saga).await.unwrap();
        assert_eq!(saga.version(), 1);

        repository.update(&mut saga).await.unwrap();
        assert_eq!(saga.version(), 2);
        assert_eq!(
            repository
                .find(saga.correlation_id())
                .await
                .unwrap()
                .unwrap()
                .version(),
            2
        );
    }

    #[tokio::test]
    async fn test_save_duplicate_guides_to_update() {
        let (repository, _clock) = repository();
        let mut saga = saga();
        repository.save(&mut saga).await.unwrap();
        let error = repository.save(&mut saga.clone()).await.unwrap_err();
        assert!(error.to_string().contains("already exists"));
        assert!(error.to_string().contains("update()"));
    }

    #[tokio::test]
    async fn test_update_missing_guides_to_save() {
        let (repository, _clock) = repository();
        let mut saga = saga();
        let error = repository.update(&mut saga).await.unwrap_err();
        assert!(error.to_string().contains("not found"));
        assert!(error.to_string().contains("save()"));
    }

    #[tokio::test]
    async fn test_save_sets_timestamps_and_update_refreshes() {
        let (repository, clock) = repository();
        let mut saga = saga();
        repository.save(&mut saga).await.unwrap();
        let created = saga.created_at();
        assert_eq!(saga.updated_at(), created);

        clock.advance(Duration::from_secs(60));
        repository.update(&mut saga).await.unwrap();
        assert_eq!(saga.created_at(), created);
        assert!(saga.updated_at() > created);
    }

    #[tokio::test]
    async fn test_find_stale_skips_completed() {
        let (repository, clock) = repository();
        let mut stalled = saga();
        let mut finished = saga();
        finished.set_completed(true);
        repository.save(&mut stalled).await.unwrap();
        repository.save(&mut finished).await.unwrap();

        clock.advance(Duration::from_secs(7200));
        let stale = repository.find_stale(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].correlation_id(), stalled.correlation_id());
    }

    #[tokio::test]
    async fn test_find_by_state() {
        let (repository, _clock) = repository();
        let mut waiting = saga();
        waiting.set_current_state("AwaitingPayment".to_string());
        let mut other = saga();
        repository.save(&mut waiting).await.unwrap();
        repository.save(&mut other).await.unwrap();

        let found = repository.find_by_state("AwaitingPayment").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].correlation_id(), waiting.correlation_id());
    }

    #[tokio::test]
    async fn test_remove_completed_purges_only_finished() {
        let (repository, _clock) = repository();
        let mut running = saga();
        let mut finished = saga();
        finished.set_completed(true);
        repository.save(&mut running).await.unwrap();
        repository.save(&mut finished).await.unwrap();

        assert_eq!(repository.remove_completed(), 1);
        assert_eq!(repository.len(), 1);
        assert!(repository
            .find(running.correlation_id())
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_updates_detect_conflicts() {
        let (repository, _clock) = repository();
        let repository = Arc::new(repository);
        let mut saga = saga();
        repository.save(&mut saga).await.unwrap();
        let correlation_id = saga.correlation_id();

        // Every worker starts from the same version-0 snapshot.
        let snapshot = repository
            .find(correlation_id)
            .await
            .unwrap()
            .expect("saga exists");
        let mut handles = Vec::new();
        for worker in 0..10 {
            let repository = repository.clone();
            let mut loaded = snapshot.clone();
            handles.push(tokio::spawn(async move {
                loaded.set_current_state(format!("Worker{worker}"));
                repository.update(&mut loaded).await
            }));
        }

        let mut successes = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => successes += 1,
                Err(MessagingError::ConcurrencyConflict { .. }) => conflicts += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(successes, 1, "exactly one same-version update wins");
        assert_eq!(conflicts, 9);

        let stored = repository.find(correlation_id).await.unwrap().unwrap();
        assert_eq!(stored.version(), 1);
    }
}
