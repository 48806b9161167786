//! Saga engine integration tests

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use common::{OrderSaga, OrderStarted, PaymentCompleted};
use hero_messaging::saga::state::{Event, State};
use hero_messaging::saga::{
    InMemorySagaRepository, SagaOrchestrator, SagaRepository, SagaTimeoutSweeper,
    StateMachineBuilder, SweeperConfig, INITIAL_STATE, TIMED_OUT_STATE,
};
use hero_messaging::timebase::{SimClock, Timebase};

fn clock() -> (Arc<dyn Timebase>, SimClock) {
    let sim = SimClock::starting_now();
    (Arc::new(sim.clone()), sim)
}

fn order_flow() -> hero_messaging::saga::StateMachineDefinition<OrderSaga> {
    let order_started = Event::<OrderStarted>::new("OrderStarted");
    let payment_completed = Event::<PaymentCompleted>::new("PaymentCompleted");
    StateMachineBuilder::new()
        .initially()
        .when(&order_started)
        .then(|saga: &mut OrderSaga, _event: &OrderStarted, compensation| {
            saga.reserved_stock = true;
            compensation.add_compensation("release-stock", || Ok(()));
            Ok(())
        })
        .transition_to(State::new("ProcessingPayment"))
        .done()
        .during(State::new("ProcessingPayment"))
        .when(&payment_completed)
        .transition_to(State::new("Completed"))
        .finalize()
        .done()
        .build()
        .expect("valid definition")
}

mod orchestration {
    use super::*;

    #[tokio::test]
    async fn test_order_flow_runs_to_completion() {
        let (clock, _sim) = clock();
        let repository = Arc::new(InMemorySagaRepository::<OrderSaga>::new(clock.clone()));
        let orchestrator =
            SagaOrchestrator::new(Arc::new(order_flow()), repository.clone(), clock);
        let correlation = Uuid::new_v4();
        let cancel = CancellationToken::new();

        orchestrator
            .process(&OrderStarted::new(correlation), &cancel)
            .await
            .unwrap();
        let saga = repository.find(correlation).await.unwrap().unwrap();
        assert_eq!(saga.current_state, "ProcessingPayment");
        assert_eq!(saga.version, 0);
        assert!(!saga.completed);
        assert!(saga.reserved_stock);

        orchestrator
            .process(&PaymentCompleted::new(correlation), &cancel)
            .await
            .unwrap();
        let saga = repository.find(correlation).await.unwrap().unwrap();
        assert_eq!(saga.current_state, "Completed");
        assert_eq!(saga.version, 1);
        assert!(saga.completed);
    }

    #[tokio::test]
    async fn test_each_correlation_id_gets_its_own_instance() {
        let (clock, _sim) = clock();
        let repository = Arc::new(InMemorySagaRepository::<OrderSaga>::new(clock.clone()));
        let orchestrator =
            SagaOrchestrator::new(Arc::new(order_flow()), repository.clone(), clock);
        let cancel = CancellationToken::new();

        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        orchestrator
            .process(&OrderStarted::new(first), &cancel)
            .await
            .unwrap();
        orchestrator
            .process(&OrderStarted::new(second), &cancel)
            .await
            .unwrap();
        orchestrator
            .process(&PaymentCompleted::new(first), &cancel)
            .await
            .unwrap();

        assert!(repository.find(first).await.unwrap().unwrap().completed);
        assert!(!repository.find(second).await.unwrap().unwrap().completed);
    }
}

mod repository_laws {
    use super::*;

    #[tokio::test]
    async fn test_save_then_update_round_trip() {
        let (clock, _sim) = clock();
        let repository = InMemorySagaRepository::<OrderSaga>::new(clock);
        let mut saga = OrderSaga {
            correlation_id: Uuid::new_v4(),
            ..OrderSaga::default()
        };

        repository.save(&mut saga).await.unwrap();
        assert_eq!(
            repository
                .find(saga.correlation_id)
                .await
                .unwrap()
                .unwrap()
                .version,
            0
        );

        saga.current_state = "Shipping".to_string();
        repository.update(&mut saga).await.unwrap();
        assert_eq!(
            repository
                .find(saga.correlation_id)
                .await
                .unwrap()
                .unwrap()
                .version,
            1
        );
    }
}

mod timeout_sweeping {
    use super::*;

    #[tokio::test]
    async fn test_stalled_saga_is_finalized_by_the_worker() {
        let (clock, sim) = clock();
        let repository = Arc::new(InMemorySagaRepository::<OrderSaga>::new(clock.clone()));
        let orchestrator =
            SagaOrchestrator::new(Arc::new(order_flow()), repository.clone(), clock.clone());
        let correlation = Uuid::new_v4();
        orchestrator
            .process(&OrderStarted::new(correlation), &CancellationToken::new())
            .await
            .unwrap();

        let sweeper = SagaTimeoutSweeper::new(
            repository.clone() as Arc<dyn SagaRepository<OrderSaga>>,
            clock,
            SweeperConfig {
                check_interval: Duration::from_secs(60),
                default_timeout: Duration::from_secs(3600),
                enabled: true,
            },
        )
        .unwrap();

        // Stall past the timeout, then let one interval elapse.
        sim.advance(Duration::from_secs(7200));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        sim.advance(Duration::from_secs(60));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let swept = repository.find(correlation).await.unwrap().unwrap();
        assert_eq!(swept.current_state, TIMED_OUT_STATE);
        assert!(swept.completed);
        sweeper.shutdown().await;

        // Finalized sagas are invisible to later sweeps and events.
        orchestrator
            .process(&PaymentCompleted::new(correlation), &CancellationToken::new())
            .await
            .unwrap();
        let unchanged = repository.find(correlation).await.unwrap().unwrap();
        assert_eq!(unchanged.current_state, TIMED_OUT_STATE);
    }
}

mod builder_validation {
    use super::*;

    #[test]
    fn test_build_without_initial_transitions_fails() {
        let error = StateMachineBuilder::<OrderSaga>::new()
            .during(State::new("Orphan"))
            .when(&Event::<OrderStarted>::new("OrderStarted"))
            .transition_to(State::new("Nowhere"))
            .done()
            .build()
            .unwrap_err();
        let text = error.to_string();
        assert!(text.contains("initial state"));
        assert!(text.contains("initially()"));
    }

    #[test]
    fn test_initial_state_constant() {
        assert_eq!(INITIAL_STATE, "Initial");
    }
}
