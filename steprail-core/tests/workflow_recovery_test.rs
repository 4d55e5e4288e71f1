//! Recovery handlers and bounded retries

use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use steprail_core::models::workflow::{RetryPolicy, StepState, TransitionCause};
use steprail_core::workflow::executor::{
    recovery_fn, step_fn, RecoveryOutcome, RetryOnFailure, StepContext, StepFailure,
};
use steprail_core::workflow::pipeline::{Pipeline, RunOutcome, StepDefinition};
use steprail_core::WorkflowError;

/// Step that fails until its `succeed_on`-th invocation
fn flaky_step(name: &str, succeed_on: u32, calls: &Arc<AtomicU32>) -> StepDefinition {
    let calls = calls.clone();
    StepDefinition::new(
        name,
        step_fn(move |ctx: StepContext| {
            let calls = calls.clone();
            async move {
                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if call < succeed_on {
                    return Err(StepFailure::failed(format!("attempt {} failed", ctx.attempt())));
                }
                ctx.scoped().set("succeeded_on", call);
                Ok(())
            }
        }),
    )
}

#[tokio::test]
async fn test_retry_succeeds_within_bound() {
    let calls = Arc::new(AtomicU32::new(0));
    let step = flaky_step("flaky", 3, &calls)
        .with_recovery(Arc::new(RetryOnFailure))
        .with_retry_policy(RetryPolicy::with_max_attempts(3));

    let pipeline = Pipeline::new(vec![step]).unwrap();
    let outcome = pipeline.run().await.unwrap();

    assert!(outcome.is_completed());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(pipeline.cursor().get("flaky.succeeded_on"), Some(json!(3)));

    let record = &pipeline.step_states()[0];
    assert_eq!(record.state, StepState::Succeeded);
    assert_eq!(record.attempts, 3);
}

#[tokio::test]
async fn test_retry_fails_beyond_bound() {
    let calls = Arc::new(AtomicU32::new(0));
    let step = flaky_step("flaky", 4, &calls)
        .with_recovery(Arc::new(RetryOnFailure))
        .with_retry_policy(RetryPolicy::with_max_attempts(3));

    let pipeline = Pipeline::new(vec![step]).unwrap();
    let outcome = pipeline.run().await.unwrap();

    match outcome {
        RunOutcome::Failed { error, .. } => match error {
            WorkflowError::RecoveryExhausted {
                step,
                attempts,
                last,
            } => {
                assert_eq!(step, "flaky");
                assert_eq!(attempts, 3);
                assert_eq!(last, StepFailure::failed("attempt 3 failed"));
            }
            other => panic!("expected RecoveryExhausted, got {:?}", other),
        },
        other => panic!("expected failure, got {:?}", other),
    }

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(pipeline.status(), "failed");
    assert_eq!(
        pipeline.history().last().unwrap().cause,
        TransitionCause::RecoveryExhausted
    );
}

#[tokio::test]
async fn test_default_bound_is_three_attempts() {
    let calls = Arc::new(AtomicU32::new(0));
    let step = flaky_step("flaky", 10, &calls).with_recovery(Arc::new(RetryOnFailure));

    let pipeline = Pipeline::new(vec![step]).unwrap();
    pipeline.run().await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_recovered_step_advances() {
    let calls = Arc::new(AtomicU32::new(0));
    let after = Arc::new(AtomicU32::new(0));
    let recovery = recovery_fn(|failure: StepFailure, _attempt, cursor| async move {
        cursor.set("fallback.reason", failure.to_string());
        Ok(RecoveryOutcome::Recovered)
    });

    let pipeline = Pipeline::new(vec![
        flaky_step("primary", 99, &calls).with_recovery(recovery),
        flaky_step("next", 1, &after),
    ])
    .unwrap();

    assert!(pipeline.run().await.unwrap().is_completed());

    let states: Vec<_> = pipeline.step_states().into_iter().map(|r| r.state).collect();
    assert_eq!(states, vec![StepState::Recovered, StepState::Succeeded]);
    assert_eq!(
        pipeline.cursor().get("fallback.reason"),
        Some(json!("attempt 1 failed"))
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_recovery_can_give_up() {
    let calls = Arc::new(AtomicU32::new(0));
    let recovery = recovery_fn(|_failure, _attempt, _cursor| async { Ok(RecoveryOutcome::Fail) });

    let pipeline =
        Pipeline::new(vec![flaky_step("primary", 99, &calls).with_recovery(recovery)]).unwrap();
    let outcome = pipeline.run().await.unwrap();

    assert!(matches!(
        outcome,
        RunOutcome::Failed {
            error: WorkflowError::StepExecutionFailure { .. },
            ..
        }
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failing_recovery_keeps_both_failures() {
    let calls = Arc::new(AtomicU32::new(0));
    let recovery = recovery_fn(|_failure, _attempt, _cursor| async {
        Err(StepFailure::failed("rollback failed"))
    });

    let pipeline =
        Pipeline::new(vec![flaky_step("primary", 99, &calls).with_recovery(recovery)]).unwrap();

    match pipeline.run().await.unwrap() {
        RunOutcome::Failed {
            error: WorkflowError::RecoveryFailed { failure, source, .. },
            ..
        } => {
            assert_eq!(source, StepFailure::failed("rollback failed"));
            assert_eq!(failure, StepFailure::failed("attempt 1 failed"));
        }
        other => panic!("expected recovery failure, got {:?}", other),
    }

    let detail = pipeline.history().last().unwrap().detail.clone().unwrap();
    assert!(detail.contains("rollback failed"));
    assert!(detail.contains("attempt 1 failed"));
}

#[tokio::test]
async fn test_recovery_sees_attempt_numbers() {
    let calls = Arc::new(AtomicU32::new(0));
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = seen.clone();
    let recovery = recovery_fn(move |_failure, attempt, _cursor| {
        let sink = sink.clone();
        async move {
            sink.lock().unwrap().push(attempt);
            Ok(RecoveryOutcome::Retry)
        }
    });

    let pipeline = Pipeline::new(vec![flaky_step("flaky", 3, &calls)
        .with_recovery(recovery)
        .with_retry_policy(RetryPolicy::with_max_attempts(5))])
    .unwrap();

    assert!(pipeline.run().await.unwrap().is_completed());
    assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
}

#[tokio::test]
async fn test_retry_delay_is_applied() {
    let calls = Arc::new(AtomicU32::new(0));
    let policy = RetryPolicy {
        max_attempts: 2,
        initial_delay_ms: 100,
        ..RetryPolicy::default()
    };
    let step = flaky_step("flaky", 2, &calls)
        .with_recovery(Arc::new(RetryOnFailure))
        .with_retry_policy(policy);

    let started = Instant::now();
    let pipeline = Pipeline::new(vec![step]).unwrap();
    assert!(pipeline.run().await.unwrap().is_completed());
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[tokio::test]
async fn test_cancel_during_retry_delay() {
    let calls = Arc::new(AtomicU32::new(0));
    let policy = RetryPolicy {
        max_attempts: 3,
        initial_delay_ms: 60_000,
        ..RetryPolicy::default()
    };
    let step = flaky_step("flaky", 10, &calls)
        .with_recovery(Arc::new(RetryOnFailure))
        .with_retry_policy(policy);
    let pipeline = Arc::new(Pipeline::new(vec![step]).unwrap());

    let runner = pipeline.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    while calls.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    pipeline.cancel("stop retrying").unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Cancelled { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_out_of_range_step_policy_is_rejected() {
    let calls = Arc::new(AtomicU32::new(0));
    let step = flaky_step("flaky", 1, &calls)
        .with_recovery(Arc::new(RetryOnFailure))
        .with_retry_policy(RetryPolicy::with_max_attempts(11));

    assert!(matches!(
        Pipeline::new(vec![step]),
        Err(WorkflowError::InvalidPipeline(_))
    ));
}
