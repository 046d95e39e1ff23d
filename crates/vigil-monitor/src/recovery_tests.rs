//! Tests for the recovery manager.

use super::*;
use std::sync::atomic::{AtomicU32, AtomicUsize};

use crate::circuit_breaker::BreakerState;
use crate::config::AlertsConfig;

fn config() -> RecoveryConfig {
    RecoveryConfig {
        cooldown_secs: 0,
        auto_circuit_breaker: false,
        ..Default::default()
    }
}

fn counting_action(calls: Arc<AtomicUsize>, succeed: bool) -> Arc<dyn RecoveryAction> {
    Arc::new(FnAction::new(move || {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            if succeed {
                RecoveryOutcome::succeeded("ok")
            } else {
                RecoveryOutcome::failed("still broken")
            }
        }
    }))
}

fn db() -> ServiceId {
    ServiceId::new("db")
}

#[test]
fn test_strategy_kind_display() {
    assert_eq!(StrategyKind::RestartConnection.to_string(), "restart-connection");
    assert_eq!(StrategyKind::ResetConnectionPool.to_string(), "reset-connection-pool");
    assert_eq!(StrategyKind::Custom("flush-dns".to_string()).to_string(), "flush-dns");
}

#[tokio::test]
async fn test_unregistered_service() {
    let manager = ServiceRecoveryManager::new(config());
    let err = manager
        .attempt_recovery(&db(), HealthStatus::Unhealthy)
        .await
        .unwrap_err();
    assert!(matches!(err, MonitorError::ServiceNotRegistered(_)));
    assert!(manager.get_recovery_status(&db()).is_err());
    assert!(manager.reset_circuit_breaker(&db()).is_err());
}

#[tokio::test]
async fn test_successful_recovery_resets_escalation() {
    let dispatcher = Arc::new(AlertDispatchEngine::new(&AlertsConfig::default()));
    let manager = ServiceRecoveryManager::new(config()).with_dispatcher(dispatcher.clone());
    let calls = Arc::new(AtomicUsize::new(0));
    manager.register_strategy(
        &db(),
        StrategyKind::RestartConnection,
        counting_action(calls.clone(), true),
        1,
    );

    let recovered = manager
        .attempt_recovery(&db(), HealthStatus::Unhealthy)
        .await
        .unwrap();

    assert!(recovered);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(manager.escalation_level(&db()).unwrap(), 0);

    let alerts = dispatcher.alert_history(10);
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].name, "recovery_succeeded");
    assert_eq!(alerts[0].severity, AlertSeverity::Low);
    assert_eq!(alerts[0].labels.get("strategy").unwrap(), "restart-connection");

    let status = manager.get_recovery_status(&db()).unwrap();
    assert_eq!(status.strategies[0].success_count, 1);
    assert_eq!(status.recent_attempts.len(), 1);
    assert!(status.recent_attempts[0].success);
    assert!(!status.in_progress);
}

#[tokio::test]
async fn test_escalation_increments_and_caps() {
    let manager = ServiceRecoveryManager::new(config());
    let calls = Arc::new(AtomicUsize::new(0));
    manager.register_strategy(
        &db(),
        StrategyKind::RestartConnection,
        counting_action(calls.clone(), false),
        1,
    );

    let mut levels = Vec::new();
    for _ in 0..5 {
        let recovered = manager
            .attempt_recovery(&db(), HealthStatus::Degraded)
            .await
            .unwrap();
        assert!(!recovered);
        levels.push(manager.escalation_level(&db()).unwrap());
    }
    assert_eq!(levels, vec![1, 2, 3, 3, 3]);
}

#[tokio::test]
async fn test_escalation_resets_after_success() {
    let manager = ServiceRecoveryManager::new(config());
    let healthy = Arc::new(AtomicBool::new(false));
    let flag = healthy.clone();
    manager.register_strategy(
        &db(),
        StrategyKind::ClearCache,
        Arc::new(FnAction::new(move || {
            let flag = flag.clone();
            async move {
                if flag.load(Ordering::SeqCst) {
                    RecoveryOutcome::succeeded("cache cleared")
                } else {
                    RecoveryOutcome::failed("cache unreachable")
                }
            }
        })),
        1,
    );

    manager.attempt_recovery(&db(), HealthStatus::Degraded).await.unwrap();
    manager.attempt_recovery(&db(), HealthStatus::Degraded).await.unwrap();
    assert_eq!(manager.escalation_level(&db()).unwrap(), 2);

    healthy.store(true, Ordering::SeqCst);
    assert!(manager.attempt_recovery(&db(), HealthStatus::Degraded).await.unwrap());
    assert_eq!(manager.escalation_level(&db()).unwrap(), 0);
}

#[tokio::test]
async fn test_strategies_run_in_priority_order_up_to_level() {
    let manager = ServiceRecoveryManager::new(config());
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

    for (kind, priority) in [
        (StrategyKind::RestartService, 30),
        (StrategyKind::RestartConnection, 10),
        (StrategyKind::ResetConnectionPool, 20),
        (StrategyKind::Failover, 20),
    ] {
        let order = order.clone();
        let label = kind.to_string();
        manager.register_strategy(
            &db(),
            kind,
            Arc::new(FnAction::new(move || {
                let order = order.clone();
                let label = label.clone();
                async move {
                    order.lock().push(label);
                    RecoveryOutcome::failed("no luck")
                }
            })),
            priority,
        );
    }

    let status = manager.get_recovery_status(&db()).unwrap();
    let kinds: Vec<String> = status.strategies.iter().map(|s| s.kind.to_string()).collect();
    assert_eq!(
        kinds,
        vec!["restart-connection", "reset-connection-pool", "failover", "restart-service"]
    );

    // Level 0 runs only the first strategy.
    manager.attempt_recovery(&db(), HealthStatus::Unhealthy).await.unwrap();
    assert_eq!(*order.lock(), vec!["restart-connection"]);

    // Level 1 runs the first two.
    order.lock().clear();
    manager.attempt_recovery(&db(), HealthStatus::Unhealthy).await.unwrap();
    assert_eq!(*order.lock(), vec!["restart-connection", "reset-connection-pool"]);
}

#[tokio::test]
async fn test_stops_at_first_success() {
    let manager = ServiceRecoveryManager::new(config());
    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));
    let third = Arc::new(AtomicUsize::new(0));
    manager.register_strategy(&db(), StrategyKind::RestartConnection, counting_action(first.clone(), false), 1);
    manager.register_strategy(&db(), StrategyKind::ResetConnectionPool, counting_action(second.clone(), true), 2);
    manager.register_strategy(&db(), StrategyKind::Failover, counting_action(third.clone(), true), 3);

    // The first failure raises the level so the second strategy is allowed.
    manager.attempt_recovery(&db(), HealthStatus::Unhealthy).await.unwrap();
    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 0);
    assert_eq!(manager.escalation_level(&db()).unwrap(), 1);

    assert!(manager.attempt_recovery(&db(), HealthStatus::Unhealthy).await.unwrap());
    assert_eq!(first.load(Ordering::SeqCst), 2);
    assert_eq!(second.load(Ordering::SeqCst), 1);
    assert_eq!(third.load(Ordering::SeqCst), 0);

    let status = manager.get_recovery_status(&db()).unwrap();
    assert_eq!(status.strategies[0].failure_count, 2);
    assert_eq!(status.strategies[1].success_count, 1);
    assert!(status.strategies[2].last_used.is_none());
}

#[tokio::test]
async fn test_no_strategies_is_failure() {
    let dispatcher = Arc::new(AlertDispatchEngine::new(&AlertsConfig::default()));
    let manager = ServiceRecoveryManager::new(config()).with_dispatcher(dispatcher.clone());
    manager.register_service(&db());

    assert!(!manager.attempt_recovery(&db(), HealthStatus::Unhealthy).await.unwrap());
    assert_eq!(manager.escalation_level(&db()).unwrap(), 1);

    let alerts = dispatcher.alert_history(10);
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].name, "recovery_escalated");
    assert_eq!(alerts[0].severity, AlertSeverity::High);
    assert!(!alerts[0].annotations.contains_key("requires_manual_intervention"));
}

#[tokio::test]
async fn test_escalation_alert_critical_at_max_level() {
    let dispatcher = Arc::new(AlertDispatchEngine::new(&AlertsConfig::default()));
    let manager = ServiceRecoveryManager::new(RecoveryConfig {
        max_escalation_level: 2,
        ..config()
    })
    .with_dispatcher(dispatcher.clone());
    let calls = Arc::new(AtomicUsize::new(0));
    manager.register_strategy(&db(), StrategyKind::Failover, counting_action(calls, false), 1);

    manager.attempt_recovery(&db(), HealthStatus::Unhealthy).await.unwrap();
    manager.attempt_recovery(&db(), HealthStatus::Unhealthy).await.unwrap();

    let alerts = dispatcher.alert_history(10);
    assert_eq!(alerts.len(), 2);
    assert_eq!(alerts[0].severity, AlertSeverity::High);
    assert_eq!(alerts[1].severity, AlertSeverity::Critical);
    assert_eq!(
        alerts[1].annotations.get("requires_manual_intervention").map(String::as_str),
        Some("true")
    );
}

#[tokio::test]
async fn test_cooldown_blocks_second_attempt() {
    let manager = ServiceRecoveryManager::new(RecoveryConfig {
        cooldown_secs: 300,
        ..config()
    });
    let calls = Arc::new(AtomicUsize::new(0));
    manager.register_strategy(&db(), StrategyKind::RestartConnection, counting_action(calls.clone(), false), 1);

    manager.attempt_recovery(&db(), HealthStatus::Degraded).await.unwrap();
    let second = manager.attempt_recovery(&db(), HealthStatus::Degraded).await.unwrap();

    assert!(!second);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    // Denied attempts do not escalate.
    assert_eq!(manager.escalation_level(&db()).unwrap(), 1);
    assert!(manager.get_recovery_status(&db()).unwrap().cooldown_remaining_secs.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_cooldown_expires() {
    let manager = ServiceRecoveryManager::new(RecoveryConfig {
        cooldown_secs: 60,
        ..config()
    });
    let calls = Arc::new(AtomicUsize::new(0));
    manager.register_strategy(&db(), StrategyKind::RestartConnection, counting_action(calls.clone(), false), 1);

    manager.attempt_recovery(&db(), HealthStatus::Degraded).await.unwrap();
    tokio::time::advance(Duration::from_secs(61)).await;
    manager.attempt_recovery(&db(), HealthStatus::Degraded).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_concurrent_attempts_run_once() {
    let manager = Arc::new(ServiceRecoveryManager::new(config()));
    let calls = Arc::new(AtomicUsize::new(0));
    let running = Arc::new(AtomicU32::new(0));
    let max_running = Arc::new(AtomicU32::new(0));
    let release = Arc::new(tokio::sync::Notify::new());

    {
        let calls = calls.clone();
        let running = running.clone();
        let max_running = max_running.clone();
        let release = release.clone();
        manager.register_strategy(
            &db(),
            StrategyKind::RestartConnection,
            Arc::new(FnAction::new(move || {
                let calls = calls.clone();
                let running = running.clone();
                let max_running = max_running.clone();
                let release = release.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    max_running.fetch_max(now, Ordering::SeqCst);
                    release.notified().await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    RecoveryOutcome::succeeded("restarted")
                }
            })),
            1,
        );
    }

    let first = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.attempt_recovery(&db(), HealthStatus::Degraded).await })
    };

    // Wait until the first attempt is inside the action.
    while calls.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }
    assert!(manager.get_recovery_status(&db()).unwrap().in_progress);

    let second = manager
        .attempt_recovery(&db(), HealthStatus::Degraded)
        .await
        .unwrap();
    assert!(!second);

    release.notify_one();
    assert!(first.await.unwrap().unwrap());

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(max_running.load(Ordering::SeqCst), 1);
    assert!(!manager.get_recovery_status(&db()).unwrap().in_progress);
}

#[tokio::test(start_paused = true)]
async fn test_circuit_breaker_opens_and_half_opens() {
    let manager = ServiceRecoveryManager::new(config());
    manager.init_circuit_breaker(&db(), 3, Duration::from_secs(60), 1);
    let calls = Arc::new(AtomicUsize::new(0));
    let succeed = Arc::new(AtomicBool::new(false));
    {
        let calls = calls.clone();
        let succeed = succeed.clone();
        manager.register_strategy(
            &db(),
            StrategyKind::RestartConnection,
            Arc::new(FnAction::new(move || {
                let calls = calls.clone();
                let succeed = succeed.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if succeed.load(Ordering::SeqCst) {
                        RecoveryOutcome::succeeded("reconnected")
                    } else {
                        RecoveryOutcome::failed("refused")
                    }
                }
            })),
            1,
        );
    }

    for _ in 0..3 {
        manager.attempt_recovery(&db(), HealthStatus::Unhealthy).await.unwrap();
    }
    let breaker = manager.get_recovery_status(&db()).unwrap().circuit_breaker.unwrap();
    assert_eq!(breaker.state, BreakerState::Open);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // Open: fail fast without running anything.
    assert!(!manager.attempt_recovery(&db(), HealthStatus::Unhealthy).await.unwrap());
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    tokio::time::advance(Duration::from_secs(60)).await;
    succeed.store(true, Ordering::SeqCst);

    assert!(manager.attempt_recovery(&db(), HealthStatus::Unhealthy).await.unwrap());
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    let breaker = manager.get_recovery_status(&db()).unwrap().circuit_breaker.unwrap();
    assert_eq!(breaker.state, BreakerState::Closed);
    assert_eq!(breaker.failure_count, 0);
}

/// Sets its flag when dropped.
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_half_open_trial_reopens_breaker() {
    let manager = ServiceRecoveryManager::new(config());
    manager.init_circuit_breaker(&db(), 1, Duration::from_secs(10), 1);
    let calls = Arc::new(AtomicUsize::new(0));
    let dropped = Arc::new(AtomicBool::new(false));
    {
        let calls = calls.clone();
        let dropped = dropped.clone();
        manager.register_strategy(
            &db(),
            StrategyKind::RestartConnection,
            Arc::new(FnAction::new(move || {
                let calls = calls.clone();
                let dropped = dropped.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 1 {
                        let _marker = DropFlag(dropped);
                        std::future::pending::<()>().await;
                    }
                    RecoveryOutcome::failed("refused")
                }
            })),
            1,
        );
    }

    assert!(!manager.attempt_recovery(&db(), HealthStatus::Unhealthy).await.unwrap());
    tokio::time::advance(Duration::from_secs(11)).await;

    // The half-open trial hangs and its caller gives up.
    let abandoned = tokio::time::timeout(
        Duration::from_secs(1),
        manager.attempt_recovery(&db(), HealthStatus::Unhealthy),
    )
    .await;
    assert!(abandoned.is_err());

    for _ in 0..10 {
        if dropped.load(Ordering::SeqCst) {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(dropped.load(Ordering::SeqCst), "hung action was not aborted");

    let status = manager.get_recovery_status(&db()).unwrap();
    assert!(!status.in_progress);
    assert_eq!(status.circuit_breaker.unwrap().state, BreakerState::Open);

    // Once the timeout passes again the breaker admits a new trial.
    tokio::time::advance(Duration::from_secs(11)).await;
    assert!(!manager.attempt_recovery(&db(), HealthStatus::Unhealthy).await.unwrap());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_shared_action_counts_per_strategy() {
    let manager = ServiceRecoveryManager::new(config());
    let calls = Arc::new(AtomicUsize::new(0));
    let action = counting_action(calls.clone(), false);
    manager.register_strategy(&db(), StrategyKind::RestartConnection, action.clone(), 1);
    manager.register_strategy(&db(), StrategyKind::ClearCache, action, 2);

    manager.attempt_recovery(&db(), HealthStatus::Unhealthy).await.unwrap();
    manager.attempt_recovery(&db(), HealthStatus::Unhealthy).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let status = manager.get_recovery_status(&db()).unwrap();
    assert_eq!(status.strategies[0].kind, StrategyKind::RestartConnection);
    assert_eq!(status.strategies[0].failure_count, 2);
    assert_eq!(status.strategies[1].kind, StrategyKind::ClearCache);
    assert_eq!(status.strategies[1].failure_count, 1);
}

#[tokio::test]
async fn test_unregister_service() {
    let manager = ServiceRecoveryManager::new(config());
    let calls = Arc::new(AtomicUsize::new(0));
    manager.register_strategy(
        &db(),
        StrategyKind::RestartConnection,
        counting_action(calls.clone(), true),
        1,
    );

    assert!(manager.unregister_service(&db()));
    assert!(!manager.unregister_service(&db()));
    assert!(manager.get_recovery_status(&db()).is_err());
    assert!(manager.attempt_recovery(&db(), HealthStatus::Unhealthy).await.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_auto_circuit_breaker_and_reset() {
    let manager = ServiceRecoveryManager::new(RecoveryConfig {
        auto_circuit_breaker: true,
        ..config()
    });
    manager.register_service(&db());

    for _ in 0..3 {
        manager.attempt_recovery(&db(), HealthStatus::Unhealthy).await.unwrap();
    }
    let status = manager.get_recovery_status(&db()).unwrap();
    assert_eq!(status.circuit_breaker.unwrap().state, BreakerState::Open);

    manager.reset_circuit_breaker(&db()).unwrap();
    let status = manager.get_recovery_status(&db()).unwrap();
    assert_eq!(status.circuit_breaker.unwrap().state, BreakerState::Closed);
}

#[tokio::test]
async fn test_panicking_action_is_failure() {
    let manager = ServiceRecoveryManager::new(config());
    manager.register_strategy(
        &db(),
        StrategyKind::RestartService,
        Arc::new(FnAction::new(|| async {
            if true {
                panic!("restart script missing");
            }
            RecoveryOutcome::succeeded("unreachable")
        })),
        1,
    );

    assert!(!manager.attempt_recovery(&db(), HealthStatus::Unhealthy).await.unwrap());

    let status = manager.get_recovery_status(&db()).unwrap();
    let attempt = &status.recent_attempts[0];
    assert!(!attempt.success);
    assert!(attempt.error.as_deref().unwrap().contains("restart script missing"));
    assert_eq!(status.strategies[0].failure_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_hung_action_times_out() {
    let manager = ServiceRecoveryManager::new(RecoveryConfig {
        action_timeout_secs: 5,
        ..config()
    });
    manager.register_strategy(
        &db(),
        StrategyKind::Failover,
        Arc::new(FnAction::new(|| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            RecoveryOutcome::succeeded("too late")
        })),
        1,
    );

    assert!(!manager.attempt_recovery(&db(), HealthStatus::Unhealthy).await.unwrap());

    let status = manager.get_recovery_status(&db()).unwrap();
    assert!(status.recent_attempts[0].message.contains("timed out"));
}

#[test]
fn test_services_sorted() {
    let manager = ServiceRecoveryManager::new(config());
    manager.register_service(&ServiceId::new("queue"));
    manager.register_service(&ServiceId::new("cache"));
    manager.register_service(&ServiceId::new("queue"));
    assert_eq!(
        manager.services(),
        vec![ServiceId::new("cache"), ServiceId::new("queue")]
    );
}
