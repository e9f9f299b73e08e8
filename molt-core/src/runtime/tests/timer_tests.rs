use super::*;
use std::time::Duration;

#[test]
fn test_registry_assigns_stable_ids_by_identity() {
    let mut registry: TimerCallbackRegistry<()> = TimerCallbackRegistry::new();
    let first: TimerCallback<()> = Arc::new(|_ctx, _ts| Ok(()));
    let second: TimerCallback<()> = Arc::new(|_ctx, _ts| Ok(()));

    let id_first = registry.register(&first);
    let id_second = registry.register(&second);
    assert_ne!(id_first, id_second);

    // Re-registering the same callback object keeps its id.
    assert_eq!(registry.register(&first), id_first);
    assert_eq!(registry.len(), 2);
    assert!(registry.get(id_first).is_some());
    assert!(registry.get(99).is_none());
}

#[test]
fn test_timer_fires_with_processing_timestamp() {
    let service = SystemTimerService::new("fires");
    let (tx, rx) = crossbeam_channel::bounded(1);
    let before = current_processing_time_ms();
    service
        .register_timer(Duration::from_millis(5), move |ts| {
            tx.send(ts).unwrap();
        })
        .unwrap();

    let fired_at = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(fired_at >= before);
    service.shutdown(Duration::from_secs(5));
}

#[test]
fn test_timers_fire_in_deadline_order() {
    let service = SystemTimerService::new("order");
    let (tx, rx) = crossbeam_channel::unbounded();
    {
        let tx = tx.clone();
        service
            .register_timer(Duration::from_millis(60), move |_| {
                tx.send("late").unwrap();
            })
            .unwrap();
    }
    service
        .register_timer(Duration::from_millis(5), move |_| {
            tx.send("early").unwrap();
        })
        .unwrap();

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "early");
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "late");
    service.shutdown(Duration::from_secs(5));
}

#[test]
fn test_quiesce_drops_pending_timers_and_rejects_new_ones() {
    let service = SystemTimerService::new("quiesce");
    let (tx, rx) = crossbeam_channel::bounded::<&str>(1);
    service
        .register_timer(Duration::from_secs(60), move |_| {
            tx.send("must not fire").unwrap();
        })
        .unwrap();

    let quiesced = service.quiesce();
    assert!(quiesced.wait_timeout(Duration::from_secs(5)));
    assert!(service.register_timer(Duration::from_millis(1), |_| {}).is_err());
    assert!(rx.try_recv().is_err());
    service.shutdown(Duration::from_secs(5));
}

#[test]
fn test_shutdown_terminates_the_helper_thread() {
    let service = SystemTimerService::new("shutdown");
    assert!(!service.is_terminated());
    assert!(service.shutdown(Duration::from_secs(5)));
    assert!(service.is_terminated());
}
