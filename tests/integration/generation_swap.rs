//! Generation swaps: diffing, schedule carry-over and non-overlap

use std::time::Duration;

use es_hit::mailbox::mailbox;
use es_hit::rules::RuleSet;
use tokio::time::{Instant, sleep};

use crate::helpers::*;

const TEN_SECONDS: Duration = Duration::from_secs(10);

fn assert_evenly_spaced(offsets: &[Duration], period: Duration) {
    for pair in offsets.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(
            gap >= period && gap < period + Duration::from_millis(50),
            "uneven gap {gap:?} in {offsets:?}"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_removed_rule_stops_and_kept_rule_keeps_its_cadence() {
    let factory = FakeSinkFactory::new();
    let (sink, sink_cancel, _) = start_sink(sink_settings("app"), factory.clone()).await;
    let backend = FakeBackend::new();
    let (tx, rx) = mailbox();

    let start = Instant::now();
    tx.publish(rule_set(vec![
        rule("alert_cpu", "q1", TEN_SECONDS),
        rule("alert_mem", "q2", TEN_SECONDS),
    ]));
    let (cancel, task) = spawn_supervisor(backend.clone(), sink, rx);

    sleep(Duration::from_secs(25)).await;
    tx.publish(rule_set(vec![rule("alert_cpu", "q1", TEN_SECONDS)]));
    sleep(Duration::from_secs(30)).await;

    let cpu = offsets(start, &backend.calls_for("q1"));
    let mem = offsets(start, &backend.calls_for("q2"));

    assert_eq!(cpu.len(), 5, "cpu ticks at 10..=50s: {cpu:?}");
    assert_evenly_spaced(&cpu, TEN_SECONDS);

    // staggered one second behind cpu, and nothing after the swap at 25s
    assert_eq!(mem, vec![Duration::from_secs(11), Duration::from_secs(21)]);

    cancel.cancel();
    task.await.unwrap();
    sink_cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_identical_set_does_not_restart_loops() {
    let factory = FakeSinkFactory::new();
    let (sink, sink_cancel, _) = start_sink(sink_settings("app"), factory.clone()).await;
    let backend = FakeBackend::new().with_count("qa", 3);
    backend.set_delay(Duration::from_secs(3), 1);
    let (tx, rx) = mailbox();

    let set = rule_set(vec![rule("a", "qa", TEN_SECONDS)]);
    tx.publish(set.clone());
    let (cancel, task) = spawn_supervisor(backend.clone(), sink, rx);

    // the first query is in flight from 10s to 13s
    sleep(Duration::from_secs(11)).await;
    tx.publish(set.clone());
    sleep(Duration::from_secs(3)).await;

    assert_eq!(backend.calls().len(), 1, "no re-run after a no-op publish");
    assert_eq!(backend.completed(), 1, "in-flight query was not interrupted");
    assert_eq!(factory.lines_on(1), vec!["app.a.count 3\n".to_string()]);

    cancel.cancel();
    task.await.unwrap();
    sink_cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_swap_mid_query_reruns_the_interrupted_tick_once() {
    let factory = FakeSinkFactory::new();
    let (sink, sink_cancel, _) = start_sink(sink_settings("app"), factory.clone()).await;
    let backend = FakeBackend::new().with_count("qa", 1);
    backend.set_delay(Duration::from_secs(3), 1);
    let (tx, rx) = mailbox();

    let start = Instant::now();
    tx.publish(rule_set(vec![
        rule("a", "qa", TEN_SECONDS),
        rule("b", "qb", TEN_SECONDS),
    ]));
    let (cancel, task) = spawn_supervisor(backend.clone(), sink, rx);

    // a's first query starts at 10s; b changes while it is in flight
    sleep(Duration::from_millis(10_500)).await;
    tx.publish(rule_set(vec![
        rule("a", "qa", TEN_SECONDS),
        rule("b", "qb AND status:500", TEN_SECONDS),
    ]));
    sleep(Duration::from_millis(1_500)).await;

    let runs = offsets(start, &backend.calls_for("qa"));
    assert_eq!(runs.len(), 2, "interrupted tick re-ran exactly once: {runs:?}");
    assert_eq!(runs[0], TEN_SECONDS);
    assert_eq!(factory.lines_on(1), vec!["app.a.count 1\n".to_string()]);

    // the changed rule counts as new and starts a full interval out
    assert!(backend.calls_for("qb").is_empty());
    assert!(backend.calls_for("qb AND status:500").is_empty());

    sleep(Duration::from_secs(10)).await;
    assert_eq!(backend.calls_for("qb AND status:500").len(), 1);
    assert_eq!(backend.calls_for("qa").len(), 3);

    cancel.cancel();
    task.await.unwrap();
    sink_cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_generations_never_overlap() {
    let factory = FakeSinkFactory::new();
    let (sink, sink_cancel, _) = start_sink(sink_settings("app"), factory.clone()).await;
    let backend = FakeBackend::new();
    backend.set_delay(Duration::from_millis(1_500), usize::MAX);
    let (tx, rx) = mailbox();

    let interval = Duration::from_secs(2);
    tx.publish(rule_set(vec![rule("a", "qa", interval), rule("b", "x", interval)]));
    let (cancel, task) = spawn_supervisor(backend.clone(), sink, rx);

    for i in 0..40 {
        sleep(Duration::from_millis(700)).await;
        let query = if i % 2 == 0 { "y" } else { "x" };
        tx.publish(rule_set(vec![rule("a", "qa", interval), rule("b", query, interval)]));
    }
    sleep(Duration::from_secs(5)).await;

    assert!(!backend.calls_for("qa").is_empty());
    assert_eq!(backend.max_in_flight("idx-a"), 1);
    assert!(backend.max_in_flight("idx-b") <= 1);

    cancel.cancel();
    task.await.unwrap();
    sink_cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_new_rules_are_staggered() {
    let factory = FakeSinkFactory::new();
    let (sink, sink_cancel, _) = start_sink(sink_settings("app"), factory.clone()).await;
    let backend = FakeBackend::new();
    let (tx, rx) = mailbox();

    let start = Instant::now();
    tx.publish(rule_set(vec![
        rule("r0", "q0", TEN_SECONDS),
        rule("r1", "q1", TEN_SECONDS),
        rule("r2", "q2", TEN_SECONDS),
    ]));
    let (cancel, task) = spawn_supervisor(backend.clone(), sink, rx);

    sleep(Duration::from_millis(12_500)).await;

    let firsts: Vec<_> = ["q0", "q1", "q2"]
        .iter()
        .map(|q| offsets(start, &backend.calls_for(q))[0])
        .collect();
    assert_eq!(
        firsts,
        vec![
            Duration::from_secs(10),
            Duration::from_secs(11),
            Duration::from_secs(12)
        ]
    );

    cancel.cancel();
    task.await.unwrap();
    sink_cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_empty_set_stops_every_loop() {
    let factory = FakeSinkFactory::new();
    let (sink, sink_cancel, _) = start_sink(sink_settings("app"), factory.clone()).await;
    let backend = FakeBackend::new();
    let (tx, rx) = mailbox();

    tx.publish(rule_set(vec![rule("a", "qa", TEN_SECONDS)]));
    let (cancel, task) = spawn_supervisor(backend.clone(), sink, rx);

    sleep(Duration::from_secs(11)).await;
    tx.publish(RuleSet::default());
    sleep(Duration::from_secs(30)).await;

    assert_eq!(backend.calls().len(), 1);

    cancel.cancel();
    task.await.unwrap();
    sink_cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_closed_mailbox_keeps_active_generation() {
    let factory = FakeSinkFactory::new();
    let (sink, sink_cancel, _) = start_sink(sink_settings("app"), factory.clone()).await;
    let backend = FakeBackend::new();
    let (tx, rx) = mailbox();

    tx.publish(rule_set(vec![rule("a", "qa", TEN_SECONDS)]));
    let (cancel, task) = spawn_supervisor(backend.clone(), sink, rx);

    sleep(Duration::from_secs(1)).await;
    drop(tx);
    sleep(Duration::from_secs(20)).await;

    assert_eq!(backend.calls().len(), 2);

    cancel.cancel();
    task.await.unwrap();
    sink_cancel.cancel();
}
