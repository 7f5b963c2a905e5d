//! End-to-end runs of the orchestrator over fakes

use std::time::Duration;

use es_hit::actors::rule_source::{RuleSource, StaticSource};
use es_hit::actors::rule_watcher::RuleWatcher;
use es_hit::orchestrator::{Orchestrator, STATIC_SOURCE};
use es_hit::rules::RuleTemplate;
use tokio::time::sleep;

use crate::helpers::*;

const TEN_SECONDS: Duration = Duration::from_secs(10);

fn template() -> RuleTemplate {
    RuleTemplate {
        index: "logs-*".to_string(),
        check_interval: TEN_SECONDS,
    }
}

fn count(lines: &[(usize, String)], line: &str) -> usize {
    lines.iter().filter(|(_, l)| l == line).count()
}

#[tokio::test(start_paused = true)]
async fn test_static_and_watched_sources_run_until_shutdown() {
    let factory = FakeSinkFactory::new();
    let mut orchestrator = Orchestrator::new(sink_settings("app"), factory.clone());

    let static_backend = FakeBackend::new().with_count("level:error", 5);
    orchestrator.add_source(
        RuleSource::Static(StaticSource::new(
            STATIC_SOURCE,
            rule_set(vec![rule("errors", "level:error", TEN_SECONDS)]),
        )),
        static_backend,
    );

    let store = FakeStore::new();
    store.push(&[("alert_cpu", "cpu:high")]);
    let kibana_backend = FakeBackend::new().with_count("cpu:high", 3);
    orchestrator.add_source(
        RuleSource::Watched(RuleWatcher::new(
            "main",
            store,
            template(),
            "alert_",
            Duration::from_secs(60),
        )),
        kibana_backend.clone(),
    );

    orchestrator
        .run(sleep(Duration::from_secs(35)))
        .await
        .unwrap();

    let lines = factory.lines();
    assert_eq!(count(&lines, "app.errors.count 5\n"), 3);
    assert_eq!(count(&lines, "app.alert_cpu.count 3\n"), 3);
    assert_eq!(kibana_backend.calls()[0].index, "logs-*");

    // the sink is closed last
    assert!(factory.connection(1).is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_sink_aborts_startup() {
    let factory = FakeSinkFactory::new();
    factory.refuse_next(100);

    let orchestrator = Orchestrator::new(sink_settings("app"), factory.clone());
    let result = orchestrator.run(std::future::pending::<()>()).await;

    let error = result.unwrap_err();
    assert!(format!("{error:#}").contains("graphite"), "{error:#}");
    assert_eq!(factory.dials(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_watcher_is_restarted() {
    let factory = FakeSinkFactory::new();
    let mut orchestrator = Orchestrator::new(sink_settings("app"), factory.clone());

    let store = FakeStore::new();
    store.panic_once();
    store.push(&[("alert_cpu", "cpu:high")]);
    let backend = FakeBackend::new().with_count("cpu:high", 1);

    orchestrator.add_source(
        RuleSource::Watched(RuleWatcher::new(
            "main",
            store.clone(),
            template(),
            "alert_",
            Duration::from_secs(60),
        )),
        backend,
    );

    // fetch panics at 0s, restarted fetch at 5s, first tick at 15s
    orchestrator
        .run(sleep(Duration::from_secs(16)))
        .await
        .unwrap();

    assert_eq!(store.fetches(), 2);
    assert_eq!(count(&factory.lines(), "app.alert_cpu.count 1\n"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_no_sources_idles_until_shutdown() {
    let factory = FakeSinkFactory::new();
    let orchestrator = Orchestrator::new(sink_settings("app"), factory.clone());

    orchestrator
        .run(sleep(Duration::from_secs(5)))
        .await
        .unwrap();

    assert_eq!(factory.dials(), 1);
    assert!(factory.lines().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_shared_sink_survives_reconnect_during_run() {
    let factory = FakeSinkFactory::new();
    let mut orchestrator = Orchestrator::new(sink_settings("app"), factory.clone());

    let backend = FakeBackend::new().with_count("q", 2);
    orchestrator.add_source(
        RuleSource::Static(StaticSource::new(
            STATIC_SOURCE,
            rule_set(vec![rule("a", "q", TEN_SECONDS), rule("b", "q", TEN_SECONDS)]),
        )),
        backend,
    );

    let breaker = {
        let factory = factory.clone();
        async move {
            sleep(Duration::from_secs(15)).await;
            factory.connection(1).break_connection();
            sleep(Duration::from_secs(20)).await;
        }
    };

    orchestrator.run(breaker).await.unwrap();

    // a and b ticked at 10/11s on the first connection; a's write at 20s hit
    // the dead socket, b (21s) and both at 30/31s went out on the new one
    assert_eq!(factory.lines_on(1).len(), 2);
    assert_eq!(factory.dials(), 2);
    assert_eq!(factory.lines_on(2).len(), 3);
    assert_eq!(factory.stale_writes(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_relay_that_stops_reading_does_not_block_shutdown() {
    let factory = FakeSinkFactory::new();
    let mut orchestrator = Orchestrator::new(sink_settings("app"), factory.clone());

    let backend = FakeBackend::new().with_count("q", 4);
    orchestrator.add_source(
        RuleSource::Static(StaticSource::new(
            STATIC_SOURCE,
            rule_set(vec![rule("a", "q", TEN_SECONDS)]),
        )),
        backend,
    );

    let staller = {
        let factory = factory.clone();
        async move {
            sleep(Duration::from_secs(15)).await;
            factory.connection(1).stall();
            sleep(Duration::from_secs(20)).await;
        }
    };

    let finished = tokio::time::timeout(Duration::from_secs(60), orchestrator.run(staller)).await;
    assert!(finished.expect("run returns").is_ok());

    // the write at 20s timed out and retired the first connection
    assert_eq!(factory.lines_on(1), vec!["app.a.count 4\n".to_string()]);
    assert_eq!(factory.dials(), 2);
    assert_eq!(factory.lines_on(2), vec!["app.a.count 4\n".to_string()]);
    assert_eq!(factory.stale_writes(), 0);
}
