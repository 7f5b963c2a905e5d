//! Wires the sources, supervisors and the sink together and runs them
//!
//! ## Supervision
//!
//! | task             | on panic                                   |
//! |------------------|--------------------------------------------|
//! | PollLoop         | restarted by its QuerySupervisor           |
//! | RuleWatcher      | restarted after [`RESTART_DELAY`]          |
//! | QuerySupervisor  | fatal                                      |
//! | SinkSupervisor   | fatal                                      |
//!
//! A fatal failure cancels the root token, waits for every other task to
//! drain and makes [`Orchestrator::run`] return an error.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::actors::query_supervisor::QuerySupervisor;
use crate::actors::rule_source::{RuleSource, StaticSource};
use crate::actors::rule_watcher::RuleWatcher;
use crate::actors::sink_supervisor::{SinkSettings, SinkSupervisor};
use crate::backend::{QueryBackend, SinkConnectionFactory};
use crate::config::Config;
use crate::elastic::{ElasticBackend, KibanaStore};
use crate::graphite::GraphiteDialer;
use crate::rules::{Rule, RuleSet, RuleTemplate};
use crate::util::{RESTART_DELAY, TaskEnd, guarded, supervise};

/// Name of the single source built from the static rules
pub const STATIC_SOURCE: &str = "static";

pub struct Orchestrator {
    sink_settings: SinkSettings,
    sink_factory: Arc<dyn SinkConnectionFactory>,
    sources: Vec<(RuleSource, Arc<dyn QueryBackend>)>,
}

impl Orchestrator {
    pub fn new(sink_settings: SinkSettings, sink_factory: Arc<dyn SinkConnectionFactory>) -> Self {
        Self {
            sink_settings,
            sink_factory,
            sources: Vec::new(),
        }
    }

    /// Build every enabled source from the configuration
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let mut orchestrator = Self::new(
            SinkSettings::from(&config.graphite),
            Arc::new(GraphiteDialer),
        );

        let static_rules: Vec<Rule> = config
            .enabled_static_rules()
            .map(|rule| Rule {
                name: rule.name.clone(),
                query: rule.pattern.clone(),
                index: rule.index.clone(),
                check_interval: rule.check_every,
            })
            .collect();

        if !static_rules.is_empty() {
            let es = config
                .elasticsearch
                .as_ref()
                .context("static rules need an [elasticsearch] section")?;
            let backend = ElasticBackend::from_config(es)
                .context("failed to build the elasticsearch client")?;

            info!("{} static rules against {}", static_rules.len(), es.url);
            orchestrator.add_source(
                RuleSource::Static(StaticSource::new(STATIC_SOURCE, RuleSet::new(static_rules))),
                Arc::new(backend),
            );
        }

        for kibana in config.enabled_kibanas() {
            let store = KibanaStore::from_config(kibana)
                .with_context(|| format!("failed to build the store for kibana {:?}", kibana.name))?;
            let backend = ElasticBackend::for_kibana(kibana).with_context(|| {
                format!("failed to build the backend for kibana {:?}", kibana.name)
            })?;

            let template = RuleTemplate {
                index: kibana.index.clone(),
                check_interval: kibana.check_every,
            };
            let watcher = RuleWatcher::new(
                kibana.name.clone(),
                Arc::new(store),
                template,
                kibana.should_prefix_with.clone(),
                kibana.watch_interval,
            );

            info!("watching kibana {:?} at {}", kibana.name, kibana.kibana_es_url);
            orchestrator.add_source(RuleSource::Watched(watcher), Arc::new(backend));
        }

        if orchestrator.sources.is_empty() {
            warn!("no static rule or kibana is enabled, nothing will be counted");
        }

        Ok(orchestrator)
    }

    pub fn add_source(&mut self, source: RuleSource, backend: Arc<dyn QueryBackend>) {
        self.sources.push((source, backend));
    }

    /// Run until `shutdown` resolves or a fatal task failure occurs
    ///
    /// The sink is stopped last, after every query supervisor has drained.
    pub async fn run<S>(self, shutdown: S) -> anyhow::Result<()>
    where
        S: Future<Output = ()>,
    {
        let root = CancellationToken::new();
        let sink_cancel = CancellationToken::new();

        let (sink_actor, sink) =
            SinkSupervisor::bootstrap(self.sink_settings, self.sink_factory, sink_cancel.clone())
                .await
                .context("failed to connect to graphite")?;

        let mut sink_task = tokio::spawn(guarded("sink-supervisor", sink_actor.run()));
        let mut sink_done = false;

        let mut tasks: JoinSet<TaskEnd> = JoinSet::new();

        // static sources hold their mailbox senders for the whole run
        let mut static_sources = Vec::new();

        for (source, backend) in self.sources {
            let name = source.name().to_string();
            let supervisor = QuerySupervisor::new(
                name.clone(),
                backend,
                sink.clone(),
                source.subscribe(),
                root.child_token(),
            );
            tasks.spawn(guarded(format!("query-supervisor:{name}"), supervisor.run()));

            match source {
                RuleSource::Static(source) => static_sources.push(source),
                RuleSource::Watched(watcher) => {
                    let watcher = Arc::new(watcher);
                    let cancel = root.child_token();
                    let task_name = format!("rule-watcher:{name}");

                    tasks.spawn(guarded(task_name.clone(), async move {
                        supervise(&task_name, cancel.clone(), RESTART_DELAY, || {
                            let watcher = watcher.clone();
                            let cancel = cancel.clone();
                            async move { watcher.run(cancel).await }
                        })
                        .await
                    }));
                }
            }
        }

        info!("agent running");

        tokio::pin!(shutdown);
        let mut failure: Option<TaskEnd> = None;

        loop {
            if root.is_cancelled() && tasks.is_empty() {
                break;
            }

            tokio::select! {
                _ = &mut shutdown, if !root.is_cancelled() => {
                    info!("shutdown requested");
                    root.cancel();
                }

                joined = &mut sink_task, if !sink_done => {
                    sink_done = true;
                    let end = joined.unwrap_or_else(|e| TaskEnd {
                        name: "sink-supervisor".to_string(),
                        panic: Some(e.to_string()),
                    });
                    // the sink only stops on its own when something went wrong
                    on_fatal(&root, &mut failure, end);
                }

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    match joined {
                        Ok(end) if end.panic.is_some() => on_fatal(&root, &mut failure, end),
                        Ok(end) => {
                            debug!(task = %end.name, "task finished");
                            if !root.is_cancelled() {
                                warn!(task = %end.name, "task finished before shutdown");
                            }
                        }
                        Err(e) => on_fatal(&root, &mut failure, TaskEnd {
                            name: "unknown".to_string(),
                            panic: Some(e.to_string()),
                        }),
                    }
                }
            }
        }

        drop(static_sources);

        sink_cancel.cancel();
        if !sink_done && let Ok(end) = sink_task.await && end.panic.is_some() {
            failure.get_or_insert(end);
        }

        match failure {
            Some(TaskEnd { name, panic }) => Err(anyhow!(
                "task {name} failed: {}",
                panic.unwrap_or_else(|| "stopped unexpectedly".to_string())
            )),
            None => {
                info!("shutdown complete, {:?}", sink.stats());
                Ok(())
            }
        }
    }
}

fn on_fatal(root: &CancellationToken, failure: &mut Option<TaskEnd>, end: TaskEnd) {
    match &end.panic {
        Some(message) => error!(task = %end.name, "fatal task failure: {message}"),
        None => error!(task = %end.name, "task stopped unexpectedly"),
    }
    root.cancel();
    failure.get_or_insert(end);
}
