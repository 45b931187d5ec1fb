//! End-to-end runs of the worker against a libsql repository and a fake agent
//!
//! Every test builds the full worker (broker, handlers, aggregation, diff,
//! notifications) and drives it through manual invocations.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use probe_agent::{
    AgentClient, AgentError, CurlRequest, CurlResponse, NetCatRequest, NetCatResponse,
    PageSpeedRequest, PageSpeedResponse, PingRequest, PingResponse, ProbeKind, TraceRouteRequest,
    TraceRouteResponse,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use uppe_orchestrator::database::{Repository, initialize_database};
use uppe_orchestrator::dispatch::InvocationDispatcher;
use uppe_orchestrator::metrics::Metrics;
use uppe_orchestrator::models::{
    InvocationPayload, PipelineConfig, ProbeOutcome, Scheduling, Step, TransitionEvent, TransitionState, Trigger,
};
use uppe_orchestrator::notify::NotificationSink;
use uppe_orchestrator::pool::open_local;
use uppe_orchestrator::registry::{DatacenterTarget, GeoLocation, StaticRegistry};
use uppe_orchestrator::store::{PipelineStore, SessionFields, StatsStore};
use uppe_orchestrator::worker::{Worker, WorkerDeps, WorkerSettings};

/// Answers every curl call with 200 unless the datacenter was taken down
#[derive(Default)]
struct FakeAgent {
    down: Mutex<HashSet<String>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl FakeAgent {
    fn take_down(&self, base_url: &str) {
        self.down.lock().unwrap().insert(base_url.to_string());
    }
}

fn unsupported() -> AgentError {
    AgentError::InvalidRequest("family not scripted".into())
}

#[async_trait]
impl AgentClient for FakeAgent {
    async fn send_curl(&self, base_url: &str, request: &CurlRequest) -> Result<CurlResponse, AgentError> {
        self.calls.lock().unwrap().push((base_url.to_string(), request.url.clone()));
        let status = if self.down.lock().unwrap().contains(base_url) { 503 } else { 200 };
        Ok(CurlResponse {
            status,
            headers: Default::default(),
            body: r#"{"token":"t-1"}"#.to_string(),
            body_encoding: Default::default(),
            time_ms: 20,
        })
    }

    async fn send_netcat(&self, _: &str, _: &NetCatRequest) -> Result<NetCatResponse, AgentError> {
        Err(unsupported())
    }

    async fn send_ping(&self, _: &str, _: &PingRequest) -> Result<PingResponse, AgentError> {
        Err(unsupported())
    }

    async fn send_trace_route(&self, _: &str, _: &TraceRouteRequest) -> Result<TraceRouteResponse, AgentError> {
        Err(unsupported())
    }

    async fn send_page_speed(&self, _: &str, _: &PageSpeedRequest) -> Result<PageSpeedResponse, AgentError> {
        Err(unsupported())
    }
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<TransitionEvent>>,
}

#[async_trait]
impl NotificationSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn deliver(&self, event: &TransitionEvent) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

fn datacenter(id: i64, title: &str) -> DatacenterTarget {
    DatacenterTarget {
        id,
        base_url: format!("http://dc{id}.agents.test:7000"),
        title: title.to_string(),
        location: GeoLocation::default(),
    }
}

fn curl_pipeline(id: i64, steps: Vec<Step>) -> PipelineConfig {
    PipelineConfig {
        kind: ProbeKind::Curl,
        steps,
        scheduling: Scheduling {
            pipeline_id: id,
            pipeline_name: format!("pipeline {id}"),
            project_id: 1,
            // Daily, so the periodic schedule stays out of the way
            duration_minutes: 1440,
            is_heart_beat: false,
            is_active: true,
            datacenter_ids: Vec::new(),
            end_at: None,
        },
    }
}

struct Running {
    repository: Arc<Repository>,
    agent: Arc<FakeAgent>,
    sink: Arc<RecordingSink>,
    dispatcher: Arc<InvocationDispatcher>,
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
    _dir: TempDir,
}

impl Running {
    async fn start(pipelines: Vec<PipelineConfig>) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("worker.db").to_string_lossy().to_string();
        let pool = open_local(&path, 4).await?;
        {
            let conn = pool.get().await?;
            initialize_database(&conn).await?;
        }
        let repository = Arc::new(Repository::new_from_pool(pool));
        for pipeline in &pipelines {
            repository.upsert_pipeline(pipeline).await?;
        }

        let agent = Arc::new(FakeAgent::default());
        let sink = Arc::new(RecordingSink::default());
        let deps = WorkerDeps {
            registry: Arc::new(StaticRegistry::new(vec![datacenter(1, "Amsterdam"), datacenter(2, "Frankfurt")])),
            pipelines: repository.clone(),
            stats: repository.clone(),
            agent: agent.clone(),
            sinks: vec![sink.clone()],
        };

        let mut settings = WorkerSettings::default();
        settings.broker.group_policy.grace_period = Duration::from_millis(20);
        settings.broker.group_policy.max_delay = Duration::from_millis(100);
        settings.maintenance_interval = Duration::from_millis(10);
        settings.server.poll_interval = Duration::from_millis(10);

        let worker = Worker::build(deps, settings, Arc::new(Metrics::new()));
        let dispatcher = worker.dispatcher();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel.clone()));

        Ok(Self { repository, agent, sink, dispatcher, cancel, handle, _dir: dir })
    }

    async fn run_manual(&self, pipeline_id: i64) -> Result<()> {
        let payload = InvocationPayload::new(pipeline_id, ProbeKind::Curl, Trigger::Manual);
        self.dispatcher.dispatch(payload).await?;
        Ok(())
    }

    async fn sessions(&self, pipeline_id: i64) -> Result<Vec<Vec<ProbeOutcome>>> {
        let ids = self.repository.read_last_n_session_ids(10, pipeline_id).await?;
        let mut sessions = Vec::new();
        for id in ids {
            sessions.push(self.repository.read_session(id, SessionFields { bodies: true }).await?);
        }
        Ok(sessions)
    }

    async fn stop(self) -> Result<()> {
        self.cancel.cancel();
        self.handle.await?;
        Ok(())
    }
}

async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

#[tokio::test]
async fn test_manual_run_persists_one_outcome_per_datacenter() -> Result<()> {
    let mut login = Step::new("login", "https://app.test/login");
    login.method = "POST".into();
    let profile = Step::new("profile", "https://app.test/me?token={{body.login.token}}");
    let running = Running::start(vec![curl_pipeline(7, vec![login, profile])]).await?;

    let r = &running;
    r.run_manual(7).await?;
    assert!(eventually(|| async move { r.sessions(7).await.is_ok_and(|s| s.first().is_some_and(|s| s.len() == 2)) }).await);

    let session = running.sessions(7).await?.remove(0);
    assert_eq!(session.iter().map(|o| o.datacenter_id).collect::<Vec<_>>(), vec![1, 2]);
    assert!(session.iter().all(|o| o.success && o.steps.len() == 2));
    assert_eq!(session[0].steps[1].url, "https://app.test/me?token=t-1");
    assert_eq!(session[0].steps[0].body.as_deref(), Some(r#"{"token":"t-1"}"#));

    let calls = running.agent.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 4);
    assert!(running.sink.events.lock().unwrap().is_empty());

    running.stop().await
}

#[tokio::test]
async fn test_regression_on_one_datacenter_notifies_down() -> Result<()> {
    let running = Running::start(vec![curl_pipeline(8, vec![Step::new("home", "https://app.test/")])]).await?;

    let r = &running;
    r.run_manual(8).await?;
    assert!(eventually(|| async move { r.sessions(8).await.is_ok_and(|s| s.len() == 1) }).await);

    r.agent.take_down("http://dc2.agents.test:7000");
    r.run_manual(8).await?;
    assert!(eventually(|| async move { !r.sink.events.lock().unwrap().is_empty() }).await);

    let event = running.sink.events.lock().unwrap()[0].clone();
    assert_eq!(event.state, TransitionState::Down);
    assert_eq!(event.pipeline_id, 8);
    assert_eq!(event.address, "https://app.test/");
    assert_eq!(event.failed_datacenters.len(), 1);
    assert_eq!(event.failed_datacenters[0].id, 2);
    assert_eq!(event.failed_datacenters[0].title.as_deref(), Some("Frankfurt"));
    assert_eq!(event.root_cause.as_deref(), Some(r#"{"home":503}"#));

    assert!(eventually(|| async move { r.sessions(8).await.is_ok_and(|s| s.len() == 2) }).await);
    running.stop().await
}

#[tokio::test]
async fn test_unresolvable_placeholder_disables_the_pipeline_and_persists_nothing() -> Result<()> {
    let steps = vec![
        Step::new("first", "https://app.test/"),
        Step::new("second", "https://app.test/{{body.missing.id}}"),
    ];
    let running = Running::start(vec![curl_pipeline(9, steps)]).await?;

    let r = &running;
    r.run_manual(9).await?;
    assert!(eventually(|| async move { r.repository.get_pipeline(9).await.is_ok_and(|p| !p.scheduling.is_active) }).await);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(running.sessions(9).await?.is_empty());
    assert!(running.repository.get_active_pipelines().await?.is_empty());

    running.stop().await
}
