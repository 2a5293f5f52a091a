//! Shared test harness: a fully wired platform over the in-memory
//! datastore and a scripted model.

use std::sync::Arc;

use brigade::api::{self, AppState};
use brigade::checkpoint::MemoryCheckpointer;
use brigade::commis::CommisRunner;
use brigade::concierge::{BarrierManager, ConciergeService};
use brigade::config::Config;
use brigade::credentials::StaticCredentials;
use brigade::db::{Database, MemoryDatabase};
use brigade::events::{CourseEventLog, EventBus};
use brigade::fiche::FicheRunner;
use brigade::jobs::build_registry;
use brigade::llm::{ScriptedLlm, ScriptedTurn};
use brigade::models::{User, UserRole};
use brigade::queue::{JobQueue, JobRegistry, QueueWorker, Scheduler};
use brigade::tools::builtin::default_registry;
use brigade::transport::{RunnerConnectionManager, RunnerJobDispatcher, WorkerOutputBuffer};

pub struct Harness {
    pub db: Arc<dyn Database>,
    pub bus: Arc<EventBus>,
    pub log: Arc<CourseEventLog>,
    pub queue: Arc<JobQueue>,
    pub registry: Arc<JobRegistry>,
    pub concierge: Arc<ConciergeService>,
    pub barrier: Arc<BarrierManager>,
    pub worker: Arc<QueueWorker>,
    pub connections: Arc<RunnerConnectionManager>,
    pub dispatcher: Arc<RunnerJobDispatcher>,
    pub output_buffer: Arc<WorkerOutputBuffer>,
    pub scheduler: Arc<Scheduler>,
    pub config: Arc<Config>,
}

impl Harness {
    /// Wire the whole platform around one scripted model.
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self::with_config(turns, Config::for_tests())
    }

    pub fn with_config(turns: Vec<ScriptedTurn>, config: Config) -> Self {
        let config = Arc::new(config);
        let db: Arc<dyn Database> = Arc::new(MemoryDatabase::new());
        let bus = Arc::new(EventBus::new());
        let log = Arc::new(CourseEventLog::new(Arc::clone(&db), Arc::clone(&bus)));

        let connections = Arc::new(RunnerConnectionManager::new());
        let dispatcher = Arc::new(RunnerJobDispatcher::with_grace(
            Arc::clone(&db),
            Arc::clone(&connections),
            std::time::Duration::from_millis(20),
        ));
        let output_buffer = Arc::new(WorkerOutputBuffer::new());

        let tools = Arc::new(default_registry());
        let runner = Arc::new(FicheRunner::new(
            tools,
            Arc::new(ScriptedLlm::new(turns)),
            Arc::new(MemoryCheckpointer::new()),
        ));

        let queue = Arc::new(JobQueue::new(Arc::clone(&db)));
        let credentials: Arc<dyn brigade::credentials::CredentialResolver> =
            Arc::new(StaticCredentials::new());

        let concierge = Arc::new(
            ConciergeService::new(
                Arc::clone(&db),
                Arc::clone(&log),
                Arc::clone(&runner),
                Arc::clone(&queue),
                "scripted",
            )
            .with_credentials(Arc::clone(&credentials))
            .with_dispatcher(Arc::clone(&dispatcher))
            .with_output_buffer(Arc::clone(&output_buffer)),
        );
        let barrier = Arc::new(BarrierManager::new(Arc::clone(&db), Arc::clone(&log)));

        let commis_runner = Arc::new(
            CommisRunner::new(
                Arc::clone(&db),
                Arc::clone(&log),
                Arc::clone(&runner),
                Arc::clone(&barrier),
                Arc::clone(&concierge),
            )
            .with_credentials(Arc::clone(&credentials))
            .with_dispatcher(Arc::clone(&dispatcher))
            .with_output_buffer(Arc::clone(&output_buffer)),
        );

        let registry = Arc::new(build_registry(
            Arc::clone(&db),
            Arc::clone(&queue),
            Arc::clone(&bus),
            Arc::clone(&concierge),
            commis_runner,
        ));

        let worker = Arc::new(QueueWorker::new(
            "test-worker",
            Arc::clone(&queue),
            Arc::clone(&registry),
            credentials,
            Arc::clone(&bus),
            chrono::Duration::seconds(60),
        ));

        let scheduler = Arc::new(Scheduler::new(Arc::clone(&queue), Arc::clone(&registry)));

        Self {
            db,
            bus,
            log,
            queue,
            registry,
            concierge,
            barrier,
            worker,
            connections,
            dispatcher,
            output_buffer,
            scheduler,
            config,
        }
    }

    pub async fn user(&self, email: &str) -> User {
        self.db
            .create_user(email, None, UserRole::User)
            .await
            .unwrap()
    }

    pub async fn admin(&self, email: &str) -> User {
        self.db
            .create_user(email, None, UserRole::Admin)
            .await
            .unwrap()
    }

    /// Drain the queue until no entry is due.
    pub async fn drain_queue(&self) {
        while self.worker.run_once().await.unwrap() {}
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            config: Arc::clone(&self.config),
            db: Arc::clone(&self.db),
            bus: Arc::clone(&self.bus),
            log: Arc::clone(&self.log),
            queue: Arc::clone(&self.queue),
            registry: Arc::clone(&self.registry),
            scheduler: Arc::clone(&self.scheduler),
            concierge: Arc::clone(&self.concierge),
            barrier: Arc::clone(&self.barrier),
            connections: Arc::clone(&self.connections),
            dispatcher: Arc::clone(&self.dispatcher),
            output_buffer: Arc::clone(&self.output_buffer),
        }
    }

    pub fn router(&self) -> axum::Router {
        api::router(self.app_state())
    }

    /// Poll until the predicate holds or the deadline passes.
    pub async fn wait_until<F, Fut>(&self, mut predicate: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if predicate().await {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("condition not reached within deadline");
    }
}
