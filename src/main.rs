//! Brigade server binary.

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use brigade::api::{self, AppState};
use brigade::checkpoint::DbCheckpointer;
use brigade::commis::CommisRunner;
use brigade::concierge::{BarrierManager, ConciergeService};
use brigade::config::{Config, ConfigError};
use brigade::credentials::EnvCredentialResolver;
use brigade::db::{Database, MemoryDatabase, PostgresDatabase, connect_pool, run_migrations};
use brigade::events::{CourseEventLog, EventBus};
use brigade::fiche::FicheRunner;
use brigade::jobs::build_registry;
use brigade::llm::{ChatApiProvider, LlmProvider, ScriptedLlm};
use brigade::queue::{JobQueue, QueueWorker, Scheduler};
use brigade::startup;
use brigade::tools::builtin::default_registry;
use brigade::transport::{RunnerConnectionManager, RunnerJobDispatcher, WorkerOutputBuffer};

#[derive(Parser)]
#[command(name = "brigade", about = "Fiche orchestration platform", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the server (default).
    Serve,
    /// Apply database migrations and exit.
    Migrate,
    /// Validate configuration and exit.
    CheckConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Serve);

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e @ (ConfigError::Missing(_) | ConfigError::Invalid { .. })) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(2);
        }
    };

    let result = match command {
        Command::CheckConfig => {
            println!("configuration ok");
            Ok(())
        }
        Command::Migrate => run_migrations(&config.database_url)
            .await
            .map_err(|e| anyhow::anyhow!(e)),
        Command::Serve => serve(config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);

    let db: Arc<dyn Database> = if config.memory_db {
        tracing::warn!("using the in-memory datastore; state dies with this process");
        Arc::new(MemoryDatabase::new())
    } else {
        run_migrations(&config.database_url).await?;
        Arc::new(PostgresDatabase::new(connect_pool(&config.database_url)?))
    };

    // Single-tenant installs refuse to start with extra users present.
    if config.single_tenant {
        let users = db.count_users().await?;
        if users > 1 {
            anyhow::bail!("SINGLE_TENANT=true but {users} users exist");
        }
    }

    let bus = Arc::new(EventBus::new());
    let log = Arc::new(CourseEventLog::new(Arc::clone(&db), Arc::clone(&bus)));

    // Error events (dead-lettered jobs, failed chains) surface in the
    // server log; alert delivery hangs off this same topic.
    bus.subscribe(brigade::events::EventType::Error, |payload| async move {
        tracing::warn!(payload = %payload, "platform error event");
        Ok(())
    })
    .await;

    startup::recover(&db, &log).await?;

    let connections = Arc::new(RunnerConnectionManager::new());
    let dispatcher = Arc::new(RunnerJobDispatcher::new(
        Arc::clone(&db),
        Arc::clone(&connections),
    ));
    let output_buffer = Arc::new(WorkerOutputBuffer::new());

    let llm: Arc<dyn LlmProvider> = match &config.llm_api_key {
        Some(key) => Arc::new(ChatApiProvider::new(
            config.llm_base_url.clone(),
            key.clone(),
            config.llm_model.clone(),
        )?),
        None if config.memory_db => {
            tracing::warn!("no LLM_API_KEY; using the scripted dev provider");
            Arc::new(ScriptedLlm::respond_with("No model is configured on this install."))
        }
        None => anyhow::bail!("LLM_API_KEY is required outside memory-db mode"),
    };

    let tools = Arc::new(default_registry());
    let checkpointer = Arc::new(DbCheckpointer::new(Arc::clone(&db)));
    let runner = Arc::new(
        FicheRunner::new(Arc::clone(&tools), llm, checkpointer)
            .with_token_stream(config.llm_token_stream),
    );

    let queue = Arc::new(JobQueue::new(Arc::clone(&db)));
    let credentials: Arc<dyn brigade::credentials::CredentialResolver> =
        Arc::new(EnvCredentialResolver);

    let concierge = Arc::new(
        ConciergeService::new(
            Arc::clone(&db),
            Arc::clone(&log),
            Arc::clone(&runner),
            Arc::clone(&queue),
            config.llm_model.clone(),
        )
        .with_credentials(credentials.clone())
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
        .with_credentials(credentials.clone())
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

    let scheduler = Arc::new(
        Scheduler::new(Arc::clone(&queue), Arc::clone(&registry)).with_backfill_window(
            chrono::Duration::from_std(config.backfill_window)
                .unwrap_or_else(|_| chrono::Duration::hours(6)),
        ),
    );
    scheduler.backfill_missed(chrono::Utc::now()).await?;
    tokio::spawn(Arc::clone(&scheduler).run());

    let lease = chrono::Duration::from_std(config.queue_lease)
        .unwrap_or_else(|_| chrono::Duration::seconds(60));
    for n in 0..config.queue_workers {
        let worker = Arc::new(QueueWorker::new(
            format!("worker-{n}"),
            Arc::clone(&queue),
            Arc::clone(&registry),
            credentials.clone(),
            Arc::clone(&bus),
            lease,
        ));
        tokio::spawn(worker.run());
    }

    let state = AppState {
        config: Arc::clone(&config),
        db,
        bus,
        log,
        queue,
        registry,
        scheduler,
        concierge,
        barrier,
        connections,
        dispatcher,
        output_buffer,
    };

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!("brigade listening on {}", config.bind_addr);
    axum::serve(listener, api::router(state)).await?;
    Ok(())
}
