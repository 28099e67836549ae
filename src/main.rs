use std::sync::Arc;

use clap::Parser;

use applyflow::cli::{Cli, Command};
use applyflow::config::ApplyflowConfig;
use applyflow::engine::ResilientClient;
use applyflow::error::ApplyflowError;
use applyflow::fetcher::ResultsFetcher;
use applyflow::metrics::Metrics;
use applyflow::poller::StatusPoller;
use applyflow::state_machine::{Application, ApplicationStatus, ReportedStatus, StateMachine};
use applyflow::store::{ApplicationStore, InMemoryStore};
use applyflow::submitter::{
    StaticProfileProvider, SubmissionInputs, SubmitOutcome, Submitter,
};
use applyflow::ui::SubmissionProgress;
use applyflow::webhook::{self, WebhookState};

struct Services {
    config: ApplyflowConfig,
    metrics: Arc<Metrics>,
    store: Arc<InMemoryStore>,
    client: Arc<ResilientClient>,
    fetcher: Arc<ResultsFetcher>,
    submitter: Arc<Submitter>,
    poller: Arc<StatusPoller>,
}

fn build_services(config: ApplyflowConfig) -> Result<Services, ApplyflowError> {
    let metrics = Metrics::new();
    let store = Arc::new(InMemoryStore::new());
    let client = Arc::new(ResilientClient::new(
        config.engine_base_url.clone(),
        config.api_key.clone(),
        config.client_config(),
        metrics.clone(),
    ));
    let fetcher = Arc::new(ResultsFetcher::new(
        client.clone(),
        store.clone(),
        metrics.clone(),
    ));
    let profiles = Arc::new(StaticProfileProvider::new(profile_inputs(&config)?));
    let submitter = Arc::new(Submitter::new(
        client.clone(),
        store.clone(),
        profiles,
        config.public_webhook_url.clone(),
        config.max_duration_seconds,
        metrics.clone(),
    ));
    let poller = Arc::new(StatusPoller::new(
        client.clone(),
        store.clone(),
        fetcher.clone(),
        config.poller_config(),
        metrics.clone(),
    ));
    Ok(Services {
        config,
        metrics,
        store,
        client,
        fetcher,
        submitter,
        poller,
    })
}

fn profile_inputs(config: &ApplyflowConfig) -> Result<SubmissionInputs, ApplyflowError> {
    let resume = match &config.profile.resume_path {
        Some(path) => {
            let contents = std::fs::read_to_string(path)?;
            serde_json::from_str(&contents)?
        }
        None => serde_json::Value::Null,
    };
    Ok(SubmissionInputs {
        full_name: config.profile.full_name.clone(),
        email: config.profile.email.clone(),
        phone: if config.profile.phone.is_empty() {
            None
        } else {
            Some(config.profile.phone.clone())
        },
        resume,
        answers: serde_json::Value::Null,
    })
}

async fn serve(services: &Services) -> anyhow::Result<()> {
    let state = WebhookState {
        store: services.store.clone(),
        fetcher: services.fetcher.clone(),
        secret: services.config.webhook_secret.clone(),
        allow_unverified: services.config.allow_unverified_webhooks,
        metrics: services.metrics.clone(),
    };
    if state.secret.is_none() && !state.allow_unverified {
        tracing::warn!(
            "no webhook secret configured, all inbound deliveries will be rejected"
        );
    }
    let router = webhook::router(state);
    let listener = tokio::net::TcpListener::bind(&services.config.listen_addr).await?;
    tracing::info!(addr = %services.config.listen_addr, "webhook server listening");
    axum::serve(listener, router).await?;
    Ok(())
}

async fn submit(services: &Services, job_url: String, job_title: String) -> anyhow::Result<()> {
    let app = Application::new(job_title.clone(), job_url);
    services.store.insert_application(app.clone()).await?;

    let progress = SubmissionProgress::start(&job_title);
    progress.update_status(ApplicationStatus::Submitting);
    let outcome = services.submitter.submit(&app.id).await?;
    progress.complete(&outcome);

    if let SubmitOutcome::Submitted { external_task_id } = outcome {
        // Foreground CLI: follow the polling channel until it resolves.
        services.poller.run(&external_task_id).await?;
    }

    let app = services.store.application(&app.id).await?;
    progress.print_application(&app);
    Ok(())
}

async fn status(services: &Services) -> anyhow::Result<()> {
    let apps = services.store.list_applications().await?;
    if apps.is_empty() {
        println!("No applications tracked.");
    }
    for app in apps {
        println!(
            "{}  {}  {}  {}",
            app.id,
            app.status,
            app.job_title,
            app.status_detail.as_deref().unwrap_or("-")
        );
    }
    println!("breaker: {:?}", services.client.breaker_state());
    println!("{:#?}", services.metrics.snapshot());
    Ok(())
}

/// Demonstração offline da máquina de estados, sem chamadas ao motor.
fn demo() {
    let progress = SubmissionProgress::start("Backend Engineer (demo)");
    let mut app = Application::new("Backend Engineer (demo)", "https://jobs.example.com/42");

    let reports = [
        ReportedStatus::Pending,
        ReportedStatus::Running,
        ReportedStatus::Completed,
        // Relatório atrasado: absorvido sem mudança de status.
        ReportedStatus::Running,
    ];
    for reported in reports {
        let outcome = StateMachine::transition(app.status, reported);
        app.status = outcome.status;
        progress.update_status(app.status);
        std::thread::sleep(std::time::Duration::from_millis(400));
    }

    progress.complete(&SubmitOutcome::Submitted {
        external_task_id: "demo-task".into(),
    });
    progress.print_application(&app);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(if cli.verbose { "debug" } else { "info" })
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = ApplyflowConfig::load()?;
    if let Some(max_retries) = cli.max_retries {
        config.max_retries = max_retries;
    }

    match cli.command {
        Command::Serve => {
            let services = build_services(config)?;
            serve(&services).await?;
        }
        Command::Submit { job_url, job_title } => {
            let services = build_services(config)?;
            submit(&services, job_url, job_title).await?;
        }
        Command::Cancel { application_id } => {
            let services = build_services(config)?;
            services.submitter.cancel(&application_id).await?;
            println!("Application {application_id} withdrawn.");
        }
        Command::Status => {
            let services = build_services(config)?;
            status(&services).await?;
        }
        Command::Demo => demo(),
    }

    Ok(())
}
