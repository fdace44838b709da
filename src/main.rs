use std::sync::Arc;

use octocrab::Octocrab;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use depflow::backflow::BackflowStatusCalculator;
use depflow::codeflow::GitCodeFlower;
use depflow::config::ServiceConfig;
use depflow::git::LocalGit;
use depflow::github::{GitHubHost, GitHubRemoteFactory};
use depflow::remote::{RetryConfig, StoredRegistry};
use depflow::server::{AppState, build_router};
use depflow::store::FileStore;
use depflow::updater::UpdaterServices;
use depflow::worker::{Dispatcher, ReminderPoller, WorkItemProcessor};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "depflow=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServiceConfig::from_env();
    tracing::info!(state_dir = %config.state_dir.display(), vmr = %config.vmr_path.display(), "Starting");

    let store = Arc::new(FileStore::open(&config.state_dir)?);
    let host = match &config.github_token {
        Some(token) => GitHubHost::from_token(token.clone())?,
        None => {
            tracing::warn!("DEPFLOW_GITHUB_TOKEN is not set; GitHub calls are unauthenticated");
            GitHubHost::new(Octocrab::builder().build()?)
        }
    };
    let remotes = Arc::new(GitHubRemoteFactory::new(host));
    let registry = Arc::new(StoredRegistry::new(store.clone()));
    let git = Arc::new(LocalGit::new(config.commit_identity.clone(), config.github_token.clone()));
    let flower = Arc::new(GitCodeFlower::new(git.clone(), &config.vmr_path, &config.clones_dir));

    let services = Arc::new(UpdaterServices::new(
        store.clone(),
        remotes.clone(),
        registry.clone(),
        flower,
        git.clone(),
        config.updater,
    ));
    let backflow = BackflowStatusCalculator::new(registry.clone(), remotes, git, store.clone(), &config.vmr_path);
    let processor = Arc::new(WorkItemProcessor::new(services, backflow));

    let shutdown = CancellationToken::new();
    let dispatcher = Arc::new(Dispatcher::new(processor, RetryConfig::DEFAULT, shutdown.child_token()));

    let poller = ReminderPoller::new(store.clone(), dispatcher.clone(), config.reminder_poll_interval);
    let poller_task = tokio::spawn(poller.run(shutdown.child_token()));

    let app = build_router(AppState::new(store, registry, dispatcher.clone()));
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tracing::info!("listening on {}", config.listen_addr);

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    dispatcher.shutdown_all().await;
    if let Err(e) = poller_task.await {
        tracing::warn!(error = %e, "Reminder poller ended abnormally");
    }
    tracing::info!("Shut down");
    Ok(())
}
