use std::io;
use std::sync::Arc;

use memory_worker_config::{load_fallback_provider_config, load_provider_config};
use memory_worker_core::{SessionDriver, SessionState};
use memory_worker_model::ProviderClient;
use memory_worker_protocol::{ObservationMode, PendingMessage};
use memory_worker_store::ObservationStore;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod session;

use session::load_session_settings;

const DEFAULT_LOG_FILTER: &str = "info,hyper=warn,reqwest=warn";

fn main() -> io::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(run());
    // stdin is read on a blocking thread that may never see EOF.
    runtime.shutdown_background();
    result
}

async fn run() -> io::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let primary = load_provider_config().map_err(invalid_input)?;
    let fallback = load_fallback_provider_config().map_err(invalid_input)?;
    let settings = load_session_settings(&|key: &str| std::env::var(key).ok()).map_err(invalid_input)?;
    let store = ObservationStore::new(settings.store_dir.clone())
        .map_err(|err| io::Error::other(err.to_string()))?;

    info!(
        provider = primary.provider_name.as_str(),
        model = primary.model.as_str(),
        fallback = fallback.as_ref().map(|config| config.provider_name.as_str()),
        store_dir = %store.root_dir().display(),
        "memory worker configured"
    );

    let mut driver = SessionDriver::new(
        Arc::new(ProviderClient::new(primary)),
        Arc::new(store),
        ObservationMode::default(),
    );
    if let Some(fallback) = fallback {
        driver = driver.with_fallback(Arc::new(ProviderClient::new(fallback)));
    }

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling session");
            interrupt.cancel();
        }
    });

    let (message_tx, mut message_rx) = mpsc::channel::<PendingMessage>(128);
    let stdin_task = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let message = match serde_json::from_str::<PendingMessage>(&line) {
                Ok(message) => message,
                Err(err) => {
                    warn!(error = %err, raw = line.as_str(), "invalid pending message json");
                    continue;
                }
            };
            if message_tx.send(message).await.is_err() {
                break;
            }
        }
        Ok::<(), io::Error>(())
    });

    let mut state = SessionState::new(
        settings.session_id,
        settings.project,
        settings.user_prompt,
        settings.prompt_number,
    );
    let outcome = driver.run(&mut state, &mut message_rx, &cancel).await;
    stdin_task.abort();

    let report = match outcome {
        Ok(report) => report,
        Err(err) => {
            error!(session_id = state.session_id.as_str(), error = %err, "memory session failed");
            return Err(io::Error::other(err.to_string()));
        }
    };

    let line = serde_json::to_string(&report)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;
    Ok(())
}

fn invalid_input(err: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, err.to_string())
}
