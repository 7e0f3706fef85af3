use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use audrey::config::{Config, is_valid_feed_name};
use audrey::controller::Controller;
use audrey::feed::FeedEndpoint;
use audrey::queue::DirQueue;
use audrey::worker::ControlEvent;

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Run the pipeline until Ctrl+C, SIGTERM or a dead worker
pub async fn run(config: Config) -> Result<(), AnyError> {
    let mut controller = Controller::from_config(&config)?;
    controller.start()?;
    info!(
        working_dir = %controller.working_dir().display(),
        feeds = config.feeds.len(),
        "Audrey running"
    );
    println!("Press Enter after loading a blank disc.");

    let mut confirmations = stdin_lines();
    let mut ticker = tokio::time::interval(config.controller.pump_interval.as_duration());
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut last_status = String::new();
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            Some(()) = confirmations.recv() => {
                controller.push_event(ControlEvent::DISC_LOADED);
            }
            _ = ticker.tick() => {
                match controller.pump() {
                    Ok(status) if status != last_status => {
                        println!("\n{}", status);
                        last_status = status;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "Pipeline stopped");
                        return Err(e.into());
                    }
                }
            }
        }
    }

    controller.shutdown();
    info!("Audrey stopped");
    Ok(())
}

/// Write (or overwrite) an endpoint's URL file
pub fn add_feed(config: &Config, name: &str, url: &str) -> Result<(), AnyError> {
    if !is_valid_feed_name(name) {
        return Err(format!("invalid feed name '{}'", name).into());
    }
    reqwest::Url::parse(url).map_err(|e| format!("invalid feed url '{}': {}", url, e))?;

    let queue = DirQueue::open(config.resolved_working_dir())?;
    FeedEndpoint::write_url(&queue, name, url)?;
    println!("Added feed {} -> {}", name, url);
    Ok(())
}

/// One message per line typed on stdin
fn stdin_lines() -> mpsc::UnboundedReceiver<()> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(_)) => {
                    if tx.send(()).is_err() {
                        return;
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "Stopped reading stdin");
                    return;
                }
            }
        }
    });
    rx
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
