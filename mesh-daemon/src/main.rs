// PeerMesh Linux daemon: control socket, discovery and peer sessions.

mod config;
mod control;
mod http;
mod tcp;

use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> Result<(), Box<dyn std::error::Error>> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("mesh-daemon {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load();
    let daemon = control::Daemon::new(cfg);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let server = tokio::spawn(daemon.clone().serve());
        tokio::select! {
            r = server => match r {
                Ok(Err(e)) => tracing::error!("control socket failed: {:#}", e),
                Err(e) => tracing::error!("control socket task failed: {}", e),
                Ok(Ok(())) => {}
            },
            _ = daemon.stopped() => {}
            r = shutdown_signal() => r?,
        }
        daemon.shutdown().await;
        tracing::info!("stopped");
        Ok::<_, Box<dyn std::error::Error>>(())
    })?;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
