use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use colored::Colorize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use coderun_core::SessionRegistry;

use crate::api;
use crate::config::ProjectConfig;

/// Extra time past the kill grace period to wait for drivers to report
const SHUTDOWN_SLACK: Duration = Duration::from_secs(1);

pub async fn handle_serve_command(config: &ProjectConfig, host: &str, port: u16) -> Result<()> {
    let registry = SessionRegistry::new(
        config.sandbox_runner(),
        config.registry_config(),
        config.limit_policy(),
    );

    if let Some(dir) = config.archive_dir()? {
        info!(dir = %dir.display(), "Archiving runs");
        coderun_core::spawn_archiver(registry.clone(), dir);
    }

    for (language, toolchain, available) in registry.runner().availability().await {
        if !available {
            warn!(
                %language,
                binary = %toolchain.binary_path().display(),
                "Toolchain not found, runs in this language will be rejected"
            );
        }
    }

    let addr = format!("{}:{}", host, port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind API server to {}", addr))?;

    eprintln!();
    eprintln!(
        "  {} {}",
        "->".bright_green(),
        format!("Listening on http://{}", addr).bold()
    );
    eprintln!("  {} Press {} to stop", "->".dimmed(), "Ctrl+C".bold());
    eprintln!();

    run_server(listener, registry, shutdown_signal()).await
}

/// Serve the API until `signal` resolves.
///
/// On shutdown, active runs are cancelled and open event streams end
/// before the server waits for its connections to close.
pub(crate) async fn run_server(
    listener: TcpListener,
    registry: SessionRegistry,
    signal: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let router = api::create_router(registry.clone(), shutdown_rx);

    let on_shutdown = {
        let registry = registry.clone();
        async move {
            signal.await;
            let cancelled = registry.cancel_all();
            info!(cancelled, "Shutting down, cancelled active runs");
            shutdown_tx.send_replace(true);
        }
    };

    let result = axum::serve(listener, router)
        .with_graceful_shutdown(on_shutdown)
        .await;

    wait_for_active_runs(&registry).await;

    result.context("API server error")
}

/// Give cancelled runs time to be reaped
async fn wait_for_active_runs(registry: &SessionRegistry) {
    if registry.active_count() == 0 {
        return;
    }

    let deadline =
        tokio::time::Instant::now() + registry.runner().policy().grace_period + SHUTDOWN_SLACK;
    while registry.active_count() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    if registry.active_count() > 0 {
        warn!(remaining = registry.active_count(), "Runs still active at shutdown");
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    eprintln!("\nShutting down...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use coderun_core::{LimitPolicy, RegistryConfig, RunRequest, SessionState};
    use coderun_sandbox::{SandboxPolicy, SandboxRunner};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_shutdown_ends_open_streams_and_cancels_runs() {
        let runner = SandboxRunner::new(
            SandboxPolicy::default().with_grace_period(Duration::from_millis(200)),
        );
        let registry =
            SessionRegistry::new(runner, RegistryConfig::default(), LimitPolicy::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(run_server(listener, registry.clone(), async move {
            let _ = stop_rx.await;
        }));

        let id = registry.submit(RunRequest::new("w1", "sh", "sleep 30\n")).unwrap();

        // A client following registry updates keeps its connection open
        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET /api/runs/live HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut head = [0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut head))
            .await
            .unwrap()
            .unwrap();
        assert!(String::from_utf8_lossy(&head[..n]).contains("200"));

        stop_tx.send(()).unwrap();
        let finished = tokio::time::timeout(Duration::from_secs(5), server).await;
        assert!(finished.is_ok(), "server did not shut down with a live client");
        finished.unwrap().unwrap().unwrap();

        assert_eq!(registry.get(id).unwrap().state, SessionState::Cancelled);
    }
}
