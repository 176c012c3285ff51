//! Unix-socket server.
//!
//! Binds the configured socket path and runs one [`Connection`] task per
//! accepted client. All connections share a single [`Router`], so there is
//! one reindex orchestrator (and one single-flight guard) per process.
//!
//! # Socket lifecycle
//!
//! | Moment | Action |
//! |--------|--------|
//! | startup | create the parent directory, remove a stale socket file, bind |
//! | accept | spawn [`Connection::run`] on its own task |
//! | shutdown signal | stop accepting, remove the socket file |
//!
//! In-flight connections are not awaited on shutdown; a running reindex is
//! abandoned with its last checkpoint recorded in memory only.
//!
//! # Usage
//!
//! ```text
//! rag-backend --config ./config/rag-backend.toml serve
//! ```

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::UnixListener;

use crate::config::Config;
use crate::connection::Connection;
use crate::error::ProtocolError;
use crate::router::Router;

/// Serve until Ctrl-C.
///
/// This is the entry point used by `rag-backend serve`.
pub async fn run_server(config: &Config) -> Result<()> {
    serve_with_shutdown(config, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
        }
    })
    .await
}

/// Serve until `shutdown` resolves.
pub async fn serve_with_shutdown<F>(config: &Config, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let router = Arc::new(Router::from_config(config)?);
    serve_router(
        router,
        &config.socket_path()?,
        config.transport.max_frame_bytes,
        shutdown,
    )
    .await
}

/// Bind `socket_path` and serve `router` until `shutdown` resolves.
pub async fn serve_router<F>(
    router: Arc<Router>,
    socket_path: &Path,
    max_frame_bytes: usize,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    let listener = bind(socket_path)?;
    let _cleanup = SocketFile(socket_path.to_path_buf());
    tracing::info!(socket = %socket_path.display(), "backend listening");

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("shutdown requested");
                break;
            }
            accepted = listener.accept() => {
                let (stream, _addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let connection = Connection::new(stream, router.clone(), max_frame_bytes);
                tokio::spawn(async move {
                    match connection.run().await {
                        Ok(()) => {}
                        Err(ProtocolError::Handshake(message)) => {
                            tracing::info!(message, "connection closed after failed handshake");
                        }
                        Err(e) => tracing::warn!(error = %e, "connection ended with error"),
                    }
                });
            }
        }
    }
    Ok(())
}

fn bind(socket_path: &Path) -> Result<UnixListener> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create socket directory {}", parent.display()))?;
    }
    if socket_path.exists() {
        std::fs::remove_file(socket_path)
            .with_context(|| format!("Failed to remove stale socket {}", socket_path.display()))?;
    }
    UnixListener::bind(socket_path)
        .with_context(|| format!("Failed to bind socket {}", socket_path.display()))
}

/// Removes the socket file when the server loop exits.
struct SocketFile(PathBuf);

impl Drop for SocketFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(socket = %self.0.display(), error = %e, "failed to remove socket");
            }
        }
    }
}
