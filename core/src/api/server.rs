//! HTTP/1.1 accept loop

use anyhow::Context;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use super::routes::handle;
use crate::service::FlowService;

/// How long in-flight requests get to finish once shutdown starts. Live event
/// streams never finish on their own and are cut off after this.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Bind the configured address and serve until Ctrl-C.
pub async fn run_server(service: Arc<FlowService>) -> anyhow::Result<()> {
    let addr = service.config().listen_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    tracing::info!("flowscope listening on http://{}", listener.local_addr()?);

    serve(listener, service, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    })
    .await
}

/// Serve connections from `listener` until `shutdown` resolves.
pub async fn serve<F>(
    listener: TcpListener,
    service: Arc<FlowService>,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()>,
{
    let graceful = GracefulShutdown::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, peer_addr)) => {
                    tracing::debug!("Connection from {}", peer_addr);
                    let service = Arc::clone(&service);
                    let connection = http1::Builder::new().serve_connection(
                        TokioIo::new(socket),
                        service_fn(move |req| handle(Arc::clone(&service), req)),
                    );
                    let connection = graceful.watch(connection);
                    tokio::spawn(async move {
                        if let Err(e) = connection.await {
                            let err_str = e.to_string().to_lowercase();
                            if e.is_incomplete_message()
                                || err_str.contains("eof")
                                || err_str.contains("broken pipe")
                                || err_str.contains("connection reset")
                                || err_str.contains("connection closed")
                            {
                                tracing::debug!("Connection closed by client: {}", e);
                            } else {
                                tracing::error!("Error handling connection: {}", e);
                            }
                        }
                    });
                }
                Err(e) => tracing::error!("Accept error: {}", e),
            },
            _ = &mut shutdown => {
                tracing::info!("Shutdown requested, no longer accepting connections");
                break;
            }
        }
    }

    drop(listener);
    match tokio::time::timeout(SHUTDOWN_GRACE, graceful.shutdown()).await {
        Ok(()) => tracing::info!("flowscope stopped"),
        Err(_) => tracing::warn!(
            "flowscope stopped with connections still open after {:?}",
            SHUTDOWN_GRACE
        ),
    }
    Ok(())
}
