//! Proxy listener. Accepts TCP connections on one socket and spawns a task
//! per connection; the CONNECT-vs-plaintext dispatch happens inside
//! `conn::handle_connection`, not here. Grounded in `start_proxy`'s accept
//! loop in `examples/Distracted-E421-nixos-cursor`, with a `stop()`
//! lifecycle capability added via `tokio::sync::Notify` since that loop
//! otherwise runs until the process is killed.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Notify;

use crate::conn;
use crate::error::ProxyResult;
use crate::state::ProxyState;

/// Handle returned by [`start`] letting a caller request a clean shutdown
/// of the accept loop without killing in-flight connections.
pub struct ListenerHandle {
    notify: Arc<Notify>,
    local_addr: std::net::SocketAddr,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Signals the accept loop to stop taking new connections. Already
    /// accepted connections run to completion independently.
    pub fn stop(&self) {
        self.notify.notify_one();
    }
}

/// Binds `host:port` and spawns the accept loop as a background task,
/// returning immediately with a handle. Each accepted socket is handed to
/// `conn::handle_connection` on its own task.
pub async fn start(state: Arc<ProxyState>) -> ProxyResult<ListenerHandle> {
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    let notify = Arc::new(Notify::new());
    let stop_notify = notify.clone();

    state
        .logs
        .info(format!("listening on {local_addr}"));

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop_notify.notified() => {
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            let state = state.clone();
                            tokio::spawn(async move {
                                conn::handle_connection(stream, peer_addr, state).await;
                            });
                        }
                        Err(e) => {
                            state.logs.warn(format!("accept failed: {e}"));
                        }
                    }
                }
            }
        }
        state.logs.info("listener stopped");
    });

    Ok(ListenerHandle { notify, local_addr })
}
