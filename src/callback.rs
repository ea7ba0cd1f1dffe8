//! Ephemeral loopback HTTP server for auto-completing browser auth.
//!
//! After the user authorises the application, RTM redirects their browser
//! to the configured callback address.  The listener captures that
//! redirect, drives the frob→token exchange, reports the outcome on a
//! one-shot channel, and shuts down.  It exists for the duration of one
//! flow only.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use tokio::sync::oneshot;

use crate::auth::{AuthManager, AuthState};
use crate::error::{Error, Result};

/// RTM's servers occasionally lag the user's authorisation by about a
/// second; exchanging the frob immediately can fail spuriously.
const SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Bound on the graceful drain at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct Shared {
    auth: Arc<AuthManager>,
    frob: String,
    result: Mutex<Option<oneshot::Sender<Result<AuthState>>>>,
}

impl Shared {
    /// Deliver the flow outcome exactly once; later signals are dropped.
    fn signal(&self, outcome: Result<AuthState>) {
        match self.result.lock().expect("result lock poisoned").take() {
            Some(sender) => {
                let _ = sender.send(outcome);
            }
            None => log::debug!("callback fired after the flow already completed"),
        }
    }
}

/// Handle to a running callback listener.
///
/// Consumed by [`wait`](CallbackListener::wait); dropping it instead stops
/// the server without completing the flow.
pub struct CallbackListener {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    result_rx: oneshot::Receiver<Result<AuthState>>,
    server: tokio::task::JoinHandle<()>,
}

impl CallbackListener {
    /// Bind the listener and start serving callback requests for `frob`.
    ///
    /// Routes `/`, `/callback` and `/auth/callback` are all accepted, GET
    /// only, to tolerate browsers following different redirect rules.
    pub async fn start(
        auth: Arc<AuthManager>,
        frob: String,
        host: &str,
        port: u16,
    ) -> Result<CallbackListener> {
        let listener = tokio::net::TcpListener::bind((host, port))
            .await
            .map_err(|e| Error::Config(format!("cannot bind callback listener {host}:{port}: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| Error::Config(format!("callback listener address unavailable: {e}")))?;

        let (result_tx, result_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let shared = Arc::new(Shared {
            auth,
            frob,
            result: Mutex::new(Some(result_tx)),
        });
        let app = Router::new()
            .route("/", get(handle_callback))
            .route("/callback", get(handle_callback))
            .route("/auth/callback", get(handle_callback))
            .with_state(shared);

        let server = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(err) = serve.await {
                log::warn!("callback listener error: {err}");
            }
        });
        log::debug!("callback listener on http://{addr}");

        Ok(CallbackListener {
            addr,
            shutdown: Some(shutdown_tx),
            result_rx,
            server,
        })
    }

    /// The bound address, useful when the configured port was 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Wait for the browser callback to complete the flow, then shut the
    /// server down.
    ///
    /// Fails with [`Error::AuthRequired`] when `timeout` elapses first.
    pub async fn wait(mut self, timeout: Duration) -> Result<AuthState> {
        let outcome = tokio::time::timeout(timeout, &mut self.result_rx).await;
        self.stop().await;
        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_closed)) => Err(Error::Cancelled),
            Err(_elapsed) => Err(Error::AuthRequired(
                "timed out waiting for browser authorisation".into(),
            )),
        }
    }

    async fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut self.server)
            .await
            .is_err()
        {
            log::warn!("callback listener did not drain within {SHUTDOWN_GRACE:?}, aborting");
            self.server.abort();
        }
    }
}

async fn handle_callback(
    State(shared): State<Arc<Shared>>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, Html<String>) {
    // Prefer the frob the browser brought back; fall back to the one this
    // listener was started for, then to whatever flow is still pending.
    let frob = match params.get("frob") {
        Some(frob) if !frob.is_empty() => frob.clone(),
        _ if !shared.frob.is_empty() => shared.frob.clone(),
        _ => shared.auth.pending_frob().unwrap_or_default(),
    };
    if frob.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Html(error_page("The callback did not include a frob.")),
        );
    }

    tokio::time::sleep(SETTLE_DELAY).await;

    // Run the exchange on its own task so a panic surfaces as a JoinError
    // instead of tearing down the listener.
    let auth = Arc::clone(&shared.auth);
    let outcome = match tokio::spawn(async move { auth.complete_auth(&frob).await }).await {
        Ok(result) => result,
        Err(join_err) if join_err.is_cancelled() => Err(Error::Cancelled),
        Err(join_err) => Err(Error::InvalidResponse(format!(
            "auth completion failed internally: {join_err}"
        ))),
    };

    match outcome {
        Ok(state) => {
            let page = success_page(&state.username);
            shared.signal(Ok(state));
            (StatusCode::OK, Html(page))
        }
        Err(err) => {
            let page = error_page(&err.to_string());
            shared.signal(Err(err));
            (StatusCode::INTERNAL_SERVER_ERROR, Html(page))
        }
    }
}

fn success_page(username: &str) -> String {
    format!(
        r#"<!doctype html>
<html lang="en">
  <head><meta charset="utf-8"><title>Authentication Complete</title></head>
  <body style="font-family: system-ui, sans-serif; padding: 24px;">
    <h1>Authentication complete</h1>
    <p>Signed in to Remember The Milk as <strong>{username}</strong>.
       You can close this window.</p>
  </body>
</html>"#
    )
}

fn error_page(message: &str) -> String {
    format!(
        r#"<!doctype html>
<html lang="en">
  <head><meta charset="utf-8"><title>Authentication Failed</title></head>
  <body style="font-family: system-ui, sans-serif; padding: 24px;">
    <h1>Authentication failed</h1>
    <p>{message}</p>
    <p>Close this window and retry from the application.</p>
  </body>
</html>"#
    )
}
