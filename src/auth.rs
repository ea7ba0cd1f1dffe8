//! Frob-based authentication state machine.
//!
//! RTM's desktop flow is a three-step handshake: obtain a frob, send the
//! user to a browser authorisation URL bound to that frob, then exchange
//! the frob for a long-lived token and verify it with
//! `rtm.auth.checkToken`.  The manager runs that handshake, keeps a
//! verified in-memory cache of the auth state, and persists the token.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use crate::callback::CallbackListener;
use crate::client::RtmClient;
use crate::config::{AuthMode, Config, ENV_AUTH_TOKEN, ENV_CI, ENV_TEST_TOKEN};
use crate::error::{Error, Result};
use crate::protocol::{AuthResponse, FrobResponse};
use crate::retry::RetryPolicy;
use crate::storage::TokenStorage;

/// Cached authentication state.
///
/// Never reports `authenticated` without the username and user id from the
/// verification response that established it.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct AuthState {
    /// Whether a verified token is held.
    pub authenticated: bool,
    /// RTM username, empty when not authenticated.
    pub username: String,
    /// RTM full name, empty when not authenticated.
    pub fullname: String,
    /// RTM user id, empty when not authenticated.
    pub user_id: String,
}

/// The public half of an in-progress authentication flow.
#[derive(Debug, Clone)]
pub struct AuthFlow {
    /// URL the user must open to authorise the application.
    pub url: String,
    /// The frob binding the browser authorisation to the token exchange.
    pub frob: String,
}

/// Outcome of [`AuthManager::ensure_authenticated`].
#[derive(Debug, Clone, Default)]
pub struct EnsureOutcome {
    /// Whether a verified (or, in CI test mode, synthetic) session exists.
    pub success: bool,
    /// Username of the session when `success`.
    pub username: String,
    /// Authorisation URL when manual completion is needed.
    pub auth_url: Option<String>,
    /// Frob to pass to [`AuthManager::complete_auth`] when manual
    /// completion is needed.
    pub frob: Option<String>,
    /// Whether the caller must finish the flow manually.
    pub needs_manual: bool,
    /// Human-readable description of what happened or what to do next.
    pub message: String,
}

struct PendingFlow {
    frob: String,
    #[allow(dead_code)]
    started: Instant,
}

/// Runs the frob→token handshake and owns the cached [`AuthState`].
///
/// Holds only the capabilities it needs (the request pipeline and the
/// token storage), not the service that composes it.
pub struct AuthManager {
    client: Arc<RtmClient>,
    storage: Arc<dyn TokenStorage>,
    config: Config,
    retry: RetryPolicy,
    state: RwLock<AuthState>,
    pending: Mutex<Option<PendingFlow>>,
    flow_lock: tokio::sync::Mutex<()>,
}

impl AuthManager {
    /// Create a manager over the given pipeline and storage.
    pub fn new(client: Arc<RtmClient>, storage: Arc<dyn TokenStorage>, config: Config) -> AuthManager {
        let retry = RetryPolicy::new(config.retry_attempts, config.retry_backoff());
        AuthManager {
            client,
            storage,
            config,
            retry,
            state: RwLock::new(AuthState::default()),
            pending: Mutex::new(None),
            flow_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// The cached auth state.  Readers are concurrent.
    pub fn auth_state(&self) -> AuthState {
        self.state.read().expect("auth state lock poisoned").clone()
    }

    fn set_state(&self, state: AuthState) {
        *self.state.write().expect("auth state lock poisoned") = state;
    }

    fn discard_pending(&self) {
        self.pending.lock().expect("pending lock poisoned").take();
    }

    /// Load a token from the environment or storage and verify it.
    ///
    /// Called once at service boot.  A token that fails verification with
    /// RTM error 98 is cleared from memory and storage; a transport
    /// failure leaves storage untouched and the service unauthenticated.
    pub async fn initialize(&self) -> Result<()> {
        if let Ok(token) = std::env::var(ENV_AUTH_TOKEN) {
            if !token.is_empty() {
                self.client.set_token(&token);
                match self.verify_token().await {
                    Ok(state) if state.authenticated => {
                        log::info!("authenticated as {} via {ENV_AUTH_TOKEN}", state.username);
                        return Ok(());
                    }
                    Ok(_) => log::warn!("{ENV_AUTH_TOKEN} token failed verification"),
                    Err(err) => {
                        log::warn!("could not verify {ENV_AUTH_TOKEN} token: {err}");
                        self.client.clear_token();
                    }
                }
            }
        }

        let stored = match self.storage.load() {
            Ok(stored) => stored,
            Err(err) => {
                log::warn!("token storage load failed: {err}");
                None
            }
        };
        if let Some(stored) = stored {
            self.client.set_token(&stored.token);
            match self.verify_token().await {
                Ok(state) if state.authenticated => {
                    log::info!("authenticated as {} from stored token", state.username);
                }
                Ok(_) => log::info!("stored token is no longer valid"),
                Err(err) => {
                    // Transport trouble: stay unauthenticated but keep the
                    // stored token for the next boot.
                    log::warn!("could not verify stored token: {err}");
                    self.client.clear_token();
                }
            }
        }
        Ok(())
    }

    /// Verify the installed token with `rtm.auth.checkToken` and update the
    /// cached state.
    ///
    /// RTM error 98 clears the in-memory token, the cached state and the
    /// persisted token, and yields an unauthenticated state rather than an
    /// error.  Transport and other failures propagate without touching
    /// storage.
    pub async fn verify_token(&self) -> Result<AuthState> {
        if !self.client.has_token() {
            self.set_state(AuthState::default());
            return Ok(AuthState::default());
        }
        match self
            .client
            .call::<AuthResponse>("rtm.auth.checkToken", vec![])
            .await
        {
            Ok(resp) => {
                let state = AuthState {
                    authenticated: true,
                    username: resp.auth.user.username,
                    fullname: resp.auth.user.fullname,
                    user_id: resp.auth.user.id,
                };
                self.set_state(state.clone());
                Ok(state)
            }
            Err(err) if err.is_invalid_token() => {
                log::info!("auth token rejected by RTM, clearing local auth state");
                self.clear_auth()?;
                Ok(AuthState::default())
            }
            Err(err) => Err(err.context("rtm.auth.checkToken failed")),
        }
    }

    /// Begin a flow: obtain a frob and build the authorisation URL.
    ///
    /// Replaces any previously pending flow; its frob is discarded.
    pub async fn start_auth(&self) -> Result<AuthFlow> {
        let frob = self
            .retry
            .execute("rtm.auth.getFrob", || {
                self.client.call::<FrobResponse>("rtm.auth.getFrob", vec![])
            })
            .await?
            .frob;
        let url = self.client.auth_url_for_frob(self.config.permission, &frob);
        *self.pending.lock().expect("pending lock poisoned") = Some(PendingFlow {
            frob: frob.clone(),
            started: Instant::now(),
        });
        log::info!("auth flow started, awaiting browser authorisation");
        Ok(AuthFlow { url, frob })
    }

    /// The frob of the in-progress flow, if any.
    pub fn pending_frob(&self) -> Option<String> {
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .as_ref()
            .map(|flow| flow.frob.clone())
    }

    /// Exchange a frob for a token, verify it, and persist it.
    ///
    /// The pending flow is consumed whether the exchange succeeds or
    /// fails.  Fails unless verification confirms authentication.
    pub async fn complete_auth(&self, frob: &str) -> Result<AuthState> {
        if frob.is_empty() {
            return Err(Error::InvalidArguments("frob is empty".into()));
        }
        let result = self.exchange_and_verify(frob).await;
        self.discard_pending();
        result
    }

    async fn exchange_and_verify(&self, frob: &str) -> Result<AuthState> {
        let resp = self
            .retry
            .execute("rtm.auth.getToken", || {
                self.client.call::<AuthResponse>(
                    "rtm.auth.getToken",
                    vec![("frob".to_string(), frob.to_string())],
                )
            })
            .await?;
        self.install_verified(resp.auth.token).await
    }

    /// Install a caller-supplied token, verifying and persisting it.
    pub async fn set_token(&self, token: &str) -> Result<AuthState> {
        if token.is_empty() {
            return Err(Error::InvalidArguments("auth token is empty".into()));
        }
        self.install_verified(token.to_string()).await
    }

    async fn install_verified(&self, token: String) -> Result<AuthState> {
        self.client.set_token(&token);
        let state = self.verify_token().await?;
        if !state.authenticated {
            return Err(Error::AuthRequired(
                "token verification did not confirm authentication".into(),
            ));
        }
        if self.config.auto_save_token {
            // The token was verified just above, which is the storage
            // invariant for persisting it.
            if let Err(err) = self.storage.save(&token, &state.user_id, &state.username) {
                log::warn!(
                    "could not persist token to {}: {err}",
                    self.storage.name()
                );
            }
        }
        Ok(state)
    }

    /// Clear the in-memory token, reset the cached state, and delete the
    /// persisted token.  Idempotent; an absent stored token is not an
    /// error.
    pub fn clear_auth(&self) -> Result<()> {
        self.client.clear_token();
        self.set_state(AuthState::default());
        self.discard_pending();
        self.storage.delete()
    }

    /// Bring the service from whatever state it is in to a usable one,
    /// according to the configured mode.
    ///
    /// At most one flow runs at a time; a second concurrent call fails
    /// rather than queueing.
    pub async fn ensure_authenticated(self: &Arc<Self>) -> Result<EnsureOutcome> {
        match self.config.mode {
            AuthMode::Interactive => self.ensure_interactive().await,
            AuthMode::Headless => self.ensure_headless().await,
            AuthMode::Test => self.ensure_test().await,
        }
    }

    fn success_outcome(state: &AuthState) -> EnsureOutcome {
        EnsureOutcome {
            success: true,
            username: state.username.clone(),
            message: format!("authenticated as {}", state.username),
            ..EnsureOutcome::default()
        }
    }

    /// Re-verify an installed token; `Ok(Some(..))` when it is good.
    async fn existing_session(&self) -> Result<Option<EnsureOutcome>> {
        let state = self.auth_state();
        if state.authenticated {
            return Ok(Some(Self::success_outcome(&state)));
        }
        if self.client.has_token() {
            let state = self.verify_token().await?;
            if state.authenticated {
                return Ok(Some(Self::success_outcome(&state)));
            }
        }
        Ok(None)
    }

    async fn ensure_interactive(self: &Arc<Self>) -> Result<EnsureOutcome> {
        let _flow = self.flow_lock.try_lock().map_err(|_| {
            Error::InvalidArguments("an interactive auth flow is already in progress".into())
        })?;

        if let Some(outcome) = self.existing_session().await? {
            return Ok(outcome);
        }

        let flow = self.start_auth().await?;
        if self.config.auto_complete_auth {
            log::info!(
                "open {} in your browser; waiting up to {}s for the callback",
                flow.url,
                self.config.timeout_secs
            );
            match CallbackListener::start(
                Arc::clone(self),
                flow.frob.clone(),
                &self.config.callback_host,
                self.config.callback_port,
            )
            .await
            {
                Ok(listener) => match listener.wait(self.config.timeout()).await {
                    Ok(state) => return Ok(Self::success_outcome(&state)),
                    Err(err) => log::warn!("automatic auth completion failed: {err}"),
                },
                Err(err) => log::warn!("callback listener did not start: {err}"),
            }
        }

        Ok(EnsureOutcome {
            success: false,
            needs_manual: true,
            message: format!(
                "open {} in your browser, authorise the application, then complete \
                 authentication with frob {}",
                flow.url, flow.frob
            ),
            auth_url: Some(flow.url),
            frob: Some(flow.frob),
            ..EnsureOutcome::default()
        })
    }

    async fn ensure_headless(&self) -> Result<EnsureOutcome> {
        if let Some(outcome) = self.existing_session().await? {
            return Ok(outcome);
        }
        Err(Error::AuthRequired(format!(
            "no valid auth token available; run an interactive flow or set {ENV_AUTH_TOKEN}"
        )))
    }

    async fn ensure_test(&self) -> Result<EnsureOutcome> {
        // CI never attempts real auth.
        if std::env::var(ENV_CI).map_or(false, |v| !v.is_empty()) {
            log::info!("CI environment detected, returning synthetic test session");
            return Ok(EnsureOutcome {
                success: true,
                username: "ci_test_user".into(),
                message: "test mode: synthetic CI session".into(),
                ..EnsureOutcome::default()
            });
        }

        if let Some(outcome) = self.existing_session().await? {
            return Ok(outcome);
        }

        if let Some(path) = &self.config.test_token_path {
            match std::fs::read_to_string(path) {
                Ok(contents) => {
                    let token = contents.trim();
                    if !token.is_empty() {
                        let state = self.set_token(token).await?;
                        return Ok(Self::success_outcome(&state));
                    }
                }
                Err(err) => log::warn!("could not read test token {}: {err}", path.display()),
            }
        }

        for var in [ENV_TEST_TOKEN, ENV_AUTH_TOKEN] {
            if let Ok(token) = std::env::var(var) {
                if !token.is_empty() {
                    let state = self.set_token(&token).await?;
                    return Ok(Self::success_outcome(&state));
                }
            }
        }

        Err(Error::AuthRequired(format!(
            "no test token available; set {ENV_TEST_TOKEN} or configure test_token_path"
        )))
    }
}
