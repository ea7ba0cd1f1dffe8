#![deny(missing_docs)]
//! Client library and service layer for the [remember the
//! milk](https://www.rememberthemilk.com/) to-do app, built to back a
//! host process speaking the Model Context Protocol.
//!
//! This crate is unofficial and not supported by remember the milk.  To
//! use it you will need a free for non-commercial use [API
//! key](https://www.rememberthemilk.com/services/api/), which is not
//! included with the crate.
//!
//! The crate hides RTM's wire conventions (MD5-signed GET parameters,
//! frob-based desktop authentication, per-write "timelines", JSON whose
//! shapes drift between calls) behind a typed [`RtmService`] façade.  All
//! outbound calls pass a token-bucket [`RateLimiter`]; the auth token is
//! verified before use and persisted to the OS secret store with a file
//! fallback.
//!
//! ```no_run
//! # #[tokio::main]
//! # async fn main() -> Result<(), cowgnition::Error> {
//! use cowgnition::{Config, RtmService};
//!
//! // Credentials come from the configuration or from RTM_API_KEY /
//! // RTM_SHARED_SECRET in the environment.
//! let service = RtmService::new(Config::new("my key", "my secret")).await?;
//!
//! // Interactive mode prints an authorisation URL and, by default, runs
//! // a local callback listener so the browser redirect completes the
//! // flow without copy-paste.
//! let outcome = service.ensure_authenticated().await?;
//! if outcome.success {
//!     let page = service.get_tasks(None).await?;
//!     for task in page.tasks {
//!         println!("{}", task.name);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod auth;
mod callback;
mod client;
mod config;
mod error;
mod model;
mod protocol;
mod ratelimit;
mod retry;
mod service;
mod storage;

pub use auth::{AuthFlow, AuthManager, AuthState, EnsureOutcome};
pub use callback::CallbackListener;
pub use client::RtmClient;
pub use config::{
    AuthMode, Config, Perms, ENV_API_KEY, ENV_AUTH_TOKEN, ENV_CI, ENV_SHARED_SECRET,
    ENV_TEST_TOKEN,
};
pub use error::{Error, Result, CODE_INVALID_API_KEY, CODE_INVALID_TOKEN};
pub use model::{join_task_id, split_task_id, Note, Settings, Tag, Task, TaskList};
pub use ratelimit::RateLimiter;
pub use retry::RetryPolicy;
pub use service::{MetricsSink, RtmService, TaskPage};
pub use storage::{default_storage, FileStorage, KeyringStorage, StoredToken, TokenStorage};

#[cfg(test)]
mod tests;
