//! Service façade.
//!
//! Composes the request pipeline, auth manager and token storage into the
//! one surface the MCP adapter consumes.  Its own logic is limited to
//! ordering, locking and error wrapping; every write obtains a fresh
//! timeline.

use std::sync::Arc;

use crate::auth::{AuthFlow, AuthManager, AuthState, EnsureOutcome};
use crate::client::RtmClient;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::{
    flatten_entry, flatten_tasks, split_task_id, NameIndex, Settings, Tag, Task, TaskList,
};
use crate::protocol::{
    ListsResponse, LocationsResponse, SettingsResponse, TagsResponse, TasksResponse,
    TimelineResponse, WriteResponse,
};
use crate::ratelimit::RateLimiter;
use crate::storage::{default_storage, TokenStorage};

/// Hard cap on tasks returned from one listing call.
const MAX_TASKS: usize = 100;

/// Optional observer for API activity, injected at construction.
pub trait MetricsSink: Send + Sync {
    /// Called once per façade operation with its outcome.
    fn record(&self, operation: &str, success: bool);
}

/// A page of tasks plus truncation details.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskPage {
    /// The tasks, at most 100.
    pub tasks: Vec<Task>,
    /// Whether the result was cut off at the cap.
    pub truncated: bool,
    /// How many tasks matched before truncation.
    pub total_found: usize,
    /// How many tasks are in `tasks`.
    pub returned: usize,
    /// Human-readable summary of the result.
    pub message: String,
}

struct ViewStrategy {
    label: &'static str,
    list_id: Option<String>,
    filter: Option<String>,
}

/// The RTM service: the only surface the MCP adapter sees.
pub struct RtmService {
    client: Arc<RtmClient>,
    auth: Arc<AuthManager>,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl RtmService {
    /// Build and boot the service: validate configuration, pick a token
    /// storage backend, and verify any stored token.
    pub async fn new(config: Config) -> Result<RtmService> {
        let config = config.with_env_credentials();
        config.validate()?;
        let storage = default_storage()?;
        RtmService::with_storage(config, storage).await
    }

    /// Like [`new`](RtmService::new) with an explicit storage backend.
    pub async fn with_storage(
        config: Config,
        storage: Arc<dyn TokenStorage>,
    ) -> Result<RtmService> {
        let config = config.with_env_credentials();
        config.validate()?;
        let client = Arc::new(RtmClient::new(&config.api_key, &config.shared_secret)?);
        RtmService::assemble(config, client, storage).await
    }

    /// Test constructor: explicit endpoints, a permissive rate limiter and
    /// injected storage.
    #[cfg(test)]
    pub(crate) async fn for_test(
        config: Config,
        rest_url: &str,
        auth_url: &str,
        storage: Arc<dyn TokenStorage>,
    ) -> Result<RtmService> {
        let client = Arc::new(RtmClient::with_endpoints(
            &config.api_key,
            &config.shared_secret,
            rest_url,
            auth_url,
            RateLimiter::new(1000.0, 1000),
        )?);
        RtmService::assemble(config, client, storage).await
    }

    async fn assemble(
        config: Config,
        client: Arc<RtmClient>,
        storage: Arc<dyn TokenStorage>,
    ) -> Result<RtmService> {
        let auth = Arc::new(AuthManager::new(Arc::clone(&client), storage, config));
        auth.initialize().await?;
        Ok(RtmService {
            client,
            auth,
            metrics: None,
        })
    }

    /// Attach a metrics sink.
    pub fn with_metrics(mut self, sink: Arc<dyn MetricsSink>) -> RtmService {
        self.metrics = Some(sink);
        self
    }

    fn observe(&self, operation: &str, success: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record(operation, success);
        }
    }

    /// The rate limiter gating outbound calls, for runtime reconfiguration.
    pub fn rate_limiter(&self) -> &RateLimiter {
        self.client.rate_limiter()
    }

    /// Current cached authentication state.
    pub fn auth_state(&self) -> AuthState {
        self.auth.auth_state()
    }

    /// Bring the service to an authenticated state per the configured mode.
    pub async fn ensure_authenticated(&self) -> Result<EnsureOutcome> {
        self.auth.ensure_authenticated().await
    }

    /// Start an auth flow; returns the authorisation URL and frob.
    pub async fn start_auth(&self) -> Result<AuthFlow> {
        self.auth
            .start_auth()
            .await
            .map_err(|e| e.context("failed to start auth flow"))
    }

    /// Complete an auth flow with the frob from [`start_auth`](RtmService::start_auth).
    pub async fn complete_auth(&self, frob: &str) -> Result<AuthState> {
        let result = self.auth.complete_auth(frob).await;
        self.observe("completeAuth", result.is_ok());
        result.map_err(|e| e.context("failed to complete auth flow"))
    }

    /// Install and verify a caller-supplied token, persisting on success.
    pub async fn set_auth_token(&self, token: &str) -> Result<AuthState> {
        self.auth
            .set_token(token)
            .await
            .map_err(|e| e.context("failed to set auth token"))
    }

    /// Log out: clear memory, cached state and persisted token.
    pub fn clear_auth(&self) -> Result<()> {
        self.auth.clear_auth()
    }

    fn require_auth(&self) -> Result<()> {
        if self.client.has_token() {
            Ok(())
        } else {
            Err(Error::AuthRequired(
                "no auth token; authenticate with the authenticate tool first".into(),
            ))
        }
    }

    /// A fresh timeline for one write operation.
    async fn timeline(&self) -> Result<String> {
        let resp = self
            .client
            .call::<TimelineResponse>("rtm.timelines.create", vec![])
            .await
            .map_err(|e| e.context("failed to call createTimeline method"))?;
        Ok(resp.timeline)
    }

    /// List tasks.  With a filter, one scoped listing call; without, the
    /// default-view fallback ladder.
    pub async fn get_tasks(&self, filter: Option<&str>) -> Result<TaskPage> {
        self.require_auth()?;
        let result = match filter {
            Some(f) if !f.is_empty() => self.fetch_tasks(None, Some(f)).await,
            _ => self.default_view_tasks().await,
        };
        self.observe("getTasks", result.is_ok());
        Ok(Self::page(result?))
    }

    async fn fetch_tasks(&self, list_id: Option<&str>, filter: Option<&str>) -> Result<Vec<Task>> {
        let mut params = Vec::new();
        if let Some(list_id) = list_id {
            params.push(("list_id".to_string(), list_id.to_string()));
        }
        if let Some(filter) = filter {
            params.push(("filter".to_string(), filter.to_string()));
        }
        let resp = self
            .client
            .call::<TasksResponse>("rtm.tasks.getList", params)
            .await
            .map_err(|e| e.context("failed to call getTasks method"))?;
        let names = self.name_index(&resp.tasks).await;
        Ok(flatten_tasks(resp.tasks, &names))
    }

    /// Resolve list and location names for a tasks response, best effort.
    async fn name_index(&self, container: &crate::protocol::TaskContainer) -> NameIndex {
        let mut index = NameIndex::default();
        if container.list.is_empty() {
            return index;
        }
        match self
            .client
            .call::<ListsResponse>("rtm.lists.getList", vec![])
            .await
        {
            Ok(resp) => {
                for list in resp.lists.list {
                    index.lists.insert(list.id, list.name);
                }
            }
            Err(err) => log::debug!("list names unavailable: {err}"),
        }

        let wants_locations = container.list.iter().any(|entry| {
            entry
                .taskseries
                .iter()
                .flatten()
                .any(|series| !series.location_id.is_empty())
        });
        if wants_locations {
            match self
                .client
                .call::<LocationsResponse>("rtm.locations.getList", vec![])
                .await
            {
                Ok(resp) => {
                    for location in resp.locations.location {
                        index.locations.insert(location.id, location.name);
                    }
                }
                Err(err) => log::debug!("location names unavailable: {err}"),
            }
        }
        index
    }

    /// The default task view: the first strategy yielding at least one
    /// task wins.  All-empty is an empty page, not an error.
    async fn default_view_tasks(&self) -> Result<Vec<Task>> {
        let settings = match self.fetch_settings().await {
            Ok(settings) => Some(settings),
            Err(err) => {
                log::warn!("settings unavailable for default view: {err}");
                None
            }
        };
        let lists = match self.fetch_lists().await {
            Ok(lists) => lists,
            Err(err) => {
                log::warn!("lists unavailable for default view: {err}");
                Vec::new()
            }
        };

        let mut strategies = Vec::new();
        if let Some(settings) = &settings {
            if !settings.default_list_id.is_empty() {
                strategies.push(ViewStrategy {
                    label: "default list by id",
                    list_id: Some(settings.default_list_id.clone()),
                    filter: Some("status:incomplete".into()),
                });
                if let Some(list) = lists.iter().find(|l| l.id == settings.default_list_id) {
                    strategies.push(ViewStrategy {
                        label: "default list by name",
                        list_id: None,
                        filter: Some(format!("list:\"{}\" AND status:incomplete", list.name)),
                    });
                }
            }
        }
        if let Some(alist) = lists.iter().find(|l| l.smart_list && l.name == "A-List") {
            strategies.push(ViewStrategy {
                label: "A-List by id",
                list_id: Some(alist.id.clone()),
                filter: Some("status:incomplete".into()),
            });
            strategies.push(ViewStrategy {
                label: "A-List by name",
                list_id: None,
                filter: Some("list:\"A-List\" AND status:incomplete".into()),
            });
        }
        strategies.push(ViewStrategy {
            label: "incomplete across all lists",
            list_id: None,
            filter: Some("status:incomplete".into()),
        });
        strategies.push(ViewStrategy {
            label: "unscoped",
            list_id: None,
            filter: None,
        });

        for strategy in strategies {
            match self
                .fetch_tasks(strategy.list_id.as_deref(), strategy.filter.as_deref())
                .await
            {
                Ok(mut tasks) => {
                    if strategy.filter.is_none() {
                        tasks.retain(|t| !t.completed);
                    }
                    if !tasks.is_empty() {
                        log::debug!("default view resolved via {}", strategy.label);
                        return Ok(tasks);
                    }
                }
                Err(err) => log::warn!("default view strategy {} failed: {err}", strategy.label),
            }
        }
        Ok(Vec::new())
    }

    fn page(mut tasks: Vec<Task>) -> TaskPage {
        let total_found = tasks.len();
        let truncated = total_found > MAX_TASKS;
        if truncated {
            tasks.truncate(MAX_TASKS);
        }
        let returned = tasks.len();
        let message = if total_found == 0 {
            "No tasks found".to_string()
        } else if truncated {
            format!("Found {total_found} tasks, returning the first {MAX_TASKS}")
        } else {
            format!("Found {total_found} tasks")
        };
        TaskPage {
            tasks,
            truncated,
            total_found,
            returned,
            message,
        }
    }

    /// Create a task.  With `smart`, RTM's smart-add parser interprets due
    /// dates and priorities embedded in the name.
    pub async fn create_task(
        &self,
        name: &str,
        list_id: Option<&str>,
        smart: bool,
    ) -> Result<Task> {
        if name.trim().is_empty() {
            return Err(Error::InvalidArguments("task name is empty".into()));
        }
        self.require_auth()?;
        let timeline = self.timeline().await?;
        let mut params = vec![
            ("timeline".to_string(), timeline),
            ("name".to_string(), name.to_string()),
            ("parse".to_string(), if smart { "1" } else { "0" }.to_string()),
        ];
        if let Some(list_id) = list_id {
            params.push(("list_id".to_string(), list_id.to_string()));
        }
        let result = self
            .client
            .call::<WriteResponse>("rtm.tasks.add", params)
            .await
            .map_err(|e| e.context("failed to call addTask method"));
        self.observe("createTask", result.is_ok());
        let entry = result?
            .list
            .ok_or_else(|| Error::InvalidResponse("addTask response has no list".into()))?;

        let mut tasks = Vec::new();
        flatten_entry(entry, &NameIndex::default(), &mut tasks);
        tasks
            .into_iter()
            .next()
            .ok_or_else(|| Error::InvalidResponse("addTask response has no task".into()))
    }

    /// Shared plumbing for the task write methods.
    async fn write_task(
        &self,
        method: &str,
        operation: &str,
        list_id: &str,
        task_id: &str,
        extra: Vec<(String, String)>,
    ) -> Result<()> {
        let (series_id, instance_id) = split_task_id(task_id)?;
        self.require_auth()?;
        let timeline = self.timeline().await?;
        let mut params = vec![
            ("timeline".to_string(), timeline),
            ("list_id".to_string(), list_id.to_string()),
            ("taskseries_id".to_string(), series_id.to_string()),
            ("task_id".to_string(), instance_id.to_string()),
        ];
        params.extend(extra);
        let result = self
            .client
            .call::<WriteResponse>(method, params)
            .await
            .map_err(|e| e.context(format!("failed to call {operation} method")));
        self.observe(operation, result.is_ok());
        result.map(|_| ())
    }

    /// Mark a task complete.  Completing an already-complete task is
    /// whatever RTM naturally reports; state here is not corrupted.
    pub async fn complete_task(&self, list_id: &str, task_id: &str) -> Result<()> {
        self.write_task("rtm.tasks.complete", "completeTask", list_id, task_id, vec![])
            .await
    }

    /// Delete a task.
    pub async fn delete_task(&self, list_id: &str, task_id: &str) -> Result<()> {
        self.write_task("rtm.tasks.delete", "deleteTask", list_id, task_id, vec![])
            .await
    }

    /// Set or clear a task's due date.  `due` is passed to RTM's parser,
    /// so natural-language dates work; `None` clears the date.
    pub async fn set_due_date(
        &self,
        list_id: &str,
        task_id: &str,
        due: Option<&str>,
    ) -> Result<()> {
        let extra = match due {
            Some(due) => vec![
                ("due".to_string(), due.to_string()),
                ("parse".to_string(), "1".to_string()),
            ],
            None => vec![("due".to_string(), String::new())],
        };
        self.write_task("rtm.tasks.setDueDate", "setDueDate", list_id, task_id, extra)
            .await
    }

    /// Add tags to a task.
    pub async fn add_tags(&self, list_id: &str, task_id: &str, tags: &[String]) -> Result<()> {
        if tags.is_empty() {
            return Err(Error::InvalidArguments("no tags supplied".into()));
        }
        self.write_task(
            "rtm.tasks.addTags",
            "addTags",
            list_id,
            task_id,
            vec![("tags".to_string(), tags.join(","))],
        )
        .await
    }

    async fn fetch_lists(&self) -> Result<Vec<TaskList>> {
        let resp = self
            .client
            .call::<ListsResponse>("rtm.lists.getList", vec![])
            .await
            .map_err(|e| e.context("failed to call getLists method"))?;
        Ok(resp
            .lists
            .list
            .into_iter()
            .map(|list| TaskList {
                id: list.id,
                name: list.name,
                deleted: list.deleted,
                locked: list.locked,
                archived: list.archived,
                position: list.position,
                smart_list: list.smart,
            })
            .collect())
    }

    /// All lists, including archived and smart lists.
    pub async fn get_lists(&self) -> Result<Vec<TaskList>> {
        self.require_auth()?;
        let result = self.fetch_lists().await;
        self.observe("getLists", result.is_ok());
        result
    }

    /// All tags in use on the account.
    pub async fn get_tags(&self) -> Result<Vec<Tag>> {
        self.require_auth()?;
        let result = self
            .client
            .call::<TagsResponse>("rtm.tags.getList", vec![])
            .await
            .map_err(|e| e.context("failed to call getTags method"));
        self.observe("getTags", result.is_ok());
        Ok(result?
            .tags
            .tag
            .into_iter()
            .map(|name| Tag { name })
            .collect())
    }

    async fn fetch_settings(&self) -> Result<Settings> {
        let resp = self
            .client
            .call::<SettingsResponse>("rtm.settings.getList", vec![])
            .await
            .map_err(|e| e.context("failed to call getSettings method"))?;
        let wire = resp.settings;
        Ok(Settings {
            timezone: wire.timezone,
            is_american_date: wire.dateformat,
            is_24_hour_time: wire.timeformat,
            default_list_id: wire.defaultlist,
            language: wire.language,
            default_due_date: wire.defaultduedate,
            is_pro_account: wire.pro,
        })
    }

    /// Account settings.
    pub async fn get_settings(&self) -> Result<Settings> {
        self.require_auth()?;
        let result = self.fetch_settings().await;
        self.observe("getSettings", result.is_ok());
        result
    }
}
