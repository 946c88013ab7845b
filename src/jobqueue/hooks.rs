//! Provider webhook management contract used by the queue workers.
//!
//! [`RestHooks`](super::RestHooks) talks to GitLab and GitHub;
//! [`InMemoryHooks`] backs the tests. Implementations receive the job's
//! credentials on every call so one client can serve every connector.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use super::args::WebhookArgs;

/// Where and as whom to call the provider API.
#[derive(Clone, Copy)]
pub struct ApiAuth<'a> {
    pub provider: &'a str,
    pub base_url: &'a str,
    pub pat: &'a str,
}

impl<'a> From<&'a WebhookArgs> for ApiAuth<'a> {
    fn from(args: &'a WebhookArgs) -> Self {
        ApiAuth {
            provider: &args.provider,
            base_url: &args.base_url,
            pat: &args.pat,
        }
    }
}

impl fmt::Debug for ApiAuth<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiAuth")
            .field("provider", &self.provider)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

/// A webhook as the provider reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hook {
    pub id: String,
    pub url: String,
}

/// What to install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookSpec {
    pub url: String,
    pub secret: Option<String>,
    /// Provider-neutral event names, e.g. `merge_requests`, `notes`.
    pub events: Vec<String>,
}

pub trait HookApi: Send + Sync {
    /// The error type returned by this API.
    type Error: fmt::Display + Send;

    /// Looks up the provider's id for a namespaced project path.
    fn resolve_project_id(
        &self,
        auth: ApiAuth<'_>,
        path: &str,
    ) -> impl Future<Output = Result<String, Self::Error>> + Send;

    fn list_hooks(
        &self,
        auth: ApiAuth<'_>,
        project_id: &str,
    ) -> impl Future<Output = Result<Vec<Hook>, Self::Error>> + Send;

    fn create_hook(
        &self,
        auth: ApiAuth<'_>,
        project_id: &str,
        spec: &HookSpec,
    ) -> impl Future<Output = Result<Hook, Self::Error>> + Send;

    fn update_hook(
        &self,
        auth: ApiAuth<'_>,
        project_id: &str,
        hook_id: &str,
        spec: &HookSpec,
    ) -> impl Future<Output = Result<Hook, Self::Error>> + Send;

    /// Deleting a hook that no longer exists succeeds.
    fn delete_hook(
        &self,
        auth: ApiAuth<'_>,
        project_id: &str,
        hook_id: &str,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

#[derive(Debug, Default)]
struct FakeForge {
    projects: HashMap<String, String>,
    hooks: HashMap<String, Vec<Hook>>,
    next_id: u64,
    creates: usize,
    updates: usize,
    deletes: usize,
    failures_left: usize,
}

/// In-memory forge for tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryHooks {
    state: Mutex<FakeForge>,
}

impl InMemoryHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a project reachable by `path` under `id`.
    pub fn with_project(self, path: &str, id: &str) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.projects.insert(path.to_string(), id.to_string());
        }
        self
    }

    /// Seeds an existing hook on a project.
    pub fn with_hook(self, project_id: &str, url: &str) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.next_id += 1;
            let hook = Hook {
                id: state.next_id.to_string(),
                url: url.to_string(),
            };
            state
                .hooks
                .entry(project_id.to_string())
                .or_default()
                .push(hook);
        }
        self
    }

    /// Makes the next `n` calls fail with a 503.
    pub fn failing(self, n: usize) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.failures_left = n;
        }
        self
    }

    pub fn hooks(&self, project_id: &str) -> Vec<Hook> {
        self.with_state(|s| Ok(s.hooks.get(project_id).cloned().unwrap_or_default()))
            .unwrap_or_default()
    }

    /// `(creates, updates, deletes)` performed so far.
    pub fn call_counts(&self) -> (usize, usize, usize) {
        self.with_state(|s| Ok((s.creates, s.updates, s.deletes)))
            .unwrap_or_default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut FakeForge) -> Result<T, String>) -> Result<T, String> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| "fake forge lock poisoned".to_string())?;
        f(&mut state)
    }

    fn call<T>(&self, f: impl FnOnce(&mut FakeForge) -> Result<T, String>) -> Result<T, String> {
        self.with_state(|state| {
            if state.failures_left > 0 {
                state.failures_left -= 1;
                return Err("503 service unavailable".to_string());
            }
            f(state)
        })
    }
}

impl HookApi for InMemoryHooks {
    type Error = String;

    fn resolve_project_id(
        &self,
        _auth: ApiAuth<'_>,
        path: &str,
    ) -> impl Future<Output = Result<String, Self::Error>> + Send {
        let result = self.call(|s| {
            s.projects
                .get(path)
                .cloned()
                .ok_or_else(|| format!("404 project {path} not found"))
        });
        async { result }
    }

    fn list_hooks(
        &self,
        _auth: ApiAuth<'_>,
        project_id: &str,
    ) -> impl Future<Output = Result<Vec<Hook>, Self::Error>> + Send {
        let result = self.call(|s| Ok(s.hooks.get(project_id).cloned().unwrap_or_default()));
        async { result }
    }

    fn create_hook(
        &self,
        _auth: ApiAuth<'_>,
        project_id: &str,
        spec: &HookSpec,
    ) -> impl Future<Output = Result<Hook, Self::Error>> + Send {
        let result = self.call(|s| {
            s.next_id += 1;
            s.creates += 1;
            let hook = Hook {
                id: s.next_id.to_string(),
                url: spec.url.clone(),
            };
            s.hooks
                .entry(project_id.to_string())
                .or_default()
                .push(hook.clone());
            Ok(hook)
        });
        async { result }
    }

    fn update_hook(
        &self,
        _auth: ApiAuth<'_>,
        project_id: &str,
        hook_id: &str,
        spec: &HookSpec,
    ) -> impl Future<Output = Result<Hook, Self::Error>> + Send {
        let result = self.call(|s| {
            s.updates += 1;
            let hook = s
                .hooks
                .get_mut(project_id)
                .and_then(|hooks| hooks.iter_mut().find(|h| h.id == hook_id))
                .ok_or_else(|| format!("404 hook {hook_id} not found"))?;
            hook.url = spec.url.clone();
            Ok(hook.clone())
        });
        async { result }
    }

    fn delete_hook(
        &self,
        _auth: ApiAuth<'_>,
        project_id: &str,
        hook_id: &str,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        let result = self.call(|s| {
            s.deletes += 1;
            if let Some(hooks) = s.hooks.get_mut(project_id) {
                hooks.retain(|h| h.id != hook_id);
            }
            Ok(())
        });
        async { result }
    }
}
