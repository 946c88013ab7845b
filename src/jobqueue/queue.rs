//! The job runner: claims persisted jobs and executes them on a bounded
//! set of tasks.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::args::{Job, JobKind, JobState, WebhookArgs};
use super::config::QueueConfig;
use super::hooks::HookApi;
use super::store::{JobStore, StoreError};
use super::worker::{JobError, install_webhook, remove_webhook};
use crate::types::JobId;

/// Shared pieces each job execution needs.
struct Shared<H> {
    store: JobStore,
    api: H,
    config: QueueConfig,
}

pub struct JobRunner<H> {
    shared: Arc<Shared<H>>,
}

impl<H> Clone for JobRunner<H> {
    fn clone(&self) -> Self {
        JobRunner {
            shared: self.shared.clone(),
        }
    }
}

impl<H: HookApi + 'static> JobRunner<H> {
    pub fn new(store: JobStore, api: H, config: QueueConfig) -> Self {
        JobRunner {
            shared: Arc::new(Shared { store, api, config }),
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.shared.store
    }

    pub fn api(&self) -> &H {
        &self.shared.api
    }

    pub async fn enqueue_install(&self, args: WebhookArgs) -> Result<JobId, StoreError> {
        self.enqueue(JobKind::WebhookInstall, args).await
    }

    pub async fn enqueue_removal(&self, args: WebhookArgs) -> Result<JobId, StoreError> {
        self.enqueue(JobKind::WebhookRemoval, args).await
    }

    async fn enqueue(&self, kind: JobKind, args: WebhookArgs) -> Result<JobId, StoreError> {
        let max_attempts = self.shared.config.max_attempts();
        self.shared
            .store
            .blocking(move |s| s.insert(kind, &args, max_attempts, Utc::now()))
            .await
    }

    /// Claims and runs jobs until `cancel` fires, with at most
    /// `max_workers` in flight. In-flight jobs are awaited before
    /// returning.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), StoreError> {
        let recovered = self
            .shared
            .store
            .blocking(|s| s.recover_running(Utc::now()))
            .await?;
        let max_workers = self.shared.config.max_workers.max(1);
        info!(max_workers, recovered, "Job runner started");

        let mut in_flight = JoinSet::new();
        loop {
            while in_flight.len() < max_workers {
                match self.claim().await {
                    Ok(Some(job)) => {
                        let shared = self.shared.clone();
                        in_flight.spawn(async move { execute(&shared, job).await });
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!(error = %e, "Failed to claim job");
                        break;
                    }
                }
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Job task panicked");
                    }
                }
                () = tokio::time::sleep(self.shared.config.poll_interval) => {}
            }
        }

        info!(in_flight = in_flight.len(), "Job runner stopping");
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Job task panicked");
            }
        }
        Ok(())
    }

    /// Runs every job that is runnable now, including retries that become
    /// due while draining, one at a time. Returns how many runs happened.
    pub async fn run_until_idle(&self) -> Result<usize, StoreError> {
        let mut runs = 0;
        while let Some(job) = self.claim().await? {
            execute(&self.shared, job).await;
            runs += 1;
        }
        Ok(runs)
    }

    async fn claim(&self) -> Result<Option<Job>, StoreError> {
        self.shared
            .store
            .blocking(|s| s.claim_next(Utc::now()))
            .await
    }
}

/// Runs one claimed job to a recorded outcome.
async fn execute<H: HookApi>(shared: &Shared<H>, job: Job) -> JobState {
    let Shared { store, api, config } = shared;
    debug!(job_id = %job.id, kind = %job.kind, attempt = job.attempt, "Running job");

    let work = async {
        match job.kind {
            JobKind::WebhookInstall => install_webhook(api, store, config, &job.args).await,
            JobKind::WebhookRemoval => remove_webhook(api, store, config, &job.args).await,
        }
    };
    let outcome = match tokio::time::timeout(config.job_timeout, work).await {
        Ok(result) => result,
        Err(_) => Err(JobError::TimedOut(config.job_timeout)),
    };

    let id = job.id;
    let recorded = match outcome {
        Ok(record) => {
            info!(
                job_id = %id,
                kind = %job.kind,
                attempt = job.attempt,
                status = record.status.as_str(),
                "Job completed"
            );
            store
                .blocking(move |s| s.complete(id, Utc::now()).map(|()| JobState::Completed))
                .await
        }
        Err(e) => {
            let message = e.to_string();
            let delay = config.backoff_after(job.attempt);
            let next_run = Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
            let state = store
                .blocking(move |s| s.fail(id, &message, next_run, Utc::now()))
                .await;
            match &state {
                Ok(JobState::Discarded) => error!(
                    job_id = %id,
                    kind = %job.kind,
                    attempt = job.attempt,
                    error = %e,
                    "Job failed permanently"
                ),
                _ => warn!(
                    job_id = %id,
                    kind = %job.kind,
                    attempt = job.attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Job failed, rescheduled"
                ),
            }
            state
        }
    };

    recorded.unwrap_or_else(|e| {
        error!(job_id = %id, error = %e, "Failed to record job outcome");
        JobState::Running
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobqueue::hooks::InMemoryHooks;
    use crate::retry::RetryConfig;
    use crate::types::ConnectorId;
    use std::time::Duration;

    fn config(max_retries: u32) -> QueueConfig {
        QueueConfig {
            public_endpoint: "https://relay.example.com".into(),
            retry_policy: RetryConfig::new(max_retries, Duration::ZERO, Duration::ZERO, 1.0),
            poll_interval: Duration::from_millis(10),
            ..QueueConfig::default()
        }
    }

    fn args(project: &str) -> WebhookArgs {
        WebhookArgs {
            connector_id: ConnectorId::new("4"),
            project_path: project.into(),
            provider: "gitlab".into(),
            base_url: "https://gitlab.example.com".into(),
            pat: "pat".into(),
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried_by_the_queue() {
        let runner = JobRunner::new(
            JobStore::open_in_memory().unwrap(),
            InMemoryHooks::new().failing(2),
            config(5),
        );
        let id = runner.enqueue_install(args("12")).await.unwrap();

        let runs = runner.run_until_idle().await.unwrap();

        assert_eq!(runs, 3);
        let job = runner.store().get(id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempt, 3);
        assert_eq!(runner.api().hooks("12").len(), 1);
    }

    #[tokio::test]
    async fn exhausted_jobs_are_discarded_with_last_error() {
        let runner = JobRunner::new(
            JobStore::open_in_memory().unwrap(),
            InMemoryHooks::new().failing(10),
            config(1),
        );
        let id = runner.enqueue_removal(args("12")).await.unwrap();

        assert_eq!(runner.run_until_idle().await.unwrap(), 2);

        let job = runner.store().get(id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Discarded);
        assert_eq!(job.max_attempts, 2);
        assert!(job.last_error.unwrap().contains("503"));
    }

    #[tokio::test]
    async fn redelivered_install_reuses_the_remote_hook() {
        let runner = JobRunner::new(
            JobStore::open_in_memory().unwrap(),
            InMemoryHooks::new(),
            config(0),
        );
        runner.enqueue_install(args("12")).await.unwrap();
        runner.enqueue_install(args("12")).await.unwrap();

        assert_eq!(runner.run_until_idle().await.unwrap(), 2);

        assert_eq!(runner.api().hooks("12").len(), 1);
        assert_eq!(runner.api().call_counts(), (1, 1, 0));
        assert_eq!(runner.store().registry_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn run_processes_jobs_until_cancelled() {
        let runner = JobRunner::new(
            JobStore::open_in_memory().unwrap(),
            InMemoryHooks::new(),
            config(0),
        );
        let first = runner.enqueue_install(args("1")).await.unwrap();
        let second = runner.enqueue_install(args("2")).await.unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let runner = runner.clone();
            let cancel = cancel.clone();
            async move { runner.run(cancel).await }
        });

        for _ in 0..200 {
            let done = [first, second].iter().all(|id| {
                runner
                    .store()
                    .get(*id)
                    .unwrap()
                    .is_some_and(|j| j.state == JobState::Completed)
            });
            if done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        handle.await.unwrap().unwrap();

        for id in [first, second] {
            assert_eq!(
                runner.store().get(id).unwrap().unwrap().state,
                JobState::Completed
            );
        }
    }
}
