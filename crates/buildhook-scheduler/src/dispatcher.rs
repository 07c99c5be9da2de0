//! Dispatcher - turns a matching webhook event into one queued job per queue.

use buildhook_core::{BuildJob, JobId, PushEvent};
use buildhook_db::{DbError, DbResult, Store};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::matcher::TriggerMatcher;

/// Reasons a webhook produced no jobs.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("unknown project: {0}")]
    UnknownProject(String),

    /// The event matched no trigger of the project. Not a fault.
    #[error("trigger missed for project {0}")]
    TriggerMiss(String),

    #[error("store error: {0}")]
    Store(#[from] DbError),
}

/// A job created for one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuedJob {
    pub queue: String,
    pub id: JobId,
}

/// Outcome of a dispatch across all requested queues.
///
/// Each queue is independent: a failure on one is reported here while the
/// jobs of the others stay queued.
#[derive(Debug, Default, Serialize)]
pub struct DispatchReport {
    pub queued: Vec<QueuedJob>,
    /// Queue name and error message for every queue that could not be served.
    pub failed: Vec<(String, String)>,
}

impl DispatchReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn ids(&self) -> Vec<JobId> {
        self.queued.iter().map(|q| q.id).collect()
    }
}

/// Creates, persists and enqueues build jobs.
#[derive(Clone)]
pub struct Dispatcher {
    pub(crate) store: Store,
    matcher: TriggerMatcher,
}

impl Dispatcher {
    pub fn new(store: Store) -> Self {
        let matcher = TriggerMatcher::new(store.triggers.clone());
        Self { store, matcher }
    }

    /// Handle a webhook delivery: `payload` is the raw `payload` form field and
    /// `queues` the comma separated queue list from the request path.
    pub async fn submit_webhook(
        &self,
        project: &str,
        queues: &str,
        payload: Option<&str>,
    ) -> Result<DispatchReport, DispatchError> {
        let Some(payload) = payload else {
            warn!(project = %project, "Payload wasn't in the POST params");
            return Err(DispatchError::MalformedPayload(
                "no payload provided".to_string(),
            ));
        };
        let raw: serde_json::Value = serde_json::from_str(payload).map_err(|e| {
            warn!(project = %project, error = %e, "Webhook payload is not JSON");
            DispatchError::MalformedPayload(format!("payload is not JSON: {}", e))
        })?;
        self.ensure_project(project).await?;
        let event = PushEvent::from_payload(raw).map_err(|e| {
            warn!(project = %project, error = %e, "Unusable webhook payload");
            DispatchError::MalformedPayload(e.to_string())
        })?;

        let queues = buildhook_core::split_list(queues);
        self.queue_matching(project, &queues, &event).await
    }

    /// Queue one job per entry of `queues`, in order.
    pub async fn submit(
        &self,
        project: &str,
        queues: &[String],
        event: &PushEvent,
    ) -> Result<DispatchReport, DispatchError> {
        self.ensure_project(project).await?;
        self.queue_matching(project, queues, event).await
    }

    async fn ensure_project(&self, project: &str) -> Result<(), DispatchError> {
        if !self.store.triggers.project_exists(project).await? {
            info!(project = %project, "Ignoring build request for unknown project");
            return Err(DispatchError::UnknownProject(project.to_string()));
        }
        Ok(())
    }

    async fn queue_matching(
        &self,
        project: &str,
        queues: &[String],
        event: &PushEvent,
    ) -> Result<DispatchReport, DispatchError> {
        let Some(triggered_by) = self.matcher.check(project, event).await? else {
            info!(
                project = %project,
                repo = %event.repository,
                git_ref = %event.git_ref,
                "Trigger missed, build skipped"
            );
            return Err(DispatchError::TriggerMiss(project.to_string()));
        };

        let mut report = DispatchReport::default();
        for queue in queues {
            match self.create_job(project, queue, event, &triggered_by).await {
                Ok(id) => {
                    info!(project = %project, queue = %queue, job_id = %id, "Build enqueued");
                    report.queued.push(QueuedJob {
                        queue: queue.clone(),
                        id,
                    });
                }
                Err(e) => {
                    error!(project = %project, queue = %queue, error = %e, "Failed to enqueue build");
                    report.failed.push((queue.clone(), e.to_string()));
                }
            }
        }

        Ok(report)
    }

    async fn create_job(
        &self,
        project: &str,
        queue: &str,
        event: &PushEvent,
        triggered_by: &str,
    ) -> DbResult<JobId> {
        let id = self.store.jobs.next_id().await?;
        let job = BuildJob::new(id, project, queue, event.raw.clone(), triggered_by);
        self.enqueue(&job).await?;
        Ok(id)
    }

    /// Persist a new job, index it and hand its id to the work queue.
    pub(crate) async fn enqueue(&self, job: &BuildJob) -> DbResult<()> {
        self.store.jobs.put(job).await?;
        self.store.jobs.index(job).await?;
        self.store.queue.push(&job.queue, job.id).await?;
        debug!(job_id = %job.id, payload = ?job, "Stored job payload");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FlakyQueue, push_payload, store_with_trigger};
    use buildhook_core::JobStatus;

    #[tokio::test]
    async fn test_submit_two_queues() {
        let store = store_with_trigger().await;
        let dispatcher = Dispatcher::new(store.clone());

        let report = dispatcher
            .submit_webhook("p", "a, b", Some(&push_payload("refs/heads/master")))
            .await
            .unwrap();

        assert!(report.is_complete());
        assert_eq!(report.queued.len(), 2);
        assert_eq!(report.queued[0].queue, "a");
        assert_eq!(report.queued[1].queue, "b");

        let first = store.jobs.get(report.queued[0].id).await.unwrap();
        let second = store.jobs.get(report.queued[1].id).await.unwrap();
        for job in [&first, &second] {
            assert_eq!(job.status, JobStatus::Waiting);
            assert!(!job.requeued);
            assert_eq!(job.project, "p");
            assert!(job.return_code.is_none());
            assert!(job.output.is_none());
        }
        assert_eq!(first.triggered_by, second.triggered_by);
        assert_eq!(first.queue, "a");
        assert_eq!(second.queue, "b");

        assert_eq!(store.queue.pending("a").await.unwrap(), 1);
        assert_eq!(store.queue.pending("b").await.unwrap(), 1);
        assert_eq!(store.jobs.list_by_project("p", 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_ids_strictly_increase_under_concurrent_dispatch() {
        let store = store_with_trigger().await;
        let dispatcher = Dispatcher::new(store.clone());
        let payload = push_payload("refs/heads/master");

        let mut handles = Vec::new();
        for _ in 0..10 {
            let dispatcher = dispatcher.clone();
            let payload = payload.clone();
            handles.push(tokio::spawn(async move {
                dispatcher
                    .submit_webhook("p", "a,b,c", Some(&payload))
                    .await
                    .unwrap()
                    .ids()
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            let ids = handle.await.unwrap();
            assert!(ids.windows(2).all(|w| w[0] < w[1]));
            all.extend(ids);
        }
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(total, 30);
        assert_eq!(all.len(), 30);
    }

    #[tokio::test]
    async fn test_identical_events_are_not_deduplicated() {
        let store = store_with_trigger().await;
        let dispatcher = Dispatcher::new(store.clone());
        let payload = push_payload("refs/heads/master");

        let first = dispatcher.submit_webhook("p", "a", Some(&payload)).await.unwrap();
        let second = dispatcher.submit_webhook("p", "a", Some(&payload)).await.unwrap();
        assert!(first.ids()[0] < second.ids()[0]);
        assert_eq!(store.queue.pending("a").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_precondition_errors() {
        let store = store_with_trigger().await;
        let dispatcher = Dispatcher::new(store.clone());

        let missing = dispatcher.submit_webhook("p", "a", None).await;
        assert!(matches!(missing, Err(DispatchError::MalformedPayload(_))));

        let garbage = dispatcher.submit_webhook("p", "a", Some("{not json")).await;
        assert!(matches!(garbage, Err(DispatchError::MalformedPayload(_))));

        let unknown = dispatcher
            .submit_webhook("nope", "a", Some(&push_payload("refs/heads/master")))
            .await;
        assert!(matches!(unknown, Err(DispatchError::UnknownProject(_))));

        let empty_unknown = dispatcher.submit_webhook("nope", "a", Some("{}")).await;
        assert!(matches!(
            empty_unknown,
            Err(DispatchError::UnknownProject(_))
        ));

        let empty_known = dispatcher.submit_webhook("p", "a", Some("{}")).await;
        assert!(matches!(
            empty_known,
            Err(DispatchError::MalformedPayload(_))
        ));

        let miss = dispatcher
            .submit_webhook("p", "a", Some(&push_payload("refs/heads/dev")))
            .await;
        assert!(matches!(miss, Err(DispatchError::TriggerMiss(_))));

        assert!(store.queue.queues().await.unwrap().is_empty());
        assert_eq!(store.jobs.next_id().await.unwrap().get(), 1);
    }

    #[tokio::test]
    async fn test_failing_queue_does_not_undo_the_others() {
        let store = store_with_trigger().await;
        let (store, _queue) = FlakyQueue::wrapping(&store)
            .rejecting_push("b")
            .install(&store);
        let dispatcher = Dispatcher::new(store.clone());

        let report = dispatcher
            .submit_webhook("p", "a,b,c", Some(&push_payload("refs/heads/master")))
            .await
            .unwrap();

        assert!(!report.is_complete());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "b");
        let queued: Vec<&str> = report.queued.iter().map(|q| q.queue.as_str()).collect();
        assert_eq!(queued, vec!["a", "c"]);

        for job in &report.queued {
            let stored = store.jobs.get(job.id).await.unwrap();
            assert_eq!(stored.status, JobStatus::Waiting);
            assert_eq!(stored.queue, job.queue);
        }
        assert_eq!(store.queue.pending("a").await.unwrap(), 1);
        assert_eq!(store.queue.pending("b").await.unwrap(), 0);
        assert_eq!(store.queue.pending("c").await.unwrap(), 1);
    }
}
