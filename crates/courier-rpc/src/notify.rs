//! ---
//! courier_section: "04-rpc-correlation"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Request/reply correlation over durable queues."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
//! One-way event fan-out.
//!
//! Notifications are never on the critical path of the operation that triggers them, so
//! [`Notifier::publish_event`] logs failures and returns normally.

use std::sync::Arc;

use courier_common::NOTIFICATION_REQUESTS;
use courier_logging::{courier_debug, courier_warn, LogContext};
use courier_msg::{ActionRequest, Message};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::channel::ManagedChannel;
use crate::error::RpcError;

/// Action consumed by the notification service.
pub const NOTIFICATION_CREATE: &str = "notification/create";

/// Publishes fire-and-forget events.
#[derive(Clone)]
pub struct Notifier {
    channel: Arc<ManagedChannel>,
}

impl Notifier {
    pub fn new(channel: Arc<ManagedChannel>) -> Self {
        Self { channel }
    }

    /// Publish `event` to `queue` without a reply address. Failures are returned.
    pub async fn try_publish_event<T>(&self, queue: &str, event: &T) -> Result<(), RpcError>
    where
        T: Serialize + ?Sized,
    {
        let message = Message::json(event)?;
        let broker = self.channel.ensure_connected().await?;
        broker.publish(queue, message).await?;
        Ok(())
    }

    /// Publish `event` to `queue`; failures are logged and swallowed.
    pub async fn publish_event<T>(&self, queue: &str, event: &T)
    where
        T: Serialize + ?Sized,
    {
        let ctx = LogContext::new().with_queue(queue);
        match self.try_publish_event(queue, event).await {
            Ok(()) => courier_debug!(context = ctx, "event published"),
            Err(err) => courier_warn!(context = ctx, "event publish failed: {}", err),
        }
    }
}

/// Review decision on a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionStatus {
    Pending,
    Approved,
    Rejected,
}

/// The submission fields notifications need.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionSummary {
    pub id: String,
    pub title: String,
    pub student_id: String,
    pub professor_id: String,
    #[serde(default)]
    pub status: Option<SubmissionStatus>,
    #[serde(default)]
    pub grade: Option<f64>,
}

/// Builds and sends the submission lifecycle notifications.
#[derive(Clone)]
pub struct SubmissionNotifier {
    notifier: Notifier,
    queue: String,
}

impl SubmissionNotifier {
    pub fn new(notifier: Notifier) -> Self {
        Self {
            notifier,
            queue: NOTIFICATION_REQUESTS.to_owned(),
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Tell the professor a student submitted work.
    pub async fn notify_new_submission(&self, submission: &SubmissionSummary) {
        self.notifier
            .publish_event(&self.queue, &new_submission_event(submission))
            .await;
    }

    /// Tell the student their work was reviewed.
    pub async fn notify_submission_evaluated(&self, submission: &SubmissionSummary) {
        self.notifier
            .publish_event(&self.queue, &submission_evaluated_event(submission))
            .await;
    }
}

/// `notification/create` request for a newly received submission.
pub fn new_submission_event(submission: &SubmissionSummary) -> ActionRequest {
    ActionRequest::new(
        NOTIFICATION_CREATE,
        json!({
            "userId": submission.professor_id,
            "title": "New submission",
            "message": format!("A student submitted: {}", submission.title),
            "type": "submission_received",
            "metadata": {
                "submissionId": submission.id,
                "studentId": submission.student_id,
                "professorId": submission.professor_id,
            },
        }),
    )
}

/// `notification/create` request for a reviewed submission.
pub fn submission_evaluated_event(submission: &SubmissionSummary) -> ActionRequest {
    let verdict = match submission.status {
        Some(SubmissionStatus::Approved) => "approved",
        _ => "rejected",
    };
    let grade = submission
        .grade
        .map(|grade| format!(" with grade {}", grade))
        .unwrap_or_default();
    ActionRequest::new(
        NOTIFICATION_CREATE,
        json!({
            "userId": submission.student_id,
            "title": "Submission reviewed",
            "message": format!("Your submission \"{}\" was {}{}", submission.title, verdict, grade),
            "type": "submission_evaluated",
            "metadata": {
                "submissionId": submission.id,
                "studentId": submission.student_id,
                "professorId": submission.professor_id,
                "status": submission.status,
                "grade": submission.grade,
            },
        }),
    )
}
