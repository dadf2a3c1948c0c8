//! Tasks assigned to a store, and the photo-proof approval workflow.
//!
//! HQ assigns a task to stores through per-store targets. A store moves its
//! target from `pending` through `in_progress`; tasks that require proof are
//! then submitted with photos and wait in `pending_review` for HQ, others are
//! completed directly. HQ may bounce a submission back to `in_progress` with a
//! review note.

use std::{collections::HashMap, fmt::Debug};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    table::{decode_all, row, Query, TableStore},
    DataAccessError,
};

const TASK_TARGETS: &str = "task_targets";
const TASKS: &str = "tasks";
const TASK_PROOFS: &str = "task_proofs";

/// Urgency of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Can wait.
    Low,
    /// Routine.
    Medium,
    /// Do today.
    High,
    /// Drop everything.
    Critical,
}

/// Progress of a task at one store, as stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    /// Not started.
    Pending,
    /// Started, or sent back by HQ.
    InProgress,
    /// Proof submitted, waiting for HQ.
    PendingReview,
    /// Done.
    Completed,
}

/// Progress of a task at one store, with lateness taken into account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DerivedStatus {
    /// See [`TargetStatus::Pending`].
    Pending,
    /// See [`TargetStatus::InProgress`].
    InProgress,
    /// See [`TargetStatus::PendingReview`].
    PendingReview,
    /// See [`TargetStatus::Completed`].
    Completed,
    /// Past its due time and not yet handed in.
    Overdue,
}

impl From<TargetStatus> for DerivedStatus {
    fn from(status: TargetStatus) -> Self {
        match status {
            TargetStatus::Pending => DerivedStatus::Pending,
            TargetStatus::InProgress => DerivedStatus::InProgress,
            TargetStatus::PendingReview => DerivedStatus::PendingReview,
            TargetStatus::Completed => DerivedStatus::Completed,
        }
    }
}

/// A task defined by HQ.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Task {
    /// Task identifier.
    pub id: String,
    /// Headline shown in lists.
    pub title: String,
    /// Instructions, if any.
    #[serde(default)]
    pub description: Option<String>,
    /// Urgency.
    pub priority: Priority,
    /// Deadline; undated tasks are never overdue.
    #[serde(default)]
    pub due_at: Option<DateTime<Utc>>,
    /// Whether completion needs photo proof. Absent means no.
    #[serde(default)]
    pub requires_proof: Option<bool>,
    /// `active` until HQ resolves the task.
    #[serde(default)]
    pub status: Option<String>,
}

impl Task {
    /// Returns `true` while HQ has not resolved the task.
    pub fn is_active(&self) -> bool {
        self.status.as_deref() == Some("active")
    }

    /// Returns `true` when completion needs photo proof.
    pub fn requires_proof(&self) -> bool {
        self.requires_proof.unwrap_or(false)
    }
}

#[derive(Debug, Deserialize)]
struct TargetRow {
    task_id: String,
    store_id: String,
    status: TargetStatus,
    #[serde(default)]
    completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    review_note: Option<String>,
}

/// A task as assigned to one store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskTarget {
    /// The assigned task.
    pub task_id: String,
    /// The store it is assigned to.
    pub store_id: String,
    /// Progress as stored.
    pub status: TargetStatus,
    /// When the store completed it.
    pub completed_at: Option<DateTime<Utc>>,
    /// HQ's note when a submission was sent back.
    pub review_note: Option<String>,
    /// The joined task row.
    pub task: Task,
}

impl TaskTarget {
    /// The status with lateness taken into account.
    pub fn derived_status(&self, now: DateTime<Utc>) -> DerivedStatus {
        derive_status(self, now)
    }

    /// Returns `true` when HQ sent the submission back with a note.
    pub fn needs_action(&self) -> bool {
        self.status == TargetStatus::InProgress
            && self
                .review_note
                .as_deref()
                .is_some_and(|note| !note.trim().is_empty())
    }
}

/// Completed targets stay completed. A target past its due time is overdue
/// unless it is waiting for review. Otherwise the stored status applies.
pub fn derive_status(target: &TaskTarget, now: DateTime<Utc>) -> DerivedStatus {
    if target.status == TargetStatus::Completed {
        return DerivedStatus::Completed;
    }

    match target.task.due_at {
        Some(due) if due < now && target.status != TargetStatus::PendingReview => {
            DerivedStatus::Overdue
        }
        _ => target.status.into(),
    }
}

/// A short label describing when a target is or was due.
pub fn due_label(target: &TaskTarget, derived: DerivedStatus, now: DateTime<Utc>) -> String {
    let Some(due) = target.task.due_at else {
        return "No due date".to_string();
    };

    let rounded_hours = |ms: i64| round_half_up(ms as f64 / 3_600_000.0);
    let days = |hours: i64| round_half_up(hours as f64 / 24.0);

    if derived == DerivedStatus::Overdue {
        let hours = rounded_hours((now - due).num_milliseconds());
        if hours >= 24 {
            format!("Overdue by {} day(s)", days(hours))
        } else {
            format!("Overdue by {hours}h")
        }
    } else {
        let hours = rounded_hours((due - now).num_milliseconds());
        if hours >= 24 {
            format!("Due in {} day(s)", days(hours))
        } else {
            format!("Due in {hours}h")
        }
    }
}

/// Rounds to the nearest integer, halves towards positive infinity.
fn round_half_up(value: f64) -> i64 {
    (value + 0.5).floor() as i64
}

/// A store's targets grouped the way the task screen lists them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskBoard {
    /// Past due and not handed in.
    pub overdue: Vec<TaskTarget>,
    /// Neither overdue nor completed.
    pub open: Vec<TaskTarget>,
    /// Done.
    pub completed: Vec<TaskTarget>,
    /// Sent back by HQ with a note.
    pub needs_action: Vec<TaskTarget>,
}

impl TaskBoard {
    /// Groups `targets` by their status at `now`. A target sent back with a
    /// note also appears in `needs_action`.
    pub fn new(targets: &[TaskTarget], now: DateTime<Utc>) -> Self {
        let mut board = Self::default();
        for target in targets {
            match target.derived_status(now) {
                DerivedStatus::Overdue => board.overdue.push(target.clone()),
                DerivedStatus::Completed => board.completed.push(target.clone()),
                _ => board.open.push(target.clone()),
            }
            if target.needs_action() {
                board.needs_action.push(target.clone());
            }
        }
        board
    }
}

/// Task counts for the dashboard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskSummary {
    /// Number of active targets.
    pub total: usize,
    /// Targets completed.
    pub completed: usize,
    /// Targets neither completed nor overdue.
    pub pending: usize,
    /// The overdue targets themselves, for the dashboard's alert list.
    pub overdue: Vec<TaskTarget>,
}

impl TaskSummary {
    /// Summarises `targets` at `now`.
    pub fn new(targets: &[TaskTarget], now: DateTime<Utc>) -> Self {
        let board = TaskBoard::new(targets, now);
        Self {
            total: targets.len(),
            completed: board.completed.len(),
            pending: board.open.len(),
            overdue: board.overdue,
        }
    }
}

/// A photo attached as proof of completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofFile {
    /// Original file name.
    pub name: String,
    /// MIME type, e.g. `image/jpeg`.
    pub content_type: String,
    /// File contents.
    pub bytes: Vec<u8>,
}

/// An object store for proof photos.
#[async_trait]
pub trait ProofStorage: Debug + Clone + Send + Sync + 'static {
    /// Stores `bytes` at `path`. Existing objects are never overwritten.
    async fn upload(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), DataAccessError>;
}

/// An error from a task operation.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// The task needs at least one proof photo.
    #[error("this task needs at least one proof photo")]
    ProofRequired,

    /// A lookup, write or upload failed.
    #[error(transparent)]
    DataAccess(#[from] DataAccessError),
}

/// Object path of an uploaded proof: `{task}/{store}/{millis}_{name}`, with
/// whitespace runs in the name replaced by `_`.
pub fn proof_path(task_id: &str, store_id: &str, file_name: &str, now: DateTime<Utc>) -> String {
    let mut safe_name = String::with_capacity(file_name.len());
    let mut in_whitespace = false;
    for c in file_name.chars() {
        if c.is_whitespace() {
            if !in_whitespace {
                safe_name.push('_');
            }
            in_whitespace = true;
        } else {
            safe_name.push(c);
            in_whitespace = false;
        }
    }

    format!(
        "{task_id}/{store_id}/{}_{safe_name}",
        now.timestamp_millis()
    )
}

/// Reads and updates a store's task targets.
#[derive(Debug, Clone)]
pub struct TaskService<Tables: TableStore> {
    tables: Tables,
}

impl<Tables: TableStore> TaskService<Tables> {
    /// Creates a service over `tables`.
    pub fn new(tables: Tables) -> Self {
        Self { tables }
    }

    /// The store's targets for tasks HQ has not resolved, soonest due first
    /// and undated last.
    #[tracing::instrument(level = "debug", skip(self), err)]
    pub async fn targets_for_store(
        &self,
        store_id: &str,
    ) -> Result<Vec<TaskTarget>, DataAccessError> {
        let query = Query::table(TASK_TARGETS).eq("store_id", store_id);
        let targets: Vec<TargetRow> = decode_all(self.tables.query_rows(&query).await?)?;
        if targets.is_empty() {
            return Ok(Vec::new());
        }

        let query = Query::table(TASKS).is_in(
            "id",
            targets.iter().map(|target| target.task_id.as_str()),
        );
        let tasks: HashMap<String, Task> = decode_all::<Task>(self.tables.query_rows(&query).await?)?
            .into_iter()
            .map(|task| (task.id.clone(), task))
            .collect();

        let mut joined: Vec<TaskTarget> = targets
            .into_iter()
            .filter_map(|target| {
                let task = tasks.get(&target.task_id)?.clone();
                Some(TaskTarget {
                    task_id: target.task_id,
                    store_id: target.store_id,
                    status: target.status,
                    completed_at: target.completed_at,
                    review_note: target.review_note,
                    task,
                })
            })
            .filter(|target| target.task.is_active())
            .collect();

        joined.sort_by_key(|target| (target.task.due_at.is_none(), target.task.due_at));
        Ok(joined)
    }

    /// Moves a target to `status`. Completing stamps the completion time.
    #[tracing::instrument(level = "debug", skip(self, now), err)]
    pub async fn set_status(
        &self,
        store_id: &str,
        task_id: &str,
        status: TargetStatus,
        now: DateTime<Utc>,
    ) -> Result<(), DataAccessError> {
        let mut patch = row(json!({ "status": status }));
        if status == TargetStatus::Completed {
            patch.insert("completed_at".to_string(), json!(now));
        }

        self.tables
            .update(&target_query(store_id, task_id), patch)
            .await?;
        Ok(())
    }

    /// Hands a target to HQ for review, clearing any earlier review note.
    #[tracing::instrument(level = "debug", skip(self), err)]
    pub async fn set_pending_review(
        &self,
        store_id: &str,
        task_id: &str,
    ) -> Result<(), DataAccessError> {
        let patch = row(json!({
            "status": TargetStatus::PendingReview,
            "completed_at": null,
            "review_note": null,
        }));

        self.tables
            .update(&target_query(store_id, task_id), patch)
            .await?;
        Ok(())
    }

    /// Uploads proof photos for a target and advances it: to review when the
    /// task requires proof, straight to completed otherwise. Returns the new
    /// status.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(task.id = %target.task_id, store.id = %target.store_id, files = files.len()),
        err
    )]
    pub async fn submit_proof<Storage: ProofStorage>(
        &self,
        storage: &Storage,
        target: &TaskTarget,
        files: Vec<ProofFile>,
        now: DateTime<Utc>,
    ) -> Result<TargetStatus, TaskError> {
        let requires_proof = target.task.requires_proof();
        if requires_proof && files.is_empty() {
            return Err(TaskError::ProofRequired);
        }

        for file in files {
            let path = proof_path(&target.task_id, &target.store_id, &file.name, now);
            storage.upload(&path, file.bytes, &file.content_type).await?;

            let proof = row(json!({
                "task_id": target.task_id,
                "store_id": target.store_id,
                "image_url": path,
                "approved": null,
                "reviewed_by": null,
            }));
            self.tables.insert(TASK_PROOFS, proof).await?;
        }

        if requires_proof {
            self.set_pending_review(&target.store_id, &target.task_id)
                .await?;
            Ok(TargetStatus::PendingReview)
        } else {
            self.set_status(
                &target.store_id,
                &target.task_id,
                TargetStatus::Completed,
                now,
            )
            .await?;
            Ok(TargetStatus::Completed)
        }
    }
}

fn target_query(store_id: &str, task_id: &str) -> Query {
    Query::table(TASK_TARGETS)
        .eq("task_id", task_id)
        .eq("store_id", store_id)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::MemoryStore;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap()
    }

    fn target(task_id: &str, status: TargetStatus, due_at: Option<DateTime<Utc>>) -> TaskTarget {
        TaskTarget {
            task_id: task_id.to_string(),
            store_id: "s-1".to_string(),
            status,
            completed_at: None,
            review_note: None,
            task: Task {
                id: task_id.to_string(),
                title: format!("Task {task_id}"),
                description: None,
                priority: Priority::Medium,
                due_at,
                requires_proof: Some(true),
                status: Some("active".to_string()),
            },
        }
    }

    #[test]
    fn derive_status_rules() {
        let past = Some(now() - Duration::hours(3));
        let future = Some(now() + Duration::hours(3));

        let completed = target("a", TargetStatus::Completed, past);
        assert_eq!(derive_status(&completed, now()), DerivedStatus::Completed);

        let late = target("b", TargetStatus::InProgress, past);
        assert_eq!(derive_status(&late, now()), DerivedStatus::Overdue);

        let in_review = target("c", TargetStatus::PendingReview, past);
        assert_eq!(derive_status(&in_review, now()), DerivedStatus::PendingReview);

        let upcoming = target("d", TargetStatus::Pending, future);
        assert_eq!(derive_status(&upcoming, now()), DerivedStatus::Pending);

        let undated = target("e", TargetStatus::InProgress, None);
        assert_eq!(derive_status(&undated, now()), DerivedStatus::InProgress);
    }

    #[test]
    fn due_labels() {
        let undated = target("a", TargetStatus::Pending, None);
        assert_eq!(due_label(&undated, DerivedStatus::Pending, now()), "No due date");

        let late = target("b", TargetStatus::Pending, Some(now() - Duration::hours(5)));
        assert_eq!(due_label(&late, DerivedStatus::Overdue, now()), "Overdue by 5h");

        let very_late = target("c", TargetStatus::Pending, Some(now() - Duration::hours(60)));
        assert_eq!(
            due_label(&very_late, DerivedStatus::Overdue, now()),
            "Overdue by 3 day(s)"
        );

        let soon = target("d", TargetStatus::Pending, Some(now() + Duration::minutes(90)));
        assert_eq!(due_label(&soon, DerivedStatus::Pending, now()), "Due in 2h");

        let later = target("e", TargetStatus::Pending, Some(now() + Duration::hours(49)));
        assert_eq!(due_label(&later, DerivedStatus::Pending, now()), "Due in 2 day(s)");
    }

    #[test]
    fn due_label_rounds_halves_up() {
        // Past due but waiting for review, so never labelled overdue.
        let in_review = target(
            "a",
            TargetStatus::PendingReview,
            Some(now() - Duration::minutes(90)),
        );
        let derived = derive_status(&in_review, now());
        assert_eq!(derived, DerivedStatus::PendingReview);
        assert_eq!(due_label(&in_review, derived, now()), "Due in -1h");

        let half = target("b", TargetStatus::Pending, Some(now() + Duration::minutes(30)));
        assert_eq!(due_label(&half, DerivedStatus::Pending, now()), "Due in 1h");

        assert_eq!(round_half_up(-2.5), -2);
        assert_eq!(round_half_up(2.5), 3);
        assert_eq!(round_half_up(-2.6), -3);
    }

    #[test]
    fn board_and_summary_groupings() {
        let mut sent_back = target("a", TargetStatus::InProgress, Some(now() + Duration::hours(1)));
        sent_back.review_note = Some("Photo is blurry".to_string());
        let mut blank_note = target("b", TargetStatus::InProgress, None);
        blank_note.review_note = Some("   ".to_string());

        let targets = vec![
            sent_back,
            blank_note,
            target("c", TargetStatus::Pending, Some(now() - Duration::hours(1))),
            target("d", TargetStatus::Completed, Some(now() - Duration::hours(1))),
        ];

        let board = TaskBoard::new(&targets, now());
        assert_eq!(board.open.len(), 2);
        assert_eq!(board.overdue[0].task_id, "c");
        assert_eq!(board.completed[0].task_id, "d");
        assert_eq!(board.needs_action.len(), 1);
        assert_eq!(board.needs_action[0].task_id, "a");

        let summary = TaskSummary::new(&targets, now());
        assert_eq!(summary.total, 4);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.pending, 2);
        assert_eq!(summary.overdue.len(), 1);
    }

    #[test]
    fn proof_paths_are_safe() {
        assert_eq!(
            proof_path("t-1", "s-1", "shelf  front view.jpg", now()),
            format!("t-1/s-1/{}_shelf_front_view.jpg", now().timestamp_millis())
        );
    }

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .seed(
                TASK_TARGETS,
                [
                    row(json!({ "task_id": "t-late", "store_id": "s-1", "status": "pending" })),
                    row(json!({ "task_id": "t-undated", "store_id": "s-1", "status": "in_progress" })),
                    row(json!({ "task_id": "t-soon", "store_id": "s-1", "status": "pending" })),
                    row(json!({ "task_id": "t-resolved", "store_id": "s-1", "status": "pending" })),
                    row(json!({ "task_id": "t-soon", "store_id": "s-2", "status": "pending" })),
                ],
            )
            .await;
        store
            .seed(
                TASKS,
                [
                    row(json!({ "id": "t-late", "title": "Count stock", "priority": "high", "due_at": "2024-05-09T12:00:00Z", "requires_proof": false, "status": "active" })),
                    row(json!({ "id": "t-undated", "title": "Clean windows", "priority": "low", "due_at": null, "requires_proof": null, "status": "active" })),
                    row(json!({ "id": "t-soon", "title": "Build display", "priority": "critical", "due_at": "2024-05-11T09:00:00+00:00", "requires_proof": true, "status": "active" })),
                    row(json!({ "id": "t-resolved", "title": "Old", "priority": "medium", "due_at": "2024-05-01T09:00:00Z", "requires_proof": false, "status": "resolved" })),
                ],
            )
            .await;
        store
    }

    #[tokio::test]
    async fn test_targets_are_active_and_sorted() {
        let service = TaskService::new(seeded().await);

        let targets = service.targets_for_store("s-1").await.unwrap();
        let ids: Vec<&str> = targets.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, vec!["t-late", "t-soon", "t-undated"]);
        assert_eq!(targets[1].task.priority, Priority::Critical);

        assert!(service.targets_for_store("s-9").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_proof_required_before_review() {
        let tables = seeded().await;
        let service = TaskService::new(tables.clone());
        let targets = service.targets_for_store("s-1").await.unwrap();
        let needs_proof = targets.iter().find(|t| t.task_id == "t-soon").unwrap();

        let err = service
            .submit_proof(&tables, needs_proof, Vec::new(), now())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::ProofRequired));

        let files = vec![ProofFile {
            name: "display.jpg".to_string(),
            content_type: "image/jpeg".to_string(),
            bytes: vec![0xff, 0xd8],
        }];
        let status = service
            .submit_proof(&tables, needs_proof, files, now())
            .await
            .unwrap();
        assert_eq!(status, TargetStatus::PendingReview);

        let path = proof_path("t-soon", "s-1", "display.jpg", now());
        assert!(tables.object(&path).await.is_some());

        let proofs = tables.rows(TASK_PROOFS).await;
        assert_eq!(proofs.len(), 1);
        assert_eq!(proofs[0]["image_url"], json!(path));
        assert_eq!(proofs[0]["approved"], json!(null));

        let targets = service.targets_for_store("s-1").await.unwrap();
        let updated = targets.iter().find(|t| t.task_id == "t-soon").unwrap();
        assert_eq!(updated.status, TargetStatus::PendingReview);
        assert_eq!(updated.completed_at, None);

        // The other store's target is untouched.
        let other = service.targets_for_store("s-2").await.unwrap();
        assert_eq!(other[0].status, TargetStatus::Pending);
    }

    #[tokio::test]
    async fn test_completion_without_proof() {
        let tables = seeded().await;
        let service = TaskService::new(tables.clone());
        let targets = service.targets_for_store("s-1").await.unwrap();
        let plain = targets.iter().find(|t| t.task_id == "t-late").unwrap();

        let status = service
            .submit_proof(&tables, plain, Vec::new(), now())
            .await
            .unwrap();
        assert_eq!(status, TargetStatus::Completed);

        let targets = service.targets_for_store("s-1").await.unwrap();
        let done = targets.iter().find(|t| t.task_id == "t-late").unwrap();
        assert_eq!(done.status, TargetStatus::Completed);
        assert_eq!(done.completed_at, Some(now()));
        assert_eq!(done.derived_status(now()), DerivedStatus::Completed);
    }
}
