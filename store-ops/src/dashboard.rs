//! The store manager's landing view.

use chrono::{DateTime, Utc};

use crate::{
    inbox::{InboxService, InboxSummary},
    model::Store,
    performance::{PerformanceService, SalesSummary},
    table::TableStore,
    tasks::{TaskService, TaskSummary},
};

/// Headline figures for one store. A part that could not be loaded is `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct Dashboard {
    /// The store the figures are for.
    pub store: Store,
    /// Task counts and overdue targets.
    pub tasks: Option<TaskSummary>,
    /// Inbox read counts.
    pub inbox: Option<InboxSummary>,
    /// Sales against target on the latest sale date.
    pub sales: Option<SalesSummary>,
}

impl Dashboard {
    /// Loads the task, inbox and sales summaries concurrently.
    #[tracing::instrument(level = "debug", skip_all, fields(store.id = %store.id))]
    pub async fn load<Tables: TableStore>(tables: &Tables, store: &Store, now: DateTime<Utc>) -> Self {
        let tasks = TaskService::new(tables.clone());
        let inbox = InboxService::new(tables.clone());
        let performance = PerformanceService::new(tables.clone());

        let (targets, messages, sales) = futures::join!(
            tasks.targets_for_store(&store.id),
            inbox.inbox_for_store(&store.id),
            performance.summary(&store.code),
        );

        Self {
            store: store.clone(),
            tasks: targets
                .map(|targets| TaskSummary::new(&targets, now))
                .map_err(|err| tracing::error!(error = %err, "task summary unavailable"))
                .ok(),
            inbox: messages
                .map(|messages| InboxSummary::new(&messages))
                .map_err(|err| tracing::error!(error = %err, "inbox summary unavailable"))
                .ok(),
            sales: sales
                .map_err(|err| tracing::error!(error = %err, "sales summary unavailable"))
                .ok(),
        }
    }
}
