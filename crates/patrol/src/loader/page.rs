use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use common::model::EditEvent;
use common::replica::Replica;

use super::Stage;

const FOURTEEN_DAYS: i64 = 14 * 86_400;

/// Stage 1: first revision of the page sets creator and creation time.
pub struct PageMetadata {
    pub replica: Arc<Replica>,
}

impl Stage for PageMetadata {
    fn name(&self) -> &'static str {
        "page_metadata"
    }

    fn failure_notice(&self) -> &'static str {
        "Failed to get page metadata"
    }

    fn apply(&self, event: &mut EditEvent) -> impl Future<Output = Result<()>> + Send {
        async move {
            let (creator, made_time) = self
                .replica
                .page_created(event.page.namespace_id, &event.sql_title())
                .await?;
            tracing::debug!(creator = %creator, made_time, "found page creator");
            event.page.creator = creator;
            event.page.made_time = made_time;
            Ok(())
        }
    }
}

/// Stage 2: count of page revisions in the last 14 days.
pub struct PageRecentEdits {
    pub replica: Arc<Replica>,
}

impl Stage for PageRecentEdits {
    fn name(&self) -> &'static str {
        "page_recent_edits"
    }

    fn failure_notice(&self) -> &'static str {
        "Failed to get page recent edit count"
    }

    fn apply(&self, event: &mut EditEvent) -> impl Future<Output = Result<()>> + Send {
        async move {
            let since = event.received_time.timestamp() - FOURTEEN_DAYS;
            let count = self
                .replica
                .page_recent_edit_count(event.page.namespace_id, &event.sql_title(), since)
                .await?;
            event.page.recent_edits = count;
            Ok(())
        }
    }
}

/// Stage 3: count of revert-like revisions in the last 14 days.
pub struct PageRecentReverts {
    pub replica: Arc<Replica>,
}

impl Stage for PageRecentReverts {
    fn name(&self) -> &'static str {
        "page_recent_reverts"
    }

    fn failure_notice(&self) -> &'static str {
        "Failed to get page recent revert count"
    }

    fn apply(&self, event: &mut EditEvent) -> impl Future<Output = Result<()>> + Send {
        async move {
            let since = event.received_time.timestamp() - FOURTEEN_DAYS;
            let count = self
                .replica
                .page_recent_revert_count(event.page.namespace_id, &event.sql_title(), since)
                .await?;
            event.page.recent_reverts = count;
            Ok(())
        }
    }
}
