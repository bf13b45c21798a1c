use std::future::Future;
use std::sync::Arc;

use anyhow::{bail, Result};
use common::model::EditEvent;
use common::wikipedia::WikipediaClient;

use super::Stage;

/// Fetch the current and previous revision bodies from the wiki API. Both
/// must be complete (non-empty text, non-zero timestamp) or the event is
/// dropped.
pub struct RevisionLoader {
    pub api: Arc<WikipediaClient>,
}

impl Stage for RevisionLoader {
    fn name(&self) -> &'static str {
        "page_revisions"
    }

    fn failure_notice(&self) -> &'static str {
        "Failed to get page revision"
    }

    fn apply(&self, event: &mut EditEvent) -> impl Future<Output = Result<()>> + Send {
        async move {
            let (current, previous) = self
                .api
                .get_revision(&event.page.title, event.current.id)
                .await?;
            if current.timestamp == 0
                || current.text.is_empty()
                || previous.timestamp == 0
                || previous.text.is_empty()
            {
                bail!("failed to get complete revision data");
            }
            event.current = current;
            event.previous = previous;
            Ok(())
        }
    }
}
