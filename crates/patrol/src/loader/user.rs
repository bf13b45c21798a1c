use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use common::model::EditEvent;
use common::replica::Replica;

use super::Stage;

/// Stage 4: total edit count for the editor. Anonymous editors are counted
/// through `revision_userindex`, registered ones through `user.user_editcount`.
pub struct UserEditCount {
    pub replica: Arc<Replica>,
}

impl Stage for UserEditCount {
    fn name(&self) -> &'static str {
        "user_edit_count"
    }

    fn failure_notice(&self) -> &'static str {
        "Failed to get user edit count"
    }

    fn apply(&self, event: &mut EditEvent) -> impl Future<Output = Result<()>> + Send {
        async move {
            let count = self.replica.user_edit_count(&event.user.username).await?;
            event.user.edit_count = count;
            Ok(())
        }
    }
}

/// Stage 5: registration time. Anonymous editors keep 0; a null
/// registration column falls back to the earliest revision.
pub struct UserRegistration {
    pub replica: Arc<Replica>,
}

impl Stage for UserRegistration {
    fn name(&self) -> &'static str {
        "user_registration"
    }

    fn failure_notice(&self) -> &'static str {
        "Failed to get user registration time"
    }

    fn apply(&self, event: &mut EditEvent) -> impl Future<Output = Result<()>> + Send {
        async move {
            if event.is_anonymous() {
                event.user.registration_time = 0;
                return Ok(());
            }
            let timestamp = self
                .replica
                .user_registration_time(&event.user.username)
                .await?;
            event.user.registration_time = timestamp;
            Ok(())
        }
    }
}

/// Stage 6: warning count on the editor's talk page.
pub struct UserWarns {
    pub replica: Arc<Replica>,
}

impl Stage for UserWarns {
    fn name(&self) -> &'static str {
        "user_warns"
    }

    fn failure_notice(&self) -> &'static str {
        "Failed to get user warns count"
    }

    fn apply(&self, event: &mut EditEvent) -> impl Future<Output = Result<()>> + Send {
        async move {
            let count = self.replica.user_warn_count(&event.user.username).await?;
            event.user.warns = count;
            Ok(())
        }
    }
}

/// Stage 7: distinct pages the editor has touched.
pub struct UserDistinctPages {
    pub replica: Arc<Replica>,
}

impl Stage for UserDistinctPages {
    fn name(&self) -> &'static str {
        "user_distinct_pages"
    }

    fn failure_notice(&self) -> &'static str {
        "Failed to get user distinct pages count"
    }

    fn apply(&self, event: &mut EditEvent) -> impl Future<Output = Result<()>> + Send {
        async move {
            let count = self
                .replica
                .user_distinct_pages(&event.user.username)
                .await?;
            event.user.distinct_pages = count;
            Ok(())
        }
    }
}
