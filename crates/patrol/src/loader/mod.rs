mod page;
mod revision;
mod user;

pub use page::{PageMetadata, PageRecentEdits, PageRecentReverts};
pub use revision::RevisionLoader;
pub use user::{UserDistinctPages, UserEditCount, UserRegistration, UserWarns};

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use common::model::EditEvent;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::relay::Relays;

/// Every enrichment stage is the same capability: mutate one declared part
/// of the event, or fail and have the event dropped.
pub trait Stage: Send + Sync + 'static {
    /// Metric/gauge label, e.g. "page_metadata".
    fn name(&self) -> &'static str;

    /// Debug-relay suffix on failure, e.g. "Failed to get page metadata".
    fn failure_notice(&self) -> &'static str;

    fn apply(&self, event: &mut EditEvent) -> impl Future<Output = Result<()>> + Send;
}

/// A stage inbox shared by all workers of its pool.
pub type SharedReceiver = Arc<Mutex<mpsc::Receiver<EditEvent>>>;

pub fn shared(receiver: mpsc::Receiver<EditEvent>) -> SharedReceiver {
    Arc::new(Mutex::new(receiver))
}

/// Spawn `workers` identical workers over one inbox. Each worker loops:
/// receive, enrich, forward; failures drop the event after a log line, a
/// metric and a debug-relay notice.
pub fn spawn_pool<S: Stage>(
    workers: usize,
    stage: Arc<S>,
    inbound: SharedReceiver,
    outbound: mpsc::Sender<EditEvent>,
    relays: Relays,
    wiki_host: String,
) -> Vec<JoinHandle<()>> {
    (0..workers)
        .map(|_| {
            let stage = stage.clone();
            let inbound = inbound.clone();
            let outbound = outbound.clone();
            let relays = relays.clone();
            let wiki_host = wiki_host.clone();
            tokio::spawn(async move {
                loop {
                    let received = { inbound.lock().await.recv().await };
                    let Some(mut event) = received else { break };

                    let name = stage.name();
                    metrics::gauge!("cbng_stage_in_use", "stage" => name).increment(1.0);
                    let span = event.span.clone();

                    match stage.apply(&mut event).instrument(span).await {
                        Ok(()) => {
                            metrics::counter!("cbng_edit_status", "state" => name, "status" => "success")
                                .increment(1);
                            if outbound.send(event).await.is_err() {
                                metrics::gauge!("cbng_stage_in_use", "stage" => name)
                                    .decrement(1.0);
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::error!(uuid = %event.uuid, stage = name, error = %e, "stage failed");
                            metrics::counter!("cbng_edit_status", "state" => name, "status" => "failed")
                                .increment(1);
                            relays.send_debug(format!(
                                "{} # {}",
                                event.irc_change_line(&wiki_host),
                                stage.failure_notice()
                            ));
                        }
                    }
                    metrics::gauge!("cbng_stage_in_use", "stage" => name).decrement(1.0);
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::model::{PageInfo, RevisionInfo, UserInfo};

    struct AddCreator;

    impl Stage for AddCreator {
        fn name(&self) -> &'static str {
            "add_creator"
        }

        fn failure_notice(&self) -> &'static str {
            "Failed to add creator"
        }

        fn apply(&self, event: &mut EditEvent) -> impl Future<Output = Result<()>> + Send {
            let fail = event.page.title == "fail";
            event.page.creator = "Creator".to_string();
            async move {
                if fail {
                    anyhow::bail!("boom");
                }
                Ok(())
            }
        }
    }

    fn event_with_title(title: &str) -> EditEvent {
        EditEvent {
            uuid: "u".to_string(),
            received_time: Utc::now(),
            change_time: 0,
            comment: String::new(),
            length: 0,
            page: PageInfo {
                title: title.to_string(),
                namespace: "Main".to_string(),
                ..PageInfo::default()
            },
            user: UserInfo::default(),
            current: RevisionInfo::default(),
            previous: RevisionInfo::default(),
            vandalism_score: 0.0,
            revert_reason: String::new(),
            span: tracing::Span::none(),
        }
    }

    #[tokio::test]
    async fn test_pool_forwards_on_success_and_drops_on_failure() {
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let handles = spawn_pool(
            2,
            Arc::new(AddCreator),
            shared(in_rx),
            out_tx,
            Relays::disabled(),
            "en.wikipedia.org".to_string(),
        );

        in_tx.send(event_with_title("fail")).await.unwrap();
        in_tx.send(event_with_title("ok")).await.unwrap();
        drop(in_tx);

        let forwarded = out_rx.recv().await.expect("one event should pass");
        assert_eq!(forwarded.page.title, "ok");
        assert_eq!(forwarded.page.creator, "Creator");
        assert!(out_rx.recv().await.is_none());

        for handle in handles {
            handle.await.unwrap();
        }
    }
}
