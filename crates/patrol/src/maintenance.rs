use std::sync::Arc;
use std::time::Duration;

use common::botdb::BotDb;
use common::model::EditEvent;
use common::replica::Replica;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::relay::Relays;

/// Depth of a bounded queue as seen from its sender.
fn queue_depth(sender: &mpsc::Sender<EditEvent>) -> usize {
    sender.max_capacity() - sender.capacity()
}

/// Sample queue depths, relay backlogs and replica pool stats every second.
pub fn spawn_metric_poller(
    queues: Vec<(&'static str, mpsc::Sender<EditEvent>)>,
    relays: Relays,
    replica: Arc<Replica>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            for (stage, sender) in &queues {
                metrics::gauge!("cbng_pending_events", "stage" => *stage)
                    .set(queue_depth(sender) as f64);
            }
            for (channel, pending) in relays.pending_counts() {
                metrics::gauge!("cbng_irc_notifications_pending", "channel" => channel)
                    .set(pending as f64);
            }
            replica.record_pool_metrics();
        }
    });
}

/// Hourly purge of dedupe rows below the recent-revert horizon.
pub fn spawn_purger(botdb: BotDb) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Skip the immediate first tick; there is nothing to purge at boot.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match botdb.purge_old_revert_times().await {
                Ok(purged) => tracing::info!(purged, "purged old revert times"),
                Err(e) => tracing::warn!(error = %e, "failed to purge old revert times"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::model::{PageInfo, RevisionInfo, UserInfo};

    fn event() -> EditEvent {
        EditEvent {
            uuid: "u".to_string(),
            received_time: Utc::now(),
            change_time: 0,
            comment: String::new(),
            length: 0,
            page: PageInfo::default(),
            user: UserInfo::default(),
            current: RevisionInfo::default(),
            previous: RevisionInfo::default(),
            vandalism_score: 0.0,
            revert_reason: String::new(),
            span: tracing::Span::none(),
        }
    }

    #[tokio::test]
    async fn test_queue_depth_tracks_buffered_events() {
        let (tx, mut rx) = mpsc::channel(10);
        assert_eq!(queue_depth(&tx), 0);
        tx.send(event()).await.unwrap();
        tx.send(event()).await.unwrap();
        assert_eq!(queue_depth(&tx), 2);
        rx.recv().await.unwrap();
        assert_eq!(queue_depth(&tx), 1);
    }
}
