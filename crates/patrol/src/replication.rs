use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use common::config::Config;
use common::model::EditEvent;
use common::replica::Replica;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::dynamic::{self, Triggers};

/// How long an event may wait for the replica before it is dropped.
const MAX_PENDING_SECS: i64 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Release,
    Expire,
    Wait,
}

/// Decide what to do with one pending event on a tick. `replication_point`
/// is `None` only when replication checking is disabled.
pub fn disposition(
    now: i64,
    received: i64,
    change_time: i64,
    replication_point: Option<i64>,
    ignore_replication_delay: bool,
) -> Disposition {
    if ignore_replication_delay {
        return Disposition::Release;
    }
    if let Some(point) = replication_point {
        if point >= change_time {
            return Disposition::Release;
        }
    }
    if now - received > MAX_PENDING_SECS {
        Disposition::Expire
    } else {
        Disposition::Wait
    }
}

fn check_reload_triggers(config: &Config, triggers: &Triggers, title: &str) {
    // Feed titles carry spaces; the config page names are underscored.
    let title = title.replace(' ', "_");
    if title == dynamic::angry_optin_page(config) {
        triggers.angry_optin.fire();
    }
    if title == dynamic::run_page(config) {
        triggers.run.fire();
    }
    if title == dynamic::namespace_optin_page(config) {
        triggers.namespace_optin.fire();
    }
    if title == dynamic::tfa_page().replace(' ', "_") {
        triggers.tfa.fire();
    }
}

/// Hold events until the replica has absorbed them. A single task owns the
/// pending map; the one-second tick skips missed ticks rather than queueing
/// them, so at most one tick is ever in flight.
pub async fn run(
    config: Arc<Config>,
    replica: Arc<Replica>,
    triggers: Triggers,
    ignore_replication_delay: bool,
    mut inbound: mpsc::Receiver<EditEvent>,
    outbound: mpsc::Sender<EditEvent>,
) {
    let mut pending: HashMap<String, EditEvent> = HashMap::new();
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                metrics::gauge!("cbng_replication_watcher_pending").set(pending.len() as f64);

                let replication_point = if ignore_replication_delay {
                    None
                } else {
                    match replica.latest_change_timestamp().await {
                        Ok(point) => Some(point),
                        Err(e) => {
                            // Skip the tick; events age but are not dropped
                            // on a failed replication-point read.
                            tracing::warn!(error = %e, "failed to get current replication point");
                            continue;
                        }
                    }
                };

                let now = Utc::now().timestamp();
                let mut released = Vec::new();
                let mut expired = Vec::new();
                for (uuid, event) in &pending {
                    match disposition(
                        now,
                        event.received_time.timestamp(),
                        event.change_time,
                        replication_point,
                        ignore_replication_delay,
                    ) {
                        Disposition::Release => released.push(uuid.clone()),
                        Disposition::Expire => expired.push(uuid.clone()),
                        Disposition::Wait => {
                            tracing::debug!(uuid = %uuid, "change still pending replication");
                        }
                    }
                }

                for uuid in expired {
                    if let Some(event) = pending.remove(&uuid) {
                        tracing::error!(uuid = %event.uuid, "change expired while pending");
                        metrics::counter!("cbng_edit_status", "state" => "wait_for_replication", "status" => "failed")
                            .increment(1);
                        metrics::counter!("cbng_replication_watcher", "result" => "timeout")
                            .increment(1);
                    }
                }
                for uuid in released {
                    if let Some(event) = pending.remove(&uuid) {
                        tracing::trace!(uuid = %event.uuid, point = ?replication_point, "change past replication point");
                        metrics::counter!("cbng_edit_status", "state" => "wait_for_replication", "status" => "success")
                            .increment(1);
                        metrics::counter!("cbng_replication_watcher", "result" => "success")
                            .increment(1);
                        if outbound.send(event).await.is_err() {
                            return;
                        }
                    }
                }
            }

            maybe_event = inbound.recv() => {
                let Some(event) = maybe_event else { return };
                // The trigger is asynchronous; the event still proceeds.
                check_reload_triggers(&config, &triggers, &event.page.title);
                pending.insert(event.uuid.clone(), event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    #[test]
    fn test_releases_once_replica_caught_up() {
        // Replication point at or past the change time releases the event.
        assert_eq!(
            disposition(NOW, NOW - 5, NOW - 10, Some(NOW - 10), false),
            Disposition::Release
        );
        assert_eq!(
            disposition(NOW, NOW - 5, NOW - 10, Some(NOW), false),
            Disposition::Release
        );
    }

    #[test]
    fn test_waits_while_replica_lags() {
        assert_eq!(
            disposition(NOW, NOW - 5, NOW - 10, Some(NOW - 60), false),
            Disposition::Wait
        );
    }

    #[test]
    fn test_boundary_at_two_minutes() {
        // 119 s pending, replica caught up: released.
        assert_eq!(
            disposition(NOW, NOW - 119, NOW - 119, Some(NOW), false),
            Disposition::Release
        );
        // 119 s pending, replica still behind: waits.
        assert_eq!(
            disposition(NOW, NOW - 119, NOW - 119, Some(NOW - 200), false),
            Disposition::Wait
        );
        // 121 s pending, replica still behind: expired.
        assert_eq!(
            disposition(NOW, NOW - 121, NOW - 121, Some(NOW - 200), false),
            Disposition::Expire
        );
    }

    #[test]
    fn test_ignore_replication_delay_releases_immediately() {
        assert_eq!(
            disposition(NOW, NOW, NOW, None, true),
            Disposition::Release
        );
    }
}
