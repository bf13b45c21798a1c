use anyhow::Result;
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

pub fn describe() {
    describe_counter!(
        "tracing_error_events",
        "Cumulative count of all ERROR-level tracing events."
    );
    describe_counter!(
        "cbng_feed_status",
        "Feed lines by disposition (decoded, rejected_type, rejected_server, rejected_namespace, received)."
    );
    describe_counter!(
        "cbng_edit_status",
        "Edit progress through the pipeline, labeled by state and status."
    );
    describe_counter!(
        "cbng_revert_status",
        "Revert decision and execution outcomes, labeled by state, status and meta."
    );
    describe_counter!(
        "cbng_replication_watcher",
        "Replication watcher dispositions (success, timeout)."
    );
    describe_gauge!(
        "cbng_replication_watcher_pending",
        "Events currently held waiting for the replica to catch up."
    );
    describe_gauge!(
        "cbng_pending_events",
        "Depth of each inter-stage queue, labeled by stage."
    );
    describe_gauge!(
        "cbng_stage_in_use",
        "Workers currently busy in each stage pool."
    );
    describe_gauge!(
        "cbng_replica_pool",
        "Replica connection pool stats, labeled by instance and metric."
    );
    describe_counter!(
        "cbng_irc_notifications_sent",
        "Messages handed to each IRC relay channel."
    );
    describe_gauge!(
        "cbng_irc_notifications_pending",
        "Messages queued towards each IRC relay channel."
    );
    describe_counter!(
        "cbng_dynamic_reloads",
        "Dynamic configuration reloads, labeled by instance and outcome."
    );
}

pub fn install_prometheus(port: u16) -> Result<()> {
    // The metrics endpoint is scraped from outside the pod, so bind wide.
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(anyhow::Error::msg)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prometheus_handle_renders_metric_names() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        describe();

        metrics::with_local_recorder(&recorder, || {
            metrics::counter!("cbng_feed_status", "status" => "received").increment(1);
            metrics::counter!("cbng_edit_status", "state" => "revert", "status" => "success")
                .increment(1);
            metrics::gauge!("cbng_pending_events", "stage" => "scoring").set(3.0);
        });

        let rendered = handle.render();
        assert!(rendered.contains("cbng_feed_status"));
        assert!(rendered.contains(r#"status="received""#));
        assert!(rendered.contains("cbng_edit_status"));
        assert!(rendered.contains("cbng_pending_events"));
    }
}
