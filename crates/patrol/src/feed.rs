use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use common::config::Config;
use common::model::{namespace_name, EditEvent, PageInfo, RevisionInfo, UserInfo};
use common::wikipedia::WikipediaClient;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use uuid::Uuid;

const FEED_URL: &str = "https://stream.wikimedia.org/v2/stream/mediawiki.recentchange";

#[derive(Debug, Deserialize)]
struct WireLength {
    old: Option<i64>,
    new: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WireRevision {
    old: Option<i64>,
    new: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WireChange {
    #[serde(rename = "type")]
    kind: String,
    namespace: i64,
    timestamp: i64,
    title: String,
    #[serde(default)]
    comment: String,
    user: String,
    length: Option<WireLength>,
    revision: Option<WireRevision>,
    server_name: String,
}

/// Outcome of one feed line, separated from IO so admission is testable.
#[derive(Debug)]
pub enum LineOutcome {
    /// Not a `data:` line; nothing to do.
    NotData,
    Rejected(&'static str),
    Accepted(Box<EditEvent>),
}

/// Lowercased namespace name with the trailing colon stripped; empty maps
/// to "main".
fn feed_namespace(namespace_id: i64) -> String {
    let name = namespace_name(namespace_id)
        .to_lowercase()
        .trim_end_matches(':')
        .to_string();
    if name.is_empty() {
        "main".to_string()
    } else {
        name
    }
}

pub fn handle_line(
    line: &str,
    wiki_host: &str,
    namespace_optin: &HashSet<String>,
) -> LineOutcome {
    let Some(payload) = line.strip_prefix("data:") else {
        return LineOutcome::NotData;
    };

    let change: WireChange = match serde_json::from_str(payload.trim()) {
        Ok(change) => change,
        Err(e) => {
            tracing::warn!(error = %e, "feed decoding failed");
            return LineOutcome::Rejected("decoding_failed");
        }
    };
    metrics::counter!("cbng_feed_status", "status" => "decoded").increment(1);

    if change.kind != "edit" {
        return LineOutcome::Rejected("rejected_type");
    }
    if change.server_name != wiki_host {
        return LineOutcome::Rejected("rejected_server");
    }

    let namespace = feed_namespace(change.namespace);
    if change.namespace != 0 && !namespace_optin.contains(&namespace) {
        tracing::debug!(namespace = %namespace, id = change.namespace, "skipping change due to namespace");
        return LineOutcome::Rejected("rejected_namespace");
    }

    let uuid = Uuid::new_v4().to_string();
    let received_time = Utc::now();
    let span = tracing::info_span!("edit", uuid = %uuid);

    let event = EditEvent {
        uuid,
        received_time,
        change_time: change.timestamp,
        comment: change.comment,
        length: change.length.as_ref().map_or(0, |l| {
            l.new.unwrap_or(0) - l.old.unwrap_or(0)
        }),
        page: PageInfo {
            namespace: namespace_name(change.namespace).to_string(),
            namespace_id: change.namespace,
            title: change.title,
            ..PageInfo::default()
        },
        user: UserInfo {
            username: change.user,
            ..UserInfo::default()
        },
        current: RevisionInfo {
            id: change.revision.as_ref().and_then(|r| r.new).unwrap_or(0),
            ..RevisionInfo::default()
        },
        previous: RevisionInfo {
            id: change.revision.as_ref().and_then(|r| r.old).unwrap_or(0),
            ..RevisionInfo::default()
        },
        vandalism_score: 0.0,
        revert_reason: String::new(),
        span,
    };
    LineOutcome::Accepted(Box::new(event))
}

/// Returns Ok once a connection was established, whatever ends it later;
/// Err means the connection itself failed.
async fn stream_feed(
    client: &reqwest::Client,
    config: &Config,
    namespace_optin: impl Fn() -> Arc<HashSet<String>>,
    feed_tx: &mpsc::Sender<EditEvent>,
) -> Result<()> {
    tracing::info!("connecting to feed");
    let response = client
        .get(FEED_URL)
        .send()
        .await
        .context("feed request failed")?
        .error_for_status()?;

    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::error!(error = %e, "feed read failed");
                return Ok(());
            }
        };
        buffer.extend_from_slice(&chunk);
        while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            match handle_line(&line, &config.wikipedia.host, &namespace_optin()) {
                LineOutcome::NotData => {}
                LineOutcome::Rejected(status) => {
                    metrics::counter!("cbng_feed_status", "status" => status).increment(1);
                }
                LineOutcome::Accepted(event) => {
                    metrics::counter!("cbng_feed_status", "status" => "received").increment(1);
                    metrics::counter!("cbng_edit_status", "state" => "received_new", "status" => "success")
                        .increment(1);
                    tracing::info!(
                        uuid = %event.uuid,
                        user = %event.user.username,
                        title = %event.page.title,
                        oldid = event.previous.id,
                        curid = event.current.id,
                        "received new event"
                    );
                    if feed_tx.send(*event).await.is_err() {
                        anyhow::bail!("pipeline closed");
                    }
                }
            }
        }
    }
    Ok(())
}

/// Consume the SSE change feed forever, reconnecting with linear backoff
/// (N seconds after the Nth consecutive failure since the last success).
pub async fn run(
    config: Arc<Config>,
    namespace_optin: impl Fn() -> Arc<HashSet<String>> + Send + 'static,
    feed_tx: mpsc::Sender<EditEvent>,
) {
    // No overall request timeout: the stream is long-lived by design.
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .expect("feed client build failed");

    let mut attempts: u64 = 0;
    loop {
        match stream_feed(&client, &config, &namespace_optin, &feed_tx).await {
            Ok(()) => {
                // The stream connected and later ended cleanly.
                attempts = 0;
            }
            Err(e) => {
                tracing::error!(error = %e, "feed stream failed");
            }
        }
        attempts += 1;
        tracing::info!(attempts, "stream returned, reconnecting");
        tokio::time::sleep(Duration::from_secs(attempts)).await;
    }
}

/// Alternative ingress: fetch one revision by id and emit a single event.
pub async fn emit_single_edit(
    api: &WikipediaClient,
    change_id: i64,
    feed_tx: &mpsc::Sender<EditEvent>,
) -> Result<()> {
    let meta = api
        .get_revision_metadata(change_id)
        .await
        .context("could not get revision metadata")?;
    let history = api
        .get_revision_history(&meta.title, change_id)
        .await
        .context("could not get revision history")?;
    if history.len() < 2 {
        anyhow::bail!("revision {change_id} has no prior revision");
    }

    let uuid = Uuid::new_v4().to_string();
    let span = tracing::info_span!("edit", uuid = %uuid);
    let event = EditEvent {
        uuid,
        received_time: Utc::now(),
        change_time: meta.timestamp,
        comment: meta.comment.clone(),
        length: meta.size,
        page: PageInfo {
            namespace: namespace_name(meta.namespace_id).to_string(),
            namespace_id: meta.namespace_id,
            title: meta.title.clone(),
            ..PageInfo::default()
        },
        user: UserInfo {
            username: meta.username.clone(),
            ..UserInfo::default()
        },
        current: RevisionInfo {
            id: change_id,
            ..RevisionInfo::default()
        },
        previous: RevisionInfo {
            id: history[1].id,
            ..RevisionInfo::default()
        },
        vandalism_score: 0.0,
        revert_reason: String::new(),
        span,
    };
    tracing::info!(
        uuid = %event.uuid,
        user = %event.user.username,
        title = %event.page.title,
        "emitting single edit"
    );
    feed_tx.send(event).await.map_err(|_| anyhow::anyhow!("pipeline closed"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: &str = "en.wikipedia.org";

    fn sample_json(kind: &str, namespace: i64, server: &str) -> String {
        format!(
            concat!(
                r#"data: {{"type":"{kind}","namespace":{ns},"title":"Example Page","#,
                r#""comment":"c","user":"192.0.2.5","timestamp":1700000000,"#,
                r#""length":{{"old":100,"new":150}},"revision":{{"old":111,"new":112}},"#,
                r#""server_name":"{server}"}}"#
            ),
            kind = kind,
            ns = namespace,
            server = server,
        )
    }

    #[test]
    fn test_accepts_main_namespace_edit() {
        let line = sample_json("edit", 0, HOST);
        match handle_line(&line, HOST, &HashSet::new()) {
            LineOutcome::Accepted(event) => {
                assert_eq!(event.page.title, "Example Page");
                assert_eq!(event.user.username, "192.0.2.5");
                assert_eq!(event.length, 50);
                assert_eq!(event.current.id, 112);
                assert_eq!(event.previous.id, 111);
                assert_eq!(event.change_time, 1_700_000_000);
                assert!(!event.uuid.is_empty());
            }
            other => panic!("expected acceptance, got {other:?}"),
        }
    }

    #[test]
    fn test_rejects_non_edit_type() {
        let line = sample_json("log", 0, HOST);
        assert!(matches!(
            handle_line(&line, HOST, &HashSet::new()),
            LineOutcome::Rejected("rejected_type")
        ));
    }

    #[test]
    fn test_rejects_other_server() {
        let line = sample_json("edit", 0, "de.wikipedia.org");
        assert!(matches!(
            handle_line(&line, HOST, &HashSet::new()),
            LineOutcome::Rejected("rejected_server")
        ));
    }

    #[test]
    fn test_rejects_namespace_without_optin() {
        let line = sample_json("edit", 2, HOST);
        assert!(matches!(
            handle_line(&line, HOST, &HashSet::new()),
            LineOutcome::Rejected("rejected_namespace")
        ));
    }

    #[test]
    fn test_admits_namespace_with_optin() {
        // Build the set through the real reload parser so this exercises
        // the producer-to-gate path, wikilink casing included.
        let line = sample_json("edit", 2, HOST);
        let optin = crate::dynamic::parse_namespace_optin("* [[User]] - requested");
        assert!(matches!(
            handle_line(&line, HOST, &optin),
            LineOutcome::Accepted(_)
        ));

        let talk_line = sample_json("edit", 3, HOST);
        let optin = crate::dynamic::parse_namespace_optin("* [[User talk]] - requested");
        assert!(matches!(
            handle_line(&talk_line, HOST, &optin),
            LineOutcome::Accepted(_)
        ));
    }

    #[test]
    fn test_ignores_non_data_lines() {
        assert!(matches!(
            handle_line("event: message", HOST, &HashSet::new()),
            LineOutcome::NotData
        ));
        assert!(matches!(
            handle_line("", HOST, &HashSet::new()),
            LineOutcome::NotData
        ));
    }

    #[test]
    fn test_rejects_malformed_json() {
        assert!(matches!(
            handle_line("data: {not json", HOST, &HashSet::new()),
            LineOutcome::Rejected("decoding_failed")
        ));
    }

    #[test]
    fn test_feed_namespace_names() {
        assert_eq!(feed_namespace(0), "main");
        assert_eq!(feed_namespace(2), "user");
        assert_eq!(feed_namespace(3), "user talk");
    }
}
