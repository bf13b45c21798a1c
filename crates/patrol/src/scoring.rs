use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use common::botdb::BotDb;
use common::config::Config;
use common::model::EditEvent;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::Instrument;

use crate::dynamic::DynamicState;
use crate::loader::SharedReceiver;
use crate::relay::Relays;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const IO_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct WpEditCommon {
    pub page_made_time: i64,
    pub title: String,
    pub namespace: String,
    pub creator: String,
    pub num_recent_edits: i64,
    pub num_recent_reversions: i64,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct WpEditRevision {
    pub timestamp: i64,
    pub text: String,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct WpEdit {
    #[serde(rename = "EditType")]
    pub edit_type: String,
    #[serde(rename = "EditID")]
    pub edit_id: i64,
    pub comment: String,
    pub user: String,
    pub user_edit_count: i64,
    pub user_distinct_pages: i64,
    pub user_warns: i64,
    pub prev_user: String,
    pub user_reg_time: i64,
    pub common: WpEditCommon,
    pub current: WpEditRevision,
    pub previous: WpEditRevision,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename = "WPEditSet")]
pub struct WpEditSet {
    #[serde(rename = "WPEdit")]
    pub edit: WpEdit,
}

#[derive(Debug, Deserialize)]
#[serde(rename = "WPEditSet")]
struct WpVerdictSet {
    #[serde(rename = "WPEdit")]
    edit: WpVerdict,
}

#[derive(Debug, Deserialize)]
struct WpVerdict {
    #[serde(rename = "ThinkVandalism")]
    think_vandalism: bool,
    #[serde(rename = "Score")]
    score: f64,
}

pub fn build_edit_set(event: &EditEvent) -> WpEditSet {
    WpEditSet {
        edit: WpEdit {
            edit_type: "change".to_string(),
            edit_id: event.current.id,
            comment: event.comment.clone(),
            user: event.user.username.clone(),
            user_edit_count: event.user.edit_count,
            user_distinct_pages: event.user.distinct_pages,
            user_warns: event.user.warns,
            prev_user: event.previous.username.clone(),
            user_reg_time: event.user.registration_time,
            common: WpEditCommon {
                page_made_time: event.page.made_time,
                title: event.page.title.clone(),
                namespace: event.page.namespace.clone(),
                creator: event.page.creator.clone(),
                num_recent_edits: event.page.recent_edits,
                num_recent_reversions: event.page.recent_reverts,
            },
            current: WpEditRevision {
                timestamp: event.current.timestamp,
                text: event.current.text.clone(),
            },
            previous: WpEditRevision {
                timestamp: event.previous.timestamp,
                text: event.previous.text.clone(),
            },
        },
    }
}

fn parse_verdict(xml: &str) -> Result<(bool, f64)> {
    let verdict: WpVerdictSet = quick_xml::de::from_str(xml).context("decoding core response")?;
    Ok((verdict.edit.think_vandalism, verdict.edit.score))
}

async fn exchange(address: &str, payload: &[u8]) -> Result<String> {
    let mut stream = timeout(DIAL_TIMEOUT, TcpStream::connect(address))
        .await
        .context("core dial timed out")?
        .with_context(|| format!("could not connect to core at {address}"))?;

    timeout(IO_TIMEOUT, stream.write_all(payload))
        .await
        .context("core write timed out")?
        .context("could not write payload")?;

    let mut response = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = timeout(IO_TIMEOUT, stream.read(&mut chunk))
            .await
            .context("core read timed out")?
            .context("could not read response")?;
        if n == 0 {
            bail!("core closed the connection mid-response");
        }
        response.extend_from_slice(&chunk[..n]);
        if String::from_utf8_lossy(&response).contains("</WPEditSet>") {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&response).into_owned())
}

/// Resolve the Core host, preferring the configured value and falling back
/// to the bookkeeping schema's active node.
async fn core_address(config: &Config, botdb: &BotDb) -> Result<String> {
    let host = if config.core.host.is_empty() {
        match botdb.get_service_host("core").await? {
            Some(host) => host,
            None => bail!("no core host configured and no cluster_node entry"),
        }
    } else {
        config.core.host.clone()
    };
    Ok(format!("{host}:{}", config.core.port))
}

/// Serialize the event, send it to the Core and parse the verdict. The
/// score is stored on the event by the caller.
pub async fn score_change(
    config: &Config,
    botdb: &BotDb,
    event: &EditEvent,
) -> Result<(bool, f64)> {
    let address = core_address(config, botdb).await?;
    let xml = quick_xml::se::to_string(&build_edit_set(event)).context("generating core xml")?;
    tracing::trace!(address = %address, "connecting to core");
    let response = exchange(&address, xml.as_bytes()).await?;
    let (is_vandalism, score) = parse_verdict(&response)?;
    tracing::debug!(is_vandalism, score, "core verdict");
    Ok((is_vandalism, score))
}

async fn process_single(
    event: &mut EditEvent,
    config: &Config,
    botdb: &BotDb,
    dynamic: &DynamicState,
    relays: &Relays,
) -> Result<bool> {
    let host = &config.wikipedia.host;
    let (is_vandalism, score) = score_change(config, botdb, event).await.map_err(|e| {
        metrics::counter!("cbng_edit_status", "state" => "score_edit", "status" => "failed_to_classify")
            .increment(1);
        e
    })?;
    event.vandalism_score = score;

    if !is_vandalism {
        tracing::info!(score, "is not vandalism");
        relays.send_spam(format!(
            "{} # {:.6} # Below threshold # Not reverted",
            event.irc_change_line(host),
            score
        ));
        metrics::counter!("cbng_edit_status", "state" => "score_edit", "status" => "classified_as_not_vandalism")
            .increment(1);
        return Ok(false);
    }
    tracing::info!(score, "is vandalism");

    if dynamic.huggle_whitelist().contains(&event.user.username) {
        tracing::info!(user = %event.user.username, "user is whitelisted, not reverting");
        relays.send_spam(format!(
            "{} # {:.6} # Whitelisted # Not reverted",
            event.irc_change_line(host),
            score
        ));
        metrics::counter!("cbng_edit_status", "state" => "score_edit", "status" => "skipped_due_to_whitelist")
            .increment(1);
        return Ok(false);
    }

    metrics::counter!("cbng_edit_status", "state" => "score_edit", "status" => "classified_as_vandalism")
        .increment(1);
    Ok(true)
}

pub fn spawn_pool(
    workers: usize,
    config: Arc<Config>,
    botdb: BotDb,
    dynamic: Arc<DynamicState>,
    relays: Relays,
    inbound: SharedReceiver,
    outbound: mpsc::Sender<EditEvent>,
) -> Vec<JoinHandle<()>> {
    (0..workers)
        .map(|_| {
            let config = config.clone();
            let botdb = botdb.clone();
            let dynamic = dynamic.clone();
            let relays = relays.clone();
            let inbound = inbound.clone();
            let outbound = outbound.clone();
            tokio::spawn(async move {
                loop {
                    let received = { inbound.lock().await.recv().await };
                    let Some(mut event) = received else { break };

                    metrics::gauge!("cbng_stage_in_use", "stage" => "scoring").increment(1.0);
                    let span = event.span.clone();
                    let result =
                        process_single(&mut event, &config, &botdb, &dynamic, &relays)
                            .instrument(span)
                            .await;
                    match result {
                        Ok(true) => {
                            if outbound.send(event).await.is_err() {
                                metrics::gauge!("cbng_stage_in_use", "stage" => "scoring")
                                    .decrement(1.0);
                                break;
                            }
                        }
                        Ok(false) => {}
                        Err(e) => {
                            tracing::error!(uuid = %event.uuid, error = %e, "failed to score change");
                            relays.send_debug(format!(
                                "{} # Failed to score change",
                                event.irc_change_line(&config.wikipedia.host)
                            ));
                        }
                    }
                    metrics::gauge!("cbng_stage_in_use", "stage" => "scoring").decrement(1.0);
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

    fn sample_event() -> EditEvent {
        EditEvent {
            uuid: "u".to_string(),
            received_time: Utc::now(),
            change_time: 0,
            comment: "rm cruft".to_string(),
            length: 42,
            page: PageInfo {
                namespace: "Main".to_string(),
                namespace_id: 0,
                title: "Example Page".to_string(),
                creator: "Creator".to_string(),
                made_time: 1_500_000_000,
                recent_edits: 7,
                recent_reverts: 2,
            },
            user: UserInfo {
                username: "192.0.2.5".to_string(),
                edit_count: 3,
                distinct_pages: 2,
                warns: 1,
                registration_time: 0,
            },
            current: RevisionInfo {
                id: 112,
                timestamp: 1_700_000_100,
                text: "new text".to_string(),
                username: "192.0.2.5".to_string(),
            },
            previous: RevisionInfo {
                id: 111,
                timestamp: 1_700_000_000,
                text: "old text".to_string(),
                username: "Bob".to_string(),
            },
            vandalism_score: 0.0,
            revert_reason: String::new(),
            span: tracing::Span::none(),
        }
    }

    #[test]
    fn test_edit_set_round_trips_through_xml() {
        let edit_set = build_edit_set(&sample_event());
        let xml = quick_xml::se::to_string(&edit_set).unwrap();
        assert!(xml.starts_with("<WPEditSet>"));
        assert!(xml.contains("<EditType>change</EditType>"));
        assert!(xml.contains("<EditID>112</EditID>"));
        assert!(xml.contains("<prev_user>Bob</prev_user>"));
        assert!(xml.contains("<num_recent_reversions>2</num_recent_reversions>"));

        let decoded: WpEditSet = quick_xml::de::from_str(&xml).unwrap();
        assert_eq!(decoded, edit_set);
    }

    #[test]
    fn test_parse_verdict() {
        let xml = "<WPEditSet><WPEdit><ThinkVandalism>true</ThinkVandalism><Score>0.97</Score></WPEdit></WPEditSet>";
        let (is_vandalism, score) = parse_verdict(xml).unwrap();
        assert!(is_vandalism);
        assert!((score - 0.97).abs() < f64::EPSILON);

        let xml = "<WPEditSet><WPEdit><ThinkVandalism>false</ThinkVandalism><Score>0.12</Score></WPEdit></WPEditSet>";
        let (is_vandalism, score) = parse_verdict(xml).unwrap();
        assert!(!is_vandalism);
        assert!((score - 0.12).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_verdict_rejects_malformed_payload() {
        assert!(parse_verdict("<WPEditSet><WPEdit></WPEdit></WPEditSet>").is_err());
        assert!(parse_verdict("not xml at all").is_err());
    }
}
