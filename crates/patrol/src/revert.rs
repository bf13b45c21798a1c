use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use chrono::Utc;
use common::botdb::BotDb;
use common::config::{Config, RECENT_REVERT_THRESHOLD};
use common::model::{is_ip, page_title, EditEvent};
use common::wikipedia::WikipediaClient;
use regex::Regex;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::dynamic::DynamicState;
use crate::loader::SharedReceiver;
use crate::relay::Relays;

const AIV_PAGE: &str = "Wikipedia:Administrator_intervention_against_vandalism/TB2";

/// Outcome of the should-revert table: first matching rule wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Revert(&'static str),
    Skip(&'static str),
}

impl Verdict {
    pub fn reason(self) -> &'static str {
        match self {
            Verdict::Revert(reason) | Verdict::Skip(reason) => reason,
        }
    }
}

/// Everything the decision table reads besides the event itself. The
/// last-revert time is fetched before the attempt is recorded, so the row
/// written for this very event is not observed by its own decision.
pub struct DecisionInput<'a> {
    pub local_run: bool,
    pub remote_run: bool,
    pub angry: bool,
    pub bot_username: &'a str,
    pub page_creator: &'a str,
    pub tfa: &'a str,
    pub angry_optin: &'a HashSet<String>,
    pub last_revert_time: Option<i64>,
    pub now: i64,
}

fn bots_deny_matches(text: &str, name: &str) -> bool {
    let pattern = format!(
        r"\{{\{{bots\s*\|\s*deny\s*=[^}}]*({}|\*)[^}}]*\}}\}}",
        regex::escape(name)
    );
    Regex::new(&pattern).map_or(false, |re| re.is_match(text))
}

fn bots_allow_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{bots\s*\|\s*allow\s*=([^}]*)\}\}").expect("allow regex"))
}

/// Exclusion compliance: `{{nobots}}`, `{{bots|deny=...}}` naming the bot
/// (raw or underscored) or `*`, or `{{bots|allow=...}}` that does not name
/// the bot in either form.
pub fn exclusion_applies(text: &str, bot_username: &str) -> bool {
    if text.contains("{{nobots}}") {
        return true;
    }

    let underscored = bot_username.replace(' ', "_");
    let names = [bot_username, underscored.as_str()];

    for name in names {
        if bots_deny_matches(text, name) {
            return true;
        }
    }

    if let Some(captures) = bots_allow_regex().captures(text) {
        let allowed = &captures[1];
        if !names.iter().any(|name| allowed.contains(name)) {
            return true;
        }
    }
    false
}

fn decision_metric(status: &'static str, meta: &'static str) {
    metrics::counter!(
        "cbng_revert_status",
        "state" => "should_revert",
        "status" => status,
        "meta" => meta
    )
    .increment(1);
}

/// The 14-rule revert decision, evaluated strictly in order.
pub fn decide(event: &EditEvent, input: &DecisionInput<'_>) -> Verdict {
    if !input.local_run {
        decision_metric("failed", "local_config");
        return Verdict::Skip("Run Disabled");
    }
    if !input.remote_run {
        decision_metric("failed", "remote_config");
        return Verdict::Skip("Run Disabled");
    }
    if event.user.username == input.bot_username {
        decision_metric("failed", "self_edit");
        return Verdict::Skip("User is myself");
    }
    if input.angry {
        decision_metric("success", "angry");
        return Verdict::Revert("Angry-reverting in angry mode");
    }
    if exclusion_applies(&event.current.text, input.bot_username) {
        decision_metric("failed", "exclusion_compliance");
        return Verdict::Skip("Exclusion compliance");
    }
    if event.user.username == input.page_creator {
        decision_metric("failed", "common_creator");
        return Verdict::Skip("User is creator");
    }
    if event.user.edit_count > 50 {
        let warn_ratio = event.user.warns as f64 / event.user.edit_count as f64;
        if warn_ratio < 0.1 {
            decision_metric("failed", "high_edit_count");
            return Verdict::Skip("User has edit count");
        }
        decision_metric("success", "edit_count_warn_perc");
        return Verdict::Revert("User has edit count, but warns > 10%");
    }
    if !input.tfa.is_empty() && event.page.title == input.tfa {
        decision_metric("success", "angry_tfa");
        return Verdict::Revert("Angry-reverting on TFA");
    }
    if input.angry_optin.contains(&event.page.title) {
        decision_metric("success", "angry_opt_in");
        return Verdict::Revert("Angry-reverting on angry-optin");
    }
    if let Some(last) = input.last_revert_time {
        if last > input.now - RECENT_REVERT_THRESHOLD {
            decision_metric("failed", "recent_revert");
            return Verdict::Skip("Reverted before");
        }
    }
    decision_metric("success", "fallback");
    Verdict::Revert("Default Revert")
}

fn revert_metric(status: &'static str, meta: &'static str) {
    metrics::counter!(
        "cbng_revert_status",
        "state" => "revert",
        "status" => status,
        "meta" => meta
    )
    .increment(1);
}

pub fn revert_summary(
    vandal: &str,
    reverted_to: &str,
    bot_username: &str,
    vandalism_id: u64,
) -> String {
    format!(
        "Reverting possible vandalism by [[Special:Contribs/{vandal}|{vandal}]] to {reverted_to}. \
         [[WP:CBFP|Report False Positive?]] Thanks, [[WP:{bot_username}|{bot_username}]]. \
         ({vandalism_id}) (Bot)"
    )
}

/// Execute the rollback: pick the newest prior revision by a different
/// author and roll the page back to it.
async fn revert_change(
    api: &WikipediaClient,
    config: &Config,
    event: &EditEvent,
    vandalism_id: u64,
) -> bool {
    let history = match api
        .get_revision_history(&event.page.title, event.current.id)
        .await
    {
        Ok(history) => history,
        Err(e) => {
            tracing::warn!(error = %e, "failed to fetch revision history");
            revert_metric("failed", "lookup_revision");
            return false;
        }
    };

    let Some(revert_to) = history
        .iter()
        .find(|revision| revision.username != event.user.username)
    else {
        tracing::info!("failed to find revert revision");
        revert_metric("failed", "lookup_revision");
        return false;
    };

    if revert_to.username == config.wikipedia.username
        || config.bot.friends.contains(&revert_to.username)
    {
        tracing::info!(reverter = %revert_to.username, "revert revision is self or a friend");
        revert_metric("failed", "revision_is_friend");
        return false;
    }

    let reverted_to = if revert_to.id != 0 {
        format!("version by {}", revert_to.username)
    } else {
        "older version".to_string()
    };
    let summary = revert_summary(
        &event.user.username,
        &reverted_to,
        &config.wikipedia.username,
        vandalism_id,
    );

    let title = page_title(&event.page.namespace, &event.page.title);
    match api.rollback(&title, &event.user.username, &summary).await {
        Ok(()) => {
            revert_metric("success", "");
            true
        }
        Err(e) => {
            tracing::warn!(error = %e, "rollback failed");
            revert_metric("failed", "api");
            false
        }
    }
}

fn edit_metric(state: &'static str, status: &'static str) {
    metrics::counter!("cbng_edit_status", "state" => state, "status" => status).increment(1);
}

/// Warn the editor, escalating to AIV at level four.
async fn do_warn(
    api: &WikipediaClient,
    config: &Config,
    relays: &Relays,
    event: &EditEvent,
    vandalism_id: u64,
) -> bool {
    let user = &event.user.username;
    let report = format!(
        "[[{}]] was [{} changed] by [[Special:Contributions/{user}|{user}]] \
         [[User:{user}|(u)]] [[User talk:{user}|(t)]] ANN scored at {:.6} on {}",
        event.title_with_namespace(),
        event.diff_url(&config.wikipedia.host),
        event.vandalism_score,
        Utc::now().to_rfc3339(),
    );

    let warning_level = api.get_warning_level(user).await;
    tracing::info!(warning_level, "found current warning level for user");

    if warning_level >= 4 {
        let page = match api.get_page(AIV_PAGE).await {
            Ok(page) => page,
            Err(e) => {
                tracing::warn!(error = %e, "failed to fetch current AIV");
                edit_metric("aiv_report", "failed");
                return false;
            }
        };
        if page.text.contains(user) {
            tracing::info!("user already reported to AIV");
            edit_metric("aiv_report", "skipped");
            return false;
        }

        let template = if is_ip(user) { "IPvandal" } else { "Vandal" };
        let notice = format!("* {{{{{template}|{user}}}}} - {report} (Automated) ~~~~");
        let comment = format!("Automatically reporting [[Special:Contributions/{user}]]. (bot)");

        tracing::info!("reporting user to AIV");
        if api.append_to_page(AIV_PAGE, &notice, &comment).await.is_err() {
            edit_metric("aiv_report", "failed");
            return false;
        }
        relays.send_spam(format!("Reporting to AIV {user} ({warning_level})"));
        edit_metric("aiv_report", "success");
        true
    } else {
        let mut warning = format!(
            "{{{{subst:User:{bot}/Warnings/Warning|1={warning_level}|2={title}|3={report}",
            bot = config.wikipedia.username,
            title = event.page.title,
        );
        warning.push_str(&format!(
            " <!{{{{subst:ns:0}}}}-- MySQL ID: {vandalism_id} --{{{{subst:ns:0}}}}>"
        ));
        warning.push_str(&format!("|4={vandalism_id}}}}} ~~~~"));
        let comment = format!(
            "Warning [[Special:Contributions/{user}|{user}]] - #{warning_level}"
        );

        tracing::info!("warning user");
        if api
            .append_to_page(&format!("User talk:{user}"), &warning, &comment)
            .await
            .is_err()
        {
            edit_metric("user_warning", "failure");
            return false;
        }
        edit_metric("user_warning", "success");
        relays.send_spam(format!("Warning {user} ({warning_level})"));
        true
    }
}

async fn process_single(
    event: &mut EditEvent,
    config: &Config,
    dynamic: &DynamicState,
    botdb: &BotDb,
    api: &WikipediaClient,
    relays: &Relays,
) -> Result<()> {
    let host = &config.wikipedia.host;
    tracing::info!("processing revert");
    event.revert_reason = "Default Revert".to_string();

    // A. Record the classification and obtain its id.
    let vandalism_id = botdb
        .generate_vandalism_id(
            &event.user.username,
            &event.page.title,
            &format!("ANN scored at {:.6}", event.vandalism_score),
            &event.diff_url(host),
            event.previous.id,
            event.current.id,
        )
        .await
        .map_err(|e| {
            relays.send_spam(format!(
                "{} # {:.6} # {} # Not reverted",
                event.irc_change_line(host),
                event.vandalism_score,
                event.revert_reason
            ));
            e
        })
        .context("failed to generate vandalism id")?;
    tracing::info!(vandalism_id, "generated vandalism id");

    // B. Dedupe state: read the previous attempt, then record this one.
    // The read must come first, or rule 13 would observe the row written
    // for this very event and suppress every first revert.
    let last_revert_time = match botdb
        .last_revert_time(&event.page.title, &event.user.username)
        .await
    {
        Ok(time) => time,
        Err(e) => {
            tracing::warn!(error = %e, "failed to read last revert time");
            None
        }
    };
    if let Err(e) = botdb
        .save_revert_time(&event.page.title, &event.user.username)
        .await
    {
        tracing::warn!(error = %e, "failed to save revert time");
    }

    // C. The decision table.
    let tfa = dynamic.tfa();
    let angry_optin = dynamic.angry_optin();
    let creator = event.page.creator.clone();
    let verdict = decide(
        event,
        &DecisionInput {
            local_run: config.bot.run,
            remote_run: dynamic.run(),
            angry: config.bot.angry,
            bot_username: &config.wikipedia.username,
            page_creator: &creator,
            tfa: &tfa,
            angry_optin: &angry_optin,
            last_revert_time,
            now: Utc::now().timestamp(),
        },
    );
    event.revert_reason = verdict.reason().to_string();

    if let Verdict::Skip(reason) = verdict {
        edit_metric("revert", "skipped");
        tracing::info!(reason, "should not revert");
        relays.send_spam(format!(
            "{} # {:.6} # {} # Not reverted",
            event.irc_change_line(host),
            event.vandalism_score,
            reason
        ));
        return Ok(());
    }
    tracing::info!(reason = verdict.reason(), "should revert");

    // D/E. Execute and record the outcome.
    if revert_change(api, config, event, vandalism_id).await {
        edit_metric("revert", "success");
        tracing::info!("reverted successfully");
        do_warn(api, config, relays, event, vandalism_id).await;
        if let Err(e) = botdb.mark_vandalism_reverted(vandalism_id).await {
            tracing::warn!(error = %e, "failed to mark vandalism reverted");
        }
        relays.send_revert(format!(
            "{} (Reverted) ({}) ({} s)",
            event.irc_revert_line(host),
            event.revert_reason,
            event.elapsed_secs()
        ));
        relays.send_spam(format!(
            "{} # {:.6} # {} # Reverted",
            event.irc_change_line(host),
            event.vandalism_score,
            event.revert_reason
        ));
    } else {
        tracing::info!("failed to revert");
        let title = page_title(&event.page.namespace, &event.page.title);
        match api.get_page(&title).await {
            Ok(top) => {
                if top.username == event.user.username {
                    // The vandal is still on top; a racing self-revert
                    // changes nothing to report.
                    edit_metric("revert", "self_beaten");
                } else {
                    edit_metric("revert", "beaten");
                    event.revert_reason = format!("Beaten by {}", top.username);
                    if let Err(e) = botdb
                        .mark_vandalism_beaten(
                            vandalism_id,
                            &event.page.title,
                            &event.diff_url(host),
                            &top.username,
                        )
                        .await
                    {
                        tracing::warn!(error = %e, "failed to record beaten revert");
                    }
                    relays.send_revert(format!(
                        "{} (Not Reverted) ({}) ({} s)",
                        event.irc_revert_line(host),
                        event.revert_reason,
                        event.elapsed_secs()
                    ));
                    relays.send_spam(format!(
                        "{} # {:.6} # {} # Not Reverted",
                        event.irc_change_line(host),
                        event.vandalism_score,
                        event.revert_reason
                    ));
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to re-read page after revert failure");
                edit_metric("revert", "failed");
            }
        }
    }
    Ok(())
}

pub fn spawn_pool(
    workers: usize,
    config: Arc<Config>,
    dynamic: Arc<DynamicState>,
    botdb: BotDb,
    api: Arc<WikipediaClient>,
    relays: Relays,
    inbound: SharedReceiver,
) -> Vec<JoinHandle<()>> {
    (0..workers)
        .map(|_| {
            let config = config.clone();
            let dynamic = dynamic.clone();
            let botdb = botdb.clone();
            let api = api.clone();
            let relays = relays.clone();
            let inbound = inbound.clone();
            tokio::spawn(async move {
                loop {
                    let received = { inbound.lock().await.recv().await };
                    let Some(mut event) = received else { break };

                    metrics::gauge!("cbng_stage_in_use", "stage" => "revert").increment(1.0);
                    let span = event.span.clone();
                    if let Err(e) =
                        process_single(&mut event, &config, &dynamic, &botdb, &api, &relays)
                            .instrument(span)
                            .await
                    {
                        tracing::error!(uuid = %event.uuid, error = %e, "revert processing failed");
                    }
                    metrics::gauge!("cbng_stage_in_use", "stage" => "revert").decrement(1.0);
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

    const BOT: &str = "ClueBot NG";
    const NOW: i64 = 1_700_000_000;

    fn event() -> EditEvent {
        EditEvent {
            uuid: "u".to_string(),
            received_time: Utc::now(),
            change_time: 0,
            comment: String::new(),
            length: 0,
            page: PageInfo {
                namespace: "Main".to_string(),
                namespace_id: 0,
                title: "Example Page".to_string(),
                creator: "Creator".to_string(),
                ..PageInfo::default()
            },
            user: UserInfo {
                username: "192.0.2.5".to_string(),
                ..UserInfo::default()
            },
            current: RevisionInfo {
                id: 112,
                text: "plain wikitext".to_string(),
                ..RevisionInfo::default()
            },
            previous: RevisionInfo {
                id: 111,
                ..RevisionInfo::default()
            },
            vandalism_score: 0.97,
            revert_reason: String::new(),
            span: tracing::Span::none(),
        }
    }

    fn input<'a>(angry_optin: &'a HashSet<String>) -> DecisionInput<'a> {
        DecisionInput {
            local_run: true,
            remote_run: true,
            angry: false,
            bot_username: BOT,
            page_creator: "Creator",
            tfa: "",
            angry_optin,
            last_revert_time: None,
            now: NOW,
        }
    }

    #[test]
    fn test_default_is_revert() {
        let optin = HashSet::new();
        assert_eq!(
            decide(&event(), &input(&optin)),
            Verdict::Revert("Default Revert")
        );
    }

    #[test]
    fn test_run_flags_win_first() {
        let optin = HashSet::new();
        let mut i = input(&optin);
        i.local_run = false;
        // Even angry mode cannot override a disabled run flag.
        i.angry = true;
        assert_eq!(decide(&event(), &i), Verdict::Skip("Run Disabled"));

        let mut i = input(&optin);
        i.remote_run = false;
        assert_eq!(decide(&event(), &i), Verdict::Skip("Run Disabled"));
    }

    #[test]
    fn test_own_edits_are_skipped() {
        let optin = HashSet::new();
        let mut ev = event();
        ev.user.username = BOT.to_string();
        assert_eq!(decide(&ev, &input(&optin)), Verdict::Skip("User is myself"));
    }

    #[test]
    fn test_angry_mode_wins_over_exclusion() {
        let optin = HashSet::new();
        let mut ev = event();
        ev.current.text = "{{nobots}}".to_string();
        let mut i = input(&optin);
        i.angry = true;
        assert_eq!(
            decide(&ev, &i),
            Verdict::Revert("Angry-reverting in angry mode")
        );
    }

    #[test]
    fn test_exclusion_compliance_skips() {
        let optin = HashSet::new();
        let mut ev = event();
        ev.current.text = "text {{nobots}} more".to_string();
        assert_eq!(
            decide(&ev, &input(&optin)),
            Verdict::Skip("Exclusion compliance")
        );
    }

    #[test]
    fn test_page_creator_is_skipped() {
        let optin = HashSet::new();
        let mut ev = event();
        ev.user.username = "Creator".to_string();
        assert_eq!(decide(&ev, &input(&optin)), Verdict::Skip("User is creator"));
    }

    #[test]
    fn test_edit_count_rules_use_real_ratio() {
        let optin = HashSet::new();

        let mut ev = event();
        ev.user.edit_count = 100;
        ev.user.warns = 5;
        assert_eq!(
            decide(&ev, &input(&optin)),
            Verdict::Skip("User has edit count")
        );

        ev.user.warns = 20;
        assert_eq!(
            decide(&ev, &input(&optin)),
            Verdict::Revert("User has edit count, but warns > 10%")
        );
    }

    #[test]
    fn test_tfa_and_angry_optin_force_revert() {
        let mut ev = event();
        ev.user.edit_count = 10;

        let optin = HashSet::new();
        let mut i = input(&optin);
        i.tfa = "Example Page";
        // TFA outranks the dedupe rule.
        i.last_revert_time = Some(NOW - 100);
        assert_eq!(decide(&ev, &i), Verdict::Revert("Angry-reverting on TFA"));

        let optin: HashSet<String> = ["Example Page".to_string()].into_iter().collect();
        let mut i = input(&optin);
        i.last_revert_time = Some(NOW - 100);
        assert_eq!(
            decide(&ev, &i),
            Verdict::Revert("Angry-reverting on angry-optin")
        );
    }

    #[test]
    fn test_recent_revert_dedupe_window() {
        let optin = HashSet::new();

        let mut i = input(&optin);
        i.last_revert_time = Some(NOW - 100);
        assert_eq!(decide(&event(), &i), Verdict::Skip("Reverted before"));

        // Outside the 24 h horizon the pair is eligible again.
        let mut i = input(&optin);
        i.last_revert_time = Some(NOW - RECENT_REVERT_THRESHOLD - 1);
        assert_eq!(decide(&event(), &i), Verdict::Revert("Default Revert"));
    }

    #[test]
    fn test_exclusion_deny_by_name_and_star() {
        assert!(exclusion_applies("{{bots|deny=ClueBot_NG}}", BOT));
        assert!(exclusion_applies("{{bots|deny=ClueBot NG}}", BOT));
        assert!(exclusion_applies("{{bots | deny = Foo, ClueBot_NG, Bar}}", BOT));
        assert!(exclusion_applies("{{bots|deny=*}}", BOT));
        assert!(!exclusion_applies("{{bots|deny=SomeOtherBot}}", BOT));
    }

    #[test]
    fn test_exclusion_allow_list() {
        // Allow list without the bot: excluded.
        assert!(exclusion_applies("{{bots|allow=SomeOtherBot}}", BOT));
        // Allow list naming the bot in either form: not excluded.
        assert!(!exclusion_applies("{{bots|allow=ClueBot NG}}", BOT));
        assert!(!exclusion_applies("{{bots|allow=ClueBot_NG}}", BOT));
        // No templates at all: not excluded.
        assert!(!exclusion_applies("plain text", BOT));
    }

    #[test]
    fn test_revert_summary_embeds_id_and_names() {
        let summary = revert_summary("192.0.2.5", "version by Bob", BOT, 4242);
        assert!(summary.contains("[[Special:Contribs/192.0.2.5|192.0.2.5]]"));
        assert!(summary.contains("version by Bob"));
        assert!(summary.contains("(4242)"));
        assert!(summary.contains("[[WP:ClueBot NG|ClueBot NG]]"));
    }
}
