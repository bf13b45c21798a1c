use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

use chrono::Utc;
use common::config::Config;
use common::wikipedia::WikipediaClient;
use regex::Regex;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

/// Process-wide dynamic configuration. Each slice is replaced wholesale on
/// reload; readers take cheap snapshots and never observe a torn value.
pub struct DynamicState {
    run: AtomicBool,
    tfa: RwLock<Arc<String>>,
    angry_optin: RwLock<Arc<HashSet<String>>>,
    namespace_optin: RwLock<Arc<HashSet<String>>>,
    huggle_whitelist: RwLock<Arc<HashSet<String>>>,
}

impl DynamicState {
    pub fn new() -> Self {
        Self {
            run: AtomicBool::new(false),
            tfa: RwLock::new(Arc::new(String::new())),
            angry_optin: RwLock::new(Arc::new(HashSet::new())),
            namespace_optin: RwLock::new(Arc::new(HashSet::new())),
            huggle_whitelist: RwLock::new(Arc::new(HashSet::new())),
        }
    }

    pub fn run(&self) -> bool {
        self.run.load(Ordering::Relaxed)
    }

    pub fn set_run(&self, value: bool) {
        self.run.store(value, Ordering::Relaxed);
    }

    pub fn tfa(&self) -> Arc<String> {
        self.tfa.read().expect("tfa lock").clone()
    }

    pub fn set_tfa(&self, value: String) {
        *self.tfa.write().expect("tfa lock") = Arc::new(value);
    }

    pub fn angry_optin(&self) -> Arc<HashSet<String>> {
        self.angry_optin.read().expect("angry lock").clone()
    }

    pub fn set_angry_optin(&self, value: HashSet<String>) {
        *self.angry_optin.write().expect("angry lock") = Arc::new(value);
    }

    pub fn namespace_optin(&self) -> Arc<HashSet<String>> {
        self.namespace_optin.read().expect("namespace lock").clone()
    }

    pub fn set_namespace_optin(&self, value: HashSet<String>) {
        *self.namespace_optin.write().expect("namespace lock") = Arc::new(value);
    }

    pub fn huggle_whitelist(&self) -> Arc<HashSet<String>> {
        self.huggle_whitelist.read().expect("huggle lock").clone()
    }

    pub fn set_huggle_whitelist(&self, value: HashSet<String>) {
        *self.huggle_whitelist.write().expect("huggle lock") = Arc::new(value);
    }
}

impl Default for DynamicState {
    fn default() -> Self {
        Self::new()
    }
}

/// Capacity-1 reload trigger. Firing never blocks; a pending trigger
/// already covers the reload.
#[derive(Clone)]
pub struct Trigger {
    tx: mpsc::Sender<()>,
}

impl Trigger {
    pub fn fire(&self) {
        let _ = self.tx.try_send(());
    }
}

/// Handles used by the replication watcher's reload fan-out.
#[derive(Clone)]
pub struct Triggers {
    pub angry_optin: Trigger,
    pub namespace_optin: Trigger,
    pub run: Trigger,
    pub tfa: Trigger,
    pub huggle: Trigger,
}

pub fn angry_optin_page(config: &Config) -> String {
    format!("User:{}/AngryOptin", config.bot_page_user())
}

pub fn namespace_optin_page(config: &Config) -> String {
    format!("User:{}/Optin", config.bot_page_user())
}

pub fn run_page(config: &Config) -> String {
    format!("User:{}/Run", config.bot_page_user())
}

/// The TFA page moves daily; compute the current name on demand.
pub fn tfa_page() -> String {
    format!(
        "Wikipedia:Today's featured article/{}",
        Utc::now().format("%B %-d, %Y")
    )
}

fn optin_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\* \[\[(.+)\]\] \-").expect("optin regex"))
}

pub fn parse_optin_pages(text: &str) -> HashSet<String> {
    text.lines()
        .filter_map(|line| optin_line_regex().captures(line))
        .map(|captures| captures[1].to_string())
        .collect()
}

/// Namespace opt-in entries are matched against the lowercased namespace
/// names the feed derives, so normalize here. Angry opt-in entries are
/// page titles and stay case-sensitive.
pub fn parse_namespace_optin(text: &str) -> HashSet<String> {
    parse_optin_pages(text)
        .into_iter()
        .map(|namespace| namespace.to_lowercase())
        .collect()
}

pub fn parse_run(text: &str) -> bool {
    text.to_lowercase().contains("true")
}

pub fn parse_tfa(text: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\{\{TFAFULL\|([^}]+)\}\}").expect("tfa regex"));
    re.captures(text).map(|captures| captures[1].to_string())
}

pub fn parse_huggle_whitelist(text: &str) -> HashSet<String> {
    text.split('|')
        .filter(|user| !user.is_empty() && *user != "<!-- list -->")
        .map(ToString::to_string)
        .collect()
}

struct Refresher {
    name: &'static str,
    interval: Duration,
    rx: mpsc::Receiver<()>,
}

fn spawn_refresher<F, Fut>(mut refresher: Refresher, reload: F)
where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        // The first tick fires immediately, giving the initial load.
        let mut ticker = tokio::time::interval(refresher.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tracing::debug!(instance = refresher.name, "reloading from timer");
                    reload().await;
                }
                Some(()) = refresher.rx.recv() => {
                    tracing::debug!(instance = refresher.name, "reloading from trigger");
                    reload().await;
                }
            }
        }
    });
}

fn record_reload(instance: &'static str, outcome: &'static str) {
    metrics::counter!("cbng_dynamic_reloads", "instance" => instance, "outcome" => outcome)
        .increment(1);
}

async fn reload_optin_slice(
    instance: &'static str,
    api: &WikipediaClient,
    page: &str,
    parse: fn(&str) -> HashSet<String>,
    current: HashSet<String>,
) -> Option<HashSet<String>> {
    let revision = match api.get_page(page).await {
        Ok(revision) => revision,
        Err(e) => {
            tracing::warn!(instance, page, error = %e, "reload fetch failed");
            record_reload(instance, "fetch_failed");
            return None;
        }
    };
    let pages = parse(&revision.text);
    if pages == current {
        record_reload(instance, "unchanged");
        return None;
    }
    tracing::info!(instance, count = pages.len(), "updating opt-in pages");
    record_reload(instance, "updated");
    Some(pages)
}

/// Start the five refresher tasks and return the trigger handles.
pub fn start(
    config: Arc<Config>,
    api: Arc<WikipediaClient>,
    state: Arc<DynamicState>,
) -> Triggers {
    let (angry_tx, angry_rx) = mpsc::channel(1);
    let (namespace_tx, namespace_rx) = mpsc::channel(1);
    let (run_tx, run_rx) = mpsc::channel(1);
    let (tfa_tx, tfa_rx) = mpsc::channel(1);
    let (huggle_tx, huggle_rx) = mpsc::channel(1);

    {
        let config = config.clone();
        let api = api.clone();
        let state = state.clone();
        spawn_refresher(
            Refresher {
                name: "angry_optin",
                interval: Duration::from_secs(3600),
                rx: angry_rx,
            },
            move || {
                let config = config.clone();
                let api = api.clone();
                let state = state.clone();
                async move {
                    let page = angry_optin_page(&config);
                    if let Some(pages) = reload_optin_slice(
                        "angry_optin",
                        &api,
                        &page,
                        parse_optin_pages,
                        (*state.angry_optin()).clone(),
                    )
                    .await
                    {
                        state.set_angry_optin(pages);
                    }
                }
            },
        );
    }

    {
        let config = config.clone();
        let api = api.clone();
        let state = state.clone();
        spawn_refresher(
            Refresher {
                name: "namespace_optin",
                interval: Duration::from_secs(3600),
                rx: namespace_rx,
            },
            move || {
                let config = config.clone();
                let api = api.clone();
                let state = state.clone();
                async move {
                    let page = namespace_optin_page(&config);
                    if let Some(pages) = reload_optin_slice(
                        "namespace_optin",
                        &api,
                        &page,
                        parse_namespace_optin,
                        (*state.namespace_optin()).clone(),
                    )
                    .await
                    {
                        state.set_namespace_optin(pages);
                    }
                }
            },
        );
    }

    {
        let config = config.clone();
        let api = api.clone();
        let state = state.clone();
        spawn_refresher(
            Refresher {
                name: "run",
                interval: Duration::from_secs(60),
                rx: run_rx,
            },
            move || {
                let config = config.clone();
                let api = api.clone();
                let state = state.clone();
                async move {
                    let page = run_page(&config);
                    match api.get_page(&page).await {
                        Ok(revision) => {
                            let should_run = parse_run(&revision.text);
                            if state.run() != should_run {
                                tracing::info!(run = should_run, "updating run status");
                                record_reload("run", "updated");
                                state.set_run(should_run);
                            } else {
                                record_reload("run", "unchanged");
                            }
                        }
                        Err(e) => {
                            tracing::warn!(page, error = %e, "run reload fetch failed");
                            record_reload("run", "fetch_failed");
                        }
                    }
                }
            },
        );
    }

    {
        let api = api.clone();
        let state = state.clone();
        spawn_refresher(
            Refresher {
                name: "tfa",
                interval: Duration::from_secs(3600),
                rx: tfa_rx,
            },
            move || {
                let api = api.clone();
                let state = state.clone();
                async move {
                    let page = tfa_page();
                    match api.get_page(&page).await {
                        Ok(revision) => match parse_tfa(&revision.text) {
                            Some(article) => {
                                if *state.tfa() != article {
                                    tracing::info!(article, "updating TFA");
                                    record_reload("tfa", "updated");
                                    state.set_tfa(article);
                                } else {
                                    record_reload("tfa", "unchanged");
                                }
                            }
                            None => {
                                tracing::error!(page, "failed to find TFA in page");
                                record_reload("tfa", "parse_failed");
                            }
                        },
                        Err(e) => {
                            tracing::warn!(page, error = %e, "TFA reload fetch failed");
                            record_reload("tfa", "fetch_failed");
                        }
                    }
                }
            },
        );
    }

    {
        let config = config.clone();
        let state = state.clone();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("huggle client build failed");
        spawn_refresher(
            Refresher {
                name: "huggle",
                interval: Duration::from_secs(3600),
                rx: huggle_rx,
            },
            move || {
                let url = config.huggle.url.clone();
                let state = state.clone();
                let client = client.clone();
                async move {
                    let body = async {
                        Ok::<_, anyhow::Error>(
                            client
                                .get(&url)
                                .send()
                                .await?
                                .error_for_status()?
                                .text()
                                .await?,
                        )
                    }
                    .await;
                    match body {
                        Ok(text) => {
                            let whitelist = parse_huggle_whitelist(&text);
                            if whitelist != *state.huggle_whitelist() {
                                tracing::info!(
                                    count = whitelist.len(),
                                    "updating huggle user whitelist"
                                );
                                record_reload("huggle", "updated");
                                state.set_huggle_whitelist(whitelist);
                            } else {
                                record_reload("huggle", "unchanged");
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "huggle reload fetch failed");
                            record_reload("huggle", "fetch_failed");
                        }
                    }
                }
            },
        );
    }

    Triggers {
        angry_optin: Trigger { tx: angry_tx },
        namespace_optin: Trigger { tx: namespace_tx },
        run: Trigger { tx: run_tx },
        tfa: Trigger { tx: tfa_tx },
        huggle: Trigger { tx: huggle_tx },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_optin_pages() {
        let text = "\
* [[Example Page]] - requested by someone
not a list line
* [[Other/Page]] - ok
* [[No dash]]";
        let pages = parse_optin_pages(text);
        assert_eq!(pages.len(), 2);
        assert!(pages.contains("Example Page"));
        assert!(pages.contains("Other/Page"));
    }

    #[test]
    fn test_parse_namespace_optin_lowercases_entries() {
        let text = "\
* [[User]] - requested
* [[User talk]] - requested
* [[Draft]] - requested";
        let namespaces = parse_namespace_optin(text);
        assert_eq!(namespaces.len(), 3);
        // The feed gate compares lowercased names; the stored set must
        // match that shape, not the wikilink casing.
        assert!(namespaces.contains("user"));
        assert!(namespaces.contains("user talk"));
        assert!(namespaces.contains("draft"));
        assert!(!namespaces.contains("User"));
    }

    #[test]
    fn test_parse_run_is_case_insensitive() {
        assert!(parse_run("True"));
        assert!(parse_run("the value is TRUE today"));
        assert!(!parse_run("false"));
        assert!(!parse_run(""));
    }

    #[test]
    fn test_parse_tfa_takes_first_capture() {
        assert_eq!(
            parse_tfa("{{TFAFULL|Some Article}}").as_deref(),
            Some("Some Article")
        );
        assert_eq!(parse_tfa("no template here"), None);
    }

    #[test]
    fn test_parse_huggle_whitelist_skips_placeholders() {
        let whitelist = parse_huggle_whitelist("<!-- list -->|Alice|Bob||Carol|");
        assert_eq!(whitelist.len(), 3);
        assert!(whitelist.contains("Alice"));
        assert!(!whitelist.contains("<!-- list -->"));
        assert!(!whitelist.contains(""));
    }

    #[test]
    fn test_reload_same_content_leaves_value_unchanged() {
        let state = DynamicState::new();
        state.set_namespace_optin(parse_namespace_optin("* [[Draft]] - a"));
        let before = state.namespace_optin();
        let again = parse_namespace_optin("* [[Draft]] - a");
        // Same parsed value: the slice must not be replaced.
        if again != *state.namespace_optin() {
            state.set_namespace_optin(again);
        }
        assert!(Arc::ptr_eq(&before, &state.namespace_optin()));
    }

    #[test]
    fn test_page_names_use_underscored_bot_name() {
        let config =
            Config::from_str(include_str!("../../../config/default.toml")).unwrap();
        assert_eq!(run_page(&config), "User:ClueBot_NG/Run");
        assert_eq!(angry_optin_page(&config), "User:ClueBot_NG/AngryOptin");
        assert_eq!(namespace_optin_page(&config), "User:ClueBot_NG/Optin");
        assert!(tfa_page().starts_with("Wikipedia:Today's featured article/"));
    }

    #[tokio::test]
    async fn test_trigger_fire_never_blocks() {
        let (tx, _rx) = mpsc::channel(1);
        let trigger = Trigger { tx };
        trigger.fire();
        trigger.fire();
        trigger.fire();
    }
}
