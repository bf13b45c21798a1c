use std::sync::Arc;

use anyhow::Result;
use common::botdb::BotDb;
use common::config::Config;
use common::model::EditEvent;
use common::replica::Replica;
use common::wikipedia::WikipediaClient;
use tokio::sync::mpsc;

mod cli;
mod dynamic;
mod feed;
mod loader;
mod maintenance;
mod metrics;
mod relay;
mod replication;
mod revert;
mod scoring;

/// Capacity of every inter-stage queue. Saturation backpressures upstream
/// all the way to the feed socket.
const QUEUE_CAPACITY: usize = 10_000;

fn channel() -> (mpsc::Sender<EditEvent>, mpsc::Receiver<EditEvent>) {
    mpsc::channel(QUEUE_CAPACITY)
}

#[tokio::main]
async fn main() -> Result<()> {
    let options = cli::parse_args(std::env::args()).map_err(anyhow::Error::msg)?;

    let config = Arc::new(Config::load()?);

    let (dispatch, _otel_guard) = common::observability::build_dispatch(
        "patrol",
        options.log_level(),
        options.debug_metrics,
    );
    tracing::dispatcher::set_global_default(dispatch).map_err(anyhow::Error::msg)?;

    tracing::info!("patrol starting");

    metrics::install_prometheus(config.observability.prometheus_port)?;
    metrics::describe();

    // Startup collaborators; any failure here is fatal to the process.
    let api = Arc::new(WikipediaClient::new(
        &config.wikipedia.host,
        &config.wikipedia.username,
        &config.wikipedia.password,
        config.bot.read_only,
    )?);
    api.login().await?;
    tracing::info!(user = %config.wikipedia.username, "logged into wikipedia");

    let replica = Arc::new(Replica::connect(&config.sql.replica).await?);
    let botdb = BotDb::new(&config.sql.cluebot);
    botdb.ping().await?;

    let dynamic_state = Arc::new(dynamic::DynamicState::new());
    let triggers = dynamic::start(config.clone(), api.clone(), dynamic_state.clone());

    let relays = relay::Relays::new(&config, options.irc_relay);

    // Processing channels: one bounded queue per arrow in the pipeline.
    let (to_replication_tx, to_replication_rx) = channel();
    let (to_page_metadata_tx, to_page_metadata_rx) = channel();
    let (to_page_recent_edits_tx, to_page_recent_edits_rx) = channel();
    let (to_page_recent_reverts_tx, to_page_recent_reverts_rx) = channel();
    let (to_user_edit_count_tx, to_user_edit_count_rx) = channel();
    let (to_user_registration_tx, to_user_registration_rx) = channel();
    let (to_user_warns_tx, to_user_warns_rx) = channel();
    let (to_user_distinct_pages_tx, to_user_distinct_pages_rx) = channel();
    let (to_revision_tx, to_revision_rx) = channel();
    let (to_scoring_tx, to_scoring_rx) = channel();
    let (to_revert_tx, to_revert_rx) = channel();

    maintenance::spawn_metric_poller(
        vec![
            ("replication", to_replication_tx.clone()),
            ("page_metadata", to_page_metadata_tx.clone()),
            ("page_recent_edits", to_page_recent_edits_tx.clone()),
            ("page_recent_reverts", to_page_recent_reverts_tx.clone()),
            ("user_edit_count", to_user_edit_count_tx.clone()),
            ("user_registration", to_user_registration_tx.clone()),
            ("user_warns", to_user_warns_tx.clone()),
            ("user_distinct_pages", to_user_distinct_pages_tx.clone()),
            ("page_revisions", to_revision_tx.clone()),
            ("scoring", to_scoring_tx.clone()),
            ("revert", to_revert_tx.clone()),
        ],
        relays.clone(),
        replica.clone(),
    );
    maintenance::spawn_purger(botdb.clone());

    // Ingress: the live feed, or exactly one edit in single-edit mode.
    if let Some(change_id) = options.process_id {
        feed::emit_single_edit(&api, change_id, &to_replication_tx).await?;
    } else {
        let feed_config = config.clone();
        let feed_state = dynamic_state.clone();
        tokio::spawn(feed::run(
            feed_config,
            move || feed_state.namespace_optin(),
            to_replication_tx.clone(),
        ));
    }

    tokio::spawn(replication::run(
        config.clone(),
        replica.clone(),
        triggers,
        options.no_replication_check,
        to_replication_rx,
        to_page_metadata_tx.clone(),
    ));

    let wiki_host = config.wikipedia.host.clone();
    loader::spawn_pool(
        options.sql_loaders,
        Arc::new(loader::PageMetadata {
            replica: replica.clone(),
        }),
        loader::shared(to_page_metadata_rx),
        to_page_recent_edits_tx.clone(),
        relays.clone(),
        wiki_host.clone(),
    );
    loader::spawn_pool(
        options.sql_loaders,
        Arc::new(loader::PageRecentEdits {
            replica: replica.clone(),
        }),
        loader::shared(to_page_recent_edits_rx),
        to_page_recent_reverts_tx.clone(),
        relays.clone(),
        wiki_host.clone(),
    );
    loader::spawn_pool(
        options.sql_loaders,
        Arc::new(loader::PageRecentReverts {
            replica: replica.clone(),
        }),
        loader::shared(to_page_recent_reverts_rx),
        to_user_edit_count_tx.clone(),
        relays.clone(),
        wiki_host.clone(),
    );
    loader::spawn_pool(
        options.sql_loaders,
        Arc::new(loader::UserEditCount {
            replica: replica.clone(),
        }),
        loader::shared(to_user_edit_count_rx),
        to_user_registration_tx.clone(),
        relays.clone(),
        wiki_host.clone(),
    );
    loader::spawn_pool(
        options.sql_loaders,
        Arc::new(loader::UserRegistration {
            replica: replica.clone(),
        }),
        loader::shared(to_user_registration_rx),
        to_user_warns_tx.clone(),
        relays.clone(),
        wiki_host.clone(),
    );
    loader::spawn_pool(
        options.sql_loaders,
        Arc::new(loader::UserWarns {
            replica: replica.clone(),
        }),
        loader::shared(to_user_warns_rx),
        to_user_distinct_pages_tx.clone(),
        relays.clone(),
        wiki_host.clone(),
    );
    loader::spawn_pool(
        options.sql_loaders,
        Arc::new(loader::UserDistinctPages {
            replica: replica.clone(),
        }),
        loader::shared(to_user_distinct_pages_rx),
        to_revision_tx.clone(),
        relays.clone(),
        wiki_host.clone(),
    );

    loader::spawn_pool(
        options.http_loaders,
        Arc::new(loader::RevisionLoader { api: api.clone() }),
        loader::shared(to_revision_rx),
        to_scoring_tx.clone(),
        relays.clone(),
        wiki_host.clone(),
    );

    scoring::spawn_pool(
        options.processors,
        config.clone(),
        botdb.clone(),
        dynamic_state.clone(),
        relays.clone(),
        loader::shared(to_scoring_rx),
        to_revert_tx.clone(),
    );
    revert::spawn_pool(
        options.processors,
        config.clone(),
        dynamic_state,
        botdb,
        api,
        relays,
        loader::shared(to_revert_rx),
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    Ok(())
}
