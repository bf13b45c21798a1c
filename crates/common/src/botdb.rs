use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::ConnectOptions;

use crate::config::{SqlServer, RECENT_REVERT_THRESHOLD};

/// Client-side deadline for the dedupe-path queries; a slow bookkeeping
/// database must not stall the revert processors.
const REVERT_TIME_DEADLINE: Duration = Duration::from_millis(300);

/// Bookkeeping-schema store. Each operation opens and closes its own
/// connection; there is no long-lived pool.
#[derive(Clone)]
pub struct BotDb {
    options: MySqlConnectOptions,
}

impl BotDb {
    pub fn new(server: &SqlServer) -> Self {
        let options = MySqlConnectOptions::new()
            .host(&server.host)
            .port(server.port)
            .username(&server.username)
            .password(&server.password)
            .database(&server.schema);
        Self { options }
    }

    async fn connect(&self) -> Result<MySqlConnection> {
        Ok(self.options.connect().await?)
    }

    /// Verify the schema is reachable. Startup aborts when this fails.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connect().await.context("connecting to bot schema")?;
        sqlx::query("SELECT 1").execute(&mut conn).await?;
        Ok(())
    }

    /// Insert the classification row and return its generated id. The row
    /// starts with `reverted = 0`; a successful rollback upgrades it.
    pub async fn generate_vandalism_id(
        &self,
        user: &str,
        title: &str,
        reason: &str,
        diff_url: &str,
        previous_id: i64,
        current_id: i64,
    ) -> Result<u64> {
        let mut conn = self.connect().await?;
        let result = sqlx::query(
            "INSERT INTO `vandalism` \
             (`id`, `user`, `article`, `heuristic`, `reason`, `diff`, `old_id`, `new_id`, `reverted`) \
             VALUES (NULL, ?, ?, '', ?, ?, ?, ?, 0)",
        )
        .bind(user)
        .bind(title)
        .bind(reason)
        .bind(diff_url)
        .bind(previous_id)
        .bind(current_id)
        .execute(&mut conn)
        .await?;
        Ok(result.last_insert_id())
    }

    pub async fn mark_vandalism_reverted(&self, vandalism_id: u64) -> Result<()> {
        let mut conn = self.connect().await?;
        sqlx::query("UPDATE `vandalism` SET `reverted` = 1 WHERE `id` = ?")
            .bind(vandalism_id)
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    /// Record a race loss: downgrade the classification row and append the
    /// beaten record.
    pub async fn mark_vandalism_beaten(
        &self,
        vandalism_id: u64,
        title: &str,
        diff_url: &str,
        beaten_user: &str,
    ) -> Result<()> {
        let mut conn = self.connect().await?;
        sqlx::query("UPDATE `vandalism` SET `reverted` = 0 WHERE `id` = ?")
            .bind(vandalism_id)
            .execute(&mut conn)
            .await?;
        sqlx::query("INSERT INTO `beaten` (`id`, `article`, `diff`, `user`) VALUES (NULL, ?, ?, ?)")
            .bind(title)
            .bind(diff_url)
            .bind(beaten_user)
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    /// Active node lookup, used as the Core host fallback when none is
    /// configured.
    pub async fn get_service_host(&self, service: &str) -> Result<Option<String>> {
        let mut conn = self.connect().await?;
        let host: Option<String> =
            sqlx::query_scalar("SELECT `node` FROM `cluster_node` WHERE `type` = ?")
                .bind(service)
                .fetch_optional(&mut conn)
                .await?;
        Ok(host)
    }

    /// Unix time of the last recorded revert for (title, user), if any.
    pub async fn last_revert_time(&self, title: &str, user: &str) -> Result<Option<i64>> {
        let work = async {
            let mut conn = self.connect().await?;
            let time: Option<i64> =
                sqlx::query_scalar("SELECT `time` FROM `last_revert` WHERE `title` = ? AND `user` = ?")
                    .bind(title)
                    .bind(user)
                    .fetch_optional(&mut conn)
                    .await?;
            Ok::<_, anyhow::Error>(time)
        };
        tokio::time::timeout(REVERT_TIME_DEADLINE, work)
            .await
            .context("last_revert lookup deadline")?
    }

    /// Record a revert attempt. An existing row keeps its original time.
    pub async fn save_revert_time(&self, title: &str, user: &str) -> Result<()> {
        let work = async {
            let mut conn = self.connect().await?;
            sqlx::query(
                "INSERT INTO `last_revert` (`title`, `user`, `time`) VALUES (?, ?, ?) \
                 ON DUPLICATE KEY UPDATE `time` = `time`",
            )
            .bind(title)
            .bind(user)
            .bind(Utc::now().timestamp())
            .execute(&mut conn)
            .await?;
            Ok::<_, anyhow::Error>(())
        };
        tokio::time::timeout(REVERT_TIME_DEADLINE, work)
            .await
            .context("last_revert upsert deadline")?
    }

    /// Drop dedupe rows below the recent-revert horizon. Runs hourly.
    pub async fn purge_old_revert_times(&self) -> Result<u64> {
        let mut conn = self.connect().await?;
        let horizon = Utc::now().timestamp() - (RECENT_REVERT_THRESHOLD + 10);
        let result = sqlx::query("DELETE FROM `last_revert` WHERE `time` < ?")
            .bind(horizon)
            .execute(&mut conn)
            .await?;
        Ok(result.rows_affected())
    }
}
