use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{bail, Result};
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};

use crate::config::SqlServer;
use crate::model::is_ip;

/// Wiki-replica adapter: one bounded pool per configured replica, handles
/// picked round-robin. Every statement carries a server-side 10 s cap.
pub struct Replica {
    pools: Vec<MySqlPool>,
    next: AtomicUsize,
}

fn connect_options(server: &SqlServer) -> MySqlConnectOptions {
    MySqlConnectOptions::new()
        .host(&server.host)
        .port(server.port)
        .username(&server.username)
        .password(&server.password)
        .database(&server.schema)
}

impl Replica {
    pub async fn connect(servers: &[SqlServer]) -> Result<Self> {
        let mut pools = Vec::with_capacity(servers.len());
        for server in servers {
            let pool = MySqlPoolOptions::new()
                .max_connections(10)
                .max_lifetime(Duration::from_secs(300))
                .connect_with(connect_options(server))
                .await?;
            tracing::debug!(host = %server.host, schema = %server.schema, "connected to replica");
            pools.push(pool);
        }
        if pools.is_empty() {
            bail!("no replica instances configured");
        }
        Ok(Self {
            pools,
            next: AtomicUsize::new(0),
        })
    }

    fn pool(&self) -> &MySqlPool {
        let i = self.next.fetch_add(1, Ordering::Relaxed);
        &self.pools[i % self.pools.len()]
    }

    /// Largest `rc_timestamp` absorbed by the replica, as a unix timestamp.
    pub async fn latest_change_timestamp(&self) -> Result<i64> {
        let point: Option<i64> = sqlx::query_scalar(
            "SET STATEMENT max_statement_time=10 FOR \
             SELECT CAST(UNIX_TIMESTAMP(MAX(rc_timestamp)) AS SIGNED) FROM `recentchanges`",
        )
        .fetch_one(self.pool())
        .await?;
        match point {
            Some(p) => Ok(p),
            None => bail!("no replication point data"),
        }
    }

    /// Creator and creation time (unix) of the first revision of a page.
    pub async fn page_created(&self, namespace_id: i64, title: &str) -> Result<(String, i64)> {
        let row: Option<(i64, String)> = sqlx::query_as(
            "SET STATEMENT max_statement_time=10 FOR \
             SELECT CAST(UNIX_TIMESTAMP(`rev_timestamp`) AS SIGNED), `actor_name` FROM `page` \
             JOIN `revision` ON `rev_page` = `page_id` \
             JOIN `actor` ON `actor_id` = `rev_actor` \
             WHERE `page_namespace` = ? AND `page_title` = ? \
             ORDER BY `rev_id` \
             LIMIT 1",
        )
        .bind(namespace_id)
        .bind(title)
        .fetch_optional(self.pool())
        .await?;
        match row {
            Some((timestamp, user)) => Ok((user, timestamp)),
            None => bail!("no revisions found for {namespace_id}:{title}"),
        }
    }

    /// Revisions of a page newer than `since` (unix).
    pub async fn page_recent_edit_count(
        &self,
        namespace_id: i64,
        title: &str,
        since: i64,
    ) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SET STATEMENT max_statement_time=10 FOR \
             SELECT COUNT(*) FROM `page` \
             JOIN `revision` ON `rev_page` = `page_id` \
             WHERE `page_namespace` = ? AND `page_title` = ? \
             AND `rev_timestamp` > DATE_FORMAT(FROM_UNIXTIME(?), '%Y%m%d%H%i%s')",
        )
        .bind(namespace_id)
        .bind(title)
        .bind(since)
        .fetch_one(self.pool())
        .await?;
        Ok(count)
    }

    /// Revisions of a page newer than `since` whose comment looks like a
    /// revert.
    pub async fn page_recent_revert_count(
        &self,
        namespace_id: i64,
        title: &str,
        since: i64,
    ) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SET STATEMENT max_statement_time=10 FOR \
             SELECT COUNT(*) FROM `page` \
             JOIN `revision` ON `rev_page` = `page_id` \
             JOIN `comment` ON `comment_id` = `rev_comment_id` \
             WHERE `page_namespace` = ? AND `page_title` = ? \
             AND `rev_timestamp` > DATE_FORMAT(FROM_UNIXTIME(?), '%Y%m%d%H%i%s') \
             AND `comment_text` LIKE 'Revert%'",
        )
        .bind(namespace_id)
        .bind(title)
        .bind(since)
        .fetch_one(self.pool())
        .await?;
        Ok(count)
    }

    /// Total edit count. Anonymous editors have no `user` row, so their
    /// count comes from `revision_userindex`.
    pub async fn user_edit_count(&self, user: &str) -> Result<i64> {
        if is_ip(user) {
            let count: i64 = sqlx::query_scalar(
                "SET STATEMENT max_statement_time=10 FOR \
                 SELECT COUNT(*) FROM `revision_userindex` \
                 WHERE `rev_actor` = (SELECT `actor_id` FROM `actor` WHERE `actor_name` = ?)",
            )
            .bind(user)
            .fetch_one(self.pool())
            .await?;
            Ok(count)
        } else {
            let count: Option<i64> = sqlx::query_scalar(
                "SET STATEMENT max_statement_time=10 FOR \
                 SELECT `user_editcount` FROM `user` WHERE `user_name` = ?",
            )
            .bind(user)
            .fetch_optional(self.pool())
            .await?;
            Ok(count.unwrap_or(0))
        }
    }

    /// Registration time (unix). Anonymous editors are a no-op (0). A null
    /// `user_registration` falls back to the user's earliest revision.
    pub async fn user_registration_time(&self, user: &str) -> Result<i64> {
        if is_ip(user) {
            return Ok(0);
        }

        let registered: Option<i64> = sqlx::query_scalar(
            "SET STATEMENT max_statement_time=10 FOR \
             SELECT CAST(UNIX_TIMESTAMP(`user_registration`) AS SIGNED) FROM `user` \
             WHERE `user_name` = ? AND `user_registration` IS NOT NULL",
        )
        .bind(user)
        .fetch_optional(self.pool())
        .await?;
        if let Some(timestamp) = registered {
            return Ok(timestamp);
        }

        let earliest: Option<i64> = sqlx::query_scalar(
            "SET STATEMENT max_statement_time=10 FOR \
             SELECT CAST(UNIX_TIMESTAMP(`rev_timestamp`) AS SIGNED) FROM `revision_userindex` \
             WHERE `rev_actor` = (SELECT `actor_id` FROM `actor` WHERE `actor_name` = ?) \
             ORDER BY `rev_timestamp` LIMIT 1",
        )
        .bind(user)
        .fetch_optional(self.pool())
        .await?;
        match earliest {
            Some(timestamp) => Ok(timestamp),
            None => bail!("no edits found for user {user}"),
        }
    }

    /// Warning-shaped comments on the user's talk page.
    pub async fn user_warn_count(&self, user: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SET STATEMENT max_statement_time=10 FOR \
             SELECT COUNT(*) FROM `page` \
             JOIN `revision` ON `rev_page` = `page_id` \
             JOIN `comment` ON `comment_id` = `rev_comment_id` \
             WHERE `page_namespace` = 3 AND `page_title` = ? \
             AND (`comment_text` LIKE '%warning%' \
             OR `comment_text` LIKE 'General note: Nonconstructive%')",
        )
        .bind(user.replace(' ', "_"))
        .fetch_one(self.pool())
        .await?;
        Ok(count)
    }

    pub async fn user_distinct_pages(&self, user: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SET STATEMENT max_statement_time=10 FOR \
             SELECT COUNT(DISTINCT rev_page) FROM `revision_userindex` \
             WHERE `rev_actor` = (SELECT `actor_id` FROM `actor` WHERE `actor_name` = ?)",
        )
        .bind(user)
        .fetch_one(self.pool())
        .await?;
        Ok(count)
    }

    /// Export per-pool connection gauges.
    pub fn record_pool_metrics(&self) {
        for (i, pool) in self.pools.iter().enumerate() {
            let instance = i.to_string();
            metrics::gauge!("cbng_replica_pool", "instance" => instance.clone(), "metric" => "open")
                .set(f64::from(pool.size()));
            metrics::gauge!("cbng_replica_pool", "instance" => instance, "metric" => "idle")
                .set(pool.num_idle() as f64);
        }
    }
}
