use anyhow::{Context, Result};
use serde::Deserialize;

/// Seconds after a revert during which the same (title, user) pair is not
/// reverted again.
pub const RECENT_REVERT_THRESHOLD: i64 = 86_400;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub bot: Bot,
    pub wikipedia: Wikipedia,
    pub core: Core,
    pub sql: Sql,
    pub irc: Irc,
    pub huggle: Huggle,
    pub observability: Observability,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Bot {
    pub owner: String,
    pub friends: Vec<String>,
    pub run: bool,
    pub angry: bool,
    pub read_only: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Wikipedia {
    pub username: String,
    pub password: String,
    pub host: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Core {
    /// Empty means "look up the active node in the bookkeeping schema".
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Sql {
    pub replica: Vec<SqlServer>,
    pub cluebot: SqlServer,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SqlServer {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub schema: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Irc {
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub channel: IrcChannels,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IrcChannels {
    pub debug: String,
    pub revert: String,
    pub spam: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Huggle {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Observability {
    pub prometheus_port: u16,
}

impl Config {
    /// Load the configuration file, honoring the `BOTNG_CFG` path override
    /// and the `CBNG_*` / `TOOL_*` secret overrides.
    pub fn load() -> Result<Self> {
        let path =
            std::env::var("BOTNG_CFG").unwrap_or_else(|_| "config/default.toml".to_string());
        let content =
            std::fs::read_to_string(&path).with_context(|| format!("reading config {path}"))?;
        let mut config = Self::from_str(&content)?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    fn apply_env_overrides(&mut self) {
        override_from_env(&mut self.wikipedia.password, "CBNG_WIKIPEDIA_PASSWORD");
        override_from_env(&mut self.irc.password, "CBNG_IRC_PASSWORD");
        override_from_env(&mut self.core.host, "CBNG_CORE_HOST");
        for replica in &mut self.sql.replica {
            override_from_env(&mut replica.username, "TOOL_REPLICA_USER");
            override_from_env(&mut replica.password, "TOOL_REPLICA_PASSWORD");
        }
        override_from_env(&mut self.sql.cluebot.username, "TOOL_TOOLSDB_USER");
        override_from_env(&mut self.sql.cluebot.password, "TOOL_TOOLSDB_PASSWORD");
    }

    /// The bot username with spaces replaced by underscores, as it appears
    /// in page titles.
    pub fn bot_page_user(&self) -> String {
        self.wikipedia.username.replace(' ', "_")
    }
}

fn override_from_env(target: &mut String, key: &str) {
    if let Ok(value) = std::env::var(key) {
        if !value.is_empty() {
            *target = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_default_config() {
        let config = Config::from_str(include_str!("../../../config/default.toml")).unwrap();
        assert_eq!(config.wikipedia.host, "en.wikipedia.org");
        assert_eq!(config.observability.prometheus_port, 8118);
        assert!(!config.sql.replica.is_empty());
        assert!(config.bot.read_only);
    }

    #[test]
    fn test_bot_page_user_replaces_spaces() {
        let mut config = Config::from_str(include_str!("../../../config/default.toml")).unwrap();
        config.wikipedia.username = "ClueBot NG".to_string();
        assert_eq!(config.bot_page_user(), "ClueBot_NG");
    }
}
