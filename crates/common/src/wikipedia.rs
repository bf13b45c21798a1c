use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use serde::Deserialize;

use crate::model::RevisionInfo;

const USER_AGENT: &str = "ClueBot/2.1";

/// Metadata for a single revision, used by the single-edit ingress mode.
#[derive(Debug, Clone)]
pub struct RevisionMeta {
    pub namespace_id: i64,
    pub title: String,
    pub username: String,
    pub comment: String,
    pub size: i64,
    pub timestamp: i64,
}

/// Wikipedia `api.php` client. Holds the session cookie jar; all requests
/// carry the bot user agent. Write operations are short-circuited to
/// success in read-only mode.
pub struct WikipediaClient {
    api_url: String,
    username: String,
    password: String,
    read_only: bool,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    login: LoginBody,
}

#[derive(Debug, Deserialize)]
struct LoginBody {
    result: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    query: Option<QueryBody>,
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct QueryBody {
    pages: Option<HashMap<String, ApiPage>>,
    tokens: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct ApiPage {
    ns: Option<i64>,
    title: Option<String>,
    revisions: Option<Vec<ApiRevision>>,
}

#[derive(Debug, Deserialize)]
struct ApiRevision {
    revid: Option<i64>,
    user: Option<String>,
    timestamp: Option<String>,
    comment: Option<String>,
    size: Option<i64>,
    slots: Option<ApiSlots>,
}

#[derive(Debug, Deserialize)]
struct ApiSlots {
    main: Option<ApiSlotContent>,
}

#[derive(Debug, Deserialize)]
struct ApiSlotContent {
    #[serde(rename = "*")]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: String,
    #[allow(dead_code)]
    info: Option<String>,
}

fn parse_api_timestamp(ts: &str) -> Result<i64> {
    Ok(DateTime::parse_from_rfc3339(ts)
        .with_context(|| format!("bad API timestamp {ts}"))?
        .timestamp())
}

impl ApiRevision {
    fn to_revision(&self) -> Result<RevisionInfo> {
        Ok(RevisionInfo {
            id: self.revid.unwrap_or(0),
            timestamp: self
                .timestamp
                .as_deref()
                .map(parse_api_timestamp)
                .transpose()?
                .unwrap_or(0),
            text: self
                .slots
                .as_ref()
                .and_then(|s| s.main.as_ref())
                .and_then(|m| m.content.clone())
                .unwrap_or_default(),
            username: self.user.clone().unwrap_or_default(),
        })
    }
}

impl WikipediaClient {
    pub fn new(host: &str, username: &str, password: &str, read_only: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(Duration::from_secs(10))
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            api_url: format!("https://{host}/w/api.php"),
            username: username.to_string(),
            password: password.to_string(),
            read_only,
            client,
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    async fn attempt_login(&self, token: Option<&str>) -> Result<LoginBody> {
        let mut form = vec![
            ("action", "login"),
            ("format", "json"),
            ("lgname", self.username.as_str()),
            ("lgpassword", self.password.as_str()),
        ];
        if let Some(token) = token {
            form.push(("lgtoken", token));
        }

        let response: LoginResponse = self
            .client
            .post(&self.api_url)
            .form(&form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.login)
    }

    /// Log in, repeating once with the issued token if the API answers
    /// `NeedToken`.
    pub async fn login(&self) -> Result<()> {
        let first = self.attempt_login(None).await?;
        match first.result.as_str() {
            "Success" => {
                tracing::debug!("logged into wikipedia (no token)");
                return Ok(());
            }
            "NeedToken" => {
                let token = first
                    .token
                    .ok_or_else(|| anyhow!("NeedToken response without a token"))?;
                let second = self.attempt_login(Some(&token)).await?;
                if second.result == "Success" {
                    tracing::debug!("logged into wikipedia (token)");
                    return Ok(());
                }
            }
            _ => {}
        }
        bail!("failed to login to wikipedia")
    }

    async fn query(&self, params: &[(&str, String)]) -> Result<ApiResponse> {
        Ok(self
            .client
            .get(&self.api_url)
            .query(params)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    fn revisions_of(response: ApiResponse) -> Result<Vec<RevisionInfo>> {
        let pages = response
            .query
            .and_then(|q| q.pages)
            .ok_or_else(|| anyhow!("no query result"))?;
        let page = pages
            .into_values()
            .next()
            .ok_or_else(|| anyhow!("no pages in query result"))?;
        let revisions = page
            .revisions
            .ok_or_else(|| anyhow!("no revisions for page"))?;
        revisions.iter().map(ApiRevision::to_revision).collect()
    }

    /// Read the latest revision of a title.
    pub async fn get_page(&self, title: &str) -> Result<RevisionInfo> {
        let response = self
            .query(&[
                ("action", "query".to_string()),
                ("format", "json".to_string()),
                ("rawcontinue", "1".to_string()),
                ("prop", "revisions".to_string()),
                ("titles", title.to_string()),
                ("rvlimit", "1".to_string()),
                ("rvslots", "*".to_string()),
                ("rvprop", "timestamp|user|content|ids".to_string()),
                ("rvdir", "older".to_string()),
            ])
            .await?;
        Self::revisions_of(response)?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("empty revision list for {title}"))
    }

    /// Read the current and previous revisions anchored at `rev_id`.
    /// Requires exactly two revisions in the answer.
    pub async fn get_revision(
        &self,
        title: &str,
        rev_id: i64,
    ) -> Result<(RevisionInfo, RevisionInfo)> {
        let response = self
            .query(&[
                ("action", "query".to_string()),
                ("format", "json".to_string()),
                ("rawcontinue", "1".to_string()),
                ("prop", "revisions".to_string()),
                ("titles", title.to_string()),
                ("rvstartid", rev_id.to_string()),
                ("rvlimit", "2".to_string()),
                ("rvslots", "*".to_string()),
                ("rvprop", "timestamp|user|content|ids".to_string()),
            ])
            .await?;
        let mut revisions = Self::revisions_of(response)?;
        if revisions.len() != 2 {
            bail!("expected 2 revisions, got {}", revisions.len());
        }
        let previous = revisions.pop().expect("length checked");
        let current = revisions.pop().expect("length checked");
        Ok((current, previous))
    }

    /// Read up to five revisions starting at `rev_id`, newest first.
    pub async fn get_revision_history(
        &self,
        title: &str,
        rev_id: i64,
    ) -> Result<Vec<RevisionInfo>> {
        let response = self
            .query(&[
                ("action", "query".to_string()),
                ("format", "json".to_string()),
                ("rawcontinue", "1".to_string()),
                ("prop", "revisions".to_string()),
                ("titles", title.to_string()),
                ("rvstartid", rev_id.to_string()),
                ("rvlimit", "5".to_string()),
                ("rvslots", "*".to_string()),
                ("rvprop", "timestamp|user|content|ids".to_string()),
            ])
            .await?;
        Self::revisions_of(response)
    }

    /// Metadata for one revision id (single-edit ingress).
    pub async fn get_revision_metadata(&self, rev_id: i64) -> Result<RevisionMeta> {
        let response = self
            .query(&[
                ("action", "query".to_string()),
                ("format", "json".to_string()),
                ("prop", "revisions".to_string()),
                ("revids", rev_id.to_string()),
                ("rvprop", "user|comment|size|timestamp".to_string()),
            ])
            .await?;
        let pages = response
            .query
            .and_then(|q| q.pages)
            .ok_or_else(|| anyhow!("no query result"))?;
        let page = pages
            .into_values()
            .next()
            .ok_or_else(|| anyhow!("no pages in query result"))?;
        let namespace_id = page.ns.unwrap_or(0);
        let title = page.title.clone().unwrap_or_default();
        let revision = page
            .revisions
            .and_then(|mut r| if r.is_empty() { None } else { Some(r.remove(0)) })
            .ok_or_else(|| anyhow!("no revisions for {rev_id}"))?;
        Ok(RevisionMeta {
            namespace_id,
            title,
            username: revision.user.clone().unwrap_or_default(),
            comment: revision.comment.clone().unwrap_or_default(),
            size: revision.size.unwrap_or(0),
            timestamp: revision
                .timestamp
                .as_deref()
                .map(parse_api_timestamp)
                .transpose()?
                .unwrap_or(0),
        })
    }

    async fn fetch_token(&self, token_type: Option<&str>) -> Result<String> {
        let mut params = vec![
            ("action", "query".to_string()),
            ("format", "json".to_string()),
            ("meta", "tokens".to_string()),
        ];
        let key = match token_type {
            Some(t) => {
                params.push(("type", t.to_string()));
                format!("{t}token")
            }
            None => "csrftoken".to_string(),
        };
        let response = self.query(&params).await?;
        response
            .query
            .and_then(|q| q.tokens)
            .and_then(|mut t| t.remove(&key))
            .ok_or_else(|| anyhow!("no {key} in token response"))
    }

    async fn post_action(&self, form: &[(&str, String)]) -> Result<()> {
        let response: ApiResponse = self
            .client
            .post(&self.api_url)
            .form(form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if let Some(error) = response.error {
            bail!(ApiError { code: error.code });
        }
        Ok(())
    }

    /// Roll back all consecutive edits by `user` on `title`. On `badtoken`
    /// the client logs in again and retries exactly once.
    pub async fn rollback(&self, title: &str, user: &str, summary: &str) -> Result<()> {
        if self.read_only {
            tracing::info!(title, user, "mock rollback due to read only mode");
            return Ok(());
        }

        let mut retried = false;
        loop {
            let token = self.fetch_token(Some("rollback")).await?;
            let result = self
                .post_action(&[
                    ("action", "rollback".to_string()),
                    ("format", "json".to_string()),
                    ("title", title.to_string()),
                    ("user", user.to_string()),
                    ("summary", summary.to_string()),
                    ("token", token),
                ])
                .await;
            match result {
                Ok(()) => return Ok(()),
                Err(e) if !retried && is_bad_token(&e) => {
                    tracing::warn!(title, "got bad token, re-trying rollback after login");
                    self.login().await?;
                    retried = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Replace the full content of a page. On `badtoken` the client logs in
    /// again and retries exactly once.
    pub async fn write_page(&self, title: &str, content: &str, summary: &str) -> Result<()> {
        if self.read_only {
            tracing::info!(title, "mock page write due to read only mode");
            return Ok(());
        }

        let mut retried = false;
        loop {
            let token = self.fetch_token(None).await?;
            let result = self
                .post_action(&[
                    ("action", "edit".to_string()),
                    ("format", "json".to_string()),
                    ("title", title.to_string()),
                    ("text", content.to_string()),
                    ("summary", summary.to_string()),
                    ("notminor", "1".to_string()),
                    ("token", token),
                ])
                .await;
            match result {
                Ok(()) => return Ok(()),
                Err(e) if !retried && is_bad_token(&e) => {
                    tracing::warn!(title, "got bad token, re-trying edit after login");
                    self.login().await?;
                    retried = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn append_to_page(&self, title: &str, message: &str, summary: &str) -> Result<()> {
        let page = self.get_page(title).await?;
        let content = format!("{}\n\n{}", page.text, message);
        self.write_page(title, &content, summary).await
    }

    /// Highest uw-template warning level on the user's talk page whose
    /// signature timestamp falls within the last two days.
    pub async fn get_warning_level(&self, user: &str) -> i64 {
        match self.get_page(&format!("User talk:{user}")).await {
            Ok(page) => scan_warning_level(&page.text, Utc::now()),
            Err(e) => {
                tracing::debug!(user, error = %e, "no talk page content for warning level");
                0
            }
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub code: String,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "API error: {}", self.code)
    }
}

impl std::error::Error for ApiError {}

fn is_bad_token(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ApiError>()
        .is_some_and(|e| e.code == "badtoken")
}

fn warning_marker_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"<!-- Template:uw-[a-z]*(\d)(?:im)? -->.*?(\d{2}):(\d{2}), (\d{1,2}) ([A-Za-z]+) (\d{4}) \(UTC\)",
        )
        .expect("warning marker regex")
    })
}

fn month_number(name: &str) -> Option<u32> {
    const MONTHS: [&str; 12] = [
        "January",
        "February",
        "March",
        "April",
        "May",
        "June",
        "July",
        "August",
        "September",
        "October",
        "November",
        "December",
    ];
    MONTHS
        .iter()
        .position(|m| m.eq_ignore_ascii_case(name))
        .map(|i| i as u32 + 1)
}

/// Scan talk-page wikitext for `<!-- Template:uw-*N(im)? -->` markers and
/// return the highest level among those signed within the last two days.
pub fn scan_warning_level(text: &str, now: DateTime<Utc>) -> i64 {
    let mut level = 0;
    for captures in warning_marker_regex().captures_iter(text) {
        let marker_level: i64 = match captures[1].parse() {
            Ok(v) => v,
            Err(_) => continue,
        };
        let (hour, minute, day, year): (u32, u32, u32, i32) = match (
            captures[2].parse(),
            captures[3].parse(),
            captures[4].parse(),
            captures[6].parse(),
        ) {
            (Ok(h), Ok(m), Ok(d), Ok(y)) => (h, m, d, y),
            _ => continue,
        };
        let Some(month) = month_number(&captures[5]) else {
            continue;
        };
        let Some(signed) = Utc
            .with_ymd_and_hms(year, month, day, hour, minute, 0)
            .single()
        else {
            continue;
        };
        if marker_level > level && now.signed_duration_since(signed).num_seconds() <= 2 * 86_400 {
            level = marker_level;
        }
    }
    level
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn signed(now: DateTime<Utc>, age: Duration) -> String {
        (now - age).format("%H:%M, %-d %B %Y (UTC)").to_string()
    }

    #[test]
    fn test_scan_warning_level_takes_recent_max() {
        let now = Utc::now();
        let text = format!(
            "<!-- Template:uw-vandalism1 --> blah {}\n<!-- Template:uw-vandalism3 --> blah {}\n",
            signed(now, Duration::hours(30)),
            signed(now, Duration::hours(2)),
        );
        assert_eq!(scan_warning_level(&text, now), 3);
    }

    #[test]
    fn test_scan_warning_level_ignores_stale_markers() {
        let now = Utc::now();
        let text = format!(
            "<!-- Template:uw-vandalism4 --> old {}",
            signed(now, Duration::days(10)),
        );
        assert_eq!(scan_warning_level(&text, now), 0);
    }

    #[test]
    fn test_scan_warning_level_accepts_im_suffix() {
        let now = Utc::now();
        let text = format!(
            "<!-- Template:uw-vandalism4im --> x {}",
            signed(now, Duration::hours(1)),
        );
        assert_eq!(scan_warning_level(&text, now), 4);
    }

    #[test]
    fn test_scan_warning_level_empty_text() {
        assert_eq!(scan_warning_level("no markers here", Utc::now()), 0);
    }

    #[test]
    fn test_bad_token_detection() {
        let err = anyhow::Error::new(ApiError {
            code: "badtoken".to_string(),
        });
        assert!(is_bad_token(&err));
        let other = anyhow::Error::new(ApiError {
            code: "ratelimited".to_string(),
        });
        assert!(!is_bad_token(&other));
    }

    #[test]
    fn test_parse_api_timestamp() {
        assert_eq!(parse_api_timestamp("1970-01-01T00:00:10Z").unwrap(), 10);
        assert!(parse_api_timestamp("not a time").is_err());
    }
}
