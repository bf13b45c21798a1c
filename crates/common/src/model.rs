use chrono::{DateTime, Utc};

/// Page-level context attached by the SQL enrichment stages.
#[derive(Debug, Clone, Default)]
pub struct PageInfo {
    pub namespace: String,
    pub namespace_id: i64,
    /// Full title as seen on the wire, namespace prefix included for
    /// non-main namespaces.
    pub title: String,
    pub creator: String,
    pub made_time: i64,
    pub recent_edits: i64,
    pub recent_reverts: i64,
}

/// Editor context attached by the SQL enrichment stages.
#[derive(Debug, Clone, Default)]
pub struct UserInfo {
    pub username: String,
    pub edit_count: i64,
    pub distinct_pages: i64,
    pub warns: i64,
    /// 0 for anonymous (IP) editors.
    pub registration_time: i64,
}

#[derive(Debug, Clone, Default)]
pub struct RevisionInfo {
    pub id: i64,
    pub timestamp: i64,
    pub text: String,
    pub username: String,
}

/// The unit of work flowing through the pipeline. Created by the feed
/// ingester, mutated only by the stage currently holding it.
#[derive(Debug, Clone)]
pub struct EditEvent {
    pub uuid: String,
    pub received_time: DateTime<Utc>,
    pub change_time: i64,
    pub comment: String,
    /// Byte-length delta (new - old).
    pub length: i64,
    pub page: PageInfo,
    pub user: UserInfo,
    pub current: RevisionInfo,
    pub previous: RevisionInfo,
    pub vandalism_score: f64,
    pub revert_reason: String,
    pub span: tracing::Span,
}

impl EditEvent {
    pub fn title_with_namespace(&self) -> String {
        if self.page.namespace_id == 0 {
            self.page.title.clone()
        } else if self.page.title.contains(':') {
            // Wire titles already carry the prefix for non-main namespaces.
            self.page.title.clone()
        } else {
            format!("{}:{}", self.page.namespace, self.page.title)
        }
    }

    pub fn diff_url(&self, host: &str) -> String {
        format!(
            "https://{}/w/index.php?diff={}&oldid={}",
            host, self.current.id, self.previous.id
        )
    }

    /// The mIRC-colored one-liner used as a prefix on debug/spam relay
    /// messages.
    pub fn irc_change_line(&self, host: &str) -> String {
        format!(
            "\x0314[[\x0307{}\x0314]]\x0304 \x0310 \x0302{} \x0305* \x0303{} \x0305* \x03({}) \x0310{}\x03",
            self.title_with_namespace(),
            self.diff_url(host),
            self.user.username,
            format_plus_or_minus(self.length),
            self.comment
        )
    }

    pub fn irc_revert_line(&self, host: &str) -> String {
        format!(
            "[[{}]] by \"{}\" ({}) {:.6}",
            self.title_with_namespace(),
            self.user.username,
            self.diff_url(host),
            self.vandalism_score
        )
    }

    pub fn is_anonymous(&self) -> bool {
        is_ip(&self.user.username)
    }

    /// Title as stored in the replica's `page` table: namespace prefix
    /// stripped, spaces replaced by underscores.
    pub fn sql_title(&self) -> String {
        strip_namespace(&self.page.title).replace(' ', "_")
    }

    pub fn elapsed_secs(&self) -> i64 {
        Utc::now().timestamp() - self.received_time.timestamp()
    }
}

pub fn is_ip(user: &str) -> bool {
    user.parse::<std::net::IpAddr>().is_ok()
}

pub fn format_plus_or_minus(value: i64) -> String {
    if value < 0 {
        format!("{value}")
    } else {
        format!("+{value}")
    }
}

/// Canonical namespace table for the configured wiki. Names are the display
/// forms; lookups are case-insensitive.
const NAMESPACES: &[(&str, i64)] = &[
    ("Special", -1),
    ("Media", -2),
    ("Main", 0),
    ("Talk", 1),
    ("User", 2),
    ("User talk", 3),
    ("Wikipedia", 4),
    ("Wikipedia talk", 5),
    ("File", 6),
    ("File talk", 7),
    ("MediaWiki", 8),
    ("MediaWiki talk", 9),
    ("Template", 10),
    ("Template talk", 11),
    ("Help", 12),
    ("Help talk", 13),
    ("Category", 14),
    ("Category talk", 15),
    ("Portal", 100),
    ("Portal talk", 101),
    ("Draft", 118),
    ("Education Program", 446),
    ("TimedText", 710),
    ("Module", 828),
    ("Gadget", 2300),
    ("Gadget definition", 2302),
];

pub fn namespace_name(id: i64) -> &'static str {
    NAMESPACES
        .iter()
        .find(|(_, nid)| *nid == id)
        .map_or("Main", |(name, _)| name)
}

pub fn namespace_id(name: &str) -> Option<i64> {
    let lowered = name.to_lowercase();
    NAMESPACES
        .iter()
        .find(|(n, _)| n.to_lowercase() == lowered)
        .map(|(_, id)| *id)
}

/// Strip a recognized namespace prefix from a title, leaving the bare page
/// name.
pub fn strip_namespace(title: &str) -> String {
    if let Some((prefix, rest)) = title.split_once(':') {
        if namespace_id(prefix).is_some() {
            return rest.to_string();
        }
    }
    title.to_string()
}

/// Join a namespace name and bare title the way the wiki API expects.
pub fn page_title(namespace: &str, title: &str) -> String {
    if namespace.eq_ignore_ascii_case("main") || title.contains(':') {
        title.to_string()
    } else {
        format!("{namespace}:{title}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> EditEvent {
        EditEvent {
            uuid: "u-1".to_string(),
            received_time: Utc::now(),
            change_time: 0,
            comment: "test edit".to_string(),
            length: 50,
            page: PageInfo {
                namespace: "Main".to_string(),
                namespace_id: 0,
                title: "Example Page".to_string(),
                ..PageInfo::default()
            },
            user: UserInfo {
                username: "192.0.2.5".to_string(),
                ..UserInfo::default()
            },
            current: RevisionInfo {
                id: 112,
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

    #[test]
    fn test_revert_line_formats_score_at_six_decimals() {
        let ev = sample_event();
        let line = ev.irc_revert_line("en.wikipedia.org");
        assert!(line.contains("[[Example Page]] by \"192.0.2.5\""));
        assert!(line.ends_with("0.970000"));
        assert!(line.contains("diff=112&oldid=111"));
    }

    #[test]
    fn test_change_line_formats_length_delta() {
        let mut ev = sample_event();
        assert!(ev.irc_change_line("en.wikipedia.org").contains("(+50)"));
        ev.length = -3;
        assert!(ev.irc_change_line("en.wikipedia.org").contains("(-3)"));
    }

    #[test]
    fn test_title_with_namespace_keeps_wire_prefix() {
        let mut ev = sample_event();
        ev.page.namespace = "User talk".to_string();
        ev.page.namespace_id = 3;
        ev.page.title = "User talk:Alice".to_string();
        assert_eq!(ev.title_with_namespace(), "User talk:Alice");
        assert_eq!(ev.sql_title(), "Alice");
    }

    #[test]
    fn test_anonymous_detection() {
        let mut ev = sample_event();
        assert!(ev.is_anonymous());
        ev.user.username = "2001:db8::1".to_string();
        assert!(ev.is_anonymous());
        ev.user.username = "Alice".to_string();
        assert!(!ev.is_anonymous());
    }

    #[test]
    fn test_namespace_table_round_trips() {
        assert_eq!(namespace_name(0), "Main");
        assert_eq!(namespace_name(3), "User talk");
        assert_eq!(namespace_id("user talk"), Some(3));
        assert_eq!(namespace_id("Template"), Some(10));
        assert_eq!(namespace_id("Nonsense"), None);
    }

    #[test]
    fn test_strip_namespace_only_strips_known_prefixes() {
        assert_eq!(strip_namespace("User:Alice"), "Alice");
        assert_eq!(strip_namespace("Example Page"), "Example Page");
        // A colon in the bare title is not a namespace separator.
        assert_eq!(strip_namespace("Dr. Strangelove: How I"), "Dr. Strangelove: How I");
    }

    #[test]
    fn test_page_title_join() {
        assert_eq!(page_title("Main", "Example"), "Example");
        assert_eq!(page_title("User talk", "User talk:Alice"), "User talk:Alice");
        assert_eq!(page_title("Draft", "Thing"), "Draft:Thing");
    }
}
