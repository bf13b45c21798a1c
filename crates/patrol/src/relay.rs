use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use base64::Engine;
use common::config::Config;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

/// Sustained message rate and burst allowed towards one IRC channel.
const RELAY_RATE_PER_SEC: f64 = 2.0;
const RELAY_BURST: f64 = 4.0;

const RELAY_QUEUE_CAPACITY: usize = 10_000;

/// Simple token bucket; messages over the limit are dropped, not queued.
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    per_sec: f64,
    last: Instant,
}

impl TokenBucket {
    pub fn new(per_sec: f64, burst: f64) -> Self {
        Self {
            capacity: burst,
            tokens: burst,
            per_sec,
            last: Instant::now(),
        }
    }

    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    fn allow_at(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.per_sec).min(self.capacity);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[derive(Clone)]
struct RelayHandle {
    tx: mpsc::Sender<String>,
}

impl RelayHandle {
    fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

/// The three logical notification channels. When the IRC relay is disabled
/// every send is a counted no-op.
#[derive(Clone)]
pub struct Relays {
    debug: Option<RelayHandle>,
    revert: Option<RelayHandle>,
    spam: Option<RelayHandle>,
}

impl Relays {
    pub fn disabled() -> Self {
        Self {
            debug: None,
            revert: None,
            spam: None,
        }
    }

    pub fn new(config: &Config, enabled: bool) -> Self {
        if !enabled {
            return Self::disabled();
        }

        let mut handles = Vec::new();
        for (kind, channel) in [
            ("debug", config.irc.channel.debug.clone()),
            ("revert", config.irc.channel.revert.clone()),
            ("spam", config.irc.channel.spam.clone()),
        ] {
            let (tx, rx) = mpsc::channel(RELAY_QUEUE_CAPACITY);
            let session = SessionParams {
                server: config.irc.server.clone(),
                port: config.irc.port,
                nick: format!("{}-{}", config.irc.username, kind),
                username: config.irc.username.clone(),
                password: config.irc.password.clone(),
                channel,
            };
            tokio::spawn(run_relay(session, rx));
            handles.push(RelayHandle { tx });
        }

        let mut handles = handles.into_iter();
        Self {
            debug: handles.next(),
            revert: handles.next(),
            spam: handles.next(),
        }
    }

    fn send(handle: Option<&RelayHandle>, channel: &'static str, message: String) {
        metrics::counter!("cbng_irc_notifications_sent", "channel" => channel).increment(1);
        if let Some(handle) = handle {
            if handle.tx.try_send(message).is_err() {
                tracing::trace!(channel, "relay queue full, dropping message");
            }
        }
    }

    pub fn send_debug(&self, message: String) {
        Self::send(self.debug.as_ref(), "debug", message);
    }

    pub fn send_revert(&self, message: String) {
        Self::send(self.revert.as_ref(), "revert", message);
    }

    pub fn send_spam(&self, message: String) {
        Self::send(self.spam.as_ref(), "spam", message);
    }

    pub fn pending_counts(&self) -> [(&'static str, usize); 3] {
        [
            ("debug", self.debug.as_ref().map_or(0, RelayHandle::pending)),
            ("revert", self.revert.as_ref().map_or(0, RelayHandle::pending)),
            ("spam", self.spam.as_ref().map_or(0, RelayHandle::pending)),
        ]
    }
}

struct SessionParams {
    server: String,
    port: u16,
    nick: String,
    username: String,
    password: String,
    channel: String,
}

async fn run_relay(params: SessionParams, mut rx: mpsc::Receiver<String>) {
    loop {
        if let Err(e) = run_session(&params, &mut rx).await {
            tracing::warn!(nick = %params.nick, error = %e, "irc session ended");
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

async fn tls_connect(server: &str, port: u16) -> Result<TlsStream<TcpStream>> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));

    let tcp = TcpStream::connect((server, port))
        .await
        .context("irc tcp connect")?;
    let domain = ServerName::try_from(server.to_string()).context("irc server name")?;
    Ok(connector.connect(domain, tcp).await.context("irc tls")?)
}

async fn send_line(
    writer: &mut WriteHalf<TlsStream<TcpStream>>,
    line: &str,
    secret: bool,
) -> Result<()> {
    if secret {
        tracing::debug!("sending to IRC: **secret**");
    } else {
        tracing::debug!(line, "sending to IRC");
    }
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    Ok(())
}

async fn run_session(params: &SessionParams, rx: &mut mpsc::Receiver<String>) -> Result<()> {
    tracing::info!(server = %params.server, nick = %params.nick, "connecting to IRC server");
    let stream = tls_connect(&params.server, params.port).await?;
    let (read_half, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(read_half).lines();

    let base_nick = params.nick.replace(' ', "_");
    let mut current_nick = base_nick.clone();
    let mut nick_count = 0;
    let mut sasl_done = false;
    let mut joined = false;
    let mut limiter = TokenBucket::new(RELAY_RATE_PER_SEC, RELAY_BURST);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("irc read")? else {
                    bail!("irc stream closed");
                };
                let parts: Vec<&str> = line.split(' ').collect();
                tracing::trace!(line, "parsing irc line");

                if line.ends_with("*** No Ident response") {
                    if !params.password.is_empty() {
                        // Prefer SASL; NickServ is the fallback.
                        send_line(&mut writer, "CAP REQ :sasl", false).await?;
                    }
                    send_line(
                        &mut writer,
                        &format!("USER {base_nick} \"1\" \"1\" :ClueBot Wikipedia Bot 3.0."),
                        false,
                    )
                    .await?;
                    send_line(&mut writer, &format!("NICK {current_nick}"), false).await?;
                } else if line.ends_with("CAP * ACK :sasl") {
                    send_line(&mut writer, "AUTHENTICATE PLAIN", false).await?;
                } else if line.ends_with("AUTHENTICATE +") {
                    let payload = base64::engine::general_purpose::STANDARD.encode(format!(
                        "{}\0{}\0{}",
                        params.username, params.username, params.password
                    ));
                    send_line(&mut writer, &format!("AUTHENTICATE {payload}"), true).await?;
                } else if line.ends_with("SASL authentication successful") {
                    send_line(&mut writer, "CAP END", false).await?;
                    sasl_done = true;
                } else if parts.first() == Some(&"ERROR") {
                    bail!("irc error: {line}");
                } else if parts.first() == Some(&"PING") {
                    let token = parts.get(1).map_or("", |t| t.trim_start_matches(':'));
                    send_line(&mut writer, &format!("PONG {token}"), false).await?;
                } else if matches!(parts.get(1), Some(&"376") | Some(&"422")) {
                    if !params.password.is_empty() && !sasl_done {
                        send_line(
                            &mut writer,
                            &format!(
                                "PRIVMSG NickServ :IDENTIFY {current_nick} {}",
                                params.password
                            ),
                            true,
                        )
                        .await?;
                    }
                    send_line(&mut writer, &format!("JOIN #{}", params.channel), false).await?;
                    joined = true;
                } else if parts.get(1) == Some(&"433") {
                    nick_count += 1;
                    current_nick = format!("{base_nick}_{nick_count}");
                    tracing::warn!(nick = %current_nick, "nick already in use, retrying");
                    send_line(&mut writer, &format!("NICK {current_nick}"), false).await?;
                } else {
                    tracing::trace!(line, "unsupported irc event");
                }
            }

            message = rx.recv(), if joined => {
                let Some(message) = message else {
                    bail!("relay channel closed");
                };
                // Drop instead of queueing when over the limit; a backlog of
                // stale notifications helps nobody.
                if limiter.allow() {
                    send_line(
                        &mut writer,
                        &format!("PRIVMSG #{} :{message}", params.channel),
                        false,
                    )
                    .await?;
                } else {
                    tracing::trace!("not sending to irc due to rate limit");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_bucket_allows_burst_then_throttles() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(2.0, 4.0);
        bucket.last = start;

        // Full burst available immediately.
        for _ in 0..4 {
            assert!(bucket.allow_at(start));
        }
        assert!(!bucket.allow_at(start));

        // Half a second refills one token at 2/s.
        assert!(bucket.allow_at(start + Duration::from_millis(500)));
        assert!(!bucket.allow_at(start + Duration::from_millis(500)));
    }

    #[test]
    fn test_token_bucket_caps_at_burst() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(2.0, 4.0);
        bucket.last = start;

        // A long idle period must not bank more than the burst.
        let later = start + Duration::from_secs(60);
        for _ in 0..4 {
            assert!(bucket.allow_at(later));
        }
        assert!(!bucket.allow_at(later));
    }

    #[test]
    fn test_disabled_relays_count_but_do_not_send() {
        let relays = Relays::disabled();
        relays.send_debug("a".to_string());
        relays.send_revert("b".to_string());
        relays.send_spam("c".to_string());
        assert_eq!(
            relays.pending_counts(),
            [("debug", 0), ("revert", 0), ("spam", 0)]
        );
    }

    #[tokio::test]
    async fn test_pending_counts_track_queued_messages() {
        let (tx, _rx) = mpsc::channel(RELAY_QUEUE_CAPACITY);
        let relays = Relays {
            debug: Some(RelayHandle { tx }),
            revert: None,
            spam: None,
        };
        relays.send_debug("one".to_string());
        relays.send_debug("two".to_string());
        assert_eq!(relays.pending_counts()[0], ("debug", 2));
    }
}
