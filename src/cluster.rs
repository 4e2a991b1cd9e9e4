//! DX cluster telnet ingest (C3): connects to a cluster server, logs
//! in with a callsign, and turns `DX de ...` announcement lines into
//! [`crate::model::Spot`] values.
//!
//! Grounded on `original_source/dxcluster.py`'s `DXClusterClient`: the
//! same reconnect-with-backoff loop, the same login-prompt sniffing,
//! the same regex-based line grammar. The async callback becomes a
//! bounded `mpsc` channel, which is the idiom the rest of this crate
//! uses to hand spots from an ingest task to the cache.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use snafu::Snafu;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::model::{Mode, Spot};

#[derive(Debug, Snafu)]
pub enum ClusterError {
    #[snafu(display("[{name}] could not connect to {host}:{port}: {source}"))]
    Connect {
        name: String,
        host: String,
        port: u16,
        source: std::io::Error,
    },

    #[snafu(display("[{name}] connection closed during login"))]
    LoginClosed { name: String },

    #[snafu(display("[{name}] connection closed by server"))]
    ReadClosed { name: String },

    #[snafu(display("[{name}] socket error: {source}"))]
    Io { name: String, source: std::io::Error },
}

type Result<T> = std::result::Result<T, ClusterError>;

static SPOT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^DX\s+de\s+(?P<spotter>[A-Z0-9/\-#]+):\s+(?P<freq>[\d.]+)\s+(?P<dx_call>[A-Z0-9/]+)\s+(?P<comment>.*?)\s+(?P<time>\d{4})Z\s*$",
    )
    .expect("static spot regex is valid")
});

static SNR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)([+-]?\d{1,3})\s*dB").expect("static snr regex is valid"));

static GRID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([A-R]{2}\d{2}(?:[a-x]{2})?)\b").expect("static grid regex is valid"));

static ANSI_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9;]*[a-zA-Z]").expect("static ansi regex is valid"));

/// Extract a mode from free-form comment text by scanning
/// [`crate::model::MODE_SCAN_ORDER`] for a whole-word match, in order.
/// FT8 is checked before FT4, JT65 before JT9, etc., matching the
/// original bridge's pattern list order exactly.
pub fn extract_mode(comment: &str) -> Option<Mode> {
    for mode in crate::model::MODE_SCAN_ORDER {
        let pattern = format!(r"(?i)\b{}\b", regex::escape(mode.as_str()));
        if Regex::new(&pattern)
            .expect("mode word-boundary regex is valid")
            .is_match(comment)
        {
            return Some(*mode);
        }
    }
    None
}

/// Parse one cleaned cluster line into a [`Spot`], or `None` if it
/// isn't a `DX de` announcement.
pub fn parse_spot_line(line: &str) -> Option<Spot> {
    let caps = SPOT_RE.captures(line.trim())?;

    let comment = caps["comment"].trim().to_string();
    let mode = extract_mode(&comment);
    let snr = SNR_RE
        .captures(&comment)
        .and_then(|c| c[1].parse::<i16>().ok());
    let grid = GRID_RE.captures(&comment).map(|c| c[1].to_string());

    Some(Spot {
        spotter: caps["spotter"].to_uppercase(),
        freq_khz: caps["freq"].parse().ok()?,
        dx_call: caps["dx_call"].to_uppercase(),
        comment,
        time_utc: caps["time"].to_string(),
        mode,
        snr,
        grid,
        activity: None,
    })
}

/// Strip ANSI escape sequences and other control characters some
/// cluster servers send (color codes, cursor moves).
fn clean_line(line: &str) -> String {
    let stripped = ANSI_RE.replace_all(line, "");
    stripped
        .chars()
        .filter(|c| *c >= ' ' || *c == '\t')
        .collect::<String>()
        .trim()
        .to_string()
}

const LOGIN_TIMEOUT: Duration = Duration::from_secs(15);
const LOGIN_READ_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(120);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(5);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(120);

/// One `(Spot, cluster_name)` ingest event.
pub type SpotEvent = (Spot, String);

/// Async TCP client for a single DX cluster telnet connection. Runs
/// forever (until `stop` is called), reconnecting with exponential
/// backoff on any error.
pub struct ClusterClient {
    host: String,
    port: u16,
    callsign: String,
    name: String,
    login_commands: Vec<String>,
    tx: mpsc::Sender<SpotEvent>,
}

impl ClusterClient {
    pub fn new(
        host: String,
        port: u16,
        callsign: String,
        name: Option<String>,
        login_commands: Vec<String>,
        tx: mpsc::Sender<SpotEvent>,
    ) -> Self {
        let name = name.unwrap_or_else(|| format!("{host}:{port}"));
        ClusterClient {
            host,
            port,
            callsign: callsign.to_uppercase(),
            name,
            login_commands,
            tx,
        }
    }

    /// Connect and read forever, reconnecting on failure. Returns only
    /// when `running` flips to false mid-backoff, or never, in the
    /// typical case of running as a spawned task until cancelled.
    pub async fn run(&self, running: &tokio::sync::watch::Receiver<bool>) {
        let mut retry_delay = INITIAL_RETRY_DELAY;

        while *running.borrow() {
            info!(cluster = %self.name, host = %self.host, port = self.port, "connecting");
            match self.connect_once().await {
                Ok(()) => {
                    retry_delay = INITIAL_RETRY_DELAY;
                }
                Err(e) => {
                    warn!(cluster = %self.name, error = %e, "connection error");
                }
            }

            if !*running.borrow() {
                break;
            }
            info!(cluster = %self.name, delay_secs = retry_delay.as_secs(), "reconnecting");
            tokio::time::sleep(retry_delay).await;
            retry_delay = (retry_delay * 2).min(MAX_RETRY_DELAY);
        }
    }

    async fn connect_once(&self) -> Result<()> {
        let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect((self.host.as_str(), self.port)))
            .await
            .map_err(|_| ClusterError::Connect {
                name: self.name.clone(),
                host: self.host.clone(),
                port: self.port,
                source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
            })?
            .context(ConnectSnafu {
                name: self.name.clone(),
                host: self.host.clone(),
                port: self.port,
            })?;

        info!(cluster = %self.name, "connected");
        self.login(&mut stream).await?;
        self.read_loop(&mut stream).await
    }

    async fn login(&self, stream: &mut TcpStream) -> Result<()> {
        let mut sent = false;
        let mut buf = [0u8; 4096];
        let deadline = tokio::time::Instant::now() + LOGIN_TIMEOUT;

        while tokio::time::Instant::now() < deadline {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let read = timeout(remaining.min(LOGIN_READ_TIMEOUT), stream.read(&mut buf)).await;

            let n = match read {
                Err(_) => {
                    if !sent {
                        break;
                    }
                    continue;
                }
                Ok(Ok(0)) => {
                    return LoginClosedSnafu {
                        name: self.name.clone(),
                    }
                    .fail()
                }
                Ok(Ok(n)) => n,
                Ok(Err(source)) => {
                    return Err(ClusterError::Io {
                        name: self.name.clone(),
                        source,
                    })
                }
            };

            let text = String::from_utf8_lossy(&buf[..n]).to_string();
            debug!(cluster = %self.name, "<<< {}", text.trim());

            let lower = text.to_lowercase();
            if ["login", "call", "your call", "enter"]
                .iter()
                .any(|kw| lower.contains(kw))
            {
                stream
                    .write_all(format!("{}\r\n", self.callsign).as_bytes())
                    .await
                    .context(IoSnafu {
                        name: self.name.clone(),
                    })?;
                info!(cluster = %self.name, callsign = %self.callsign, "sent callsign");
                sent = true;
                tokio::time::sleep(Duration::from_secs(1)).await;
                return self.post_login(stream).await;
            }
        }

        if !sent {
            stream
                .write_all(format!("{}\r\n", self.callsign).as_bytes())
                .await
                .context(IoSnafu {
                    name: self.name.clone(),
                })?;
            info!(cluster = %self.name, callsign = %self.callsign, "sent callsign (no prompt detected)");
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        self.post_login(stream).await
    }

    /// Post the configured `login_commands` (0.5 s apart) followed by
    /// `sh/dx\r\n`, once the callsign has been sent and the 1 s
    /// settle-delay has elapsed.
    async fn post_login(&self, stream: &mut TcpStream) -> Result<()> {
        for cmd in &self.login_commands {
            stream
                .write_all(format!("{cmd}\r\n").as_bytes())
                .await
                .context(IoSnafu {
                    name: self.name.clone(),
                })?;
            debug!(cluster = %self.name, command = %cmd, "sent login command");
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        stream.write_all(b"sh/dx\r\n").await.context(IoSnafu {
            name: self.name.clone(),
        })?;
        debug!(cluster = %self.name, "sent sh/dx");
        Ok(())
    }

    async fn read_loop(&self, stream: &mut TcpStream) -> Result<()> {
        let mut buffer = String::new();
        let mut buf = [0u8; 4096];

        loop {
            let read = timeout(READ_TIMEOUT, stream.read(&mut buf)).await;
            let n = match read {
                Err(_) => {
                    if stream.write_all(b"\r\n").await.is_err() {
                        return Ok(());
                    }
                    continue;
                }
                Ok(Ok(0)) => {
                    warn!(cluster = %self.name, "connection closed by server");
                    return ReadClosedSnafu {
                        name: self.name.clone(),
                    }
                    .fail();
                }
                Ok(Ok(n)) => n,
                Ok(Err(source)) => {
                    return Err(ClusterError::Io {
                        name: self.name.clone(),
                        source,
                    })
                }
            };

            buffer.push_str(&String::from_utf8_lossy(&buf[..n]));
            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].to_string();
                buffer.drain(..=pos);
                let clean = clean_line(&line);
                if clean.is_empty() {
                    continue;
                }
                debug!(cluster = %self.name, "{}", clean);

                match parse_spot_line(&clean) {
                    Some(spot) => {
                        debug!(cluster = %self.name, dx = %spot.dx_call, freq = spot.freq_khz, "parsed spot");
                        if self.tx.send((spot, self.name.clone())).await.is_err() {
                            return Ok(());
                        }
                    }
                    None if clean.to_uppercase().starts_with("DX DE") => {
                        warn!(cluster = %self.name, line = %clean, "unparsed DX line");
                    }
                    None => {}
                }
            }
        }
    }
}

use snafu::ResultExt;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_standard_spot_line() {
        let line = "DX de W3LPL:     14074.0  JA1ABC       FT8 -15dB                1234Z";
        let spot = parse_spot_line(line).expect("should parse");
        assert_eq!(spot.spotter, "W3LPL");
        assert_eq!(spot.freq_khz, 14074.0);
        assert_eq!(spot.dx_call, "JA1ABC");
        assert_eq!(spot.mode, Some(Mode::Ft8));
        assert_eq!(spot.snr, Some(-15));
        assert_eq!(spot.time_utc, "1234");
    }

    #[test]
    fn extracts_grid_from_comment() {
        let line = "DX de K1ABC:     7074.0  W1AW      FT8 FN42 -10dB         0100Z";
        let spot = parse_spot_line(line).unwrap();
        assert_eq!(spot.grid.as_deref(), Some("FN42"));
    }

    #[test]
    fn non_spot_lines_return_none() {
        assert!(parse_spot_line("Welcome to the cluster").is_none());
        assert!(parse_spot_line("").is_none());
    }

    #[test]
    fn mode_scan_checks_ft8_before_ft4() {
        assert_eq!(extract_mode("FT8 strong signal"), Some(Mode::Ft8));
        assert_eq!(extract_mode("FT4 weak"), Some(Mode::Ft4));
        assert_eq!(extract_mode("nothing here"), None);
    }

    #[test]
    fn strips_ansi_escape_codes() {
        let dirty = "\x1b[1;32mDX de W3LPL:\x1b[0m     14074.0  JA1ABC FT8  1234Z";
        let clean = clean_line(dirty);
        assert!(!clean.contains('\x1b'));
        assert!(parse_spot_line(&clean).is_some());
    }

    #[test]
    fn spotter_and_callsign_are_uppercased() {
        let line = "DX de w3lpl:     14074.0  ja1abc       FT8 -15dB                1234Z";
        let spot = parse_spot_line(line).unwrap();
        assert_eq!(spot.spotter, "W3LPL");
        assert_eq!(spot.dx_call, "JA1ABC");
    }
}
