//! FlexRadio SmartSDR TCP control link (C6): monitors slice status
//! over the SmartSDR TCP API (port 4992) and tunes an existing,
//! mode-compatible slice when a spot is clicked in the downstream
//! roster. Never creates or removes slices.
//!
//! Grounded on `original_source/flexradio.py`'s `FlexRadioClient`: the
//! same two-line connect handshake, the same `C<seq>|cmd` / `S<handle>|...`
//! line protocol, the same compatible-mode table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use snafu::Snafu;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Snafu)]
pub enum RadioError {
    #[snafu(display("could not connect to FlexRadio at {host}:{port}: {source}"))]
    Connect {
        host: String,
        port: u16,
        source: std::io::Error,
    },

    #[snafu(display("FlexRadio connection closed during handshake"))]
    HandshakeClosed,

    #[snafu(display("FlexRadio connection closed by radio"))]
    ReadClosed,

    #[snafu(display("FlexRadio socket error: {source}"))]
    Io { source: std::io::Error },
}

type Result<T> = std::result::Result<T, RadioError>;

/// Per-spot-mode set of SmartSDR slice modes that are considered
/// compatible when hunting for a slice to reuse.
fn compatible_modes(spot_mode: &str) -> Option<&'static [&'static str]> {
    match spot_mode {
        "CW" => Some(&["CW"]),
        "SSB" => Some(&["USB", "LSB"]),
        "FT8" | "FT4" => Some(&["DIGU", "DIGL"]),
        "RTTY" => Some(&["DIGU", "DIGL", "RTTY"]),
        "PSK" => Some(&["DIGU", "DIGL"]),
        "JS8" => Some(&["DIGU", "DIGL"]),
        _ => None,
    }
}

/// Map a bridge spot mode to the SmartSDR slice mode string used to
/// tune to it.
pub fn spot_to_sdr_mode(spot_mode: &str, freq_mhz: f64) -> &'static str {
    match spot_mode.to_uppercase().as_str() {
        "CW" => "CW",
        "SSB" => {
            if (5.0..=5.5).contains(&freq_mhz) {
                "USB"
            } else if freq_mhz < 10.0 {
                "LSB"
            } else {
                "USB"
            }
        }
        "RTTY" => "RTTY",
        "FT8" | "FT4" | "PSK" | "JS8" => "DIGU",
        _ => "USB",
    }
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(5);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Async client for the SmartSDR TCP API. `slices` is behind an
/// `RwLock`: the read loop holds the write lock briefly on every
/// status line, while `find_slice` (called from the reply handler on
/// a different task) only ever needs a read lock.
pub struct FlexRadioClient {
    host: String,
    port: u16,
    pub slices: RwLock<HashMap<u32, HashMap<String, String>>>,
    connected: AtomicBool,
    seq: AtomicU64,
    writer: Mutex<Option<OwnedWriteHalf>>,
}

impl FlexRadioClient {
    pub fn new(host: String, port: u16) -> Self {
        FlexRadioClient {
            host,
            port,
            slices: RwLock::new(HashMap::new()),
            connected: AtomicBool::new(false),
            seq: AtomicU64::new(0),
            writer: Mutex::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Connect (with automatic reconnect) and process status updates
    /// forever, until `running` flips to false.
    pub async fn run(&self, running: &tokio::sync::watch::Receiver<bool>) {
        let mut retry_delay = INITIAL_RETRY_DELAY;

        while *running.borrow() {
            info!(host = %self.host, port = self.port, "connecting to FlexRadio");
            match self.connect_once().await {
                Ok(()) => retry_delay = INITIAL_RETRY_DELAY,
                Err(e) => warn!(error = %e, "FlexRadio connection error"),
            }

            self.connected.store(false, Ordering::Relaxed);
            self.slices.write().await.clear();
            *self.writer.lock().await = None;

            if !*running.borrow() {
                break;
            }
            info!(delay_secs = retry_delay.as_secs(), "reconnecting to FlexRadio");
            tokio::time::sleep(retry_delay).await;
            retry_delay = (retry_delay * 2).min(MAX_RETRY_DELAY);
        }
    }

    async fn connect_once(&self) -> Result<()> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((self.host.as_str(), self.port)))
            .await
            .map_err(|_| RadioError::Connect {
                host: self.host.clone(),
                port: self.port,
                source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
            })?
            .context(ConnectSnafu {
                host: self.host.clone(),
                port: self.port,
            })?;

        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let mut version = String::new();
        let mut handle = String::new();
        tokio::time::timeout(HANDSHAKE_TIMEOUT, reader.read_line(&mut version))
            .await
            .map_err(|_| RadioError::HandshakeClosed)?
            .context(IoSnafu)?;
        tokio::time::timeout(HANDSHAKE_TIMEOUT, reader.read_line(&mut handle))
            .await
            .map_err(|_| RadioError::HandshakeClosed)?
            .context(IoSnafu)?;

        info!(version = version.trim(), handle = handle.trim(), "connected to FlexRadio");

        self.slices.write().await.clear();
        self.seq.store(0, Ordering::Relaxed);
        *self.writer.lock().await = Some(write_half);

        self.send("sub slice all").await?;
        self.connected.store(true, Ordering::Relaxed);

        self.read_loop(reader).await
    }

    async fn send(&self, cmd: &str) -> Result<u64> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let mut guard = self.writer.lock().await;
        if let Some(w) = guard.as_mut() {
            let line = format!("C{seq}|{cmd}\n");
            w.write_all(line.as_bytes()).await.context(IoSnafu)?;
            debug!(seq, cmd, "sent FlexRadio command");
        }
        Ok(seq)
    }

    async fn read_loop(&self, mut reader: BufReader<tokio::net::tcp::OwnedReadHalf>) -> Result<()> {
        let mut line = String::new();
        loop {
            line.clear();
            let n = reader.read_line(&mut line).await.context(IoSnafu)?;
            if n == 0 {
                warn!("FlexRadio connection closed by radio");
                return ReadClosedSnafu.fail();
            }
            let text = line.trim();
            if text.is_empty() {
                continue;
            }
            match text.as_bytes()[0] {
                b'S' => self.on_status(text).await,
                b'R' => self.on_response(text),
                _ => {}
            }
        }
    }

    fn on_response(&self, text: &str) {
        let parts: Vec<&str> = text.splitn(4, '|').collect();
        if parts.len() >= 2 && parts[1] != "0" {
            let msg = parts.get(2).copied().unwrap_or("");
            warn!(seq = &parts[0][1..], status = parts[1], message = msg, "FlexRadio command error");
        }
    }

    async fn on_status(&self, text: &str) {
        let Some(pipe) = text.find('|') else { return };
        let body = &text[pipe + 1..];
        let tokens: Vec<&str> = body.split_whitespace().collect();
        if tokens.len() < 2 || tokens[0] != "slice" {
            return;
        }
        let Ok(sn) = tokens[1].parse::<u32>() else {
            return;
        };

        let mut slices = self.slices.write().await;
        let entry = slices.entry(sn).or_default();
        for tok in &tokens[2..] {
            if let Some(eq) = tok.find('=') {
                entry.insert(tok[..eq].to_string(), tok[eq + 1..].to_string());
            }
        }

        if entry.get("in_use").map(String::as_str) == Some("1") {
            debug!(
                slice = sn,
                letter = entry.get("index_letter").map(String::as_str).unwrap_or("?"),
                freq = entry.get("RF_frequency").map(String::as_str).unwrap_or("?"),
                mode = entry.get("mode").map(String::as_str).unwrap_or("?"),
                "slice update"
            );
        }
    }

    /// Find an in-use slice on `band` whose mode is compatible with
    /// `mode`, or `None` if none matches.
    pub async fn find_slice(&self, band: &str, mode: &str) -> Option<u32> {
        let compat = compatible_modes(mode)?;
        let slices = self.slices.read().await;
        for (sn, info) in slices.iter() {
            if info.get("in_use").map(String::as_str) != Some("1") {
                continue;
            }
            let Some(freq_mhz) = info.get("RF_frequency").and_then(|s| s.parse::<f64>().ok()) else {
                continue;
            };
            let slice_band = crate::band::freq_to_band(freq_mhz * 1000.0);
            let slice_mode = info.get("mode").map(|s| s.to_uppercase()).unwrap_or_default();
            if slice_band == Some(band) && compat.contains(&slice_mode.as_str()) {
                return Some(*sn);
            }
        }
        None
    }

    pub async fn tune(&self, slice_num: u32, freq_mhz: f64) -> Result<()> {
        if !self.is_connected() {
            return Ok(());
        }
        info!(slice = slice_num, freq_mhz, "tuning FlexRadio slice");
        self.send(&format!("slice t {slice_num} {freq_mhz:.6}")).await?;
        Ok(())
    }

    pub async fn set_mode(&self, slice_num: u32, mode: &str) -> Result<()> {
        if !self.is_connected() {
            return Ok(());
        }
        info!(slice = slice_num, mode, "setting FlexRadio slice mode");
        self.send(&format!("slice set {slice_num} mode={mode}")).await?;
        Ok(())
    }

    /// Tune `slice_num` to `freq_mhz` and, if needed, change its mode
    /// to match `spot_mode` first.
    pub async fn tune_to_spot(&self, slice_num: u32, freq_mhz: f64, spot_mode: &str) -> Result<()> {
        if !self.is_connected() {
            return Ok(());
        }
        let sdr_mode = spot_to_sdr_mode(spot_mode, freq_mhz);
        let current = self
            .slices
            .read()
            .await
            .get(&slice_num)
            .and_then(|s| s.get("mode"))
            .map(|s| s.to_uppercase())
            .unwrap_or_default();
        if current != sdr_mode {
            self.set_mode(slice_num, sdr_mode).await?;
        }
        self.tune(slice_num, freq_mhz).await
    }
}

use snafu::ResultExt;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sdr_mode_cw_is_cw() {
        assert_eq!(spot_to_sdr_mode("CW", 14.0), "CW");
    }

    #[test]
    fn sdr_mode_ssb_picks_sideband_by_frequency() {
        assert_eq!(spot_to_sdr_mode("SSB", 3.8), "LSB");
        assert_eq!(spot_to_sdr_mode("SSB", 14.2), "USB");
        assert_eq!(spot_to_sdr_mode("SSB", 5.3), "USB"); // 60m exception
    }

    #[test]
    fn sdr_mode_digital_modes_map_to_digu() {
        assert_eq!(spot_to_sdr_mode("FT8", 14.074), "DIGU");
        assert_eq!(spot_to_sdr_mode("FT4", 7.047), "DIGU");
        assert_eq!(spot_to_sdr_mode("JS8", 7.078), "DIGU");
    }

    #[test]
    fn sdr_mode_unknown_falls_back_to_usb() {
        assert_eq!(spot_to_sdr_mode("BOGUS", 14.0), "USB");
    }

    #[tokio::test]
    async fn find_slice_matches_band_and_compatible_mode() {
        let client = FlexRadioClient::new("127.0.0.1".to_string(), 4992);
        {
            let mut slices = client.slices.write().await;
            let mut info = HashMap::new();
            info.insert("in_use".to_string(), "1".to_string());
            info.insert("RF_frequency".to_string(), "14.074".to_string());
            info.insert("mode".to_string(), "DIGU".to_string());
            slices.insert(0, info);
        }
        assert_eq!(client.find_slice("20m", "FT8").await, Some(0));
        assert_eq!(client.find_slice("40m", "FT8").await, None);
        assert_eq!(client.find_slice("20m", "CW").await, None);
    }

    #[tokio::test]
    async fn tune_is_a_no_op_when_not_connected() {
        let client = FlexRadioClient::new("127.0.0.1".to_string(), 4992);
        assert!(client.tune(0, 14.074).await.is_ok());
    }
}
