//! Telnet re-broadcast server (C10): a DX Spider-alike TCP server so
//! any standard DX cluster client (or Ham Radio Deluzie/VE7CC gateway
//! mode) can watch the same spots this bridge is forwarding.
//!
//! Grounded on `original_source/telnet_server.py`'s `TelnetServer`:
//! same login banner, same `set/ve7cc` / `set/prompt` / `echo` command
//! surface, same two line formats. Per-client writer state becomes a
//! `tokio::sync::broadcast` subscription instead of a shared
//! `{writer: state}` dict — each client task tracks its own `ve7cc`
//! flag locally and formats every broadcast spot itself.

use chrono::Utc;
use snafu::Snafu;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::model::Spot;

#[derive(Debug, Snafu)]
pub enum TelnetError {
    #[snafu(display("could not bind telnet server on {host}:{port}: {source}"))]
    Bind {
        host: String,
        port: u16,
        source: std::io::Error,
    },
}

const BROADCAST_CAPACITY: usize = 256;
const LOGIN_TIMEOUT_SECS: u64 = 60;

/// `"DX de spotter:   freq  dx_call      comment                    timeZ"`
pub fn format_spot_line(spot: &Spot) -> String {
    let spotter = format!("{}:", spot.spotter);
    let spotter = truncate(&spotter, 8);
    let dx_call = truncate(&spot.dx_call, 12);
    let comment = truncate(&spot.comment, 28);

    format!(
        "DX de {spotter:<8} {:>10.1}  {dx_call:<12} {comment:<28}{}Z",
        spot.freq_khz, spot.time_utc
    )
}

/// `CC11^freq^dx_call^date^timeZ^comment^spotter^grid^origin^flag^`
pub fn format_cc11_line(spot: &Spot) -> String {
    let date_str = Utc::now().format("%d-%b-%Y").to_string();
    let grid = spot.grid.as_deref().unwrap_or("");
    format!(
        "CC11^{:.1}^{}^{}^{}Z^{}^{}^{}^^0^",
        spot.freq_khz, spot.dx_call, date_str, spot.time_utc, spot.comment, spot.spotter, grid
    )
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

pub struct TelnetServer {
    host: String,
    port: u16,
    node_call: String,
    tx: broadcast::Sender<Spot>,
}

impl TelnetServer {
    pub fn new(host: String, port: u16, node_call: String) -> Self {
        let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        TelnetServer {
            host,
            port,
            node_call,
            tx,
        }
    }

    /// Broadcast a spot to every connected client. A no-op if nobody
    /// is listening (mirrors the original's early-return when
    /// `self._clients` is empty).
    pub fn broadcast_spot(&self, spot: Spot) {
        let _ = self.tx.send(spot);
    }

    /// Bind and serve forever, spawning one task per accepted
    /// connection, until `running` flips to false.
    pub async fn run(&self, running: tokio::sync::watch::Receiver<bool>) -> Result<(), TelnetError> {
        let listener = TcpListener::bind((self.host.as_str(), self.port))
            .await
            .context(BindSnafu {
                host: self.host.clone(),
                port: self.port,
            })?;
        info!(host = %self.host, port = self.port, node = %self.node_call, "telnet server listening");

        let mut running = running;
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let node_call = self.node_call.clone();
                            let rx = self.tx.subscribe();
                            tokio::spawn(async move {
                                if let Err(e) = handle_client(stream, peer.to_string(), node_call, rx).await {
                                    warn!(peer = %peer, error = %e, "telnet client error");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "telnet accept error"),
                    }
                }
                _ = running.changed() => {
                    if !*running.borrow() {
                        break;
                    }
                }
            }
        }
        info!("telnet server stopped");
        Ok(())
    }
}

async fn handle_client(
    stream: TcpStream,
    addr: String,
    node_call: String,
    mut spots: broadcast::Receiver<Spot>,
) -> std::io::Result<()> {
    info!(addr = %addr, "telnet client connected");
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    write_half.write_all(b"login: Please enter your call: ").await?;

    let mut line = String::new();
    let read = tokio::time::timeout(
        std::time::Duration::from_secs(LOGIN_TIMEOUT_SECS),
        reader.read_line(&mut line),
    )
    .await;

    let callsign = match read {
        Err(_) => {
            write_half.write_all(b"Timeout. Goodbye.\r\n").await.ok();
            info!(addr = %addr, "telnet client timed out during login");
            return Ok(());
        }
        Ok(Ok(0)) => return Ok(()),
        Ok(Ok(_)) => {
            let call = line.trim().to_string();
            if call.is_empty() {
                "UNKNOWN".to_string()
            } else {
                call
            }
        }
        Ok(Err(e)) => return Err(e),
    };

    write_half
        .write_all(format!("Hello {callsign}, this is {node_call} running DX Spider\r\n{callsign} de {node_call} >\r\n").as_bytes())
        .await?;
    info!(addr = %addr, callsign, "telnet client logged in");

    let mut prompt = format!("{callsign} de {node_call} >\r\n");
    let mut ve7cc = false;

    loop {
        let mut cmd_line = String::new();
        tokio::select! {
            read_result = reader.read_line(&mut cmd_line) => {
                match read_result {
                    Ok(0) => break,
                    Ok(_) => {
                        let cmd = cmd_line.trim();
                        if cmd.is_empty() {
                            continue;
                        }
                        debug!(addr = %addr, cmd, "telnet command");
                        let mut parts = cmd.splitn(2, char::is_whitespace);
                        let verb = parts.next().unwrap_or("").to_lowercase();
                        let rest = parts.next().unwrap_or("").trim();

                        let response = match verb.as_str() {
                            "echo" if !rest.is_empty() => format!("{rest}\r\n{prompt}"),
                            "set/prompt" if !rest.is_empty() => {
                                prompt = format!("{}\r\n", rest.replace("%M", &node_call));
                                prompt.clone()
                            }
                            "set/ve7cc" => {
                                ve7cc = true;
                                info!(addr = %addr, "VE7CC mode enabled");
                                format!("VE7CC gateway mode enabled\r\n{prompt}")
                            }
                            _ if verb.starts_with("sh/") => prompt.clone(),
                            _ => prompt.clone(),
                        };
                        if write_half.write_all(response.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            spot = spots.recv() => {
                match spot {
                    Ok(spot) => {
                        let line = if ve7cc {
                            format!("{}\x07\r\n", format_cc11_line(&spot))
                        } else {
                            format!("{}\x07\r\n", format_spot_line(&spot))
                        };
                        if write_half.write_all(line.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    info!(addr = %addr, "telnet client disconnected");
    Ok(())
}

use snafu::ResultExt;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Mode;

    fn sample_spot() -> Spot {
        Spot {
            spotter: "W3LPL".to_string(),
            freq_khz: 14074.0,
            dx_call: "JA1ABC".to_string(),
            comment: "FT8 -15dB".to_string(),
            time_utc: "1234".to_string(),
            mode: Some(Mode::Ft8),
            snr: Some(-15),
            grid: None,
            activity: None,
        }
    }

    #[test]
    fn formats_standard_spot_line() {
        let line = format_spot_line(&sample_spot());
        assert!(line.starts_with("DX de W3LPL:"));
        assert!(line.ends_with("1234Z"));
        assert!(line.contains("JA1ABC"));
    }

    #[test]
    fn formats_cc11_line() {
        let line = format_cc11_line(&sample_spot());
        assert!(line.starts_with("CC11^14074.0^JA1ABC^"));
        assert!(line.contains("^1234Z^"));
        assert!(line.ends_with("^^0^"));
    }

    #[test]
    fn truncates_long_fields() {
        let mut spot = sample_spot();
        spot.dx_call = "VERYLONGCALLSIGN1234567".to_string();
        let line = format_spot_line(&spot);
        assert!(line.contains(&truncate(&spot.dx_call, 12)));
    }

    #[tokio::test]
    async fn broadcast_with_no_subscribers_does_not_panic() {
        let server = TelnetServer::new("127.0.0.1".to_string(), 0, "GTB-2".to_string());
        server.broadcast_spot(sample_spot());
    }
}
