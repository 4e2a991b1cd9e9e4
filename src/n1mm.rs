//! Contact-log ingest (C7): a UDP listener for N1MM Logger+'s
//! `<contactinfo>` broadcast, emitting a QSO-Logged record onto the
//! wire for every completed contact.
//!
//! No `original_source/` analog exists for this component — the wire
//! shape and field list come straight from the configured port and
//! the documented `contactinfo` schema. Named after the actual
//! protocol it speaks (N1MM Logger+'s UDP contact broadcast) rather
//! than a generic label.

use quick_xml::events::Event;
use quick_xml::reader::Reader;
use snafu::Snafu;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

#[derive(Debug, Snafu)]
pub enum N1mmError {
    #[snafu(display("could not bind N1MM UDP listener on port {port}: {source}"))]
    Bind { port: u16, source: std::io::Error },

    #[snafu(display("N1MM UDP socket error: {source}"))]
    Recv { source: std::io::Error },
}

type Result<T> = std::result::Result<T, N1mmError>;

/// A parsed `<contactinfo>` document — one completed QSO as reported
/// by N1MM Logger+.
#[derive(Debug, Clone, Default)]
pub struct N1mmContactInfo {
    pub call: String,
    pub mode: Option<String>,
    /// Receive frequency in Hz (the wire units are 10 Hz, already
    /// multiplied up).
    pub rx_freq_hz: Option<u64>,
    pub gridsquare: Option<String>,
    pub snt: Option<String>,
    pub rcv: Option<String>,
    pub mycall: Option<String>,
    pub sntnr: Option<String>,
    pub rcvnr: Option<String>,
    /// `YYYY-MM-DD HH:MM:SS`, UTC, as broadcast.
    pub timestamp: Option<String>,
}

/// Parse one UDP datagram's bytes as a `contactinfo` XML document.
/// Returns `None` if the root element isn't `contactinfo`, or if the
/// document has no `call` text (both are silently-dropped cases per
/// the ingest rule, not errors).
pub fn parse_contact_info(bytes: &[u8]) -> Option<N1mmContactInfo> {
    let text = String::from_utf8_lossy(bytes);
    let mut reader = Reader::from_str(&text);
    reader.config_mut().trim_text(true);

    let mut info = N1mmContactInfo::default();
    let mut current: Option<String> = None;
    let mut saw_root = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if !saw_root {
                    if name != "contactinfo" {
                        return None;
                    }
                    saw_root = true;
                } else {
                    current = Some(name);
                }
            }
            Ok(Event::End(_)) => {
                current = None;
            }
            Ok(Event::Text(t)) => {
                let Some(tag) = current.as_deref() else { continue };
                let Ok(value) = t.unescape() else { continue };
                let value = value.trim().to_string();
                match tag {
                    "call" => info.call = value,
                    "mode" => info.mode = Some(value.to_uppercase()),
                    "rxfreq" => {
                        info.rx_freq_hz = value.parse::<u64>().ok().map(|v| v * 10);
                    }
                    "gridsquare" => info.gridsquare = Some(value),
                    "snt" => info.snt = Some(value),
                    "rcv" => info.rcv = Some(value),
                    "mycall" => info.mycall = Some(value),
                    "sntnr" => info.sntnr = Some(value),
                    "rcvnr" => info.rcvnr = Some(value),
                    "timestamp" => info.timestamp = Some(value),
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }

    if !saw_root || info.call.is_empty() {
        return None;
    }
    Some(info)
}

/// UDP listener for the N1MM contact broadcast. `run` drives the
/// socket recv loop and invokes `on_contact` for every accepted
/// datagram; the caller is expected to do band validation and wire
/// emission there (§4.7: unknown band is dropped with a warning by
/// the caller, since band/virtual-instance bookkeeping lives in C8/C9).
pub struct N1mmListener {
    socket: UdpSocket,
}

impl N1mmListener {
    pub async fn bind(port: u16) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port))
            .await
            .context(BindSnafu { port })?;
        Ok(N1mmListener { socket })
    }

    pub async fn run<F>(&self, running: &tokio::sync::watch::Receiver<bool>, mut on_contact: F)
    where
        F: FnMut(N1mmContactInfo),
    {
        let mut buf = [0u8; 8192];
        while *running.borrow() {
            match self.socket.recv_from(&mut buf).await {
                Ok((n, peer)) => {
                    debug!(bytes = n, %peer, "received N1MM datagram");
                    match parse_contact_info(&buf[..n]) {
                        Some(info) => on_contact(info),
                        None => debug!(%peer, "datagram was not a recognizable contactinfo document"),
                    }
                }
                Err(e) => warn!(error = %e, "N1MM UDP recv error"),
            }
        }
    }
}

use snafu::ResultExt;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_contactinfo_document() {
        let xml = r#"<contactinfo>
            <call>K1ABC</call>
            <mode>ft8</mode>
            <rxfreq>1407400</rxfreq>
            <gridsquare>FN42</gridsquare>
            <snt>-10</snt>
            <rcv>-05</rcv>
            <mycall>W1AW</mycall>
            <sntnr>001</sntnr>
            <rcvnr>002</rcvnr>
            <timestamp>2026-02-12 23:08:46</timestamp>
        </contactinfo>"#;
        let info = parse_contact_info(xml.as_bytes()).expect("should parse");
        assert_eq!(info.call, "K1ABC");
        assert_eq!(info.mode.as_deref(), Some("FT8"));
        assert_eq!(info.rx_freq_hz, Some(14_074_000));
        assert_eq!(info.gridsquare.as_deref(), Some("FN42"));
        assert_eq!(info.mycall.as_deref(), Some("W1AW"));
        assert_eq!(info.timestamp.as_deref(), Some("2026-02-12 23:08:46"));
    }

    #[test]
    fn non_contactinfo_root_is_dropped() {
        let xml = r#"<somethingelse><call>K1ABC</call></somethingelse>"#;
        assert!(parse_contact_info(xml.as_bytes()).is_none());
    }

    #[test]
    fn missing_call_is_dropped() {
        let xml = r#"<contactinfo><mode>CW</mode></contactinfo>"#;
        assert!(parse_contact_info(xml.as_bytes()).is_none());
    }

    #[test]
    fn malformed_xml_is_dropped_not_panicked() {
        assert!(parse_contact_info(b"not xml at all").is_none());
    }
}
