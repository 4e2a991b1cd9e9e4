//! QRZ XML API grid lookup (C5): fills in a missing grid square for a
//! spotted callsign, with a disk-backed cache so the same callsign is
//! never queried twice.
//!
//! Grounded on `original_source/qrz.py`'s `QRZLookup`. The three-way
//! result (`grid found` / `confirmed no grid` / `transient failure`)
//! is preserved as [`Lookup`]: only the first two get cached, so a
//! network blip doesn't poison the cache with a false negative.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use snafu::Snafu;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const QRZ_URL: &str = "https://xmldata.qrz.com/xml/current/";
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);
const MIN_INTERVAL: Duration = Duration::from_millis(2000);

fn url_encode(s: &str) -> String {
    utf8_percent_encode(s, NON_ALPHANUMERIC).to_string()
}

#[derive(Debug, Snafu)]
pub enum GridError {
    #[snafu(display("QRZ cache file I/O error: {source}"))]
    CacheIo { source: std::io::Error },

    #[snafu(display("QRZ cache file is not valid JSON: {source}"))]
    CacheJson { source: serde_json::Error },
}

/// Outcome of a single `_fetch_grid`-equivalent API call.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Lookup {
    Found(String),
    NotFound,
    Failed,
}

/// Strip the QRZ XML default namespace (the original client does the
/// same string replace before parsing) and read out the text content
/// at a dotted tag path, e.g. `"Session.Error"`.
fn find_text(xml: &str, path: &str) -> Option<String> {
    let xml = xml.replace(" xmlns=\"http://xmldata.qrz.com\"", "");
    let target: Vec<&str> = path.split('.').collect();

    let mut reader = Reader::from_str(&xml);
    reader.config_mut().trim_text(true);
    let mut stack: Vec<String> = Vec::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                stack.push(String::from_utf8_lossy(e.name().as_ref()).to_string());
            }
            Ok(Event::End(_)) => {
                stack.pop();
            }
            Ok(Event::Text(t)) => {
                if stack == target {
                    return t.unescape().ok().map(|s| s.trim().to_string());
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    None
}

struct QrzState {
    session_key: Option<String>,
    cache: HashMap<String, String>,
    last_lookup: Option<tokio::time::Instant>,
}

/// QRZ XML API client. Holds its state behind a single `Mutex`, which
/// both serializes lookups (only one in flight at a time, as the
/// original's `asyncio.Semaphore(1)` does) and protects the session
/// key and cache from concurrent mutation.
pub struct QrzClient {
    username: String,
    password: String,
    cache_path: PathBuf,
    http: reqwest::Client,
    state: Mutex<QrzState>,
}

impl QrzClient {
    pub fn new(username: String, password: String, cache_path: PathBuf) -> Self {
        QrzClient {
            username,
            password,
            cache_path,
            http: reqwest::Client::builder()
                .timeout(LOOKUP_TIMEOUT)
                .build()
                .expect("reqwest client with only a timeout never fails to build"),
            state: Mutex::new(QrzState {
                session_key: None,
                cache: HashMap::new(),
                last_lookup: None,
            }),
        }
    }

    pub async fn load_cache(&self) {
        match tokio::fs::read(&self.cache_path).await {
            Ok(bytes) => match serde_json::from_slice::<HashMap<String, String>>(&bytes) {
                Ok(map) => {
                    info!(count = map.len(), path = %self.cache_path.display(), "loaded QRZ grid cache");
                    self.state.lock().await.cache = map;
                }
                Err(e) => warn!(error = %e, "QRZ cache is not valid JSON, starting empty"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, "could not read QRZ cache"),
        }
    }

    async fn save_cache(&self, cache: &HashMap<String, String>) {
        match serde_json::to_vec_pretty(cache) {
            Ok(bytes) => {
                if let Err(e) = tokio::fs::write(&self.cache_path, bytes).await {
                    warn!(error = %e, "failed to save QRZ cache");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize QRZ cache"),
        }
    }

    /// Seed (or correct) the cache with a grid observed directly from
    /// a cluster spot line — authoritative, and cheaper than an API
    /// round trip.
    pub async fn update_cache(&self, callsign: &str, grid: &str) {
        let call = callsign.to_uppercase();
        if grid.is_empty() {
            return;
        }
        let mut state = self.state.lock().await;
        if state.cache.get(&call).map(String::as_str) != Some(grid) {
            state.cache.insert(call.clone(), grid.to_string());
            debug!(callsign = %call, grid, "QRZ cache updated from cluster");
            let snapshot = state.cache.clone();
            drop(state);
            self.save_cache(&snapshot).await;
        }
    }

    async fn login(&self, state: &mut QrzState) {
        let url = format!(
            "{QRZ_URL}?username={};password={};agent=gtbridge",
            url_encode(&self.username),
            url_encode(&self.password),
        );
        let text = match self.http.get(&url).send().await {
            Ok(resp) => match resp.text().await {
                Ok(t) => t,
                Err(e) => {
                    warn!(error = %e, "QRZ login error reading response");
                    state.session_key = None;
                    return;
                }
            },
            Err(e) => {
                warn!(error = %e, "QRZ login error");
                state.session_key = None;
                return;
            }
        };

        if let Some(err) = find_text(&text, "Session.Error") {
            warn!(error = %err, "QRZ login failed");
            state.session_key = None;
            return;
        }
        match find_text(&text, "Session.Key") {
            Some(key) => {
                info!("QRZ session established");
                state.session_key = Some(key);
            }
            None => {
                warn!("QRZ login response missing session key");
                state.session_key = None;
            }
        }
    }

    /// `_fetch_grid` equivalent, recursing (iteratively) once on a
    /// session timeout exactly as the original does.
    async fn fetch_grid(&self, state: &mut QrzState, callsign: &str) -> Lookup {
        if state.session_key.is_none() {
            self.login(state).await;
        }
        let Some(key) = state.session_key.clone() else {
            return Lookup::Failed;
        };

        let url = format!("{QRZ_URL}?s={key};callsign={}", url_encode(callsign));
        let text = match self.http.get(&url).send().await {
            Ok(resp) => match resp.text().await {
                Ok(t) => t,
                Err(e) => {
                    warn!(callsign, error = %e, "QRZ lookup error");
                    return Lookup::Failed;
                }
            },
            Err(e) => {
                warn!(callsign, error = %e, "QRZ lookup error");
                return Lookup::Failed;
            }
        };

        if let Some(err) = find_text(&text, "Session.Error") {
            let lower = err.to_lowercase();
            if lower.contains("session") || lower.contains("timeout") {
                info!("QRZ session expired, re-logging in");
                state.session_key = None;
                self.login(state).await;
                if state.session_key.is_some() {
                    return Box::pin(self.fetch_grid(state, callsign)).await;
                }
                return Lookup::Failed;
            } else if lower.contains("not found") {
                debug!(callsign, "not found in QRZ");
                return Lookup::NotFound;
            }
            warn!(callsign, error = %err, "QRZ lookup error");
            return Lookup::Failed;
        }

        match find_text(&text, "Callsign.grid") {
            Some(grid) if !grid.is_empty() => {
                info!(callsign, grid, "resolved QRZ grid");
                Lookup::Found(grid)
            }
            _ => {
                debug!(callsign, "has no grid in QRZ");
                Lookup::NotFound
            }
        }
    }

    /// Look up the grid for `callsign`. A cache hit returns instantly;
    /// a cache miss queries QRZ, serialized and rate-limited to one
    /// call per [`MIN_INTERVAL`].
    pub async fn lookup_grid(&self, callsign: &str) -> Option<String> {
        let call = callsign.to_uppercase();

        {
            let state = self.state.lock().await;
            if let Some(cached) = state.cache.get(&call) {
                return if cached.is_empty() { None } else { Some(cached.clone()) };
            }
        }

        let mut state = self.state.lock().await;
        if let Some(cached) = state.cache.get(&call) {
            return if cached.is_empty() { None } else { Some(cached.clone()) };
        }

        if let Some(last) = state.last_lookup {
            let elapsed = last.elapsed();
            if elapsed < MIN_INTERVAL {
                tokio::time::sleep(MIN_INTERVAL - elapsed).await;
            }
        }

        let result = self.fetch_grid(&mut state, &call).await;
        state.last_lookup = Some(tokio::time::Instant::now());

        match result {
            Lookup::Failed => None,
            Lookup::NotFound => {
                state.cache.insert(call, String::new());
                let snapshot = state.cache.clone();
                drop(state);
                self.save_cache(&snapshot).await;
                None
            }
            Lookup::Found(grid) => {
                state.cache.insert(call, grid.clone());
                let snapshot = state.cache.clone();
                drop(state);
                self.save_cache(&snapshot).await;
                Some(grid)
            }
        }
    }
}
