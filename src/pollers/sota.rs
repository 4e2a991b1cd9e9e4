//! Summits on the Air (SOTA) activator poller.
//!
//! Grounded on `original_source/sota.py`'s `SotaFetcher`: polls
//! `https://api2.sota.org.uk/api/spots/50/all`, keeps only the latest
//! spot per activator callsign, redelivers on a `spot_ttl`-derived
//! refresh interval rather than a hard dedup, and resolves each
//! summit's grid square via `https://api2.sota.org.uk/api/summits/...`
//! with a disk-backed cache so repeated activations of the same summit
//! don't re-hit the API.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{http_client, PollerError};
use crate::cluster::SpotEvent;
use crate::model::{Activity, Spot};

pub const SOTA_SPOTS_URL: &str = "https://api2.sota.org.uk/api/spots/50/all";
pub const SOTA_SUMMIT_URL: &str = "https://api2.sota.org.uk/api/summits";
const FETCH_TIMEOUT: Duration = Duration::from_secs(15);
const MIN_FREQ_KHZ: f64 = 1800.0;
const MAX_FREQ_KHZ: f64 = 450_000.0;

#[derive(Debug, Deserialize)]
struct SotaApiSpot {
    #[serde(rename = "activatorCallsign")]
    activator_callsign: Option<String>,
    id: Option<i64>,
    frequency: Option<String>,
    mode: Option<String>,
    #[serde(rename = "associationCode")]
    association_code: Option<String>,
    #[serde(rename = "summitCode")]
    summit_code: Option<String>,
    comments: Option<String>,
    #[serde(rename = "timeStamp")]
    time_stamp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SotaSummit {
    locator: Option<String>,
}

fn time_utc_from_iso(spot_time: &str) -> String {
    if spot_time.len() >= 16 {
        spot_time[11..16].replace(':', "")
    } else {
        "0000".to_string()
    }
}

/// Dedup state for one activator: last delivered `(freq_khz, mode)`
/// plus the instant it was delivered, used to decide when a refresh
/// is due even without a change.
struct LastState {
    freq_khz: f64,
    mode: String,
    at: Instant,
}

pub struct SotaFetcher {
    client: reqwest::Client,
    poll_interval: Duration,
    refresh_interval: Duration,
    tx: mpsc::Sender<SpotEvent>,
    last_state: HashMap<String, LastState>,
    summit_cache: HashMap<String, String>,
    cache_path: PathBuf,
}

impl SotaFetcher {
    pub fn new(poll_interval: Duration, spot_ttl: Duration, tx: mpsc::Sender<SpotEvent>, cache_path: PathBuf) -> Self {
        let refresh_secs = spot_ttl.as_secs().saturating_sub(30).max(60);
        SotaFetcher {
            client: http_client(FETCH_TIMEOUT),
            poll_interval,
            refresh_interval: Duration::from_secs(refresh_secs),
            tx,
            last_state: HashMap::new(),
            summit_cache: HashMap::new(),
            cache_path,
        }
    }

    /// Load the summit-grid cache from disk. A missing or malformed
    /// file is treated as an empty cache, not a hard error — the
    /// bridge still functions, it just re-resolves every summit.
    pub async fn load_cache(&mut self) {
        match tokio::fs::read(&self.cache_path).await {
            Ok(bytes) => match serde_json::from_slice::<HashMap<String, String>>(&bytes) {
                Ok(map) => {
                    info!(count = map.len(), path = %self.cache_path.display(), "loaded SOTA summit grid cache");
                    self.summit_cache = map;
                }
                Err(e) => warn!(error = %e, "SOTA summit cache is not valid JSON, starting empty"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, "could not read SOTA summit cache"),
        }
    }

    async fn save_cache(&self) {
        match serde_json::to_vec_pretty(&self.summit_cache) {
            Ok(bytes) => {
                if let Err(e) = tokio::fs::write(&self.cache_path, bytes).await {
                    warn!(error = %e, "failed to save SOTA summit cache");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize SOTA summit cache"),
        }
    }

    async fn fetch_summit_grid(&self, summit_ref: &str) -> Option<String> {
        let url = format!("{SOTA_SUMMIT_URL}/{summit_ref}");
        let resp = self.client.get(&url).send().await.ok()?.error_for_status().ok()?;
        let summit: SotaSummit = resp.json().await.ok()?;
        let locator = summit.locator.unwrap_or_default();
        if locator.len() >= 4 {
            Some(locator[..4].to_string())
        } else {
            None
        }
    }

    async fn summit_grid(&mut self, summit_ref: &str) -> Option<String> {
        if let Some(cached) = self.summit_cache.get(summit_ref) {
            return if cached.is_empty() { None } else { Some(cached.clone()) };
        }

        let grid = self.fetch_summit_grid(summit_ref).await;
        match &grid {
            Some(g) => {
                info!(summit = summit_ref, grid = %g, "resolved SOTA summit grid");
                self.summit_cache.insert(summit_ref.to_string(), g.clone());
            }
            None => {
                debug!(summit = summit_ref, "summit grid lookup failed, caching miss");
                self.summit_cache.insert(summit_ref.to_string(), String::new());
            }
        }
        self.save_cache().await;
        grid
    }

    async fn fetch_spots(&self) -> Result<Vec<SotaApiSpot>, PollerError> {
        self.client
            .get(SOTA_SPOTS_URL)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|source| PollerError::Http {
                source_name: "SOTA".to_string(),
                source,
            })?
            .json::<Vec<SotaApiSpot>>()
            .await
            .map_err(|source| PollerError::Http {
                source_name: "SOTA".to_string(),
                source,
            })
    }

    async fn poll_once(&mut self) {
        let raw_spots = match self.fetch_spots().await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "SOTA API fetch error");
                return;
            }
        };

        // Keep only the highest-id (most recent) spot per activator.
        let mut latest: HashMap<String, &SotaApiSpot> = HashMap::new();
        for s in &raw_spots {
            let Some(call) = s.activator_callsign.as_deref() else {
                continue;
            };
            let call = call.trim().to_uppercase();
            if call.is_empty() {
                continue;
            }
            let id = s.id.unwrap_or(0);
            match latest.get(&call) {
                Some(existing) if existing.id.unwrap_or(0) >= id => {}
                _ => {
                    latest.insert(call, s);
                }
            }
        }

        let mut current_calls = std::collections::HashSet::new();
        let mut new_count = 0;
        let calls: Vec<String> = latest.keys().cloned().collect();

        for call in calls {
            let s = latest[&call];

            let Some(freq_str) = s.frequency.as_deref() else {
                continue;
            };
            if freq_str.is_empty() {
                continue;
            }

            let comments = s.comments.as_deref().unwrap_or("").to_uppercase();
            if comments.contains("QRT") {
                continue;
            }

            let Ok(freq_mhz) = freq_str.parse::<f64>() else {
                continue;
            };
            let freq_khz = freq_mhz * 1000.0;
            if !(MIN_FREQ_KHZ..=MAX_FREQ_KHZ).contains(&freq_khz) {
                continue;
            }

            let mut mode_str = s.mode.as_deref().unwrap_or("").trim().to_uppercase();
            if mode_str == "OTHER" {
                mode_str.clear();
            }
            if mode_str == "FT8" || mode_str == "FT4" {
                continue;
            }

            current_calls.insert(call.clone());

            let now = Instant::now();
            let is_new_state = match self.last_state.get(&call) {
                Some(prev) => {
                    !(prev.freq_khz == freq_khz
                        && prev.mode == mode_str
                        && now.duration_since(prev.at) < self.refresh_interval)
                }
                None => true,
            };
            if !is_new_state {
                continue;
            }

            self.last_state.insert(
                call.clone(),
                LastState {
                    freq_khz,
                    mode: mode_str.clone(),
                    at: now,
                },
            );
            new_count += 1;

            let assoc = s.association_code.clone().unwrap_or_default();
            let code = s.summit_code.clone().unwrap_or_default();
            let summit_ref = format!("{assoc}/{code}");
            let grid = self.summit_grid(&summit_ref).await;

            let mode = if mode_str.is_empty() {
                None
            } else {
                crate::model::Mode::parse(&mode_str)
            };
            let time_utc = time_utc_from_iso(s.time_stamp.as_deref().unwrap_or(""));

            let spot = Spot {
                spotter: "SOTA".to_string(),
                freq_khz,
                dx_call: call,
                comment: summit_ref,
                time_utc,
                mode,
                snr: None,
                grid,
                activity: Some(Activity::Sota),
            };

            if self.tx.send((spot, "SOTA".to_string())).await.is_err() {
                return;
            }
        }

        self.last_state.retain(|call, _| current_calls.contains(call));

        if new_count > 0 {
            info!(new_count, total = current_calls.len(), "SOTA new/changed activators");
        }
    }

    pub async fn run(&mut self, mut running: tokio::sync::watch::Receiver<bool>) {
        self.load_cache().await;
        info!(interval_secs = self.poll_interval.as_secs(), url = SOTA_SPOTS_URL, "polling SOTA");
        self.poll_once().await;

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.tick().await;

        while *running.borrow() {
            tokio::select! {
                _ = ticker.tick() => self.poll_once().await,
                _ = running.changed() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_hhmm_from_iso_timestamp() {
        assert_eq!(time_utc_from_iso("2026-02-12T23:08:46"), "2308");
        assert_eq!(time_utc_from_iso(""), "0000");
    }

    #[test]
    fn refresh_interval_floors_at_60() {
        let (tx, _rx) = mpsc::channel(1);
        let f = SotaFetcher::new(
            Duration::from_secs(120),
            Duration::from_secs(10),
            tx,
            PathBuf::from("/tmp/sota_cache_test.json"),
        );
        assert_eq!(f.refresh_interval, Duration::from_secs(60));
    }

    #[test]
    fn refresh_interval_subtracts_30_when_above_floor() {
        let (tx, _rx) = mpsc::channel(1);
        let f = SotaFetcher::new(
            Duration::from_secs(120),
            Duration::from_secs(300),
            tx,
            PathBuf::from("/tmp/sota_cache_test2.json"),
        );
        assert_eq!(f.refresh_interval, Duration::from_secs(270));
    }

    #[tokio::test]
    async fn summit_grid_uses_cached_value_without_network() {
        let (tx, _rx) = mpsc::channel(1);
        let mut f = SotaFetcher::new(
            Duration::from_secs(120),
            Duration::from_secs(300),
            tx,
            PathBuf::from("/tmp/sota_cache_test3.json"),
        );
        f.summit_cache.insert("W0C/FR-102".to_string(), "DN70".to_string());
        assert_eq!(f.summit_grid("W0C/FR-102").await, Some("DN70".to_string()));

        f.summit_cache.insert("W0C/FR-999".to_string(), String::new());
        assert_eq!(f.summit_grid("W0C/FR-999").await, None);
    }
}
