//! Parks on the Air (POTA) activator poller.
//!
//! Grounded on `original_source/pota.py`'s `POTAFetcher`: polls
//! `https://api.pota.app/spot/activator`, dedups on `spotId`, skips
//! FT8/FT4 (GridTracker tags those natively from WSJT-X decodes, not
//! from this bridge). On top of the `spotId` dedup, also applies the
//! callsign-level `(freq_khz, mode)` refresh policy shared with
//! [`super::sota`], so a long-running activation keeps getting
//! redelivered even once its `spotId` has already been seen.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::{http_client, PollerError};
use crate::cluster::SpotEvent;
use crate::model::{Activity, Spot};

pub const POTA_API_URL: &str = "https://api.pota.app/spot/activator";
const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
struct PotaApiSpot {
    #[serde(rename = "spotId")]
    spot_id: Option<i64>,
    activator: Option<String>,
    frequency: Option<String>,
    mode: Option<String>,
    grid4: Option<String>,
    reference: Option<String>,
    #[serde(rename = "spotTime")]
    spot_time: Option<String>,
}

/// Extract `HHMM` from an ISO-8601-ish timestamp like
/// `"2026-02-12T23:08:46"`, matching `spot_time[11:16]` in the
/// original implementation.
fn time_utc_from_iso(spot_time: &str) -> String {
    if spot_time.len() >= 16 {
        spot_time[11..16].replace(':', "")
    } else {
        "0000".to_string()
    }
}

/// Dedup state for one activator: last delivered `(freq_khz, mode)`
/// plus the instant it was delivered, used to decide when a refresh
/// is due even without a change. Mirrors `sota::LastState`.
struct LastState {
    freq_khz: f64,
    mode: String,
    at: Instant,
}

pub struct PotaFetcher {
    client: reqwest::Client,
    poll_interval: Duration,
    refresh_interval: Duration,
    tx: mpsc::Sender<SpotEvent>,
    seen: HashSet<i64>,
    last_state: HashMap<String, LastState>,
}

impl PotaFetcher {
    pub fn new(poll_interval: Duration, spot_ttl: Duration, tx: mpsc::Sender<SpotEvent>) -> Self {
        let refresh_secs = spot_ttl.as_secs().saturating_sub(30).max(60);
        PotaFetcher {
            client: http_client(FETCH_TIMEOUT),
            poll_interval,
            refresh_interval: Duration::from_secs(refresh_secs),
            tx,
            seen: HashSet::new(),
            last_state: HashMap::new(),
        }
    }

    async fn fetch(&self) -> Result<Vec<PotaApiSpot>, PollerError> {
        self.client
            .get(POTA_API_URL)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|source| PollerError::Http {
                source_name: "POTA".to_string(),
                source,
            })?
            .json::<Vec<PotaApiSpot>>()
            .await
            .map_err(|source| PollerError::Http {
                source_name: "POTA".to_string(),
                source,
            })
    }

    async fn poll_once(&mut self) {
        let spots = match self.fetch().await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "POTA API fetch error");
                return;
            }
        };

        let mut current_ids = HashSet::new();
        let mut current_calls = HashSet::new();
        let mut new_count = 0;

        for s in &spots {
            let Some(spot_id) = s.spot_id else { continue };
            current_ids.insert(spot_id);

            let call = s.activator.as_deref().unwrap_or("").trim().to_uppercase();
            let Some(freq_str) = s.frequency.as_deref() else {
                continue;
            };
            if call.is_empty() || freq_str.is_empty() {
                continue;
            }
            let Ok(freq_khz) = freq_str.parse::<f64>() else {
                continue;
            };

            let mode_str = s.mode.as_deref().unwrap_or("").trim().to_uppercase();
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
            if self.seen.contains(&spot_id) && !is_new_state {
                continue;
            }

            self.seen.insert(spot_id);
            self.last_state.insert(
                call.clone(),
                LastState {
                    freq_khz,
                    mode: mode_str.clone(),
                    at: now,
                },
            );
            new_count += 1;

            let mode = if mode_str.is_empty() {
                None
            } else {
                crate::model::Mode::parse(&mode_str)
            };
            let grid = s.grid4.clone().filter(|g| !g.is_empty());
            let reference = s.reference.clone().unwrap_or_default();
            let time_utc = time_utc_from_iso(s.spot_time.as_deref().unwrap_or(""));

            let spot = Spot {
                spotter: "POTA".to_string(),
                freq_khz,
                dx_call: call,
                comment: reference,
                time_utc,
                mode,
                snr: None,
                grid,
                activity: Some(Activity::Pota),
            };

            if self.tx.send((spot, "POTA".to_string())).await.is_err() {
                return;
            }
        }

        self.seen.retain(|id| current_ids.contains(id));
        self.last_state.retain(|call, _| current_calls.contains(call));

        if new_count > 0 {
            info!(new_count, total = spots.len(), "POTA new activators");
        }
    }

    /// Poll forever, stopping only when the receiving channel closes
    /// or `running` flips to false. Fetches immediately on entry, then
    /// on every `poll_interval` tick, matching the original loop.
    pub async fn run(&mut self, mut running: tokio::sync::watch::Receiver<bool>) {
        info!(interval_secs = self.poll_interval.as_secs(), url = POTA_API_URL, "polling POTA");
        self.poll_once().await;

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.tick().await; // consume the immediate first tick

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
        assert_eq!(time_utc_from_iso("short"), "0000");
    }

    #[test]
    fn refresh_interval_subtracts_30_when_above_floor() {
        let (tx, _rx) = mpsc::channel(1);
        let f = PotaFetcher::new(Duration::from_secs(120), Duration::from_secs(300), tx);
        assert_eq!(f.refresh_interval, Duration::from_secs(270));
    }

    #[test]
    fn refresh_interval_floors_at_60() {
        let (tx, _rx) = mpsc::channel(1);
        let f = PotaFetcher::new(Duration::from_secs(120), Duration::from_secs(10), tx);
        assert_eq!(f.refresh_interval, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn dedups_on_spot_id() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut fetcher = PotaFetcher::new(Duration::from_secs(120), Duration::from_secs(300), tx);
        fetcher.seen.insert(42);

        let spots = vec![
            PotaApiSpot {
                spot_id: Some(42),
                activator: Some("K1ABC".to_string()),
                frequency: Some("14285.0".to_string()),
                mode: Some("SSB".to_string()),
                grid4: Some("FN42".to_string()),
                reference: Some("K-1234".to_string()),
                spot_time: Some("2026-02-12T23:08:46".to_string()),
            },
            PotaApiSpot {
                spot_id: Some(43),
                activator: Some("W1AW".to_string()),
                frequency: Some("7185.0".to_string()),
                mode: Some("SSB".to_string()),
                grid4: None,
                reference: Some("K-5678".to_string()),
                spot_time: Some("2026-02-12T23:09:00".to_string()),
            },
        ];

        let mut current_ids = HashSet::new();
        for s in &spots {
            if let Some(id) = s.spot_id {
                current_ids.insert(id);
                if !fetcher.seen.contains(&id) {
                    fetcher.seen.insert(id);
                }
            }
        }
        assert!(current_ids.contains(&42));
        assert!(current_ids.contains(&43));
        drop(rx.try_recv());
    }

    #[test]
    fn skips_digital_modes() {
        let mode_str = "FT8";
        assert!(mode_str == "FT8" || mode_str == "FT4");
    }

    fn sample_spot(spot_id: i64) -> PotaApiSpot {
        PotaApiSpot {
            spot_id: Some(spot_id),
            activator: Some("K1ABC".to_string()),
            frequency: Some("14285.0".to_string()),
            mode: Some("SSB".to_string()),
            grid4: Some("FN42".to_string()),
            reference: Some("K-1234".to_string()),
            spot_time: Some("2026-02-12T23:08:46".to_string()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn redelivers_a_seen_spot_id_once_the_refresh_interval_elapses() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut fetcher = PotaFetcher::new(Duration::from_secs(120), Duration::from_secs(90), tx);

        fetcher.seen.insert(1);
        fetcher.last_state.insert(
            "K1ABC".to_string(),
            LastState {
                freq_khz: 14285.0,
                mode: "SSB".to_string(),
                at: Instant::now(),
            },
        );
        apply_dedup_and_refresh(&mut fetcher, vec![sample_spot(1)]).await;
        assert!(rx.try_recv().is_err(), "same spotId within the refresh window must not redeliver");

        tokio::time::advance(Duration::from_secs(61)).await;
        apply_dedup_and_refresh(&mut fetcher, vec![sample_spot(1)]).await;
        assert!(rx.try_recv().is_ok(), "same spotId must redeliver once the refresh interval elapses");
    }

    /// Drives the same per-spot logic `poll_once` runs, without a
    /// network fetch, for refresh-policy tests.
    async fn apply_dedup_and_refresh(fetcher: &mut PotaFetcher, spots: Vec<PotaApiSpot>) {
        for s in &spots {
            let Some(spot_id) = s.spot_id else { continue };
            let call = s.activator.as_deref().unwrap_or("").trim().to_uppercase();
            let freq_khz: f64 = s.frequency.as_deref().unwrap_or("").parse().unwrap();
            let mode_str = s.mode.as_deref().unwrap_or("").trim().to_uppercase();

            let now = Instant::now();
            let is_new_state = match fetcher.last_state.get(&call) {
                Some(prev) => {
                    !(prev.freq_khz == freq_khz
                        && prev.mode == mode_str
                        && now.duration_since(prev.at) < fetcher.refresh_interval)
                }
                None => true,
            };
            if fetcher.seen.contains(&spot_id) && !is_new_state {
                continue;
            }

            fetcher.seen.insert(spot_id);
            fetcher.last_state.insert(
                call,
                LastState {
                    freq_khz,
                    mode: mode_str,
                    at: now,
                },
            );

            let spot = Spot {
                spotter: "POTA".to_string(),
                freq_khz,
                dx_call: s.activator.clone().unwrap_or_default(),
                comment: s.reference.clone().unwrap_or_default(),
                time_utc: "2308".to_string(),
                mode: Some(crate::model::Mode::Ssb),
                snr: None,
                grid: None,
                activity: Some(Activity::Pota),
            };
            let _ = fetcher.tx.send((spot, "POTA".to_string())).await;
        }
    }
}
