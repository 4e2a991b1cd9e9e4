//! Spot cache + flush engine (C8): the heart of the bridge. A single
//! mutex guards three maps — `live`, `stale`, and `instances` — so the
//! arrival path, the flush cycle, and the stale-purge always see a
//! consistent view.
//!
//! The arrival path, TTL/grace expiry, and flush-cycle grouping follow
//! spec §4.8 directly (no `original_source/` analog keeps a `stale`
//! map or a grace period — that's this crate's addition over the
//! original bridge). The re-send message text and dial-frequency
//! table are grounded on `original_source/gtbridge.py`'s
//! `GTBridge._on_spot` / `_flush_cycle`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use snafu::Snafu;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::band;
use crate::grid_enrich::QrzClient;
use crate::model::{CacheEntry, Instance, Mode, Spot};
use crate::telnet::TelnetServer;
use crate::wire;

#[derive(Debug, Snafu)]
pub enum CacheError {
    #[snafu(display("failed to deliver a frame to the UDP sender: channel closed"))]
    ChannelClosed,
}

type Result<T> = std::result::Result<T, CacheError>;

/// Default dial frequency, in Hz, used for a band's Status records
/// when no spot on that band gives a better number. Recovered from
/// `GTBridge.BAND_DIAL_FREQ`.
fn default_dial_freq_hz(band: &str) -> Option<u64> {
    match band {
        "160m" => Some(1_840_000),
        "80m" => Some(3_573_000),
        "60m" => Some(5_357_000),
        "40m" => Some(7_074_000),
        "30m" => Some(10_136_000),
        "20m" => Some(14_074_000),
        "17m" => Some(18_100_000),
        "15m" => Some(21_074_000),
        "12m" => Some(24_915_000),
        "10m" => Some(28_074_000),
        "6m" => Some(50_313_000),
        "2m" => Some(144_174_000),
        _ => None,
    }
}

/// `"CQ [<ACTIVITY>] <dx_call> [<grid>]"`, per the reconciled message
/// rule: activity (if any) prefixes, grid (if known) suffixes, the
/// dx_call is always present and never replaced by a summit/park
/// reference.
fn message_text(spot: &Spot) -> String {
    let mut parts = vec!["CQ".to_string()];
    if let Some(activity) = spot.activity {
        parts.push(activity.as_str().to_string());
    }
    parts.push(spot.dx_call.clone());
    if let Some(grid) = &spot.grid {
        parts.push(grid.clone());
    }
    parts.join(" ")
}

struct CacheState {
    live: HashMap<(String, String), CacheEntry>,
    stale: HashMap<(String, String), CacheEntry>,
    instances: HashSet<Instance>,
}

/// Filters applied on arrival, mirroring `GTBridge.mode_filter` /
/// `band_filter`.
pub struct SpotFilters {
    pub mode_filter: HashSet<Mode>,
    pub band_filter: HashSet<String>,
}

impl SpotFilters {
    pub fn passes(&self, mode: Option<Mode>, band: &str) -> bool {
        if !self.mode_filter.is_empty() {
            match mode {
                Some(m) if self.mode_filter.contains(&m) => {}
                _ => return false,
            }
        }
        if !self.band_filter.is_empty() && !self.band_filter.contains(band) {
            return false;
        }
        true
    }
}

pub struct SpotCache {
    state: Mutex<CacheState>,
    udp_tx: mpsc::Sender<Vec<u8>>,
    callsign: String,
    grid: String,
    spot_ttl: Duration,
    grace_ttl: Duration,
    qrz: Option<Arc<QrzClient>>,
    telnet: Option<Arc<TelnetServer>>,
    region: u8,
}

impl SpotCache {
    pub fn new(udp_tx: mpsc::Sender<Vec<u8>>, callsign: String, grid: String, spot_ttl: Duration) -> Self {
        SpotCache {
            state: Mutex::new(CacheState {
                live: HashMap::new(),
                stale: HashMap::new(),
                instances: HashSet::new(),
            }),
            udp_tx,
            callsign,
            grid,
            spot_ttl,
            grace_ttl: Duration::from_secs(300),
            qrz: None,
            telnet: None,
            region: 2,
        }
    }

    pub fn with_grace_ttl(mut self, grace_ttl: Duration) -> Self {
        self.grace_ttl = grace_ttl;
        self
    }

    /// Set the IARU region used to resolve `infer_mode`'s CW/SSB/RTTY
    /// sub-band table for spots with no mode of their own.
    pub fn with_region(mut self, region: u8) -> Self {
        self.region = region;
        self
    }

    pub fn with_qrz(mut self, qrz: Arc<QrzClient>) -> Self {
        self.qrz = Some(qrz);
        self
    }

    pub fn with_telnet(mut self, telnet: Arc<TelnetServer>) -> Self {
        self.telnet = Some(telnet);
        self
    }

    async fn send(&self, frame: Vec<u8>) -> Result<()> {
        self.udp_tx.send(frame).await.map_err(|_| CacheError::ChannelClosed)
    }

    /// Deliver a pre-encoded frame that did not originate from a spot
    /// (the N1MM QSO-Logged path). Shares the same outbound channel as
    /// every Heartbeat/Status/Decode record.
    pub async fn send_raw(&self, frame: Vec<u8>) -> Result<()> {
        self.send(frame).await
    }

    /// Handle one incoming spot: infer mode if missing, apply filters,
    /// enrich the grid via C5 if missing, upsert the cache (inheriting
    /// a sticky activity tag), broadcast to telnet subscribers, and
    /// fire the first heartbeat+status for a never-before-seen
    /// `(band, mode)` instance.
    pub async fn on_spot(&self, mut spot: Spot, cluster_name: String, filters: &SpotFilters) -> Result<()> {
        if spot.mode.is_none() {
            spot.mode = band::infer_mode(spot.freq_khz, self.region);
        }

        let Some(band_name) = band::freq_to_band(spot.freq_khz) else {
            debug!(freq_khz = spot.freq_khz, "skipping spot on unknown band");
            return Ok(());
        };

        if !filters.passes(spot.mode, band_name) {
            info!(dx_call = %spot.dx_call, freq_khz = spot.freq_khz, mode = ?spot.mode, "filtered");
            return Ok(());
        }

        if spot.grid.is_none() {
            if let Some(qrz) = &self.qrz {
                spot.grid = qrz.lookup_grid(&spot.dx_call).await;
            }
        }

        let now = Instant::now();
        let key = (band_name.to_string(), spot.dx_call.clone());
        let instance = Instance {
            band: band_name.to_string(),
            mode: spot.mode,
        };

        let is_new_instance = {
            let mut state = self.state.lock().await;

            if let Some(existing) = state.live.get(&key) {
                if spot.activity.is_none() {
                    spot.activity = existing.spot.activity;
                }
                info!(
                    cluster = %cluster_name, dx_call = %spot.dx_call, freq_khz = spot.freq_khz,
                    mode = ?spot.mode, band = band_name, spotter = %spot.spotter, "updated"
                );
                let first_seen = existing.first_seen;
                state.live.insert(
                    key,
                    CacheEntry {
                        spot: spot.clone(),
                        cluster_name: cluster_name.clone(),
                        first_seen,
                        last_updated: now,
                        expired_at: None,
                    },
                );
            } else {
                info!(
                    cluster = %cluster_name, dx_call = %spot.dx_call, freq_khz = spot.freq_khz,
                    mode = ?spot.mode, band = band_name, spotter = %spot.spotter, "new"
                );
                state.live.insert(
                    key,
                    CacheEntry {
                        spot: spot.clone(),
                        cluster_name: cluster_name.clone(),
                        first_seen: now,
                        last_updated: now,
                        expired_at: None,
                    },
                );
            }
            state.instances.insert(instance.clone())
        };

        if let Some(telnet) = &self.telnet {
            telnet.broadcast_spot(spot.clone());
        }

        if is_new_instance {
            let cid = instance.client_id();
            let dial = default_dial_freq_hz(&instance.band).unwrap_or_else(|| spot.freq_hz());
            self.send(wire::encode_heartbeat(&cid, 3, env!("CARGO_PKG_VERSION"), "")).await?;
            self.send(wire::encode_status(
                &cid,
                &wire::StatusFields {
                    dial_freq: dial,
                    mode: spot.mode.map(|m| m.as_str()),
                    de_call: Some(&self.callsign),
                    de_grid: Some(&self.grid),
                    decoding: true,
                    ..Default::default()
                },
            ))
            .await?;
            info!(client_id = %cid, dial_freq_hz = dial, "new instance");
        }

        Ok(())
    }

    /// Expire stale-from-live entries into `stale` with `expired_at`
    /// set, purge `stale` entries past the grace period, re-send every
    /// surviving live spot grouped by `(band, mode_or_SSB)`. Returns
    /// the number of Decode records sent.
    pub async fn flush_cycle(&self) -> Result<usize> {
        let now = Instant::now();
        let mut by_instance: HashMap<Instance, Vec<Spot>> = HashMap::new();
        let mut expired_count = 0;
        let mut purged_count = 0;

        {
            let mut state = self.state.lock().await;

            let live_keys: Vec<(String, String)> = state.live.keys().cloned().collect();
            for key in live_keys {
                let age_exceeded = state
                    .live
                    .get(&key)
                    .map(|e| now.duration_since(e.last_updated) > self.spot_ttl)
                    .unwrap_or(false);
                if age_exceeded {
                    if let Some(mut entry) = state.live.remove(&key) {
                        entry.expired_at = Some(now);
                        state.stale.insert(key, entry);
                        expired_count += 1;
                    }
                }
            }

            let grace_ttl = self.grace_ttl;
            state.stale.retain(|_key, entry| {
                let keep = entry
                    .expired_at
                    .map(|at| now.duration_since(at) <= grace_ttl)
                    .unwrap_or(true);
                if !keep {
                    purged_count += 1;
                }
                keep
            });

            for (key, entry) in state.live.iter() {
                let inst = Instance {
                    band: key.0.clone(),
                    mode: entry.spot.mode,
                };
                by_instance.entry(inst).or_default().push(entry.spot.clone());
            }
        }

        if expired_count > 0 || purged_count > 0 {
            debug!(expired_count, purged_count, "moved expired spots to stale / purged stale entries");
        }

        let time_ms = wire::current_time_ms();
        let mut total_sent = 0;

        for (instance, spots) in &by_instance {
            let cid = instance.client_id();
            let dial = default_dial_freq_hz(&instance.band).unwrap_or_else(|| spots[0].freq_hz());

            self.send(wire::encode_status(
                &cid,
                &wire::StatusFields {
                    dial_freq: dial,
                    mode: instance.mode.map(|m| m.as_str()),
                    de_call: Some(&self.callsign),
                    de_grid: Some(&self.grid),
                    decoding: true,
                    ..Default::default()
                },
            ))
            .await?;

            for spot in spots {
                let msg = message_text(spot);
                let snr = spot.snr.unwrap_or(-10) as i32;
                let mode_char = spot.mode.map(|m| m.decode_char()).unwrap_or('~');
                let delta_freq = spot.freq_hz() as u32;

                self.send(wire::encode_decode(
                    &cid,
                    &wire::DecodeFields {
                        is_new: true,
                        time_ms,
                        snr,
                        delta_time: 0.0,
                        delta_freq,
                        mode: &mode_char.to_string(),
                        message: &msg,
                        low_confidence: false,
                        off_air: false,
                    },
                ))
                .await?;
                total_sent += 1;
            }
        }

        if total_sent > 0 {
            info!(
                total_sent,
                instances = by_instance.len(),
                expired_count,
                purged_count,
                "flush cycle"
            );
        }

        Ok(total_sent)
    }

    /// Look up a spot for click-to-tune (§4.11): live first, then
    /// stale (so a click still resolves during the grace window).
    pub async fn lookup_for_tune(&self, band: &str, dx_call: &str) -> Option<Spot> {
        let key = (band.to_string(), dx_call.to_string());
        let state = self.state.lock().await;
        state
            .live
            .get(&key)
            .or_else(|| state.stale.get(&key))
            .map(|e| e.spot.clone())
    }

    /// Current active instances, for the heartbeat loop (C9).
    pub async fn active_instances(&self) -> Vec<Instance> {
        self.state.lock().await.instances.iter().cloned().collect()
    }

    /// Register an instance discovered outside the spot-arrival path
    /// (the N1MM listener, per spec §4.7: "instances is mutated only
    /// by the arrival path and C7").
    pub async fn ensure_instance(&self, instance: Instance) -> bool {
        self.state.lock().await.instances.insert(instance)
    }

    pub async fn live_count(&self) -> usize {
        self.state.lock().await.live.len()
    }

    pub async fn stale_count(&self) -> usize {
        self.state.lock().await.stale.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spot(dx_call: &str, freq_khz: f64, mode: Option<Mode>) -> Spot {
        Spot {
            spotter: "W3LPL".to_string(),
            freq_khz,
            dx_call: dx_call.to_string(),
            comment: String::new(),
            time_utc: "0000".to_string(),
            mode,
            snr: Some(-10),
            grid: None,
            activity: None,
        }
    }

    #[test]
    fn message_text_plain_call() {
        let spot = sample_spot("K1ABC", 14074.0, Some(Mode::Ft8));
        assert_eq!(message_text(&spot), "CQ K1ABC");
    }

    #[test]
    fn message_text_with_grid() {
        let mut spot = sample_spot("K1ABC", 14074.0, Some(Mode::Ft8));
        spot.grid = Some("FN42".to_string());
        assert_eq!(message_text(&spot), "CQ K1ABC FN42");
    }

    #[test]
    fn message_text_with_activity_and_grid() {
        let mut spot = sample_spot("K1ABC", 14074.0, Some(Mode::Ft8));
        spot.grid = Some("FN42".to_string());
        spot.activity = Some(crate::model::Activity::Pota);
        assert_eq!(message_text(&spot), "CQ POTA K1ABC FN42");
    }

    #[tokio::test]
    async fn new_spot_fires_heartbeat_and_status_once() {
        let (tx, mut rx) = mpsc::channel(16);
        let cache = SpotCache::new(tx, "W1AW".to_string(), "FN31".to_string(), Duration::from_secs(600));
        let filters = SpotFilters {
            mode_filter: HashSet::new(),
            band_filter: HashSet::new(),
        };

        cache
            .on_spot(sample_spot("K1ABC", 14074.0, Some(Mode::Ft8)), "TEST".to_string(), &filters)
            .await
            .unwrap();

        let hb = rx.recv().await.unwrap();
        let (ty, _, _) = wire::decode_header(&hb).unwrap();
        assert_eq!(ty, wire::msg_type::HEARTBEAT);

        let st = rx.recv().await.unwrap();
        let (ty, _, _) = wire::decode_header(&st).unwrap();
        assert_eq!(ty, wire::msg_type::STATUS);

        cache
            .on_spot(sample_spot("K1XYZ", 14074.0, Some(Mode::Ft8)), "TEST".to_string(), &filters)
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn flush_cycle_sends_status_and_decode_per_instance() {
        let (tx, mut rx) = mpsc::channel(16);
        let cache = SpotCache::new(tx, "W1AW".to_string(), "FN31".to_string(), Duration::from_secs(600));
        let filters = SpotFilters {
            mode_filter: HashSet::new(),
            band_filter: HashSet::new(),
        };
        cache
            .on_spot(sample_spot("K1ABC", 14074.0, Some(Mode::Ft8)), "TEST".to_string(), &filters)
            .await
            .unwrap();
        while rx.try_recv().is_ok() {}

        let sent = cache.flush_cycle().await.unwrap();
        assert_eq!(sent, 1);
        let st = rx.recv().await.unwrap();
        assert_eq!(wire::decode_header(&st).unwrap().0, wire::msg_type::STATUS);
        let dc = rx.recv().await.unwrap();
        assert_eq!(wire::decode_header(&dc).unwrap().0, wire::msg_type::DECODE);
    }

    #[tokio::test]
    async fn unknown_band_is_dropped() {
        let (tx, _rx) = mpsc::channel(16);
        let cache = SpotCache::new(tx, "W1AW".to_string(), "FN31".to_string(), Duration::from_secs(600));
        let filters = SpotFilters {
            mode_filter: HashSet::new(),
            band_filter: HashSet::new(),
        };
        cache
            .on_spot(sample_spot("K1ABC", 12000.0, None), "TEST".to_string(), &filters)
            .await
            .unwrap();
        assert_eq!(cache.live_count().await, 0);
    }

    #[tokio::test]
    async fn expired_spot_moves_to_stale_and_is_still_tunable() {
        let (tx, mut rx) = mpsc::channel(16);
        let cache = SpotCache::new(tx, "W1AW".to_string(), "FN31".to_string(), Duration::from_millis(1));
        let filters = SpotFilters {
            mode_filter: HashSet::new(),
            band_filter: HashSet::new(),
        };
        cache
            .on_spot(sample_spot("K1ABC", 14074.0, Some(Mode::Ft8)), "TEST".to_string(), &filters)
            .await
            .unwrap();
        while rx.try_recv().is_ok() {}

        tokio::time::sleep(Duration::from_millis(5)).await;
        let sent = cache.flush_cycle().await.unwrap();
        assert_eq!(sent, 0);
        assert_eq!(cache.live_count().await, 0);
        assert_eq!(cache.stale_count().await, 1);
        assert!(cache.lookup_for_tune("20m", "K1ABC").await.is_some());
    }

    #[tokio::test]
    async fn sticky_activity_survives_an_update_without_one() {
        let (tx, _rx) = mpsc::channel(16);
        let cache = SpotCache::new(tx, "W1AW".to_string(), "FN31".to_string(), Duration::from_secs(600));
        let filters = SpotFilters {
            mode_filter: HashSet::new(),
            band_filter: HashSet::new(),
        };
        let mut first = sample_spot("K1ABC", 14074.0, Some(Mode::Ft8));
        first.activity = Some(crate::model::Activity::Pota);
        cache.on_spot(first, "POTA".to_string(), &filters).await.unwrap();

        let second = sample_spot("K1ABC", 14074.0, Some(Mode::Ft8));
        cache.on_spot(second, "CLUSTER".to_string(), &filters).await.unwrap();

        let spot = cache.lookup_for_tune("20m", "K1ABC").await.unwrap();
        assert_eq!(spot.activity, Some(crate::model::Activity::Pota));
    }
}
