//! Virtual-instance registry + heartbeat loop (C9).
//!
//! The registry itself — an append-only `HashSet<Instance>` — lives
//! inside [`crate::cache::SpotCache`], since the arrival path needs to
//! mutate it under the same lock it uses for `live`/`stale` (spec
//! §4.8's "single logical lock"). This module is the periodic side:
//! a task that wakes up every `heartbeat_interval` seconds and emits a
//! Heartbeat for every instance registered so far.

use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use crate::cache::SpotCache;
use crate::wire;

/// Run the heartbeat loop until `running` flips to false. Every tick,
/// send a Heartbeat for each currently-registered `(band, mode)`
/// instance — the first-spot path in `SpotCache::on_spot` already
/// covers the "announce immediately on first sight" half of §4.9; this
/// covers the steady-state re-announce.
pub async fn run_heartbeat_loop(
    cache: &SpotCache,
    send: impl Fn(Vec<u8>) -> Result<(), tokio::sync::mpsc::error::SendError<Vec<u8>>>,
    interval: Duration,
    mut running: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // first tick fires immediately; skip it

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let instances = cache.active_instances().await;
                debug!(count = instances.len(), "heartbeat tick");
                for instance in instances {
                    let frame = wire::encode_heartbeat(&instance.client_id(), 3, env!("CARGO_PKG_VERSION"), "");
                    if send(frame).is_err() {
                        debug!("heartbeat send failed, UDP channel closed");
                        return;
                    }
                }
            }
            _ = running.changed() => {
                if !*running.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Mode, Spot};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn sample_spot() -> Spot {
        Spot {
            spotter: "W3LPL".to_string(),
            freq_khz: 14074.0,
            dx_call: "K1ABC".to_string(),
            comment: String::new(),
            time_utc: "1234".to_string(),
            mode: Some(Mode::Ft8),
            snr: Some(-10),
            grid: None,
            activity: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_loop_sends_one_per_instance_per_tick() {
        let (cache_tx, mut cache_rx) = mpsc::channel(16);
        let cache = SpotCache::new(cache_tx, "W1AW".to_string(), "FN31".to_string(), Duration::from_secs(600));
        let filters = crate::cache::SpotFilters {
            mode_filter: Default::default(),
            band_filter: Default::default(),
        };
        cache.on_spot(sample_spot(), "TEST".to_string(), &filters).await.unwrap();
        while cache_rx.try_recv().is_ok() {}

        let (tick_tx, mut tick_rx) = mpsc::channel(16);
        let sent_count = Arc::new(AtomicUsize::new(0));
        let sent_count2 = sent_count.clone();
        let send = move |frame: Vec<u8>| {
            sent_count2.fetch_add(1, Ordering::SeqCst);
            tick_tx.try_send(frame).ok();
            Ok(())
        };

        let (running_tx, running_rx) = watch::channel(true);
        let handle = tokio::spawn(async move {
            run_heartbeat_loop(&cache, send, Duration::from_secs(15), running_rx).await;
        });

        tokio::time::advance(Duration::from_secs(16)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sent_count.load(Ordering::SeqCst), 1);
        assert!(tick_rx.try_recv().is_ok());

        running_tx.send(false).ok();
        handle.await.ok();
    }
}
