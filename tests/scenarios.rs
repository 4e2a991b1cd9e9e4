//! End-to-end scenarios spanning more than one module, composed from
//! only the crate's public API — the kind of test that would catch a
//! wiring mistake a pure unit test inside one module can't.

use std::time::Duration;

use gtbridge::cache::{SpotCache, SpotFilters};
use gtbridge::cluster::parse_spot_line;
use gtbridge::model::{Activity, Mode};
use gtbridge::wire;
use tokio::sync::mpsc;

fn empty_filters() -> SpotFilters {
    SpotFilters {
        mode_filter: Default::default(),
        band_filter: Default::default(),
    }
}

/// S1 from the testable-properties list: a standard `DX de` line with
/// an SNR and a grid in its comment parses into every expected field.
#[test]
fn cluster_line_parses_fully() {
    let line = "DX de W3LPL-#:  14074.0  JA1ABC       FT8 -15dB FN20       1234Z";
    let spot = parse_spot_line(line).expect("line should parse");
    assert_eq!(spot.spotter, "W3LPL-#");
    assert_eq!(spot.freq_khz, 14074.0);
    assert_eq!(spot.dx_call, "JA1ABC");
    assert_eq!(spot.comment, "FT8 -15dB FN20");
    assert_eq!(spot.time_utc, "1234");
    assert_eq!(spot.mode, Some(Mode::Ft8));
    assert_eq!(spot.snr, Some(-15));
    assert_eq!(spot.grid.as_deref(), Some("FN20"));
}

/// S6: a Reply datagram's message and client_id resolve to the right
/// cache key and requested mode, composed from the public wire decoder
/// and the public cache lookup — the same steps the click-to-tune path
/// performs internally.
#[tokio::test]
async fn reply_routes_to_the_right_cache_entry() {
    let (tx, _rx) = mpsc::channel(16);
    let cache = SpotCache::new(tx, "W1AW".to_string(), "FN31".to_string(), Duration::from_secs(600));

    let mut spot = gtbridge::model::Spot {
        spotter: "K3LR".to_string(),
        freq_khz: 7030.0,
        dx_call: "K1ABC".to_string(),
        comment: "POTA K-1234".to_string(),
        time_utc: "0000".to_string(),
        mode: Some(Mode::Cw),
        snr: None,
        grid: Some("FN42".to_string()),
        activity: Some(Activity::Pota),
    };
    spot.freq_khz = 7030.0; // 40m

    cache
        .on_spot(spot, "TEST".to_string(), &empty_filters())
        .await
        .unwrap();

    let mut w = Vec::new();
    w.extend_from_slice(&wire::encode_heartbeat("40m-CW", 3, "1.0", ""));
    let header_only_client_id = wire::decode_header(&w).unwrap().1;
    assert_eq!(header_only_client_id.as_deref(), Some("40m-CW"));

    let message = "CQ POTA K1ABC FN42";
    let mut tokens = message.split_whitespace();
    let first = tokens.next().unwrap();
    let dx_call = if first == "POTA" || first == "SOTA" {
        tokens.next().unwrap()
    } else {
        first
    };
    assert_eq!(dx_call, "K1ABC");

    let client_id = "40m-CW";
    let dash = client_id.rfind('-').unwrap();
    let band = &client_id[..dash];
    let mode = &client_id[dash + 1..];
    assert_eq!(band, "40m");
    assert_eq!(mode, "CW");

    let resolved = cache.lookup_for_tune(band, dx_call).await;
    assert!(resolved.is_some());
    assert_eq!(resolved.unwrap().dx_call, "K1ABC");
}

/// S3 + S4 at the cache's public boundary: sticky activity survives an
/// update that lacks one, and an expired entry is still resolvable
/// until the grace period elapses.
#[tokio::test]
async fn sticky_activity_and_grace_window_hold_at_the_public_boundary() {
    let (tx, _rx) = mpsc::channel(16);
    let cache = SpotCache::new(tx, "W1AW".to_string(), "FN31".to_string(), Duration::from_millis(20))
        .with_grace_ttl(Duration::from_millis(200));

    let mut first = gtbridge::model::Spot {
        spotter: "W3LPL".to_string(),
        freq_khz: 14074.0,
        dx_call: "K1ABC".to_string(),
        comment: String::new(),
        time_utc: "0000".to_string(),
        mode: Some(Mode::Ft8),
        snr: Some(-10),
        grid: None,
        activity: Some(Activity::Pota),
    };
    cache.on_spot(first.clone(), "A".to_string(), &empty_filters()).await.unwrap();

    first.activity = None;
    cache.on_spot(first, "B".to_string(), &empty_filters()).await.unwrap();

    let live = cache.lookup_for_tune("20m", "K1ABC").await.unwrap();
    assert_eq!(live.activity, Some(Activity::Pota));

    tokio::time::sleep(Duration::from_millis(30)).await;
    cache.flush_cycle().await.unwrap();
    assert_eq!(cache.live_count().await, 0);
    assert_eq!(cache.stale_count().await, 1);
    assert!(cache.lookup_for_tune("20m", "K1ABC").await.is_some());

    tokio::time::sleep(Duration::from_millis(250)).await;
    cache.flush_cycle().await.unwrap();
    assert_eq!(cache.stale_count().await, 0);
    assert!(cache.lookup_for_tune("20m", "K1ABC").await.is_none());
}

/// S2: the band classifier's mode-guess fallback lands on FT8/FT4
/// anywhere inside the documented `[D, D+3.0)` digital calling window
/// (40 m FT4 is narrower, `[D, D+2.5)`, matching the published
/// 7047.5-7050.0 kHz calling channel), and falls through to the
/// region's CW sub-band outside it.
#[test]
fn mode_guess_lands_on_digital_modes_near_dial_frequencies() {
    for &d in gtbridge::band::FT8_DIAL_FREQ_KHZ {
        assert_eq!(gtbridge::band::infer_mode(d + 0.05, 2), Some(Mode::Ft8));
    }
    for &d in gtbridge::band::FT4_DIAL_FREQ_KHZ {
        assert_eq!(gtbridge::band::infer_mode(d + 0.05, 2), Some(Mode::Ft4));
    }
    // near the top of the FT8 20 m window, still well clear of the FT4 20 m window (14080-14083)
    assert_eq!(gtbridge::band::infer_mode(14074.0 + 2.9, 2), Some(Mode::Ft8));

    // 7050.0 kHz sits right at the edge of the narrower 40 m FT4 window and
    // resolves to general CW, not FT4.
    assert_eq!(gtbridge::band::infer_mode(7050.0, 2), Some(gtbridge::model::Mode::Cw));
}
