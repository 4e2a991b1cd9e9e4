//! Process orchestrator (A5): builds every component from a loaded
//! [`crate::config::BridgeConfig`] and runs them to completion,
//! fanning spots from ingest tasks into the shared [`SpotCache`], and
//! wiring the click-to-tune path from inbound Reply datagrams back to
//! the radio link.
//!
//! Grounded on `original_source/gtbridge.py`'s `GTBridge.run` /
//! `_cycle_loop` / `_heartbeat_loop` / `_stats_loop`, restated as a set
//! of cooperating `tokio::task`s joined on a shared shutdown signal.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::cache::{SpotCache, SpotFilters};
use crate::cluster::{ClusterClient, SpotEvent};
use crate::config::{BridgeConfig, SecretsFile};
use crate::grid_enrich::QrzClient;
use crate::instances;
use crate::model::Mode;
use crate::n1mm::N1mmListener;
use crate::pollers::{pota::PotaFetcher, sota::SotaFetcher};
use crate::radio::FlexRadioClient;
use crate::telnet::TelnetServer;
use crate::wire;

const OUTBOUND_CHANNEL_CAPACITY: usize = 256;
const SPOT_CHANNEL_CAPACITY: usize = 256;

/// Top-level bridge: owns every long-running task's shared state and
/// the shutdown signal they all select against.
pub struct Bridge {
    config: BridgeConfig,
    cache: Arc<SpotCache>,
    qrz: Option<Arc<QrzClient>>,
    radio: Option<Arc<FlexRadioClient>>,
    telnet: Option<Arc<TelnetServer>>,
}

impl Bridge {
    pub async fn build(config: BridgeConfig) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (udp_tx, udp_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);

        let telnet = if config.telnet_server {
            Some(Arc::new(TelnetServer::new(
                "0.0.0.0".to_string(),
                config.telnet_port,
                config.client_id.clone(),
            )))
        } else {
            None
        };

        let qrz = if let Some(path) = SecretsFile::resolve_path(&config) {
            match SecretsFile::load(&path) {
                Ok(secrets) => match secrets.decode_password() {
                    Ok(password) => match (secrets.qrz_username, password) {
                        (Some(user), Some(pass)) => {
                            let client = Arc::new(QrzClient::new(user, pass, "qrz_grid_cache.json".into()));
                            client.load_cache().await;
                            Some(client)
                        }
                        _ => {
                            warn!("secrets file present but missing qrz_username/qrz_password, grid enrichment disabled");
                            None
                        }
                    },
                    Err(e) => {
                        warn!(error = %e, "could not decode QRZ password, grid enrichment disabled");
                        None
                    }
                },
                Err(e) => {
                    warn!(error = %e, "could not load secrets file, grid enrichment disabled");
                    None
                }
            }
        } else {
            None
        };

        let mut cache = SpotCache::new(
            udp_tx,
            config.callsign.clone(),
            config.grid.clone(),
            Duration::from_secs(config.spot_ttl),
        )
        .with_grace_ttl(Duration::from_secs(config.grace_ttl))
        .with_region(config.region);
        if let Some(qrz) = &qrz {
            cache = cache.with_qrz(qrz.clone());
        }
        if let Some(telnet) = &telnet {
            cache = cache.with_telnet(telnet.clone());
        }
        let cache = Arc::new(cache);

        let radio = if config.flex_radio {
            Some(Arc::new(FlexRadioClient::new(config.flex_host.clone(), config.flex_port)))
        } else {
            None
        };

        (
            Bridge {
                config,
                cache,
                qrz,
                radio,
                telnet,
            },
            udp_rx,
        )
    }

    /// Run every component until `running` flips to false, then return
    /// once all tasks have unwound.
    pub async fn run(self, udp_rx: mpsc::Receiver<Vec<u8>>, running: watch::Receiver<bool>) -> std::io::Result<()> {
        let Bridge {
            config,
            cache,
            qrz,
            radio,
            telnet,
        } = self;

        let udp_socket = Arc::new(UdpSocket::bind(("0.0.0.0", 0)).await?);
        udp_socket.connect((config.udp_host.as_str(), config.udp_port)).await?;
        info!(host = %config.udp_host, port = config.udp_port, "sending UDP datagrams to roster consumer");

        let mut handles = Vec::new();

        handles.push(tokio::spawn(udp_sender_loop(udp_socket.clone(), udp_rx)));

        handles.push(tokio::spawn(reply_listener_loop(
            udp_socket.clone(),
            cache.clone(),
            radio.clone(),
            config.flex_slice,
            running.clone(),
        )));

        let (spot_tx, mut spot_rx) = mpsc::channel::<SpotEvent>(SPOT_CHANNEL_CAPACITY);

        for cluster_cfg in &config.clusters {
            let client = ClusterClient::new(
                cluster_cfg.host.clone(),
                cluster_cfg.port,
                config.callsign.clone(),
                Some(cluster_cfg.name.clone()),
                cluster_cfg.login_commands.clone(),
                spot_tx.clone(),
            );
            let running = running.clone();
            handles.push(tokio::spawn(async move {
                client.run(&running).await;
            }));
        }

        if config.pota_spots {
            let mut fetcher = PotaFetcher::new(
                Duration::from_secs(config.pota_poll_interval),
                Duration::from_secs(config.spot_ttl),
                spot_tx.clone(),
            );
            let running = running.clone();
            handles.push(tokio::spawn(async move {
                fetcher.run(running).await;
            }));
        }

        if config.sota_spots {
            let mut fetcher = SotaFetcher::new(
                Duration::from_secs(config.sota_poll_interval),
                Duration::from_secs(config.spot_ttl),
                spot_tx.clone(),
                "sota_summit_cache.json".into(),
            );
            let running = running.clone();
            handles.push(tokio::spawn(async move {
                fetcher.run(running).await;
            }));
        }
        drop(spot_tx);

        if let Some(radio) = &radio {
            let radio = radio.clone();
            let running = running.clone();
            handles.push(tokio::spawn(async move {
                radio.run(&running).await;
            }));
        }

        if let Some(telnet) = &telnet {
            let telnet = telnet.clone();
            let running = running.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = telnet.run(running).await {
                    warn!(error = %e, "telnet server exited");
                }
            }));
        }

        if config.n1mm_listen {
            match N1mmListener::bind(config.n1mm_port).await {
                Ok(listener) => {
                    let cache = cache.clone();
                    let running = running.clone();
                    let client_id = config.client_id.clone();
                    handles.push(tokio::spawn(async move {
                        listener
                            .run(&running, |contact| {
                                tokio::spawn(handle_contact(cache.clone(), client_id.clone(), contact));
                            })
                            .await;
                    }));
                }
                Err(e) => warn!(error = %e, "could not start N1MM listener"),
            }
        }

        {
            let cache = cache.clone();
            let filters = self_filters(&config);
            let running = running.clone();
            handles.push(tokio::spawn(async move {
                while let Some((spot, cluster_name)) = spot_rx.recv().await {
                    if let Some(qrz) = &qrz {
                        qrz.update_cache(&spot.dx_call, spot.grid.as_deref().unwrap_or("")).await;
                    }
                    if let Err(e) = cache.on_spot(spot, cluster_name, &filters).await {
                        warn!(error = %e, "failed to deliver spot's wire frames");
                    }
                    if !*running.borrow() {
                        break;
                    }
                }
            }));
        }

        {
            let cache = cache.clone();
            let running = running.clone();
            let cycle_interval = Duration::from_secs(config.cycle_interval);
            handles.push(tokio::spawn(async move {
                run_flush_loop(&cache, cycle_interval, running).await;
            }));
        }

        {
            let cache = cache.clone();
            let socket = udp_socket.clone();
            let running = running.clone();
            let heartbeat_interval = Duration::from_secs(config.heartbeat_interval);
            handles.push(tokio::spawn(async move {
                let send = |frame: Vec<u8>| {
                    let socket = socket.clone();
                    tokio::spawn(async move {
                        let _ = socket.send(&frame).await;
                    });
                    Ok(())
                };
                instances::run_heartbeat_loop(&cache, send, heartbeat_interval, running).await;
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }
}

fn self_filters(config: &BridgeConfig) -> SpotFilters {
    SpotFilters {
        mode_filter: config.mode_filter.iter().filter_map(|m| Mode::parse(m)).collect(),
        band_filter: config.band_filter.iter().cloned().collect(),
    }
}

async fn udp_sender_loop(socket: Arc<UdpSocket>, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = socket.send(&frame).await {
            warn!(error = %e, "UDP send failed");
        }
    }
}

async fn reply_listener_loop(
    socket: Arc<UdpSocket>,
    cache: Arc<SpotCache>,
    radio: Option<Arc<FlexRadioClient>>,
    dedicated_slice: Option<u32>,
    mut running: watch::Receiver<bool>,
) {
    let mut buf = [0u8; 65536];
    loop {
        tokio::select! {
            result = socket.recv(&mut buf) => {
                match result {
                    Ok(n) => handle_reply(&buf[..n], &cache, radio.as_deref(), dedicated_slice).await,
                    Err(e) => warn!(error = %e, "UDP recv error"),
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

/// Click-to-tune path (§4.11): decode a Reply, extract the callsign
/// (skipping an activity-tag first token), split `client_id` on its
/// final `-` into `(band, mode)`, resolve against the cache, and tune.
async fn handle_reply(data: &[u8], cache: &SpotCache, radio: Option<&FlexRadioClient>, dedicated_slice: Option<u32>) {
    let Ok(reply) = wire::decode_reply(data) else {
        return;
    };
    let Some(radio) = radio else { return };
    let Some(client_id) = &reply.client_id else { return };
    let Some(message) = &reply.message else { return };

    let mut tokens = message.split_whitespace();
    let Some(first) = tokens.next() else { return };
    let dx_call = if first == "POTA" || first == "SOTA" {
        match tokens.next() {
            Some(call) => call,
            None => return,
        }
    } else {
        first
    };

    let Some(dash) = client_id.rfind('-') else { return };
    let band = &client_id[..dash];
    let mode = &client_id[dash + 1..];

    let Some(spot) = cache.lookup_for_tune(band, dx_call).await else {
        return;
    };
    let freq_mhz = spot.freq_khz / 1000.0;

    if let Some(slice_num) = dedicated_slice {
        let _ = radio.tune_to_spot(slice_num, freq_mhz, mode).await;
    } else if let Some(slice_num) = radio.find_slice(band, mode).await {
        let _ = radio.tune(slice_num, freq_mhz).await;
    }
}

/// One completed N1MM contact: register its `(band, mode)` instance if
/// new, and emit a QSO-Logged record. Unknown band is dropped with a
/// warning (§4.7).
async fn handle_contact(cache: Arc<SpotCache>, client_id: String, contact: crate::n1mm::N1mmContactInfo) {
    let Some(freq_hz) = contact.rx_freq_hz else {
        return;
    };
    let freq_khz = freq_hz as f64 / 1000.0;
    let Some(band) = crate::band::freq_to_band(freq_khz) else {
        warn!(call = %contact.call, freq_khz, "N1MM contact on unknown band, dropped");
        return;
    };
    let mode = contact.mode.as_deref().and_then(Mode::parse);
    cache
        .ensure_instance(crate::model::Instance {
            band: band.to_string(),
            mode,
        })
        .await;

    let time_on = wire::DateTime::now_utc();
    let frame = wire::encode_qso_logged(
        &client_id,
        &wire::QsoLoggedFields {
            date_time_off: time_on,
            dx_call: Some(&contact.call),
            dx_grid: contact.gridsquare.as_deref(),
            freq_hz,
            mode: contact.mode.as_deref(),
            report_sent: contact.snt.as_deref(),
            report_rcvd: contact.rcv.as_deref(),
            tx_power: None,
            comments: None,
            name: None,
            date_time_on: time_on,
            operator_call: contact.mycall.as_deref(),
            my_call: contact.mycall.as_deref(),
            my_grid: None,
            exchange_sent: contact.sntnr.as_deref(),
            exchange_rcvd: contact.rcvnr.as_deref(),
            adif_prop_mode: None,
        },
    );
    if let Err(e) = cache.send_raw(frame).await {
        warn!(error = %e, "failed to deliver QSO-Logged frame");
    }
}

async fn run_flush_loop(cache: &SpotCache, interval: Duration, mut running: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = cache.flush_cycle().await {
                    warn!(error = %e, "flush cycle failed to deliver frames");
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
