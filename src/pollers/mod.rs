//! HTTP spot pollers (C4): periodic activation-program fetchers that
//! feed [`crate::model::Spot`] values into the same channel the
//! cluster ingest uses.
//!
//! Both [`pota::PotaFetcher`] and [`sota::SotaFetcher`] share the
//! shape of `original_source/pota.py` / `sota.py`: fetch on a fixed
//! interval, dedup against what was already delivered, prune state
//! for activators that drop out of the API response.

pub mod pota;
pub mod sota;

use std::time::Duration;

use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum PollerError {
    #[snafu(display("[{source_name}] HTTP request failed: {source}"))]
    Http {
        source_name: String,
        source: reqwest::Error,
    },

    #[snafu(display("[{source_name}] cache file I/O error: {source}"))]
    CacheIo {
        source_name: String,
        source: std::io::Error,
    },

    #[snafu(display("[{source_name}] cache file is not valid JSON: {source}"))]
    CacheJson {
        source_name: String,
        source: serde_json::Error,
    },
}

pub(crate) fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent(concat!("gtbridge-rs/", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .build()
        .expect("reqwest client with only a timeout and user-agent never fails to build")
}
