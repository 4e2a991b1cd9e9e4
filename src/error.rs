//! Crate-wide error taxonomy.
//!
//! Each component gets its own `snafu` enum so call sites can match on
//! the failure that's actually relevant to them; [`BridgeError`] folds
//! them all together for the handful of places (mainly `main`) that
//! need one `Result` type to bubble up to.

use snafu::Snafu;

use crate::{cache, cluster, config, n1mm, radio, wire};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum BridgeError {
    #[snafu(display("configuration error"))]
    Config { source: config::ConfigError },

    #[snafu(display("cluster ingest error"))]
    Cluster { source: cluster::ClusterError },

    #[snafu(display("wire codec error"))]
    Wire { source: wire::WireError },

    #[snafu(display("radio control link error"))]
    Radio { source: radio::RadioError },

    #[snafu(display("n1mm listener error"))]
    N1mm { source: n1mm::N1mmError },

    #[snafu(display("spot cache error"))]
    Cache { source: cache::CacheError },

    #[snafu(display("fatal startup error: {reason}"))]
    Fatal { reason: String },
}

impl From<config::ConfigError> for BridgeError {
    fn from(source: config::ConfigError) -> Self {
        BridgeError::Config { source }
    }
}

impl From<cluster::ClusterError> for BridgeError {
    fn from(source: cluster::ClusterError) -> Self {
        BridgeError::Cluster { source }
    }
}

impl From<wire::WireError> for BridgeError {
    fn from(source: wire::WireError) -> Self {
        BridgeError::Wire { source }
    }
}

impl From<radio::RadioError> for BridgeError {
    fn from(source: radio::RadioError) -> Self {
        BridgeError::Radio { source }
    }
}

impl From<n1mm::N1mmError> for BridgeError {
    fn from(source: n1mm::N1mmError) -> Self {
        BridgeError::N1mm { source }
    }
}

impl From<cache::CacheError> for BridgeError {
    fn from(source: cache::CacheError) -> Self {
        BridgeError::Cache { source }
    }
}
