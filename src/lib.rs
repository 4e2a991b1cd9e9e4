pub mod band;
pub mod bridge;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod error;
pub mod grid_enrich;
pub mod instances;
pub mod model;
pub mod n1mm;
pub mod pollers;
pub mod radio;
pub mod telnet;
pub mod tracing_init;
pub mod wire;

pub use error::BridgeError;
