//! Core data model shared by every component: [`Spot`], the modes and
//! activity tags it can carry, and the bookkeeping types the spot
//! cache (`cache.rs`) attaches to it.

use std::fmt;
use std::time::Instant;

use once_cell::sync::Lazy;
use regex::Regex;

/// A digital/voice/CW mode a spot can be tagged with.
///
/// Order matters for [`crate::cluster::extract_mode`]: it is the order
/// comment text is scanned in, and some mode names are substrings of
/// others' surrounding context, so FT8 is checked before FT4 is not
/// required here (the two never collide), but the ordering is kept
/// stable and explicit to match the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Ft8,
    Ft4,
    Cw,
    Ssb,
    Rtty,
    Psk,
    Js8,
    Msk144,
    Jt65,
    Jt9,
}

/// Canonical scan order used by [`crate::cluster::extract_mode`].
pub const MODE_SCAN_ORDER: &[Mode] = &[
    Mode::Ft8,
    Mode::Ft4,
    Mode::Cw,
    Mode::Ssb,
    Mode::Rtty,
    Mode::Psk,
    Mode::Js8,
    Mode::Msk144,
    Mode::Jt65,
    Mode::Jt9,
];

impl Mode {
    /// The name used on the wire, in config files, and in log output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Ft8 => "FT8",
            Mode::Ft4 => "FT4",
            Mode::Cw => "CW",
            Mode::Ssb => "SSB",
            Mode::Rtty => "RTTY",
            Mode::Psk => "PSK",
            Mode::Js8 => "JS8",
            Mode::Msk144 => "MSK144",
            Mode::Jt65 => "JT65",
            Mode::Jt9 => "JT9",
        }
    }

    /// Parse a mode name case-insensitively. Unknown names yield `None`
    /// rather than an error: callers treat an unrecognized mode the
    /// same as a missing one.
    pub fn parse(s: &str) -> Option<Mode> {
        MODE_SCAN_ORDER
            .iter()
            .copied()
            .find(|m| m.as_str().eq_ignore_ascii_case(s))
    }

    /// The single-character decode-mode selector used in §4.8 Decode
    /// records (`message/mod` of the wire protocol, not this module).
    pub fn decode_char(&self) -> char {
        match self {
            Mode::Ft8 => '~',
            Mode::Ft4 => '+',
            Mode::Jt65 => '#',
            Mode::Jt9 => '@',
            Mode::Msk144 => '`',
            _ => '~',
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parks/summits activation tag. Sticky once set (§3 invariant): a
/// [`crate::cache::CacheEntry`] that has seen `Some(activity)` never
/// reverts to `None` for the same key while it is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Pota,
    Sota,
}

impl Activity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Activity::Pota => "POTA",
            Activity::Sota => "SOTA",
        }
    }
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static GRID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-R]{2}\d{2}([a-x]{2})?$").expect("static grid regex is valid")
});

/// Returns `true` if `s` is a syntactically valid Maidenhead locator:
/// two uppercase letters A-R, two digits, optionally two lowercase
/// letters a-x.
pub fn is_valid_grid(s: &str) -> bool {
    GRID_RE.is_match(s)
}

/// The canonical DX-spot event, normalized from whichever upstream
/// produced it (cluster line, POTA/SOTA poll, or a prior cache entry
/// being overwritten).
#[derive(Debug, Clone)]
pub struct Spot {
    pub spotter: String,
    pub freq_khz: f64,
    pub dx_call: String,
    pub comment: String,
    pub time_utc: String,
    pub mode: Option<Mode>,
    pub snr: Option<i16>,
    pub grid: Option<String>,
    pub activity: Option<Activity>,
}

impl Spot {
    /// Frequency in whole Hz, as encoded on the wire.
    pub fn freq_hz(&self) -> u64 {
        (self.freq_khz * 1000.0).round() as u64
    }
}

/// Bookkeeping a [`Spot`] carries once it lives in the spot cache.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub spot: Spot,
    pub cluster_name: String,
    pub first_seen: Instant,
    pub last_updated: Instant,
    pub expired_at: Option<Instant>,
}

/// A synthetic downstream identity for one `(band, mode)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Instance {
    pub band: String,
    pub mode: Option<Mode>,
}

impl Instance {
    /// `"<band>-<mode>"`, falling back to `SSB` when mode is unknown —
    /// mirrors the flush cycle's `mode_or_"SSB"` grouping (§4.8).
    pub fn client_id(&self) -> String {
        format!(
            "{}-{}",
            self.band,
            self.mode.map(|m| m.as_str()).unwrap_or("SSB")
        )
    }
}
