//! Binary wire codec (C1): length-prefixed, big-endian tagged records
//! mimicking the WSJT-X UDP network protocol (`NetworkMessage.hpp`).
//!
//! Every outbound datagram starts with the same 12-byte header (magic,
//! schema, message type) followed by a length-prefixed `client_id`
//! string, then the fields of whichever record type is being sent.
//! Strings are 4-byte-length-prefixed UTF-8; the sentinel length
//! `0xFFFF_FFFF` means "null string" rather than empty.

use snafu::Snafu;

/// `QDataStream`-style wire magic that opens every datagram.
pub const MAGIC: u32 = 0xADBC_CBDA;
/// Schema version this codec speaks. Schema 2 is the widest-compatible
/// WSJT-X UDP schema and is what most consumers (including GridTracker)
/// expect.
pub const SCHEMA: u32 = 2;
/// Frames larger than this are rejected outright — decoders never
/// allocate an open-ended buffer for a length prefix (§4.1).
pub const MAX_FRAME_LEN: usize = 64 * 1024;

pub mod msg_type {
    pub const HEARTBEAT: u32 = 0;
    pub const STATUS: u32 = 1;
    pub const DECODE: u32 = 2;
    pub const REPLY: u32 = 4;
    pub const QSO_LOGGED: u32 = 5;
}

#[derive(Debug, Snafu)]
pub enum WireError {
    #[snafu(display("bad magic: expected {MAGIC:#010x}, got {found:#010x}"))]
    BadMagic { found: u32 },

    #[snafu(display("frame truncated: need {need} bytes, have {have}"))]
    Truncated { need: usize, have: usize },

    #[snafu(display("length prefix {len} exceeds remaining {remaining} bytes"))]
    LengthOverrun { len: usize, remaining: usize },

    #[snafu(display("frame of {len} bytes exceeds the {MAX_FRAME_LEN}-byte ceiling"))]
    FrameTooLarge { len: usize },

    #[snafu(display("string field is not valid UTF-8"))]
    Utf8 { source: std::string::FromUtf8Error },
}

type Result<T> = std::result::Result<T, WireError>;

/// `QDateTime`-equivalent: Julian Day Number plus milliseconds since
/// midnight, always in the UTC timespec (byte value `1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateTime {
    pub jdn: i64,
    pub ms_of_day: u32,
}

impl DateTime {
    /// Proleptic-Gregorian (Y, M, D, h, m, s) -> JDN + ms-of-day, per
    /// the formula in §4.1:
    /// `a=(14-M)/12; y=Y+4800-a; m=M+12a-3;`
    /// `JDN = D + (153m+2)/5 + 365y + y/4 - y/100 + y/400 - 32045`
    /// (all divisions are integer/floor division).
    pub fn from_ymd_hms(year: i64, month: i64, day: i64, hour: u32, min: u32, sec: u32) -> Self {
        let a = (14 - month).div_euclid(12);
        let y = year + 4800 - a;
        let m = month + 12 * a - 3;
        let jdn = day
            + (153 * m + 2).div_euclid(5)
            + 365 * y
            + y.div_euclid(4)
            - y.div_euclid(100)
            + y.div_euclid(400)
            - 32045;
        DateTime {
            jdn,
            ms_of_day: ((hour * 3600 + min * 60 + sec) * 1000),
        }
    }

    /// The current instant in UTC.
    pub fn now_utc() -> Self {
        use chrono::{Datelike, Timelike, Utc};
        let now = Utc::now();
        Self::from_ymd_hms(
            now.year() as i64,
            now.month() as i64,
            now.day() as i64,
            now.hour(),
            now.minute(),
            now.second(),
        )
    }
}

/// Milliseconds since midnight UTC for "now" — used as the `time_ms`
/// field of Decode records, per §4.1: `((h*3600)+m*60+s)*1000`.
pub fn current_time_ms() -> u32 {
    use chrono::{Timelike, Utc};
    let now = Utc::now();
    (now.hour() * 3600 + now.minute() * 60 + now.second()) * 1000
}

/// Growable byte buffer with big-endian scalar/string pushers. Not a
/// general-purpose serializer — just what this wire format needs.
#[derive(Default)]
struct Writer(Vec<u8>);

impl Writer {
    fn u8(&mut self, v: u8) {
        self.0.push(v);
    }
    fn u32(&mut self, v: u32) {
        self.0.extend_from_slice(&v.to_be_bytes());
    }
    fn i32(&mut self, v: i32) {
        self.0.extend_from_slice(&v.to_be_bytes());
    }
    fn u64(&mut self, v: u64) {
        self.0.extend_from_slice(&v.to_be_bytes());
    }
    fn i64(&mut self, v: i64) {
        self.0.extend_from_slice(&v.to_be_bytes());
    }
    fn f64(&mut self, v: f64) {
        self.0.extend_from_slice(&v.to_be_bytes());
    }
    fn bool(&mut self, v: bool) {
        self.0.push(v as u8);
    }
    fn string(&mut self, v: Option<&str>) {
        match v {
            None => self.u32(0xFFFF_FFFF),
            Some(s) => {
                let bytes = s.as_bytes();
                self.u32(bytes.len() as u32);
                self.0.extend_from_slice(bytes);
            }
        }
    }
    fn datetime(&mut self, v: DateTime) {
        self.i64(v.jdn);
        self.u32(v.ms_of_day);
        self.u8(1); // timespec: 1 = UTC
    }
    fn header(&mut self, msg_type: u32, client_id: &str) {
        self.u32(MAGIC);
        self.u32(SCHEMA);
        self.u32(msg_type);
        self.string(Some(client_id));
    }
    fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

/// Heartbeat (type 0).
pub fn encode_heartbeat(client_id: &str, max_schema: u32, version: &str, revision: &str) -> Vec<u8> {
    let mut w = Writer::default();
    w.header(msg_type::HEARTBEAT, client_id);
    w.u32(max_schema);
    w.string(Some(version));
    w.string(Some(revision));
    w.into_bytes()
}

/// Fields of a Status record (type 1), in wire order.
pub struct StatusFields<'a> {
    pub dial_freq: u64,
    pub mode: Option<&'a str>,
    pub dx_call: Option<&'a str>,
    pub report: Option<&'a str>,
    pub tx_mode: Option<&'a str>,
    pub tx_enabled: bool,
    pub transmitting: bool,
    pub decoding: bool,
    pub rx_df: u32,
    pub tx_df: u32,
    pub de_call: Option<&'a str>,
    pub de_grid: Option<&'a str>,
    pub dx_grid: Option<&'a str>,
    pub tx_watchdog: bool,
    pub sub_mode: Option<&'a str>,
    pub fast_mode: bool,
    pub special_op: u8,
    pub freq_tolerance: u32,
    pub tr_period: u32,
    pub config_name: Option<&'a str>,
}

impl Default for StatusFields<'_> {
    fn default() -> Self {
        StatusFields {
            dial_freq: 0,
            mode: None,
            dx_call: None,
            report: None,
            tx_mode: None,
            tx_enabled: false,
            transmitting: false,
            decoding: true,
            rx_df: 1500,
            tx_df: 1500,
            de_call: None,
            de_grid: None,
            dx_grid: None,
            tx_watchdog: false,
            sub_mode: None,
            fast_mode: false,
            special_op: 0,
            freq_tolerance: 0,
            tr_period: 15,
            config_name: Some("Default"),
        }
    }
}

/// Status (type 1).
pub fn encode_status(client_id: &str, f: &StatusFields) -> Vec<u8> {
    let mut w = Writer::default();
    w.header(msg_type::STATUS, client_id);
    w.u64(f.dial_freq);
    w.string(f.mode);
    w.string(f.dx_call);
    w.string(f.report);
    w.string(f.tx_mode);
    w.bool(f.tx_enabled);
    w.bool(f.transmitting);
    w.bool(f.decoding);
    w.u32(f.rx_df);
    w.u32(f.tx_df);
    w.string(f.de_call);
    w.string(f.de_grid);
    w.string(f.dx_grid);
    w.bool(f.tx_watchdog);
    w.string(f.sub_mode);
    w.bool(f.fast_mode);
    w.u8(f.special_op);
    w.u32(f.freq_tolerance);
    w.u32(f.tr_period);
    w.string(f.config_name);
    w.into_bytes()
}

/// Fields of a Decode record (type 2), in wire order.
pub struct DecodeFields<'a> {
    pub is_new: bool,
    pub time_ms: u32,
    pub snr: i32,
    pub delta_time: f64,
    pub delta_freq: u32,
    pub mode: &'a str,
    pub message: &'a str,
    pub low_confidence: bool,
    pub off_air: bool,
}

/// Decode (type 2).
pub fn encode_decode(client_id: &str, f: &DecodeFields) -> Vec<u8> {
    let mut w = Writer::default();
    w.header(msg_type::DECODE, client_id);
    w.bool(f.is_new);
    w.u32(f.time_ms);
    w.i32(f.snr);
    w.f64(f.delta_time);
    w.u32(f.delta_freq);
    w.string(Some(f.mode));
    w.string(Some(f.message));
    w.bool(f.low_confidence);
    w.bool(f.off_air);
    w.into_bytes()
}

/// Fields of a QSO Logged record (type 5), in wire order.
pub struct QsoLoggedFields<'a> {
    pub date_time_off: DateTime,
    pub dx_call: Option<&'a str>,
    pub dx_grid: Option<&'a str>,
    pub freq_hz: u64,
    pub mode: Option<&'a str>,
    pub report_sent: Option<&'a str>,
    pub report_rcvd: Option<&'a str>,
    pub tx_power: Option<&'a str>,
    pub comments: Option<&'a str>,
    pub name: Option<&'a str>,
    pub date_time_on: DateTime,
    pub operator_call: Option<&'a str>,
    pub my_call: Option<&'a str>,
    pub my_grid: Option<&'a str>,
    pub exchange_sent: Option<&'a str>,
    pub exchange_rcvd: Option<&'a str>,
    pub adif_prop_mode: Option<&'a str>,
}

/// QSO Logged (type 5).
pub fn encode_qso_logged(client_id: &str, f: &QsoLoggedFields) -> Vec<u8> {
    let mut w = Writer::default();
    w.header(msg_type::QSO_LOGGED, client_id);
    w.datetime(f.date_time_off);
    w.string(f.dx_call);
    w.string(f.dx_grid);
    w.u64(f.freq_hz);
    w.string(f.mode);
    w.string(f.report_sent);
    w.string(f.report_rcvd);
    w.string(f.tx_power);
    w.string(f.comments);
    w.string(f.name);
    w.datetime(f.date_time_on);
    w.string(f.operator_call);
    w.string(f.my_call);
    w.string(f.my_grid);
    w.string(f.exchange_sent);
    w.string(f.exchange_rcvd);
    w.string(f.adif_prop_mode);
    w.into_bytes()
}

/// Cursor over a decoded frame's bytes.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.data.len() - self.pos < n {
            return Truncated {
                need: n,
                have: self.data.len() - self.pos,
            }
            .fail();
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        let v = self.data[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        let v = u32::from_be_bytes(self.data[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Ok(v)
    }

    fn i32(&mut self) -> Result<i32> {
        self.need(4)?;
        let v = i32::from_be_bytes(self.data[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Ok(v)
    }

    fn f64(&mut self) -> Result<f64> {
        self.need(8)?;
        let v = f64::from_be_bytes(self.data[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        Ok(v)
    }

    fn bool(&mut self) -> Result<bool> {
        Ok(self.u8()? != 0)
    }

    fn string(&mut self) -> Result<Option<String>> {
        let len = self.u32()?;
        if len == 0xFFFF_FFFF {
            return Ok(None);
        }
        let len = len as usize;
        let remaining = self.data.len() - self.pos;
        if len > remaining {
            return LengthOverrun { len, remaining }.fail();
        }
        let bytes = self.data[self.pos..self.pos + len].to_vec();
        self.pos += len;
        String::from_utf8(bytes).map(Some).context(Utf8Snafu)
    }
}

use snafu::ResultExt;

/// Common header shared by every record: magic, schema, message type,
/// client id. Returns `(msg_type, client_id, bytes consumed)`.
pub fn decode_header(data: &[u8]) -> Result<(u32, Option<String>, usize)> {
    if data.len() > MAX_FRAME_LEN {
        return FrameTooLarge { len: data.len() }.fail();
    }
    let mut r = Reader::new(data);
    let magic = r.u32()?;
    if magic != MAGIC {
        return BadMagic { found: magic }.fail();
    }
    let _schema = r.u32()?;
    let msg_type = r.u32()?;
    let client_id = r.string()?;
    Ok((msg_type, client_id, r.pos))
}

/// A decoded Reply (type 4) datagram — the click-to-tune message sent
/// back by the roster consumer.
#[derive(Debug, Clone)]
pub struct Reply {
    pub client_id: Option<String>,
    pub time_ms: u32,
    pub snr: i32,
    pub delta_time: f64,
    pub delta_freq: u32,
    pub mode: Option<String>,
    pub message: Option<String>,
    pub low_confidence: bool,
    pub modifiers: u8,
}

/// Decode a Reply (type 4) datagram in full.
pub fn decode_reply(data: &[u8]) -> Result<Reply> {
    if data.len() > MAX_FRAME_LEN {
        return FrameTooLarge { len: data.len() }.fail();
    }
    let mut r = Reader::new(data);
    let magic = r.u32()?;
    if magic != MAGIC {
        return BadMagic { found: magic }.fail();
    }
    let _schema = r.u32()?;
    let _msg_type = r.u32()?;
    let client_id = r.string()?;
    let time_ms = r.u32()?;
    let snr = r.i32()?;
    let delta_time = r.f64()?;
    let delta_freq = r.u32()?;
    let mode = r.string()?;
    let message = r.string()?;
    let low_confidence = r.bool()?;
    let modifiers = r.u8()?;
    Ok(Reply {
        client_id,
        time_ms,
        snr,
        delta_time,
        delta_freq,
        mode,
        message,
        low_confidence,
        modifiers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_matches_documented_byte_layout() {
        // §8 S5: heartbeat(client_id="GTB", max_schema=3, version="2.6.1", revision="")
        let bytes = encode_heartbeat("GTB", 3, "2.6.1", "");
        let expected: Vec<u8> = vec![
            0xAD, 0xBC, 0xCB, 0xDA, // magic
            0x00, 0x00, 0x00, 0x02, // schema
            0x00, 0x00, 0x00, 0x00, // msg type 0
            0x00, 0x00, 0x00, 0x03, b'G', b'T', b'B', // client_id
            0x00, 0x00, 0x00, 0x03, // max_schema
            0x00, 0x00, 0x00, 0x05, b'2', b'.', b'6', b'.', b'1', // version
            0x00, 0x00, 0x00, 0x00, // revision (empty, not null)
        ];
        assert_eq!(bytes, expected);
    }

    #[test]
    fn header_round_trips_for_every_type() {
        for (ty, bytes) in [
            (msg_type::HEARTBEAT, encode_heartbeat("X", 3, "v", "r")),
            (
                msg_type::STATUS,
                encode_status("X", &StatusFields::default()),
            ),
            (
                msg_type::DECODE,
                encode_decode(
                    "X",
                    &DecodeFields {
                        is_new: true,
                        time_ms: 0,
                        snr: -10,
                        delta_time: 0.0,
                        delta_freq: 1500,
                        mode: "~",
                        message: "CQ K1ABC FN42",
                        low_confidence: false,
                        off_air: false,
                    },
                ),
            ),
        ] {
            let (decoded_ty, client_id, _) = decode_header(&bytes).unwrap();
            assert_eq!(decoded_ty, ty);
            assert_eq!(client_id.as_deref(), Some("X"));
        }
    }

    #[test]
    fn reply_round_trips_all_fields() {
        // Build a reply datagram by hand (this crate never encodes type 4,
        // only decodes it — it's inbound-only per §4.1).
        let mut w = Writer::default();
        w.header(msg_type::REPLY, "40m-CW");
        w.u32(12_345);
        w.i32(-7);
        w.f64(0.25);
        w.u32(1600);
        w.string(Some("CW"));
        w.string(Some("CQ POTA K1ABC FN42"));
        w.bool(false);
        w.u8(0);
        let bytes = w.into_bytes();

        let reply = decode_reply(&bytes).unwrap();
        assert_eq!(reply.client_id.as_deref(), Some("40m-CW"));
        assert_eq!(reply.time_ms, 12_345);
        assert_eq!(reply.snr, -7);
        assert_eq!(reply.delta_time, 0.25);
        assert_eq!(reply.delta_freq, 1600);
        assert_eq!(reply.mode.as_deref(), Some("CW"));
        assert_eq!(reply.message.as_deref(), Some("CQ POTA K1ABC FN42"));
        assert!(!reply.low_confidence);
        assert_eq!(reply.modifiers, 0);
    }

    #[test]
    fn decode_header_rejects_bad_magic() {
        let bytes = [0u8; 16];
        assert!(matches!(
            decode_header(&bytes),
            Err(WireError::BadMagic { .. })
        ));
    }

    #[test]
    fn decode_header_rejects_truncated_frame() {
        let bytes = [0xAD, 0xBC, 0xCB, 0xDA, 0x00, 0x00];
        assert!(matches!(
            decode_header(&bytes),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn decode_rejects_oversized_frame() {
        let bytes = vec![0u8; MAX_FRAME_LEN + 1];
        assert!(matches!(
            decode_header(&bytes),
            Err(WireError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn jdn_matches_known_date() {
        // 2000-01-01 00:00:00 UTC -> JDN 2451545 (well-known reference point).
        let dt = DateTime::from_ymd_hms(2000, 1, 1, 0, 0, 0);
        assert_eq!(dt.jdn, 2_451_545);
        assert_eq!(dt.ms_of_day, 0);
    }

    #[test]
    fn null_string_round_trips() {
        let mut w = Writer::default();
        w.string(None);
        let mut r = Reader::new(&w.0);
        assert_eq!(r.string().unwrap(), None);
    }
}
