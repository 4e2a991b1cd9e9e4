//! Band/mode classifier (C2): frequency-to-band mapping and the
//! default FT4/FT8 dial frequencies used when a spot carries no mode
//! of its own.

/// `(low_khz, high_khz, band_name)` table, ordered low to high. Ranges
/// follow the IARU Region 1/2/3 consensus allocations used by the
/// common DX cluster software (`freq_to_band` in the original
/// bridge).
const BANDS: &[(f64, f64, &str)] = &[
    (1800.0, 2000.0, "160m"),
    (3500.0, 4000.0, "80m"),
    (5330.0, 5410.0, "60m"),
    (7000.0, 7300.0, "40m"),
    (10100.0, 10150.0, "30m"),
    (14000.0, 14350.0, "20m"),
    (18068.0, 18168.0, "17m"),
    (21000.0, 21450.0, "15m"),
    (24890.0, 24990.0, "12m"),
    (28000.0, 29700.0, "10m"),
    (50000.0, 54000.0, "6m"),
    (144000.0, 148000.0, "2m"),
];

/// Map a frequency in kHz to its amateur band name, or `None` if it
/// falls outside every known allocation.
pub fn freq_to_band(freq_khz: f64) -> Option<&'static str> {
    BANDS
        .iter()
        .find(|(low, high, _)| *low <= freq_khz && freq_khz <= *high)
        .map(|(_, _, name)| *name)
}

/// Known FT8 dial (suppressed-carrier) frequencies in kHz, used to
/// infer a spot's mode when the comment field doesn't name one and
/// the frequency lands within the digital calling channel above a
/// published dial frequency.
pub const FT8_DIAL_FREQ_KHZ: &[f64] = &[
    1840.0, 3573.0, 5357.0, 7074.0, 10136.0, 14074.0, 18100.0, 21074.0, 24915.0, 28074.0, 50313.0,
    144174.0,
];

/// Known FT4 dial frequencies in kHz.
pub const FT4_DIAL_FREQ_KHZ: &[f64] = &[
    1836.6, 3575.5, 7047.5, 10140.0, 14080.0, 18104.0, 21140.0, 24919.0, 28180.0, 50318.0, 144170.0,
];

/// Width of the digital calling channel above a dial frequency, in
/// kHz: a spot in `[D, D+DIGITAL_WINDOW_KHZ)` is snapped to that mode.
const DIGITAL_WINDOW_KHZ: f64 = 3.0;

/// 40 m is narrower than the nominal 3 kHz window: the published FT4
/// calling channel is 7047.5-7050.0 kHz, inside the wider 40 m
/// CW/digital sub-band, so general CW resumes at 7050.0 rather than
/// 7050.5.
const FT4_40M_WINDOW_KHZ: f64 = 2.5;

fn ft4_window_width(dial_khz: f64) -> f64 {
    if dial_khz == 7047.5 {
        FT4_40M_WINDOW_KHZ
    } else {
        DIGITAL_WINDOW_KHZ
    }
}

use crate::model::Mode;

/// `(low_khz, high_khz, mode)`, checked in order, first match wins.
/// IARU Region 2 (ARRL band plan) CW/SSB/RTTY sub-bands.
const REGION2_SUBBANDS: &[(f64, f64, Mode)] = &[
    (1800.0, 1838.0, Mode::Cw),
    (1838.0, 2000.0, Mode::Ssb),
    (3500.0, 3600.0, Mode::Cw),
    (3600.0, 4000.0, Mode::Ssb),
    (7000.0, 7125.0, Mode::Cw),
    (7125.0, 7300.0, Mode::Ssb),
    (10100.0, 10150.0, Mode::Cw),
    (14000.0, 14150.0, Mode::Cw),
    (14150.0, 14350.0, Mode::Ssb),
    (18068.0, 18110.0, Mode::Cw),
    (18110.0, 18168.0, Mode::Ssb),
    (21000.0, 21200.0, Mode::Cw),
    (21200.0, 21450.0, Mode::Ssb),
    (24890.0, 24920.0, Mode::Cw),
    (24920.0, 24990.0, Mode::Ssb),
    (28000.0, 28300.0, Mode::Cw),
    (28300.0, 29700.0, Mode::Ssb),
    (29300.0, 29510.0, Mode::Rtty),
    (50000.0, 50100.0, Mode::Cw),
    (50100.0, 54000.0, Mode::Ssb),
];

/// IARU Region 1 sub-bands: same table as Region 2, with 40 m and
/// 80 m narrowed to the Region 1 phone/CW boundaries (broadcast-band
/// coexistence leaves less room for SSB on both bands).
const REGION1_SUBBANDS: &[(f64, f64, Mode)] = &[
    (1800.0, 1838.0, Mode::Cw),
    (1838.0, 2000.0, Mode::Ssb),
    (3500.0, 3600.0, Mode::Cw),
    (3600.0, 3800.0, Mode::Ssb),
    (7000.0, 7040.0, Mode::Cw),
    (7040.0, 7200.0, Mode::Ssb),
    (10100.0, 10150.0, Mode::Cw),
    (14000.0, 14150.0, Mode::Cw),
    (14150.0, 14350.0, Mode::Ssb),
    (18068.0, 18110.0, Mode::Cw),
    (18110.0, 18168.0, Mode::Ssb),
    (21000.0, 21200.0, Mode::Cw),
    (21200.0, 21450.0, Mode::Ssb),
    (24890.0, 24920.0, Mode::Cw),
    (24920.0, 24990.0, Mode::Ssb),
    (28000.0, 28300.0, Mode::Cw),
    (28300.0, 29700.0, Mode::Ssb),
    (29300.0, 29510.0, Mode::Rtty),
    (50000.0, 50100.0, Mode::Cw),
    (50100.0, 54000.0, Mode::Ssb),
];

/// IARU Region 3 sub-bands: same table as Region 2, with 40 m and
/// 80 m shifted to the Region 3 boundaries.
const REGION3_SUBBANDS: &[(f64, f64, Mode)] = &[
    (1800.0, 1838.0, Mode::Cw),
    (1838.0, 2000.0, Mode::Ssb),
    (3500.0, 3600.0, Mode::Cw),
    (3600.0, 3900.0, Mode::Ssb),
    (7000.0, 7025.0, Mode::Cw),
    (7025.0, 7200.0, Mode::Ssb),
    (10100.0, 10150.0, Mode::Cw),
    (14000.0, 14150.0, Mode::Cw),
    (14150.0, 14350.0, Mode::Ssb),
    (18068.0, 18110.0, Mode::Cw),
    (18110.0, 18168.0, Mode::Ssb),
    (21000.0, 21200.0, Mode::Cw),
    (21200.0, 21450.0, Mode::Ssb),
    (24890.0, 24920.0, Mode::Cw),
    (24920.0, 24990.0, Mode::Ssb),
    (28000.0, 28300.0, Mode::Cw),
    (28300.0, 29700.0, Mode::Ssb),
    (29300.0, 29510.0, Mode::Rtty),
    (50000.0, 50100.0, Mode::Cw),
    (50100.0, 54000.0, Mode::Ssb),
];

fn subbands_for_region(region: u8) -> &'static [(f64, f64, Mode)] {
    match region {
        1 => REGION1_SUBBANDS,
        3 => REGION3_SUBBANDS,
        _ => REGION2_SUBBANDS,
    }
}

/// Infer a spot's mode from frequency and IARU region alone, for when
/// the comment field names no mode of its own. Checked in order: FT4
/// dial window, then FT8 dial window, then the region's CW/SSB/RTTY
/// sub-band table, defaulting to SSB within a known band that matches
/// no sub-band. Unrecognized region values fall back to region 2.
/// Returns `None` only when the frequency falls outside every known
/// band allocation.
pub fn infer_mode(freq_khz: f64, region: u8) -> Option<Mode> {
    if FT4_DIAL_FREQ_KHZ
        .iter()
        .any(|d| *d <= freq_khz && freq_khz < *d + ft4_window_width(*d))
    {
        return Some(Mode::Ft4);
    }
    if FT8_DIAL_FREQ_KHZ
        .iter()
        .any(|d| *d <= freq_khz && freq_khz < *d + DIGITAL_WINDOW_KHZ)
    {
        return Some(Mode::Ft8);
    }

    freq_to_band(freq_khz)?;

    let subbands = subbands_for_region(region);
    if let Some((_, _, mode)) = subbands.iter().find(|(low, high, _)| *low <= freq_khz && freq_khz < *high) {
        return Some(*mode);
    }

    Some(Mode::Ssb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_bands() {
        assert_eq!(freq_to_band(14074.0), Some("20m"));
        assert_eq!(freq_to_band(7074.0), Some("40m"));
        assert_eq!(freq_to_band(144200.0), Some("2m"));
    }

    #[test]
    fn rejects_gaps_between_bands() {
        assert_eq!(freq_to_band(12000.0), None);
        assert_eq!(freq_to_band(100.0), None);
    }

    #[test]
    fn boundary_frequencies_are_inclusive() {
        assert_eq!(freq_to_band(14000.0), Some("20m"));
        assert_eq!(freq_to_band(14350.0), Some("20m"));
    }

    #[test]
    fn ft4_window_wins_over_ft8_when_both_could_apply() {
        // 3575.7 kHz falls inside both the FT8 80 m window (3573-3576)
        // and the FT4 80 m window (3575.5-3578.5).
        assert_eq!(infer_mode(3575.7, 2), Some(Mode::Ft4));
        assert_eq!(infer_mode(14074.5, 2), Some(Mode::Ft8));
    }

    #[test]
    fn resolves_via_cw_subband_when_no_digital_window_matches() {
        assert_eq!(infer_mode(7050.0, 2), Some(Mode::Cw));
    }

    #[test]
    fn resolves_via_ssb_subband() {
        assert_eq!(infer_mode(14250.0, 2), Some(Mode::Ssb));
    }

    #[test]
    fn defaults_to_ssb_within_a_known_band_matching_no_subband() {
        assert_eq!(infer_mode(5370.0, 2), Some(Mode::Ssb));
    }

    #[test]
    fn returns_none_outside_every_band() {
        assert_eq!(infer_mode(12000.0, 2), None);
    }

    #[test]
    fn unknown_region_falls_back_to_region_2() {
        assert_eq!(infer_mode(7050.0, 99), infer_mode(7050.0, 2));
    }

    #[test]
    fn region_1_and_3_narrow_40m_and_80m_differently_from_region_2() {
        assert_eq!(infer_mode(7100.0, 2), Some(Mode::Cw));
        assert_eq!(infer_mode(7100.0, 1), Some(Mode::Ssb));
        assert_eq!(infer_mode(7030.0, 3), Some(Mode::Ssb));
    }
}
