//! Barometric cloud-top height estimation.
//!
//! Converts a cloud-top pressure into a physical height by interpolating
//! the atmospheric temperature profile between fixed reference pressure
//! levels and applying the hypsometric relation.

/// Reference pressure levels in hPa, strictly decreasing.
///
/// Temperature profiles are sampled at exactly these levels, one value
/// per level per pixel.
pub const REFERENCE_PRESSURE_LEVELS: [f64; 25] = [
    1000.0, 950.0, 925.0, 900.0, 850.0, 800.0, 700.0, 600.0, 500.0, 400.0, 300.0, 250.0, 200.0,
    150.0, 100.0, 70.0, 50.0, 30.0, 20.0, 10.0, 7.0, 5.0, 3.0, 2.0, 1.0,
];

/// Number of temperature samples expected per pixel
pub const NUM_PRESSURE_LEVELS: usize = REFERENCE_PRESSURE_LEVELS.len();

/// Hypsometric height for pressure `ctp` over surface pressure `p0` at
/// temperature `ts` (standard lapse rate 6.5 K/km).
fn height_from_ctp(ctp: f64, p0: f64, ts: f64) -> f64 {
    -ts * ((ctp / p0).powf(1.0 / 5.255) - 1.0) / 0.0065
}

/// Cloud-top height from cloud-top pressure, sea-level pressure and the
/// per-pixel temperature profile.
///
/// The profile is bracketed to find the level pair enclosing `ctp`, the
/// temperature is linearly interpolated at `ctp` and fed into the
/// hypsometric relation. A `ctp` at or above the first tabulated level
/// interpolates with the outermost pair (extrapolating past the table
/// top); a `ctp` below the smallest level uses the last pair the same
/// way. Returns 0.0 only when no bracket matches, which cannot happen
/// for finite positive `ctp`.
pub fn refined_height_from_ctp(ctp: f64, slp: f64, temperatures: &[f64]) -> f64 {
    debug_assert_eq!(temperatures.len(), NUM_PRESSURE_LEVELS);
    let levels = &REFERENCE_PRESSURE_LEVELS;
    let n = levels.len();

    if ctp >= levels[n - 1] {
        for i in 0..n - 1 {
            if ctp > levels[0] || (ctp < levels[i] && ctp > levels[i + 1]) {
                let t1 = temperatures[i];
                let t2 = temperatures[i + 1];
                let ts = (t2 - t1) / (levels[i + 1] - levels[i]) * (ctp - levels[i]) + t1;
                return height_from_ctp(ctp, slp, ts);
            }
        }
        0.0
    } else {
        let t1 = temperatures[n - 2];
        let t2 = temperatures[n - 1];
        let ts = (t2 - t1) / (levels[n - 1] - levels[n - 2]) * (ctp - levels[n - 2]) + t1;
        height_from_ctp(ctp, slp, ts)
    }
}
