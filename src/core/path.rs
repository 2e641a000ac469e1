//! Illumination path geometry.
//!
//! Shadow casting works on rasterized paths in the anti-solar direction:
//! a projected displacement is computed from the sun geometry, clipped to
//! the scene and turned into an ordered sequence of integer pixel offsets.

use crate::types::{GeoPos, Rect};

/// Mean Earth radius in metres used for all geodetic distances
pub const MEAN_EARTH_RADIUS: f64 = 6_372_000.0;

/// sin(45 deg), separates the dominant azimuth quadrants for border clipping
const QUARTER_DIVIDER: f64 = 0.707_106_781_186_547_5;

/// End point of a geodetic line of `length_m` metres from `start` along
/// `azimuth_rad` (clockwise from north).
pub fn line_with_angle(start: GeoPos, length_m: f64, azimuth_rad: f64) -> GeoPos {
    let delta_x = length_m * azimuth_rad.sin();
    let delta_y = length_m * azimuth_rad.cos();
    let dist_lat = -(delta_y / MEAN_EARTH_RADIUS).to_degrees();
    let dist_lon = -(delta_x / (MEAN_EARTH_RADIUS * start.lat.to_radians().cos())).to_degrees();
    GeoPos {
        lat: start.lat + dist_lat,
        lon: start.lon + dist_lon,
    }
}

/// Great-circle distance in metres, spherical law of cosines
pub fn spherical_distance(p1: GeoPos, p2: GeoPos) -> f64 {
    let lat1 = p1.lat.to_radians();
    let lat2 = p2.lat.to_radians();
    let delta_lon = (p2.lon - p1.lon).abs().to_radians();
    let cos_delta = lat1.sin() * lat2.sin() + lat1.cos() * lat2.cos() * delta_lon.cos();
    cos_delta.clamp(-1.0, 1.0).acos() * MEAN_EARTH_RADIUS
}

/// Ground distance between two pixels, on a sphere inflated by the lower
/// of the two surface altitudes. Negative or NaN altitudes count as sea
/// level. Returns the distance and the clamped minimum altitude.
pub fn surface_distance(p1: GeoPos, p2: GeoPos, alt1: f64, alt2: f64) -> (f64, f64) {
    let mut min_altitude = alt1.min(alt2);
    if min_altitude < 0.0 || min_altitude.is_nan() {
        min_altitude = 0.0;
    }
    let lat1 = p1.lat.to_radians();
    let lat2 = p2.lat.to_radians();
    let delta = (p2.lon - p1.lon).to_radians();
    let (sin_d, cos_d) = delta.sin_cos();
    let y = ((lat2.cos() * sin_d).powi(2)
        + (lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * cos_d).powi(2))
    .sqrt();
    let x = lat1.sin() * lat2.sin() + lat1.cos() * lat2.cos() * cos_d;
    let arc = y.atan2(x);
    (arc * (MEAN_EARTH_RADIUS + min_altitude), min_altitude)
}

/// Per-pixel apparent sun azimuth in degrees.
///
/// Corrects the sun azimuth for the view geometry so the cast direction
/// matches the observed cloud displacement. All angles in degrees.
pub fn apparent_sun_azimuth(
    sun_zenith: f64,
    sun_azimuth: f64,
    view_zenith: f64,
    view_azimuth: f64,
    latitude: f64,
) -> f64 {
    let delta_phi = if view_azimuth < 0.0 {
        360.0 - view_azimuth.abs() - sun_azimuth
    } else {
        sun_azimuth - view_azimuth
    };
    let delta_phi_rad = delta_phi.to_radians();
    let tan_sza = sun_zenith.to_radians().tan();
    let tan_oza = view_zenith.to_radians().tan();
    let numerator = tan_sza - tan_oza * delta_phi_rad.cos();
    let denominator =
        (tan_oza * tan_oza + tan_sza * tan_sza - 2.0 * tan_oza * tan_sza * delta_phi_rad.cos())
            .sqrt();
    let mut delta = (numerator / denominator).clamp(-1.0, 1.0).acos().to_degrees();
    if sun_azimuth > 270.0 || sun_azimuth < 90.0 {
        delta = -delta;
    }
    if latitude < 0.0 {
        sun_azimuth - delta
    } else {
        sun_azimuth + delta
    }
}

/// Scene-mean apparent sun azimuth in degrees, from the centre-pixel
/// view geometry. The cloud position observed at non-zero view zenith is
/// displaced; the cast direction follows the apparent azimuth instead of
/// the true solar one.
pub fn scene_apparent_sun_azimuth(
    sun_azimuth_mean: f64,
    view_zenith_mean: f64,
    view_azimuth_mean: f64,
) -> f64 {
    let mut diff_phi = sun_azimuth_mean - view_azimuth_mean;
    if diff_phi < 0.0 {
        diff_phi += 180.0;
    }
    if diff_phi > 90.0 {
        diff_phi -= 90.0;
    }
    diff_phi *= view_zenith_mean.to_radians().tan();
    if view_azimuth_mean > 180.0 {
        diff_phi = -diff_phi;
    }
    sun_azimuth_mean + diff_phi
}

/// Pixels of the digital line between two pixel positions, in traversal
/// order. Pixels outside `clip` are skipped.
pub fn path_pixels(x0: i32, y0: i32, x1: i32, y1: i32, clip: &Rect) -> Vec<(i32, i32)> {
    let mut pixels = Vec::new();
    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;
    let (mut x, mut y) = (x0, y0);
    loop {
        if clip.contains(x, y) {
            pixels.push((x, y));
        }
        if x == x1 && y == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }
    pixels
}

/// Ordered integer offsets of the shadow-casting path shared by all
/// pixels of a tile.
///
/// The projected displacement is anchored at a corner of the source (or
/// target) rectangle chosen so the path sweeps fully across it in the
/// down-sun direction, clipped to the scene at the border matching the
/// azimuth's dominant quadrant, then rasterized. The first offset is
/// always (0, 0). `inverse` flips the direction, yielding the offsets
/// from a shadow receiver back towards the casting cloud.
#[allow(clippy::too_many_arguments)]
pub fn relative_path(
    min_surface_altitude: f64,
    sza_rad: f64,
    saa_rad: f64,
    max_object_altitude: f64,
    source_rect: &Rect,
    target_rect: &Rect,
    scene_width: i32,
    scene_height: i32,
    spatial_resolution: f64,
    inverse: bool,
    offset_in_target_rect: bool,
) -> Vec<(i32, i32)> {
    let cos_saa = (saa_rad - std::f64::consts::FRAC_PI_2).cos();
    let sin_saa = (saa_rad - std::f64::consts::FRAC_PI_2).sin();
    let delta_proj_x =
        (max_object_altitude - min_surface_altitude) * sza_rad.tan() * cos_saa / spatial_resolution;
    let delta_proj_y =
        (max_object_altitude - min_surface_altitude) * sza_rad.tan() * sin_saa / spatial_resolution;

    let anchor = if offset_in_target_rect {
        target_rect
    } else {
        source_rect
    };
    let x0 = if cos_saa > 0.0 {
        anchor.x as f64
    } else {
        (anchor.x + anchor.width - 1) as f64
    };
    let y0 = if sin_saa > 0.0 {
        anchor.y as f64
    } else {
        (anchor.y + anchor.height - 1) as f64
    };
    let mut x1 = x0 + delta_proj_x + 0.5;
    let mut y1 = y0 + delta_proj_y + 0.5;

    let min_x = f64::max(0.0, source_rect.x as f64);
    let min_y = f64::max(0.0, source_rect.y as f64);
    let max_x = f64::min(
        (scene_width - 1) as f64,
        (source_rect.x + source_rect.width - 1) as f64,
    );
    let max_y = f64::min(
        (scene_height - 1) as f64,
        (source_rect.y + source_rect.height - 1) as f64,
    );

    if sin_saa + QUARTER_DIVIDER < 1e-8 {
        // upper border
        if y1 < min_y {
            if x0 != x1 {
                let m = (y1 - y0) / (x1 - x0);
                x1 = x0 + (min_y - y0) / m;
            }
            y1 = min_y;
        }
    } else if sin_saa - QUARTER_DIVIDER > 1e-8 {
        // lower border
        if y1 > max_y {
            if x0 != x1 {
                let m = (y1 - y0) / (x1 - x0);
                x1 = x0 + (max_y - y0) / m;
            }
            y1 = max_y;
        }
    } else if cos_saa + QUARTER_DIVIDER < 1e-8 {
        // left border
        if x1 < min_x {
            if y0 != y1 {
                let m = (y1 - y0) / (x1 - x0);
                y1 = y0 + m * (min_x - x0);
            }
            x1 = min_x;
        }
    } else {
        // right border
        if x1 > max_x {
            if y0 != y1 {
                let m = (y1 - y0) / (x1 - x0);
                y1 = y0 + m * (max_x - x0);
            }
            x1 = max_x;
        }
    }

    let (end_x, end_y) = if inverse {
        (x0 - x1, y0 - y1)
    } else {
        (x1 - x0, y1 - y0)
    };
    let unclipped = Rect::new(i32::MIN / 2, i32::MIN / 2, i32::MAX, i32::MAX);
    path_pixels(0, 0, end_x as i32, end_y as i32, &unclipped)
}

/// Tile source rectangle extended by the final path offset in both
/// directions, clipped to the scene.
pub fn extended_source_rect(
    scene_width: i32,
    scene_height: i32,
    target_rect: &Rect,
    path: &[(i32, i32)],
) -> Rect {
    let (relative_x, relative_y) = path.last().copied().unwrap_or((0, 0));
    let x0 = i32::max(0, target_rect.x - relative_x.abs());
    let y0 = i32::max(0, target_rect.y - relative_y.abs());
    let x1 = i32::min(scene_width, target_rect.x + target_rect.width + relative_x.abs());
    let y1 = i32::min(scene_height, target_rect.y + target_rect.height + relative_y.abs());
    Rect::new(x0, y0, x1 - x0, y1 - y0)
}
