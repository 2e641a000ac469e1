//! Single-pass per-pixel cloud shadow detection.
//!
//! Casts a ray from every clear pixel along the apparent anti-solar
//! direction and marks the pixel as shadow when a cloud along the ray
//! sits at a height matching the cast geometry. Works per pixel with the
//! full sun/view geometry rasters and the refined cloud-top height, so
//! no scene-wide offset search is needed.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::core::height::refined_height_from_ctp;
use crate::core::path::{line_with_angle, path_pixels, spherical_distance, apparent_sun_azimuth};
use crate::types::{
    GeoCoding, PixelFlags, PixelGrid, PixelPos, Rect, FlagRaster, ShadowError, ShadowResult,
};

/// Fallback surface pressure in hPa when no sea-level pressure raster is
/// supplied
const DEFAULT_SEA_LEVEL_PRESSURE: f64 = 1013.25;

/// Parameters for the per-pixel shadow search
#[derive(Debug, Clone)]
pub struct FrontsShadowParams {
    /// Upper bound for shadow-casting cloud tops in metres
    pub max_cloud_height: f64,
    /// Half width of the accepted height window around the cloud top
    pub height_tolerance: f64,
    /// Lower bound for the assumed cloud base in metres
    pub min_cloud_base: f64,
}

impl Default for FrontsShadowParams {
    fn default() -> Self {
        Self {
            max_cloud_height: 12_000.0,
            height_tolerance: 300.0,
            min_cloud_base: 300.0,
        }
    }
}

/// Per-pixel shadow detector over a tile
pub struct FrontsShadowDetector<'a> {
    geo_coding: &'a dyn GeoCoding,
    params: FrontsShadowParams,
}

impl<'a> FrontsShadowDetector<'a> {
    pub fn new(geo_coding: &'a dyn GeoCoding) -> Self {
        Self {
            geo_coding,
            params: FrontsShadowParams::default(),
        }
    }

    pub fn with_params(geo_coding: &'a dyn GeoCoding, params: FrontsShadowParams) -> Self {
        Self { geo_coding, params }
    }

    /// Run the shadow search over `target`, reading cloud flags from the
    /// whole raster (which may extend beyond the target rectangle).
    ///
    /// Skips the entire computation when no cloud-top pressure or
    /// temperature profile is available; height refinement is not
    /// possible then and shadow flags stay unset.
    pub fn detect(
        &self,
        grid: &PixelGrid,
        flags: &mut FlagRaster,
        target: &Rect,
        cancel: &AtomicBool,
    ) -> ShadowResult<()> {
        if grid.cloud_top_pressure.is_none() || grid.temperature_profile.is_none() {
            log::warn!("No cloud-top pressure or temperature profile, skipping shadow search");
            return Ok(());
        }
        log::debug!(
            "Shadow front search over {}x{} tile at ({}, {})",
            target.width,
            target.height,
            target.x,
            target.y
        );

        for y in target.y..target.y + target.height {
            if cancel.load(Ordering::Relaxed) {
                return Err(ShadowError::Cancelled);
            }
            for x in target.x..target.x + target.width {
                let f = flags.get(x, y);
                if f.is_cloud() || f.is_invalid() {
                    continue;
                }
                if self.is_cloud_shadow(grid, flags, x, y) {
                    flags.insert(x, y, PixelFlags::CLOUD_SHADOW);
                }
            }
        }

        fill_shadow_gaps(flags, target);
        extend_shadow_belt(flags, target);
        Ok(())
    }

    fn is_cloud_shadow(&self, grid: &PixelGrid, flags: &FlagRaster, x: i32, y: i32) -> bool {
        let (ux, uy) = (x as usize, y as usize);
        let sza = grid.sun_zenith[[uy, ux]] as f64;
        let tan_sza = (90.0 - sza).to_radians().tan();
        if !(tan_sza > 0.0) {
            return false;
        }
        let cloud_distance_max = self.params.max_cloud_height / tan_sza;
        let cloud_distance_min = self.params.min_cloud_base / tan_sza;

        let origin = self.geo_coding.geo_pos(PixelPos::new(x as f64 + 0.5, y as f64 + 0.5));
        let saa = apparent_sun_azimuth(
            sza,
            grid.sun_azimuth[[uy, ux]] as f64,
            grid.view_zenith[[uy, ux]] as f64,
            grid.view_azimuth[[uy, ux]] as f64,
            origin.lat,
        );
        let azimuth = saa.to_radians() + std::f64::consts::PI;

        let mut end = self
            .geo_coding
            .pixel_pos(line_with_angle(origin, cloud_distance_max, azimuth));
        if end.is_none() {
            // Shorten the cast until it lands on the grid again. Every
            // shortened distance is attempted, including the last one at
            // twice the minimum; past that the cast fails and the pixel
            // stays clear.
            let mut step = 1;
            loop {
                let distance = cloud_distance_max - step as f64 * cloud_distance_min;
                end = self
                    .geo_coding
                    .pixel_pos(line_with_angle(origin, distance, azimuth));
                step += 1;
                if end.is_some() || distance <= 2.0 * cloud_distance_min {
                    break;
                }
            }
        }
        let end = match end {
            Some(p) => p,
            None => return false,
        };

        let mut surface_altitude = grid.elevation[[uy, ux]] as f64;
        if surface_altitude.is_nan() || surface_altitude < 0.0 {
            surface_altitude = 0.0;
        }

        let ctp_raster = grid.cloud_top_pressure.as_ref().unwrap();
        let profile = grid.temperature_profile.as_ref().unwrap();
        let clip = flags.rect().intersection(&grid.scene_rect());

        for (px, py) in path_pixels(x, y, end.x as i32, end.y as i32, &clip) {
            if px == x && py == y {
                continue;
            }
            if !flags.contains(px, py, PixelFlags::CLOUD) {
                continue;
            }
            let (cx, cy) = (px as usize, py as usize);
            let cloud_geo = self
                .geo_coding
                .geo_pos(PixelPos::new(px as f64 + 0.5, py as f64 + 0.5));
            let dist = spherical_distance(origin, cloud_geo);
            let search_height = dist * tan_sza + surface_altitude;

            let ctp = ctp_raster[[cy, cx]] as f64;
            let slp = grid
                .sea_level_pressure
                .as_ref()
                .map(|r| r[[cy, cx]] as f64)
                .unwrap_or(DEFAULT_SEA_LEVEL_PRESSURE);
            let temperatures: Vec<f64> = profile
                .slice(ndarray::s![.., cy, cx])
                .iter()
                .map(|&t| t as f64)
                .collect();
            let cloud_height = refined_height_from_ctp(ctp, slp, &temperatures);
            let cloud_base = self.params.min_cloud_base.max(cloud_height - self.params.height_tolerance);

            if search_height <= cloud_height + self.params.height_tolerance
                && search_height >= cloud_base - self.params.height_tolerance
            {
                return true;
            }
        }
        false
    }
}

/// Mark a clear pixel as shadow when at least 6 pixels of its 3x3
/// neighbourhood are cloud, or at least 6 are already shadow.
fn fill_shadow_gaps(flags: &mut FlagRaster, target: &Rect) {
    let snapshot = flags.clone();
    let rect = *snapshot.rect();
    for y in target.y..target.y + target.height {
        for x in target.x..target.x + target.width {
            let f = snapshot.get(x, y);
            if f.is_cloud() || f.is_invalid() || f.is_cloud_shadow() {
                continue;
            }
            let mut n_cloud = 0;
            let mut n_shadow = 0;
            for ny in y - 1..=y + 1 {
                for nx in x - 1..=x + 1 {
                    if !rect.contains(nx, ny) {
                        continue;
                    }
                    let nf = snapshot.get(nx, ny);
                    if nf.is_cloud() {
                        n_cloud += 1;
                    }
                    if nf.is_cloud_shadow() {
                        n_shadow += 1;
                    }
                }
            }
            if n_cloud >= 6 || n_shadow >= 6 {
                flags.insert(x, y, PixelFlags::CLOUD_SHADOW);
            }
        }
    }
}

/// Mark a clear pixel as shadow when any of its 8 neighbours is shadow.
/// Runs on a snapshot so the belt grows by exactly one pixel.
fn extend_shadow_belt(flags: &mut FlagRaster, target: &Rect) {
    let snapshot = flags.clone();
    let rect = *snapshot.rect();
    for y in target.y..target.y + target.height {
        for x in target.x..target.x + target.width {
            let f = snapshot.get(x, y);
            if f.is_cloud() || f.is_invalid() || f.is_cloud_shadow() {
                continue;
            }
            'neighbours: for ny in y - 1..=y + 1 {
                for nx in x - 1..=x + 1 {
                    if (nx, ny) == (x, y) || !rect.contains(nx, ny) {
                        continue;
                    }
                    if snapshot.get(nx, ny).is_cloud_shadow() {
                        flags.insert(x, y, PixelFlags::CLOUD_SHADOW);
                        break 'neighbours;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AffineGeoCoding;
    use ndarray::{Array2, Array3};
    use std::sync::atomic::AtomicBool;

    const SIZE: usize = 40;
    const RESOLUTION_DEG: f64 = 60.0 * 180.0 / (std::f64::consts::PI * 6_372_000.0);

    const PROFILE_LOW_CLOUD: [f32; 25] = [
        279.76178, 276.8786, 275.2141, 273.40378, 270.1625, 268.1065, 261.449, 256.47284,
        247.98018, 237.19742, 225.11032, 218.98813, 217.61, 219.14716, 216.29794, 216.65158,
        214.7119, 212.98112, 214.11125, 222.45465, 229.25972, 242.21924, 261.0823, 267.98877,
        268.43387,
    ];

    fn test_geo_coding() -> AffineGeoCoding {
        AffineGeoCoding {
            origin_lat: 0.0,
            origin_lon: 10.0,
            lat_per_pixel: -RESOLUTION_DEG,
            lon_per_pixel: RESOLUTION_DEG,
            width: SIZE,
            height: SIZE,
        }
    }

    fn test_grid() -> PixelGrid {
        let dim = (SIZE, SIZE);
        let mut profile = Array3::zeros((25, SIZE, SIZE));
        for (level, &t) in PROFILE_LOW_CLOUD.iter().enumerate() {
            profile.slice_mut(ndarray::s![level, .., ..]).fill(t);
        }
        PixelGrid {
            width: SIZE,
            height: SIZE,
            reflectance: vec![Array2::from_elem(dim, 0.2)],
            elevation: Array2::zeros(dim),
            sun_zenith: Array2::from_elem(dim, 45.0),
            sun_azimuth: Array2::from_elem(dim, 180.0),
            view_zenith: Array2::zeros(dim),
            view_azimuth: Array2::from_elem(dim, 100.0),
            cloud_top_pressure: Some(Array2::from_elem(dim, 969.0744)),
            sea_level_pressure: Some(Array2::from_elem(dim, 1016.1385)),
            temperature_profile: Some(profile),
        }
    }

    fn cast_direction(grid: &PixelGrid, geo: &AffineGeoCoding, x: i32, y: i32) -> (i32, i32) {
        // Direction of the cast from (x, y), as a unit pixel step.
        let origin = geo.geo_pos(PixelPos::new(x as f64 + 0.5, y as f64 + 0.5));
        let saa = grid.sun_azimuth[[y as usize, x as usize]] as f64;
        let azimuth = saa.to_radians() + std::f64::consts::PI;
        let end = geo
            .pixel_pos(line_with_angle(origin, 600.0, azimuth))
            .unwrap();
        (
            ((end.x - (x as f64 + 0.5)).round() as i32).signum(),
            ((end.y - (y as f64 + 0.5)).round() as i32).signum(),
        )
    }

    #[test]
    fn test_shadow_found_for_cloud_on_ray() {
        let grid = test_grid();
        let geo = test_geo_coding();
        let scene = grid.scene_rect();
        let mut flags = FlagRaster::new(scene);
        for f in flags.iter_mut() {
            f.insert(PixelFlags::LAND);
        }

        let (px, py) = (20, 20);
        let (dx, dy) = cast_direction(&grid, &geo, px, py);
        // A small cloud 4 pixels down the ray; the low cloud top
        // (~384 m) matches a 240 m search height.
        let (cx, cy) = (px + 4 * dx, py + 4 * dy);
        for y in cy - 1..=cy + 1 {
            for x in cx - 1..=cx + 1 {
                flags.insert(x, y, PixelFlags::CLOUD);
            }
        }

        let detector = FrontsShadowDetector::new(&geo);
        let cancel = AtomicBool::new(false);
        detector.detect(&grid, &mut flags, &scene, &cancel).unwrap();

        assert!(flags.contains(px, py, PixelFlags::CLOUD_SHADOW));
        assert!(!flags.contains(cx, cy, PixelFlags::CLOUD_SHADOW));
        // Pixels far off the ray stay clear.
        assert!(!flags.contains(5, 5, PixelFlags::CLOUD_SHADOW));
    }

    #[test]
    fn test_shortened_cast_tries_minimum_distance() {
        let grid = test_grid();
        let geo = test_geo_coding();
        let scene = grid.scene_rect();
        let mut flags = FlagRaster::new(scene);
        for f in flags.iter_mut() {
            f.insert(PixelFlags::LAND);
        }

        // From this receiver every cast of 900 m or more leaves the
        // grid; only the final shortened distance of 600 m (twice the
        // minimum cloud distance at sza 45) lands on it again and can
        // reach the cloud four pixels down the ray.
        let (px, py) = (20, 26);
        let (dx, dy) = cast_direction(&grid, &geo, px, py);
        let (cx, cy) = (px + 4 * dx, py + 4 * dy);
        for y in cy - 1..=cy + 1 {
            for x in cx - 1..=cx + 1 {
                flags.insert(x, y, PixelFlags::CLOUD);
            }
        }

        let detector = FrontsShadowDetector::new(&geo);
        let cancel = AtomicBool::new(false);
        detector.detect(&grid, &mut flags, &scene, &cancel).unwrap();
        assert!(flags.contains(px, py, PixelFlags::CLOUD_SHADOW));
    }

    #[test]
    fn test_cloud_and_invalid_pixels_not_shadow_receivers() {
        let grid = test_grid();
        let geo = test_geo_coding();
        let scene = grid.scene_rect();
        let mut flags = FlagRaster::new(scene);
        for f in flags.iter_mut() {
            f.insert(PixelFlags::LAND);
        }
        let (px, py) = (20, 20);
        let (dx, dy) = cast_direction(&grid, &geo, px, py);
        let (cx, cy) = (px + 4 * dx, py + 4 * dy);
        for y in cy - 1..=cy + 1 {
            for x in cx - 1..=cx + 1 {
                flags.insert(x, y, PixelFlags::CLOUD);
            }
        }
        flags.insert(px, py, PixelFlags::INVALID);

        let detector = FrontsShadowDetector::new(&geo);
        let cancel = AtomicBool::new(false);
        detector.detect(&grid, &mut flags, &scene, &cancel).unwrap();
        assert!(!flags.contains(px, py, PixelFlags::CLOUD_SHADOW));
    }

    #[test]
    fn test_first_qualifying_cloud_decides() {
        let mut grid = test_grid();
        let geo = test_geo_coding();
        let scene = grid.scene_rect();
        let mut flags = FlagRaster::new(scene);
        for f in flags.iter_mut() {
            f.insert(PixelFlags::LAND);
        }

        let (px, py) = (20, 8);
        let (dx, dy) = cast_direction(&grid, &geo, px, py);
        let (near_x, near_y) = (px + 4 * dx, py + 4 * dy);
        let (far_x, far_y) = (px + 12 * dx, py + 12 * dy);
        flags.insert(near_x, near_y, PixelFlags::CLOUD);
        flags.insert(far_x, far_y, PixelFlags::CLOUD);
        // The far cloud carries an unusable pressure; only the near one
        // can qualify, and it does.
        grid.cloud_top_pressure.as_mut().unwrap()[[far_y as usize, far_x as usize]] = f32::NAN;

        let detector = FrontsShadowDetector::new(&geo);
        let cancel = AtomicBool::new(false);
        detector.detect(&grid, &mut flags, &scene, &cancel).unwrap();
        assert!(flags.contains(px, py, PixelFlags::CLOUD_SHADOW));
    }

    #[test]
    fn test_skips_without_pressure_data() {
        let mut grid = test_grid();
        grid.cloud_top_pressure = None;
        let geo = test_geo_coding();
        let scene = grid.scene_rect();
        let mut flags = FlagRaster::new(scene);
        flags.insert(10, 14, PixelFlags::CLOUD);

        let detector = FrontsShadowDetector::new(&geo);
        let cancel = AtomicBool::new(false);
        detector.detect(&grid, &mut flags, &scene, &cancel).unwrap();
        for f in flags.iter() {
            assert!(!f.is_cloud_shadow());
        }
    }

    #[test]
    fn test_detect_cancelled() {
        let grid = test_grid();
        let geo = test_geo_coding();
        let scene = grid.scene_rect();
        let mut flags = FlagRaster::new(scene);
        let detector = FrontsShadowDetector::new(&geo);
        let cancel = AtomicBool::new(true);
        let result = detector.detect(&grid, &mut flags, &scene, &cancel);
        assert!(matches!(result, Err(ShadowError::Cancelled)));
    }

    #[test]
    fn test_fill_gaps_and_belt() {
        let rect = Rect::new(0, 0, 9, 9);
        let mut flags = FlagRaster::new(rect);
        // A shadow ring around (4, 4); the hole gets filled, then the
        // belt grows the area by one pixel.
        for y in 3..=5 {
            for x in 3..=5 {
                if (x, y) != (4, 4) {
                    flags.insert(x, y, PixelFlags::CLOUD_SHADOW);
                }
            }
        }
        fill_shadow_gaps(&mut flags, &rect);
        assert!(flags.contains(4, 4, PixelFlags::CLOUD_SHADOW));

        extend_shadow_belt(&mut flags, &rect);
        assert!(flags.contains(2, 2, PixelFlags::CLOUD_SHADOW));
        assert!(!flags.contains(0, 0, PixelFlags::CLOUD_SHADOW));
    }
}
