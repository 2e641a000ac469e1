//! Scene-level shadow detection pipeline.
//!
//! Splits the scene into tiles, runs the per-tile candidate search and
//! brightness statistics in parallel, aggregates the statistics into a
//! scene-wide shadow offset and finishes each tile with the shifted and
//! clustered shadow flags before consolidating the result.

use std::sync::atomic::{AtomicBool, Ordering};

use ndarray::Array2;
#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::core::cluster::{identify_potential_shadows, PotentialShadows, RegionClusterer, RegionLabels};
use crate::core::consolidate::{
    enforce_exclusions, flag_cloud_buffer, flag_recommended_shadow, merge_mountain_shadow,
    prepare_classification,
};
use crate::core::fronts::FrontsShadowDetector;
use crate::core::gaps::flag_shadow_in_cloud_gaps;
use crate::core::offset::{
    apply_bulk_shift, choose_best_offset, find_scene_offsets, flag_shadow_combination, BulkShifter,
    TileStats,
};
use crate::core::path::{extended_source_rect, relative_path, scene_apparent_sun_azimuth};
use crate::types::{
    FlagRaster, GeoCoding, PixelGrid, PixelPos, Rect, ShadowConfig, ShadowError, ShadowResult,
};

/// Hard ceiling for shadow-casting cloud tops in metres
const MAX_CLOUD_HEIGHT: f64 = 8000.0;

/// Lower bound for the assumed cloud base in metres
const MIN_CLOUD_BASE: f64 = 100.0;

/// Sun zenith samples at or past this angle are ignored for the search
/// border; the tangent degenerates toward the terminator.
const MAX_BORDER_SUN_ZENITH: f64 = 89.0;

/// Latitude-dependent upper bound for cloud tops in metres; convection
/// reaches higher in the tropics than near the poles.
fn max_cloud_top(latitude: f64) -> f64 {
    let colat = 90.0 - latitude.abs();
    (0.5 * colat * colat + 25.0 * colat + 5000.0).ceil().min(MAX_CLOUD_HEIGHT)
}

/// Per-tile result of the pre-pass, kept until the scene offset is known
struct TileAnalysis {
    flags: FlagRaster,
    target: Rect,
    clouds: RegionLabels,
    potential: PotentialShadows,
    stats: TileStats,
}

/// Cloud shadow detection over a complete scene
pub struct CloudShadowProcessor {
    config: ShadowConfig,
}

impl CloudShadowProcessor {
    pub fn new(config: ShadowConfig) -> ShadowResult<Self> {
        if config.tile_size == 0 {
            return Err(ShadowError::Config("Tile size must be positive".to_string()));
        }
        if !(config.spatial_resolution > 0.0) {
            return Err(ShadowError::Config(
                "Spatial resolution must be positive".to_string(),
            ));
        }
        if !(config.gap_kernel_radius > 0.0) {
            return Err(ShadowError::Config(
                "Gap kernel radius must be positive".to_string(),
            ));
        }
        Ok(Self { config })
    }

    /// Runs the full pipeline and returns the consolidated flag raster.
    ///
    /// `classification` carries the input cloud/land/water/invalid
    /// classification over the whole scene; `mountain_shadow` is an
    /// optional precomputed terrain shadow mask. `cancel` is polled at
    /// scanline and tile boundaries.
    pub fn process(
        &self,
        grid: &PixelGrid,
        classification: &FlagRaster,
        geo_coding: &dyn GeoCoding,
        mountain_shadow: Option<&Array2<bool>>,
        cancel: &AtomicBool,
    ) -> ShadowResult<FlagRaster> {
        grid.validate()?;
        let scene = grid.scene_rect();
        if *classification.rect() != scene {
            return Err(ShadowError::Config(format!(
                "Classification rectangle {:?} does not match the scene {:?}",
                classification.rect(),
                scene
            )));
        }
        if let Some(mask) = mountain_shadow {
            if mask.dim() != (grid.height, grid.width) {
                return Err(ShadowError::Config(format!(
                    "Mountain shadow mask has shape {:?}, expected {:?}",
                    mask.dim(),
                    (grid.height, grid.width)
                )));
            }
        }

        let mut flags = classification.clone();
        prepare_classification(&mut flags);

        let best_offset = if self.config.compute_cloud_shadow {
            self.detect_shadow(grid, &mut flags, geo_coding, cancel)?
        } else {
            0
        };
        flag_recommended_shadow(&mut flags, best_offset);

        if self.config.compute_cloud_buffer {
            flag_cloud_buffer(
                &mut flags,
                self.config.cloud_buffer_width as i32,
                self.config.buffer_for_ambiguous_clouds,
            );
        }
        if self.config.merge_mountain_shadow {
            if let Some(mask) = mountain_shadow {
                merge_mountain_shadow(&mut flags, mask);
            }
        }
        enforce_exclusions(&mut flags);
        Ok(flags)
    }

    fn detect_shadow(
        &self,
        grid: &PixelGrid,
        flags: &mut FlagRaster,
        geo_coding: &dyn GeoCoding,
        cancel: &AtomicBool,
    ) -> ShadowResult<usize> {
        let scene = grid.scene_rect();

        // The per-pixel detector needs the pressure data; without it the
        // offset search below still runs.
        if grid.cloud_top_pressure.is_some() && grid.temperature_profile.is_some() {
            log::info!("Running per-pixel shadow detection");
            let detector = FrontsShadowDetector::new(geo_coding);
            detector.detect(grid, flags, &scene, cancel)?;
        }

        let (cx, cy) = (grid.width / 2, grid.height / 2);
        let sun_zenith = grid.sun_zenith[[cy, cx]] as f64;
        if !(0.0..90.0).contains(&sun_zenith) {
            return Err(ShadowError::Geometry(format!(
                "Sun zenith {} deg at scene centre is outside (0, 90)",
                sun_zenith
            )));
        }
        let center_geo =
            geo_coding.geo_pos(PixelPos::new(cx as f64 + 0.5, cy as f64 + 0.5));
        let apparent_azimuth = scene_apparent_sun_azimuth(
            grid.sun_azimuth[[cy, cx]] as f64,
            grid.view_zenith[[cy, cx]] as f64,
            grid.view_azimuth[[cy, cx]] as f64,
        );
        let cloud_top = max_cloud_top(center_geo.lat);
        let lowest = grid
            .elevation
            .iter()
            .map(|&v| v as f64)
            .filter(|v| !v.is_nan())
            .fold(f64::INFINITY, f64::min);
        let min_altitude = if lowest.is_finite() { lowest.max(0.0) } else { 0.0 };
        log::info!(
            "Scene geometry: sza {:.2} deg, apparent saa {:.2} deg, cloud top limit {} m",
            sun_zenith,
            apparent_azimuth,
            cloud_top
        );

        let path = relative_path(
            min_altitude,
            sun_zenith.to_radians(),
            apparent_azimuth.to_radians(),
            cloud_top,
            &scene,
            &scene,
            scene.width,
            scene.height,
            self.config.spatial_resolution,
            false,
            false,
        );
        if path.len() < 2 {
            log::warn!("Degenerate shadow path, skipping offset search");
            return Ok(0);
        }

        let max_sun_zenith = grid
            .sun_zenith
            .iter()
            .map(|&v| v as f64)
            .filter(|v| v.is_finite() && *v < MAX_BORDER_SUN_ZENITH)
            .fold(sun_zenith, f64::max);
        let border = (((MAX_CLOUD_HEIGHT / (90.0 - max_sun_zenith).to_radians().tan())
            / self.config.spatial_resolution)
            .ceil() as i32)
            .clamp(0, scene.width.max(scene.height));

        let tiles = self.tile_rects(&scene);
        log::info!("Pre-pass over {} tiles, path length {}", tiles.len(), path.len());

        let scene_flags: &FlagRaster = flags;
        let run_pre = |&(tile_id, target): &(usize, Rect)| {
            self.analyse_tile(
                grid,
                geo_coding,
                scene_flags,
                &path,
                target,
                extended_source_rect(scene.width, scene.height, &target, &path)
                    .grow_clipped(border, border, &scene),
                tile_id,
                sun_zenith,
                cloud_top,
                cancel,
            )
        };
        #[cfg(feature = "parallel")]
        let mut analyses = tiles
            .par_iter()
            .map(run_pre)
            .collect::<ShadowResult<Vec<_>>>()?;
        #[cfg(not(feature = "parallel"))]
        let mut analyses = tiles
            .iter()
            .map(run_pre)
            .collect::<ShadowResult<Vec<_>>>()?;

        let stats: Vec<TileStats> = analyses.iter().map(|a| a.stats.clone()).collect();
        let offsets = find_scene_offsets(&stats);
        let best_offset = choose_best_offset(offsets, &stats);
        log::info!("Best scene shadow offset: {} path steps", best_offset);

        let run_post = |a: &mut TileAnalysis| self.finish_tile(grid, a, &path, best_offset, cancel);
        #[cfg(feature = "parallel")]
        analyses.par_iter_mut().try_for_each(run_post)?;
        #[cfg(not(feature = "parallel"))]
        analyses.iter_mut().try_for_each(run_post)?;

        for analysis in &analyses {
            merge_target(flags, &analysis.flags, &analysis.target);
        }
        Ok(best_offset)
    }

    #[allow(clippy::too_many_arguments)]
    fn analyse_tile(
        &self,
        grid: &PixelGrid,
        geo_coding: &dyn GeoCoding,
        scene_flags: &FlagRaster,
        path: &[(i32, i32)],
        target: Rect,
        source: Rect,
        tile_id: usize,
        sun_zenith: f64,
        cloud_top: f64,
        cancel: &AtomicBool,
    ) -> ShadowResult<TileAnalysis> {
        if cancel.load(Ordering::Relaxed) {
            return Err(ShadowError::Cancelled);
        }
        let mut tile_flags = FlagRaster::new(source);
        tile_flags.merge(scene_flags);

        if tile_flags.iter().all(|f| f.is_invalid()) {
            log::debug!("Tile {} is completely invalid, skipped", tile_id);
            return Ok(TileAnalysis {
                flags: tile_flags,
                target,
                clouds: RegionLabels::default(),
                potential: PotentialShadows::default(),
                stats: TileStats::empty(tile_id, path.len()),
            });
        }

        let clouds =
            RegionClusterer::new(self.config.connectivity).label(&tile_flags, crate::types::PixelFlags::CLOUD);
        let potential = identify_potential_shadows(
            grid,
            geo_coding,
            &mut tile_flags,
            &clouds,
            path,
            sun_zenith,
            MIN_CLOUD_BASE,
            cloud_top,
        );
        let stats = BulkShifter::new(self.config.mode)
            .compute_stats(grid, &mut tile_flags, path, tile_id);
        Ok(TileAnalysis {
            flags: tile_flags,
            target,
            clouds,
            potential,
            stats,
        })
    }

    fn finish_tile(
        &self,
        grid: &PixelGrid,
        analysis: &mut TileAnalysis,
        path: &[(i32, i32)],
        best_offset: usize,
        cancel: &AtomicBool,
    ) -> ShadowResult<()> {
        if cancel.load(Ordering::Relaxed) {
            return Err(ShadowError::Cancelled);
        }
        apply_bulk_shift(&mut analysis.flags, path, best_offset);
        flag_shadow_combination(
            grid,
            &mut analysis.flags,
            &analysis.clouds,
            &analysis.potential,
            self.config.mode,
            self.config.analysis_thresholds,
        );
        flag_shadow_in_cloud_gaps(
            &mut analysis.flags,
            self.config.connectivity,
            best_offset,
            self.config.gap_kernel_radius,
            self.config.spatial_resolution,
        );
        Ok(())
    }

    fn tile_rects(&self, scene: &Rect) -> Vec<(usize, Rect)> {
        let size = self.config.tile_size as i32;
        let mut tiles = Vec::new();
        let mut tile_id = 0;
        for y in (0..scene.height).step_by(self.config.tile_size) {
            for x in (0..scene.width).step_by(self.config.tile_size) {
                let width = size.min(scene.width - x);
                let height = size.min(scene.height - y);
                tiles.push((tile_id, Rect::new(x, y, width, height)));
                tile_id += 1;
            }
        }
        tiles
    }
}

/// OR all flags from the tile raster into the scene raster, restricted
/// to the tile's target rectangle. Flags set outside the target belong
/// to neighbouring tiles.
fn merge_target(scene_flags: &mut FlagRaster, tile_flags: &FlagRaster, target: &Rect) {
    for y in target.y..target.y + target.height {
        for x in target.x..target.x + target.width {
            let merged = scene_flags.get(x, y).union(tile_flags.get(x, y));
            scene_flags.set(x, y, merged);
        }
    }
}
