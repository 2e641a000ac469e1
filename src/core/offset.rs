//! Scene-wide shadow offset search.
//!
//! Clouds in one scene cast shadows at nearly the same path offset, so
//! the offset is searched globally: every tile records the mean
//! brightness of the shifted cloud mask per path step, the curves are
//! aggregated over the scene and the first interior brightness minimum
//! gives the best offset. Statistics are kept separately for all, land
//! and water receivers.

use crate::core::cluster::{PotentialShadows, RegionLabels};
use crate::types::{AnalysisMode, FlagRaster, PixelFlags, PixelGrid};

const KMEANS_CLUSTER_COUNT: usize = 4;
const KMEANS_MAX_ITERATIONS: usize = 30;

/// Per-tile statistics recorded during the pre-pass.
///
/// Curves are indexed by path step; entry 0 is never written. The record
/// is immutable once the tile is done; aggregation works on copies.
#[derive(Debug, Clone)]
pub struct TileStats {
    pub tile_id: usize,
    /// Mean brightness per step over all / land / water receivers
    pub mean_reflectance: [Vec<f64>; 3],
    pub n_cloud_over_land: usize,
    pub n_cloud_over_water: usize,
    pub n_valid: usize,
}

impl TileStats {
    /// Record for a tile that was skipped, flat zero curves
    pub fn empty(tile_id: usize, path_length: usize) -> Self {
        Self {
            tile_id,
            mean_reflectance: [
                vec![0.0; path_length],
                vec![0.0; path_length],
                vec![0.0; path_length],
            ],
            n_cloud_over_land: 0,
            n_cloud_over_water: 0,
            n_valid: 0,
        }
    }
}

/// Shifts the cloud mask step by step along the path and records
/// receiver brightness statistics
pub struct BulkShifter {
    mode: AnalysisMode,
}

impl BulkShifter {
    pub fn new(mode: AnalysisMode) -> Self {
        Self { mode }
    }

    /// Brightness measure for the analysis mode. Land/water analysis
    /// uses the second configured band, single band the first,
    /// multi-band the average.
    fn brightness(&self, grid: &PixelGrid, x: usize, y: usize) -> f64 {
        match self.mode {
            AnalysisMode::SingleBand => grid.reflectance[0][[y, x]] as f64,
            AnalysisMode::LandWater => {
                let band = grid.reflectance.get(1).unwrap_or(&grid.reflectance[0]);
                band[[y, x]] as f64
            }
            AnalysisMode::MultiBand => {
                let sum: f64 = grid.reflectance.iter().map(|b| b[[y, x]] as f64).sum();
                sum / grid.reflectance.len() as f64
            }
        }
    }

    /// Walk all path steps, flag reachable clear pixels as potential
    /// shadow and record the per-step mean brightness curves plus the
    /// tile's cloud-over-land/water counts.
    pub fn compute_stats(
        &self,
        grid: &PixelGrid,
        flags: &mut FlagRaster,
        path: &[(i32, i32)],
        tile_id: usize,
    ) -> TileStats {
        let rect = *flags.rect();
        let mut cloud_pixels = Vec::new();
        let mut n_cloud_over_land = 0;
        let mut n_cloud_over_water = 0;
        let mut n_valid = 0;
        for y in rect.y..rect.y + rect.height {
            for x in rect.x..rect.x + rect.width {
                let f = flags.get(x, y);
                if !f.is_invalid() {
                    n_valid += 1;
                }
                if f.is_cloud() {
                    cloud_pixels.push((x, y));
                    if f.is_land() {
                        n_cloud_over_land += 1;
                    }
                    if f.is_water() {
                        n_cloud_over_water += 1;
                    }
                }
            }
        }

        let mut mean_reflectance = [
            vec![0.0; path.len()],
            vec![0.0; path.len()],
            vec![0.0; path.len()],
        ];
        for (step, &(dx, dy)) in path.iter().enumerate().skip(1) {
            let mut sums = [0.0f64; 3];
            let mut counts = [0usize; 3];
            for &(x, y) in &cloud_pixels {
                let (tx, ty) = (x + dx, y + dy);
                if !rect.contains(tx, ty) {
                    continue;
                }
                let f = flags.get(tx, ty);
                if f.is_cloud() || f.is_invalid() {
                    continue;
                }
                flags.insert(tx, ty, PixelFlags::POTENTIAL_CLOUD_SHADOW);
                let value = self.brightness(grid, tx as usize, ty as usize);
                sums[0] += value;
                counts[0] += 1;
                if f.is_land() {
                    sums[1] += value;
                    counts[1] += 1;
                }
                if f.is_water() {
                    sums[2] += value;
                    counts[2] += 1;
                }
            }
            for j in 0..3 {
                if counts[j] > 0 {
                    mean_reflectance[j][step] = sums[j] / counts[j] as f64;
                }
            }
        }

        TileStats {
            tile_id,
            mean_reflectance,
            n_cloud_over_land,
            n_cloud_over_water,
            n_valid,
        }
    }
}

/// Indices of the relative minima of `x`, in candidate order: first
/// sample, last sample (each judged against its single neighbour), then
/// the strict interior minima. An array containing NaN yields only the
/// two boundary indices, which later exclusion removes.
pub fn relative_minima(x: &[f64]) -> Vec<usize> {
    let lx = x.len();
    let mut indices = Vec::new();
    if lx == 0 {
        return indices;
    }
    if lx == 1 {
        indices.push(0);
        return indices;
    }
    if x.iter().any(|v| v.is_nan()) {
        indices.push(0);
        indices.push(lx - 1);
        return indices;
    }
    if -x[0] > -x[1] {
        indices.push(0);
    }
    if -x[lx - 1] > -x[lx - 2] {
        indices.push(lx - 1);
    }
    for i in 1..lx - 1 {
        if -x[i] > -x[i - 1] && -x[i] > -x[i + 1] {
            indices.push(i);
        }
    }
    indices
}

fn interior_minima(x: &[f64]) -> Vec<usize> {
    let lx = x.len();
    relative_minima(x)
        .into_iter()
        .filter(|&i| i != 0 && i != lx.saturating_sub(1))
        .collect()
}

/// Aggregates the per-tile brightness curves and finds the best offset
/// independently for the all/land/water statistics.
///
/// Tiles without an interior minimum, with NaN in the curve, or whose
/// first minimum lies in the second half of the path are excluded from
/// the aggregation. Each remaining curve is normalized by its own
/// maximum before summation, then the first interior minimum of the sum
/// is the offset (0 when none exists).
pub fn find_scene_offsets(tiles: &[TileStats]) -> [usize; 3] {
    let mut offsets = [0usize; 3];
    if tiles.is_empty() {
        return offsets;
    }
    let path_length = tiles
        .iter()
        .map(|t| t.mean_reflectance[0].len())
        .max()
        .unwrap_or(0);

    for j in 0..3 {
        let mut scaled_total = vec![0.0f64; path_length];
        for tile in tiles {
            let curve = &tile.mean_reflectance[j];
            let minima = interior_minima(curve);
            let exclude = match minima.first() {
                None => true,
                Some(&first) => first as f64 > curve.len() as f64 / 2.0,
            };
            if exclude {
                continue;
            }
            let max_value = curve.iter().cloned().filter(|v| !v.is_nan()).fold(0.0, f64::max);
            if max_value <= 0.0 {
                continue;
            }
            for (i, &v) in curve.iter().enumerate() {
                if !v.is_nan() {
                    scaled_total[i] += v / max_value;
                }
            }
        }
        if let Some(&first) = interior_minima(&scaled_total).first() {
            offsets[j] = first;
        }
    }
    log::debug!(
        "Scene offsets: all={} land={} water={}",
        offsets[0],
        offsets[1],
        offsets[2]
    );
    offsets
}

/// Picks among the all/land/water offsets by cloud population: a surface
/// type holding more than twice the other's cloud pixels wins.
pub fn choose_best_offset(offsets: [usize; 3], tiles: &[TileStats]) -> usize {
    let n_land: usize = tiles.iter().map(|t| t.n_cloud_over_land).sum();
    let n_water: usize = tiles.iter().map(|t| t.n_cloud_over_water).sum();
    let n_all = n_land + n_water;
    if n_all == 0 {
        return offsets[0];
    }
    let rel_land = n_land as f64 / n_all as f64;
    let rel_water = n_water as f64 / n_all as f64;
    if rel_land > 2.0 * rel_water {
        offsets[1]
    } else if rel_water > 2.0 * rel_land {
        offsets[2]
    } else {
        offsets[0]
    }
}

/// Translates the whole cloud mask by the chosen path step and flags
/// clear valid receivers as shifted cloud shadow.
pub fn apply_bulk_shift(flags: &mut FlagRaster, path: &[(i32, i32)], best_offset: usize) {
    if best_offset == 0 || best_offset >= path.len() {
        return;
    }
    let rect = *flags.rect();
    let (dx, dy) = path[best_offset];
    let mut cloud_pixels = Vec::new();
    for y in rect.y..rect.y + rect.height {
        for x in rect.x..rect.x + rect.width {
            if flags.contains(x, y, PixelFlags::CLOUD) {
                cloud_pixels.push((x, y));
            }
        }
    }
    for (x, y) in cloud_pixels {
        let (tx, ty) = (x + dx, y + dy);
        if !rect.contains(tx, ty) {
            continue;
        }
        let f = flags.get(tx, ty);
        if !f.is_cloud() && !f.is_invalid() {
            flags.insert(tx, ty, PixelFlags::SHIFTED_CLOUD_SHADOW);
        }
    }
}

/// One-dimensional k-means over brightness values. Returns the centroid
/// assignment per value and the centroids, darkest first.
fn kmeans_brightness(values: &[f64], cluster_count: usize) -> (Vec<usize>, Vec<f64>) {
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let k = cluster_count.min(values.len()).max(1);
    let mut centroids: Vec<f64> = (0..k)
        .map(|i| min + (max - min) * (i as f64 + 0.5) / k as f64)
        .collect();
    let mut assignment = vec![0usize; values.len()];
    for _ in 0..KMEANS_MAX_ITERATIONS {
        let mut changed = false;
        for (vi, &v) in values.iter().enumerate() {
            let mut best = 0;
            let mut best_dist = f64::INFINITY;
            for (ci, &c) in centroids.iter().enumerate() {
                let d = (v - c).abs();
                if d < best_dist {
                    best_dist = d;
                    best = ci;
                }
            }
            if assignment[vi] != best {
                assignment[vi] = best;
                changed = true;
            }
        }
        let mut sums = vec![0.0; k];
        let mut counts = vec![0usize; k];
        for (vi, &ci) in assignment.iter().enumerate() {
            sums[ci] += values[vi];
            counts[ci] += 1;
        }
        for ci in 0..k {
            if counts[ci] > 0 {
                centroids[ci] = sums[ci] / counts[ci] as f64;
            }
        }
        if !changed {
            break;
        }
    }
    (assignment, centroids)
}

/// Combines the clustered and the shifted shadow evidence.
///
/// Per cloud region the candidate brightness values are clustered and
/// the darkest cluster becomes clustered cloud shadow, provided a
/// member is darker than the region mean plus the threshold for its
/// surface type (all/land/water). The combination flag is then the
/// union of clustered and shifted shadow.
pub fn flag_shadow_combination(
    grid: &PixelGrid,
    flags: &mut FlagRaster,
    clouds: &RegionLabels,
    potential: &PotentialShadows,
    mode: AnalysisMode,
    thresholds: [f64; 3],
) {
    let rect = *flags.rect();
    let width = rect.width as usize;
    let shifter = BulkShifter::new(mode);

    for region_id in clouds.regions.keys() {
        let positions = match potential.positions.get(region_id) {
            Some(p) if p.len() > 1 => p,
            _ => continue,
        };
        let mut usable: Vec<(usize, f64)> = Vec::with_capacity(positions.len());
        for &index in positions {
            let x = rect.x + (index % width) as i32;
            let y = rect.y + (index / width) as i32;
            let value = shifter.brightness(grid, x as usize, y as usize);
            if !value.is_nan() {
                usable.push((index, value));
            }
        }
        if usable.len() < 2 {
            continue;
        }
        let values: Vec<f64> = usable.iter().map(|&(_, v)| v).collect();
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let (assignment, centroids) = kmeans_brightness(&values, KMEANS_CLUSTER_COUNT);
        let darkest = centroids
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(i, _)| i)
            .unwrap_or(0);
        for (k, &(index, value)) in usable.iter().enumerate() {
            if assignment[k] != darkest {
                continue;
            }
            let x = rect.x + (index % width) as i32;
            let y = rect.y + (index / width) as i32;
            let f = flags.get(x, y);
            let threshold = if f.is_land() {
                thresholds[1]
            } else if f.is_water() {
                thresholds[2]
            } else {
                thresholds[0]
            };
            if value < mean + threshold {
                flags.insert(x, y, PixelFlags::CLOUD_SHADOW);
            }
        }
    }

    for y in rect.y..rect.y + rect.height {
        for x in rect.x..rect.x + rect.width {
            let f = flags.get(x, y);
            if f.contains(PixelFlags::CLOUD_SHADOW | PixelFlags::SHIFTED_CLOUD_SHADOW) {
                flags.insert(x, y, PixelFlags::CLOUD_SHADOW_COMB);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Rect;
    use ndarray::Array2;

    fn grid_with_reflectance(size: usize, reflectance: Array2<f32>) -> PixelGrid {
        let dim = (size, size);
        PixelGrid {
            width: size,
            height: size,
            reflectance: vec![reflectance],
            elevation: Array2::zeros(dim),
            sun_zenith: Array2::from_elem(dim, 30.0),
            sun_azimuth: Array2::from_elem(dim, 180.0),
            view_zenith: Array2::zeros(dim),
            view_azimuth: Array2::from_elem(dim, 100.0),
            cloud_top_pressure: None,
            sea_level_pressure: None,
            temperature_profile: None,
        }
    }

    #[test]
    fn test_relative_minima_interior_dip() {
        let x = [3.0, 2.0, 1.0, 2.0, 3.0];
        assert_eq!(relative_minima(&x), vec![2]);
    }

    #[test]
    fn test_relative_minima_boundaries() {
        let x = [1.0, 2.0, 3.0, 2.5];
        // First sample beats its neighbour, last sample beats its
        // neighbour; both are boundary candidates only.
        assert_eq!(relative_minima(&x), vec![0, 3]);
        assert!(interior_minima(&x).is_empty());
    }

    #[test]
    fn test_relative_minima_nan_gives_boundaries() {
        let x = [1.0, f64::NAN, 0.5, 2.0];
        assert_eq!(relative_minima(&x), vec![0, 3]);
    }

    #[test]
    fn test_offset_recovered_from_dark_patch() {
        let size = 30;
        let mut reflectance = Array2::from_elem((size, size), 0.5f32);
        // Dark patch where the cloud square, shifted six steps down the
        // path, would land.
        for y in 11..16 {
            for x in 5..10 {
                reflectance[[y, x]] = 0.05;
            }
        }
        let grid = grid_with_reflectance(size, reflectance);
        let rect = Rect::new(0, 0, size as i32, size as i32);
        let mut flags = FlagRaster::new(rect);
        for f in flags.iter_mut() {
            f.insert(PixelFlags::LAND);
        }
        for y in 5..10 {
            for x in 5..10 {
                flags.insert(x, y, PixelFlags::CLOUD);
            }
        }
        let path: Vec<(i32, i32)> = (0..12).map(|i| (0, i)).collect();

        let shifter = BulkShifter::new(AnalysisMode::SingleBand);
        let stats = shifter.compute_stats(&grid, &mut flags, &path, 0);
        assert_eq!(stats.n_cloud_over_land, 25);
        assert_eq!(stats.n_cloud_over_water, 0);

        let offsets = find_scene_offsets(&[stats.clone()]);
        assert_eq!(offsets[0], 6);
        assert_eq!(offsets[1], 6);
        // No water receivers, so the water curve never dips.
        assert_eq!(offsets[2], 0);

        let best = choose_best_offset(offsets, &[stats]);
        assert_eq!(best, 6);
    }

    #[test]
    fn test_choose_best_offset_dominance() {
        let make = |land: usize, water: usize| TileStats {
            tile_id: 0,
            mean_reflectance: [vec![], vec![], vec![]],
            n_cloud_over_land: land,
            n_cloud_over_water: water,
            n_valid: 100,
        };
        let offsets = [3, 4, 5];
        assert_eq!(choose_best_offset(offsets, &[make(90, 10)]), 4);
        assert_eq!(choose_best_offset(offsets, &[make(10, 90)]), 5);
        assert_eq!(choose_best_offset(offsets, &[make(50, 50)]), 3);
    }

    #[test]
    fn test_apply_bulk_shift_marks_receivers() {
        let rect = Rect::new(0, 0, 10, 10);
        let mut flags = FlagRaster::new(rect);
        flags.insert(2, 2, PixelFlags::CLOUD);
        flags.insert(2, 6, PixelFlags::INVALID);
        let path: Vec<(i32, i32)> = (0..6).map(|i| (0, i)).collect();

        apply_bulk_shift(&mut flags, &path, 3);
        assert!(flags.contains(2, 5, PixelFlags::SHIFTED_CLOUD_SHADOW));

        apply_bulk_shift(&mut flags, &path, 4);
        // Invalid pixels never receive the shifted flag.
        assert!(!flags.contains(2, 6, PixelFlags::SHIFTED_CLOUD_SHADOW));
    }

    #[test]
    fn test_combination_flags_dark_cluster_only() {
        use crate::core::cluster::{PotentialShadows, RegionClusterer};
        use crate::types::Connectivity;

        let size = 20;
        let mut reflectance = Array2::from_elem((size, size), 0.5f32);
        reflectance[[12, 5]] = 0.05;
        reflectance[[12, 6]] = 0.05;
        let grid = grid_with_reflectance(size, reflectance);
        let rect = Rect::new(0, 0, size as i32, size as i32);
        let mut flags = FlagRaster::new(rect);
        for f in flags.iter_mut() {
            f.insert(PixelFlags::LAND);
        }
        flags.insert(5, 5, PixelFlags::CLOUD);
        flags.insert(6, 5, PixelFlags::CLOUD);
        let clouds = RegionClusterer::new(Connectivity::Eight).label(&flags, PixelFlags::CLOUD);

        let index = |x: usize, y: usize| y * size + x;
        let mut potential = PotentialShadows::default();
        potential
            .positions
            .insert(1, vec![index(5, 8), index(6, 8), index(5, 12), index(6, 12)]);
        potential.steps.insert(1, vec![3, 3, 7, 7]);

        flag_shadow_combination(
            &grid,
            &mut flags,
            &clouds,
            &potential,
            AnalysisMode::SingleBand,
            [0.01, -0.11, 0.01],
        );
        assert!(flags.contains(5, 12, PixelFlags::CLOUD_SHADOW));
        assert!(flags.contains(6, 12, PixelFlags::CLOUD_SHADOW));
        assert!(flags.contains(5, 12, PixelFlags::CLOUD_SHADOW_COMB));
        assert!(!flags.contains(5, 8, PixelFlags::CLOUD_SHADOW));
    }

    #[test]
    fn test_combination_skips_uniform_brightness() {
        use crate::core::cluster::{PotentialShadows, RegionClusterer};
        use crate::types::Connectivity;

        let size = 20;
        let grid = grid_with_reflectance(size, Array2::from_elem((size, size), 0.2f32));
        let rect = Rect::new(0, 0, size as i32, size as i32);
        let mut flags = FlagRaster::new(rect);
        for f in flags.iter_mut() {
            f.insert(PixelFlags::LAND);
        }
        flags.insert(5, 5, PixelFlags::CLOUD);
        let clouds = RegionClusterer::new(Connectivity::Eight).label(&flags, PixelFlags::CLOUD);

        let mut potential = PotentialShadows::default();
        potential.positions.insert(1, vec![8 * size + 5, 9 * size + 5]);
        potential.steps.insert(1, vec![3, 4]);

        flag_shadow_combination(
            &grid,
            &mut flags,
            &clouds,
            &potential,
            AnalysisMode::SingleBand,
            [0.01, -0.11, 0.01],
        );
        for f in flags.iter() {
            assert!(!f.contains(PixelFlags::CLOUD_SHADOW));
        }
    }

    #[test]
    fn test_kmeans_separates_dark_cluster() {
        let values = [0.05, 0.06, 0.5, 0.52, 0.55, 0.9];
        let (assignment, centroids) = kmeans_brightness(&values, 4);
        let darkest = centroids
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(assignment[0], darkest);
        assert_eq!(assignment[1], darkest);
        assert_ne!(assignment[2], darkest);
    }
}
