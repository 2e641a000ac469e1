//! Cloud region clustering and potential shadow identification.

use std::collections::{HashMap, HashSet};

use crate::core::path::surface_distance;
use crate::types::{
    Connectivity, FlagRaster, GeoCoding, PixelFlags, PixelGrid, PixelPos,
};

/// Connected components over a flag raster.
///
/// Region ids start at 1; id 0 marks unlabeled pixels. Indices are local
/// to the raster rectangle in row-major order.
#[derive(Debug, Default)]
pub struct RegionLabels {
    pub ids: Vec<i32>,
    pub regions: HashMap<i32, Vec<usize>>,
}

/// Labels contiguous areas sharing a flag bit
pub struct RegionClusterer {
    connectivity: Connectivity,
}

impl RegionClusterer {
    pub fn new(connectivity: Connectivity) -> Self {
        Self { connectivity }
    }

    fn neighbour_offsets(&self) -> &'static [(i32, i32)] {
        match self.connectivity {
            Connectivity::Four => &[(0, -1), (-1, 0), (1, 0), (0, 1)],
            Connectivity::Eight => &[
                (-1, -1),
                (0, -1),
                (1, -1),
                (-1, 0),
                (1, 0),
                (-1, 1),
                (0, 1),
                (1, 1),
            ],
        }
    }

    /// Flood-fill labeling of all pixels carrying `bits`
    pub fn label(&self, flags: &FlagRaster, bits: u16) -> RegionLabels {
        let rect = *flags.rect();
        let width = rect.width as usize;
        let len = rect.area();
        let mut ids = vec![0i32; len];
        let mut regions: HashMap<i32, Vec<usize>> = HashMap::new();
        let mut next_id = 1;
        let mut stack = Vec::new();

        for start in 0..len {
            if ids[start] != 0 {
                continue;
            }
            let sx = rect.x + (start % width) as i32;
            let sy = rect.y + (start / width) as i32;
            if !flags.contains(sx, sy, bits) {
                continue;
            }
            let id = next_id;
            next_id += 1;
            let mut members = Vec::new();
            ids[start] = id;
            stack.push((sx, sy));
            while let Some((x, y)) = stack.pop() {
                let index = ((y - rect.y) as usize) * width + (x - rect.x) as usize;
                members.push(index);
                for (dx, dy) in self.neighbour_offsets() {
                    let (nx, ny) = (x + dx, y + dy);
                    if !rect.contains(nx, ny) {
                        continue;
                    }
                    let n_index = ((ny - rect.y) as usize) * width + (nx - rect.x) as usize;
                    if ids[n_index] == 0 && flags.contains(nx, ny, bits) {
                        ids[n_index] = id;
                        stack.push((nx, ny));
                    }
                }
            }
            regions.insert(id, members);
        }
        log::debug!("Labeled {} regions", regions.len());
        RegionLabels { ids, regions }
    }
}

/// Candidate shadow positions per cloud region.
///
/// `positions` and `steps` are parallel: `steps[id][k]` is the path step
/// at which `positions[id][k]` was first reached from region `id`.
#[derive(Debug, Default)]
pub struct PotentialShadows {
    pub positions: HashMap<i32, Vec<usize>>,
    pub steps: HashMap<i32, Vec<usize>>,
}

/// Walks the shared cloud path from every member pixel of every cloud
/// region, flags reachable clear pixels as potential cloud shadow and
/// records which step reached them.
///
/// A candidate only qualifies when the height implied by the cast
/// geometry falls inside the assumed cloud vertical extent
/// (`min_cloud_base`..`max_cloud_top`, metres).
#[allow(clippy::too_many_arguments)]
pub fn identify_potential_shadows(
    grid: &PixelGrid,
    geo_coding: &dyn GeoCoding,
    flags: &mut FlagRaster,
    clouds: &RegionLabels,
    path: &[(i32, i32)],
    sun_zenith_mean: f64,
    min_cloud_base: f64,
    max_cloud_top: f64,
) -> PotentialShadows {
    let rect = *flags.rect();
    let width = rect.width as usize;
    let tan_elevation = (std::f64::consts::FRAC_PI_2 - sun_zenith_mean.to_radians()).tan();
    let mut result = PotentialShadows::default();

    for (&region_id, members) in &clouds.regions {
        let mut seen: HashSet<usize> = HashSet::new();
        let positions = result.positions.entry(region_id).or_default();
        let steps = result.steps.entry(region_id).or_default();

        for &member in members {
            let x = rect.x + (member % width) as i32;
            let y = rect.y + (member / width) as i32;
            let origin_geo = geo_coding.geo_pos(PixelPos::new(x as f64 + 0.5, y as f64 + 0.5));
            let origin_alt = grid.elevation[[y as usize, x as usize]] as f64;

            for (step, &(dx, dy)) in path.iter().enumerate().skip(1) {
                let (tx, ty) = (x + dx, y + dy);
                if !rect.contains(tx, ty) {
                    continue;
                }
                let f = flags.get(tx, ty);
                if f.is_cloud() || f.is_invalid() {
                    continue;
                }
                let target_geo =
                    geo_coding.geo_pos(PixelPos::new(tx as f64 + 0.5, ty as f64 + 0.5));
                let target_alt = grid.elevation[[ty as usize, tx as usize]] as f64;
                let (dist, min_alt) =
                    surface_distance(origin_geo, target_geo, origin_alt, target_alt);
                let search_height = dist * tan_elevation + (origin_alt - min_alt);
                if !(min_cloud_base <= search_height && search_height <= max_cloud_top) {
                    continue;
                }
                flags.insert(tx, ty, PixelFlags::POTENTIAL_CLOUD_SHADOW);
                let index = ((ty - rect.y) as usize) * width + (tx - rect.x) as usize;
                if seen.insert(index) {
                    positions.push(index);
                    steps.push(step);
                }
            }
        }
    }
    result
}
