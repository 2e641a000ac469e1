//! Shadow detection inside gaps of broken cloud fields.
//!
//! Shifting the whole cloud mask places shadow into openings between
//! clouds where the brightness statistics are unreliable. A local
//! cloud-density contrast identifies those openings and shifted shadow
//! regions touching them get an extra flag so consumers can treat them
//! with less confidence.

use crate::core::cluster::RegionClusterer;
use crate::types::{Connectivity, FlagRaster, PixelFlags};

/// Fraction of the kernel radius covered by the inner disc
const INNER_KERNEL_FACTOR: f64 = 0.8;

/// A pixel is inside a cloud gap when the inner disc is at least this
/// much less cloudy than the surrounding annulus.
const GAP_CONTRAST_THRESHOLD: f64 = -0.1;

/// Kernel width in pixels for a metric radius in metres
pub fn kernel_block_size(kernel_radius_m: f64, resolution_m: f64) -> usize {
    2 * (kernel_radius_m / resolution_m).ceil() as usize + 1
}

/// Marks shifted shadow regions that coincide with openings in the
/// cloud field.
///
/// The gap metric is the mean cloud indicator over the inner disc minus
/// the mean over the annulus between inner and full kernel radius,
/// evaluated over valid pixels only. Every contiguous shifted-shadow
/// region containing at least one gap pixel gets the gap flag on all of
/// its clear valid members. Does nothing when no offset was found or
/// the kernel does not fit into the raster.
pub fn flag_shadow_in_cloud_gaps(
    flags: &mut FlagRaster,
    connectivity: Connectivity,
    best_offset: usize,
    kernel_radius_m: f64,
    resolution_m: f64,
) {
    if best_offset == 0 {
        return;
    }
    let rect = *flags.rect();
    let block_size = kernel_block_size(kernel_radius_m, resolution_m);
    if block_size >= rect.width.min(rect.height) as usize {
        log::debug!(
            "Gap kernel ({} px) does not fit into {}x{} raster, skipping gap analysis",
            block_size,
            rect.width,
            rect.height
        );
        return;
    }

    let half = (block_size / 2) as i32;
    let inner_radius = INNER_KERNEL_FACTOR * kernel_radius_m;
    let mut inner_offsets = Vec::new();
    let mut annulus_offsets = Vec::new();
    for dy in -half..=half {
        for dx in -half..=half {
            let dist = resolution_m * f64::hypot(dx as f64, dy as f64);
            if dist <= inner_radius {
                inner_offsets.push((dx, dy));
            } else if dist <= kernel_radius_m {
                annulus_offsets.push((dx, dy));
            }
        }
    }

    let width = rect.width as usize;
    let mut gap = vec![false; rect.area()];
    for y in rect.y..rect.y + rect.height {
        for x in rect.x..rect.x + rect.width {
            let f = flags.get(x, y);
            if f.is_cloud() || f.is_invalid() {
                continue;
            }
            let inner = mean_cloud_indicator(flags, x, y, &inner_offsets);
            let annulus = mean_cloud_indicator(flags, x, y, &annulus_offsets);
            if let (Some(inner), Some(annulus)) = (inner, annulus) {
                if inner - annulus < GAP_CONTRAST_THRESHOLD {
                    let index = ((y - rect.y) as usize) * width + (x - rect.x) as usize;
                    gap[index] = true;
                }
            }
        }
    }

    let regions = RegionClusterer::new(connectivity)
        .label(flags, PixelFlags::SHIFTED_CLOUD_SHADOW);
    for members in regions.regions.values() {
        if !members.iter().any(|&m| gap[m]) {
            continue;
        }
        for &member in members {
            let x = rect.x + (member % width) as i32;
            let y = rect.y + (member / width) as i32;
            let f = flags.get(x, y);
            if !f.is_cloud() && !f.is_invalid() {
                flags.insert(x, y, PixelFlags::SHIFTED_CLOUD_SHADOW_GAPS);
            }
        }
    }
}

fn mean_cloud_indicator(
    flags: &FlagRaster,
    x: i32,
    y: i32,
    offsets: &[(i32, i32)],
) -> Option<f64> {
    let rect = flags.rect();
    let mut sum = 0.0;
    let mut count = 0usize;
    for &(dx, dy) in offsets {
        let (sx, sy) = (x + dx, y + dy);
        if !rect.contains(sx, sy) {
            continue;
        }
        let f = flags.get(sx, sy);
        if f.is_invalid() {
            continue;
        }
        if f.is_cloud() {
            sum += 1.0;
        }
        count += 1;
    }
    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Rect;

    const RESOLUTION: f64 = 500.0;
    const KERNEL_RADIUS: f64 = 1000.0;

    #[test]
    fn test_kernel_block_size() {
        assert_eq!(kernel_block_size(1000.0, 60.0), 35);
        assert_eq!(kernel_block_size(1000.0, 500.0), 5);
    }

    /// Right half cloudy with a 3x3 hole, left half clear. The shadow
    /// region inside the hole gets the gap flag, the one in open clear
    /// terrain does not.
    #[test]
    fn test_gap_flag_set_inside_cloud_hole() {
        let rect = Rect::new(0, 0, 20, 20);
        let mut flags = FlagRaster::new(rect);
        for y in 0..20 {
            for x in 8..20 {
                flags.insert(x, y, PixelFlags::CLOUD);
            }
        }
        for y in 9..12 {
            for x in 13..16 {
                flags.remove(x, y, PixelFlags::CLOUD);
            }
        }
        flags.insert(14, 10, PixelFlags::SHIFTED_CLOUD_SHADOW);
        flags.insert(2, 10, PixelFlags::SHIFTED_CLOUD_SHADOW);
        flags.insert(2, 11, PixelFlags::SHIFTED_CLOUD_SHADOW);

        flag_shadow_in_cloud_gaps(&mut flags, Connectivity::Eight, 5, KERNEL_RADIUS, RESOLUTION);

        assert!(flags.contains(14, 10, PixelFlags::SHIFTED_CLOUD_SHADOW_GAPS));
        assert!(!flags.contains(2, 10, PixelFlags::SHIFTED_CLOUD_SHADOW_GAPS));
        assert!(!flags.contains(2, 11, PixelFlags::SHIFTED_CLOUD_SHADOW_GAPS));
    }

    #[test]
    fn test_skipped_without_offset() {
        let rect = Rect::new(0, 0, 20, 20);
        let mut flags = FlagRaster::new(rect);
        for y in 0..20 {
            for x in 8..20 {
                flags.insert(x, y, PixelFlags::CLOUD);
            }
        }
        flags.remove(14, 10, PixelFlags::CLOUD);
        flags.insert(14, 10, PixelFlags::SHIFTED_CLOUD_SHADOW);

        flag_shadow_in_cloud_gaps(&mut flags, Connectivity::Eight, 0, KERNEL_RADIUS, RESOLUTION);
        assert!(!flags.contains(14, 10, PixelFlags::SHIFTED_CLOUD_SHADOW_GAPS));
    }

    #[test]
    fn test_skipped_when_kernel_exceeds_raster() {
        let rect = Rect::new(0, 0, 4, 4);
        let mut flags = FlagRaster::new(rect);
        flags.insert(1, 1, PixelFlags::SHIFTED_CLOUD_SHADOW);
        flag_shadow_in_cloud_gaps(&mut flags, Connectivity::Eight, 5, KERNEL_RADIUS, RESOLUTION);
        for y in 0..4 {
            for x in 0..4 {
                assert!(!flags.contains(x, y, PixelFlags::SHIFTED_CLOUD_SHADOW_GAPS));
            }
        }
    }
}
