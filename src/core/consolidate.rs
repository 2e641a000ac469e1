//! Final flag consolidation.
//!
//! Normalizes the input classification before shadow analysis, dilates
//! clouds into a safety buffer, merges externally computed mountain
//! shadow, derives the recommended shadow flag and enforces the
//! exclusion rules between the flag bits.

use ndarray::Array2;

use crate::types::{FlagRaster, PixelFlags};

const SHADOW_BITS: u16 = PixelFlags::CLOUD_SHADOW
    | PixelFlags::POTENTIAL_CLOUD_SHADOW
    | PixelFlags::SHIFTED_CLOUD_SHADOW
    | PixelFlags::CLOUD_SHADOW_COMB
    | PixelFlags::SHIFTED_CLOUD_SHADOW_GAPS
    | PixelFlags::RECOMMENDED_CLOUD_SHADOW;

/// Normalizes the incoming classification.
///
/// Invalid pixels keep only the invalid bit. Snow or ice overrides any
/// cloud classification. Sure and ambiguous cloud are made mutually
/// exclusive (sure wins) and either one implies the plain cloud bit.
pub fn prepare_classification(flags: &mut FlagRaster) {
    for f in flags.iter_mut() {
        if f.is_invalid() {
            *f = PixelFlags(PixelFlags::INVALID);
            continue;
        }
        if f.contains(PixelFlags::SNOW_ICE) {
            f.remove(PixelFlags::CLOUD | PixelFlags::CLOUD_SURE | PixelFlags::CLOUD_AMBIGUOUS);
            continue;
        }
        if f.contains(PixelFlags::CLOUD_SURE) {
            f.remove(PixelFlags::CLOUD_AMBIGUOUS);
            f.insert(PixelFlags::CLOUD);
        } else if f.contains(PixelFlags::CLOUD_AMBIGUOUS) {
            f.insert(PixelFlags::CLOUD);
        }
    }
}

/// Dilates the cloud mask by a square structuring element of the given
/// half width and flags the rim as cloud buffer.
///
/// Buffer pixels never become cloud themselves, so repeated application
/// does not grow the rim. With `include_ambiguous` the dilation also
/// seeds from ambiguous cloud pixels.
pub fn flag_cloud_buffer(flags: &mut FlagRaster, buffer_width: i32, include_ambiguous: bool) {
    if buffer_width <= 0 {
        return;
    }
    let rect = *flags.rect();
    let mut seeds = Vec::new();
    for y in rect.y..rect.y + rect.height {
        for x in rect.x..rect.x + rect.width {
            let f = flags.get(x, y);
            let seed = if include_ambiguous {
                f.is_cloud()
            } else {
                f.is_cloud() && !f.contains(PixelFlags::CLOUD_AMBIGUOUS)
            };
            if seed {
                seeds.push((x, y));
            }
        }
    }
    for (x, y) in seeds {
        for dy in -buffer_width..=buffer_width {
            for dx in -buffer_width..=buffer_width {
                let (nx, ny) = (x + dx, y + dy);
                if !rect.contains(nx, ny) {
                    continue;
                }
                let f = flags.get(nx, ny);
                if !f.contains(PixelFlags::CLOUD | PixelFlags::INVALID | SHADOW_BITS) {
                    flags.insert(nx, ny, PixelFlags::CLOUD_BUFFER);
                }
            }
        }
    }
}

/// Merges a precomputed mountain shadow mask into the flag raster. The
/// mask is addressed in scene coordinates and must cover the raster
/// rectangle.
pub fn merge_mountain_shadow(flags: &mut FlagRaster, mask: &Array2<bool>) {
    let rect = *flags.rect();
    for y in rect.y..rect.y + rect.height {
        for x in rect.x..rect.x + rect.width {
            if mask[[y as usize, x as usize]] && !flags.get(x, y).is_invalid() {
                flags.insert(x, y, PixelFlags::MOUNTAIN_SHADOW);
            }
        }
    }
}

/// Derives the recommended shadow flag.
///
/// When a scene offset was found the recommendation is the combined
/// shadow plus the gap-flagged shifted shadow. Without an offset only
/// the clustered shadow is trustworthy.
pub fn flag_recommended_shadow(flags: &mut FlagRaster, best_offset: usize) {
    let source_bits = if best_offset > 0 {
        PixelFlags::CLOUD_SHADOW_COMB | PixelFlags::SHIFTED_CLOUD_SHADOW_GAPS
    } else {
        PixelFlags::CLOUD_SHADOW
    };
    for f in flags.iter_mut() {
        if f.contains(source_bits) {
            f.insert(PixelFlags::RECOMMENDED_CLOUD_SHADOW);
        }
    }
}

/// Clears every shadow bit from cloud and invalid pixels. Shadow can
/// only ever be reported on clear valid ground.
pub fn enforce_exclusions(flags: &mut FlagRaster) {
    for f in flags.iter_mut() {
        if f.is_cloud() || f.is_invalid() {
            f.remove(SHADOW_BITS);
        }
    }
}
