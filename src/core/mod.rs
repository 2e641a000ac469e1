//! Core shadow detection modules

pub mod height;
pub mod path;
pub mod fronts;
pub mod cluster;
pub mod offset;
pub mod gaps;
pub mod consolidate;
pub mod scene;

// Re-export main types
pub use height::{refined_height_from_ctp, NUM_PRESSURE_LEVELS, REFERENCE_PRESSURE_LEVELS};
pub use path::{
    apparent_sun_azimuth, extended_source_rect, line_with_angle, path_pixels, relative_path,
    scene_apparent_sun_azimuth, spherical_distance, surface_distance, MEAN_EARTH_RADIUS,
};
pub use fronts::{FrontsShadowDetector, FrontsShadowParams};
pub use cluster::{identify_potential_shadows, PotentialShadows, RegionClusterer, RegionLabels};
pub use offset::{
    apply_bulk_shift, choose_best_offset, find_scene_offsets, flag_shadow_combination,
    relative_minima, BulkShifter, TileStats,
};
pub use gaps::{flag_shadow_in_cloud_gaps, kernel_block_size};
pub use consolidate::{
    enforce_exclusions, flag_cloud_buffer, flag_recommended_shadow, merge_mountain_shadow,
    prepare_classification,
};
pub use scene::CloudShadowProcessor;
