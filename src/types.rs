use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};

/// Real-valued raster data (reflectance, elevation, angles)
pub type RasterReal = f32;

/// 2D real raster array (row x column)
pub type RealImage = Array2<RasterReal>;

/// 3D raster stack (level x row x column), used for temperature profiles
pub type ProfileStack = Array3<RasterReal>;

/// Geographic position in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPos {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPos {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// Continuous pixel position (scene coordinates)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelPos {
    pub x: f64,
    pub y: f64,
}

impl PixelPos {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Mapping between pixel and geographic coordinates.
///
/// The forward direction always succeeds; the inverse may fail for
/// positions outside the scene footprint.
pub trait GeoCoding: Sync {
    fn geo_pos(&self, pixel: PixelPos) -> GeoPos;
    fn pixel_pos(&self, geo: GeoPos) -> Option<PixelPos>;
}

/// Affine geocoding for regularly gridded scenes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffineGeoCoding {
    pub origin_lat: f64,
    pub origin_lon: f64,
    pub lat_per_pixel: f64,
    pub lon_per_pixel: f64,
    pub width: usize,
    pub height: usize,
}

impl GeoCoding for AffineGeoCoding {
    fn geo_pos(&self, pixel: PixelPos) -> GeoPos {
        GeoPos {
            lat: self.origin_lat + pixel.y * self.lat_per_pixel,
            lon: self.origin_lon + pixel.x * self.lon_per_pixel,
        }
    }

    fn pixel_pos(&self, geo: GeoPos) -> Option<PixelPos> {
        if self.lat_per_pixel == 0.0 || self.lon_per_pixel == 0.0 {
            return None;
        }
        let x = (geo.lon - self.origin_lon) / self.lon_per_pixel;
        let y = (geo.lat - self.origin_lat) / self.lat_per_pixel;
        if x < -0.5 || y < -0.5 || x >= self.width as f64 - 0.5 || y >= self.height as f64 - 0.5 {
            return None;
        }
        Some(PixelPos { x, y })
    }
}

/// Integer rectangle in scene coordinates.
///
/// Coordinates may be negative for rectangles extended beyond the scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x && x < self.x + self.width && y >= self.y && y < self.y + self.height
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    pub fn area(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            self.width as usize * self.height as usize
        }
    }

    pub fn intersection(&self, other: &Rect) -> Rect {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = (self.x + self.width).min(other.x + other.width);
        let y1 = (self.y + self.height).min(other.y + other.height);
        Rect {
            x: x0,
            y: y0,
            width: (x1 - x0).max(0),
            height: (y1 - y0).max(0),
        }
    }

    /// Grow the rectangle by `dx`/`dy` in both directions, clipped to `bounds`.
    pub fn grow_clipped(&self, dx: i32, dy: i32, bounds: &Rect) -> Rect {
        let grown = Rect {
            x: self.x - dx,
            y: self.y - dy,
            width: self.width + 2 * dx,
            height: self.height + 2 * dy,
        };
        grown.intersection(bounds)
    }
}

/// Per-pixel classification flags, one bit per condition.
///
/// Bit positions 0..=12 follow the classification layout expected by
/// downstream consumers; 13..=15 carry the cloud discrimination states
/// used during consolidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PixelFlags(pub u16);

impl PixelFlags {
    pub const WATER: u16 = 1 << 0;
    pub const LAND: u16 = 1 << 1;
    pub const CLOUD: u16 = 1 << 2;
    pub const HAZE: u16 = 1 << 3;
    pub const CLOUD_SHADOW: u16 = 1 << 4;
    pub const MOUNTAIN_SHADOW: u16 = 1 << 5;
    pub const INVALID: u16 = 1 << 6;
    pub const CLOUD_BUFFER: u16 = 1 << 7;
    pub const POTENTIAL_CLOUD_SHADOW: u16 = 1 << 8;
    pub const SHIFTED_CLOUD_SHADOW: u16 = 1 << 9;
    pub const CLOUD_SHADOW_COMB: u16 = 1 << 10;
    pub const SHIFTED_CLOUD_SHADOW_GAPS: u16 = 1 << 11;
    pub const RECOMMENDED_CLOUD_SHADOW: u16 = 1 << 12;
    pub const CLOUD_SURE: u16 = 1 << 13;
    pub const CLOUD_AMBIGUOUS: u16 = 1 << 14;
    pub const SNOW_ICE: u16 = 1 << 15;

    pub const EMPTY: PixelFlags = PixelFlags(0);

    /// True when any bit of `bits` is set. For a multi-bit mask this is
    /// an any-of test, not a subset test.
    pub fn contains(&self, bits: u16) -> bool {
        self.0 & bits != 0
    }

    pub fn insert(&mut self, bits: u16) {
        self.0 |= bits;
    }

    pub fn remove(&mut self, bits: u16) {
        self.0 &= !bits;
    }

    pub fn union(&self, other: PixelFlags) -> PixelFlags {
        PixelFlags(self.0 | other.0)
    }

    pub fn is_invalid(&self) -> bool {
        self.contains(Self::INVALID)
    }

    pub fn is_cloud(&self) -> bool {
        self.contains(Self::CLOUD)
    }

    pub fn is_land(&self) -> bool {
        self.contains(Self::LAND)
    }

    pub fn is_water(&self) -> bool {
        self.contains(Self::WATER)
    }

    pub fn is_cloud_shadow(&self) -> bool {
        self.contains(Self::CLOUD_SHADOW)
    }

    /// A pixel that can receive a shadow flag: valid and cloud free
    pub fn is_shadow_receiver(&self) -> bool {
        !self.contains(Self::INVALID | Self::CLOUD)
    }
}

/// Flag raster over a rectangle, addressed in scene coordinates
#[derive(Debug, Clone)]
pub struct FlagRaster {
    rect: Rect,
    data: Vec<PixelFlags>,
}

impl FlagRaster {
    pub fn new(rect: Rect) -> Self {
        Self {
            data: vec![PixelFlags::EMPTY; rect.area()],
            rect,
        }
    }

    pub fn rect(&self) -> &Rect {
        &self.rect
    }

    fn index(&self, x: i32, y: i32) -> usize {
        debug_assert!(self.rect.contains(x, y));
        ((y - self.rect.y) as usize) * self.rect.width as usize + (x - self.rect.x) as usize
    }

    pub fn get(&self, x: i32, y: i32) -> PixelFlags {
        self.data[self.index(x, y)]
    }

    pub fn set(&mut self, x: i32, y: i32, flags: PixelFlags) {
        let i = self.index(x, y);
        self.data[i] = flags;
    }

    pub fn insert(&mut self, x: i32, y: i32, bits: u16) {
        let i = self.index(x, y);
        self.data[i].insert(bits);
    }

    pub fn remove(&mut self, x: i32, y: i32, bits: u16) {
        let i = self.index(x, y);
        self.data[i].remove(bits);
    }

    /// True when any bit of `bits` is set at `(x, y)`; same any-of
    /// semantics as [`PixelFlags::contains`].
    pub fn contains(&self, x: i32, y: i32, bits: u16) -> bool {
        self.data[self.index(x, y)].contains(bits)
    }

    /// OR all flags from `other` into this raster on the overlapping area
    pub fn merge(&mut self, other: &FlagRaster) {
        let overlap = self.rect.intersection(&other.rect);
        for y in overlap.y..overlap.y + overlap.height {
            for x in overlap.x..overlap.x + overlap.width {
                let merged = self.get(x, y).union(other.get(x, y));
                self.set(x, y, merged);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PixelFlags> {
        self.data.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PixelFlags> {
        self.data.iter_mut()
    }
}

/// Sun and view geometry for a single pixel, angles in degrees
#[derive(Debug, Clone, Copy)]
pub struct ObservationGeometry {
    pub sun_zenith: f64,
    pub sun_azimuth: f64,
    pub view_zenith: f64,
    pub view_azimuth: f64,
}

/// Input rasters for a scene.
///
/// All rasters share the scene dimensions; `validate` rejects grids with
/// mismatched shapes before any processing starts.
pub struct PixelGrid {
    pub width: usize,
    pub height: usize,
    /// Reflectance of the analysis band(s); at least one band required
    pub reflectance: Vec<RealImage>,
    pub elevation: RealImage,
    pub sun_zenith: RealImage,
    pub sun_azimuth: RealImage,
    pub view_zenith: RealImage,
    pub view_azimuth: RealImage,
    /// Cloud-top pressure in hPa; shadow height refinement needs it
    pub cloud_top_pressure: Option<RealImage>,
    /// Sea-level pressure in hPa
    pub sea_level_pressure: Option<RealImage>,
    /// Temperature profile at the reference pressure levels, shape
    /// (levels, height, width)
    pub temperature_profile: Option<ProfileStack>,
}

impl PixelGrid {
    pub fn validate(&self) -> ShadowResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(ShadowError::Config("Empty scene dimensions".to_string()));
        }
        if self.reflectance.is_empty() {
            return Err(ShadowError::Config(
                "At least one reflectance band is required".to_string(),
            ));
        }
        let dim = (self.height, self.width);
        for (i, band) in self.reflectance.iter().enumerate() {
            if band.dim() != dim {
                return Err(ShadowError::Config(format!(
                    "Reflectance band {} has shape {:?}, expected {:?}",
                    i,
                    band.dim(),
                    dim
                )));
            }
        }
        for (name, raster) in [
            ("elevation", &self.elevation),
            ("sun_zenith", &self.sun_zenith),
            ("sun_azimuth", &self.sun_azimuth),
            ("view_zenith", &self.view_zenith),
            ("view_azimuth", &self.view_azimuth),
        ] {
            if raster.dim() != dim {
                return Err(ShadowError::Config(format!(
                    "Raster '{}' has shape {:?}, expected {:?}",
                    name,
                    raster.dim(),
                    dim
                )));
            }
        }
        for (name, raster) in [
            ("cloud_top_pressure", &self.cloud_top_pressure),
            ("sea_level_pressure", &self.sea_level_pressure),
        ] {
            if let Some(r) = raster {
                if r.dim() != dim {
                    return Err(ShadowError::Config(format!(
                        "Raster '{}' has shape {:?}, expected {:?}",
                        name,
                        r.dim(),
                        dim
                    )));
                }
            }
        }
        if let Some(profile) = &self.temperature_profile {
            let (_, h, w) = profile.dim();
            if (h, w) != dim {
                return Err(ShadowError::Config(format!(
                    "Temperature profile has spatial shape {:?}, expected {:?}",
                    (h, w),
                    dim
                )));
            }
        }
        Ok(())
    }

    pub fn scene_rect(&self) -> Rect {
        Rect::new(0, 0, self.width as i32, self.height as i32)
    }
}

/// Band interpretation used by the shadow analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnalysisMode {
    /// Separate statistics over land and water receivers
    LandWater,
    /// Combine several bands into one brightness measure
    MultiBand,
    /// Single analysis band
    SingleBand,
}

impl std::str::FromStr for AnalysisMode {
    type Err = ShadowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LandWater" => Ok(AnalysisMode::LandWater),
            "MultiBand" => Ok(AnalysisMode::MultiBand),
            "SingleBand" => Ok(AnalysisMode::SingleBand),
            other => Err(ShadowError::Config(format!(
                "Unknown analysis mode: '{}'",
                other
            ))),
        }
    }
}

/// Pixel neighbourhood used for region growing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Connectivity {
    Four,
    Eight,
}

/// Configuration for the shadow detection pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowConfig {
    /// Width of the cloud buffer in pixels
    pub cloud_buffer_width: u32,
    pub compute_cloud_buffer: bool,
    pub compute_cloud_shadow: bool,
    /// Merge an externally computed mountain shadow mask
    pub merge_mountain_shadow: bool,
    /// Extend the cloud buffer to ambiguous cloud pixels as well
    pub buffer_for_ambiguous_clouds: bool,
    pub mode: AnalysisMode,
    pub connectivity: Connectivity,
    /// Spatial resolution in metres per pixel
    pub spatial_resolution: f64,
    /// Kernel radius in metres for the cloud gap filter
    pub gap_kernel_radius: f64,
    /// Dark-cluster thresholds for the all/land/water brightness splits
    pub analysis_thresholds: [f64; 3],
    /// Processing tile edge length in pixels
    pub tile_size: usize,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            cloud_buffer_width: 2,
            compute_cloud_buffer: true,
            compute_cloud_shadow: true,
            merge_mountain_shadow: true,
            buffer_for_ambiguous_clouds: false,
            mode: AnalysisMode::LandWater,
            connectivity: Connectivity::Eight,
            spatial_resolution: 60.0,
            gap_kernel_radius: 1000.0,
            analysis_thresholds: [0.01, -0.11, 0.01],
            tile_size: 610,
        }
    }
}

/// Error types for shadow processing
#[derive(Debug, thiserror::Error)]
pub enum ShadowError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Geometry error: {0}")]
    Geometry(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Processing was cancelled")]
    Cancelled,
}

/// Result type for shadow operations
pub type ShadowResult<T> = Result<T, ShadowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_bits_are_distinct() {
        let bits = [
            PixelFlags::WATER,
            PixelFlags::LAND,
            PixelFlags::CLOUD,
            PixelFlags::HAZE,
            PixelFlags::CLOUD_SHADOW,
            PixelFlags::MOUNTAIN_SHADOW,
            PixelFlags::INVALID,
            PixelFlags::CLOUD_BUFFER,
            PixelFlags::POTENTIAL_CLOUD_SHADOW,
            PixelFlags::SHIFTED_CLOUD_SHADOW,
            PixelFlags::CLOUD_SHADOW_COMB,
            PixelFlags::SHIFTED_CLOUD_SHADOW_GAPS,
            PixelFlags::RECOMMENDED_CLOUD_SHADOW,
            PixelFlags::CLOUD_SURE,
            PixelFlags::CLOUD_AMBIGUOUS,
            PixelFlags::SNOW_ICE,
        ];
        let mut seen = 0u16;
        for bit in bits {
            assert_eq!(seen & bit, 0);
            seen |= bit;
        }
        assert_eq!(seen, u16::MAX);
    }

    #[test]
    fn test_flag_contains_matches_any_bit() {
        let f = PixelFlags(PixelFlags::CLOUD);
        assert!(f.contains(PixelFlags::CLOUD | PixelFlags::INVALID));
        assert!(!f.contains(PixelFlags::INVALID | PixelFlags::SNOW_ICE));
    }

    #[test]
    fn test_flag_raster_scene_coordinates() {
        let mut raster = FlagRaster::new(Rect::new(-5, -3, 10, 8));
        raster.insert(-5, -3, PixelFlags::CLOUD);
        raster.insert(4, 4, PixelFlags::CLOUD_SHADOW);
        assert!(raster.contains(-5, -3, PixelFlags::CLOUD));
        assert!(raster.contains(4, 4, PixelFlags::CLOUD_SHADOW));
        assert!(!raster.contains(0, 0, PixelFlags::CLOUD));
    }

    #[test]
    fn test_rect_intersection() {
        let a = Rect::new(0, 0, 100, 100);
        let b = Rect::new(50, 60, 100, 100);
        let c = a.intersection(&b);
        assert_eq!(c, Rect::new(50, 60, 50, 40));
        let d = a.intersection(&Rect::new(200, 200, 10, 10));
        assert!(d.is_empty());
    }

    #[test]
    fn test_rect_grow_clipped() {
        let bounds = Rect::new(0, 0, 100, 100);
        let tile = Rect::new(10, 10, 20, 20);
        let grown = tile.grow_clipped(15, 15, &bounds);
        assert_eq!(grown, Rect::new(0, 0, 45, 45));
    }

    #[test]
    fn test_analysis_mode_parse() {
        use std::str::FromStr;
        assert_eq!(
            AnalysisMode::from_str("LandWater").unwrap(),
            AnalysisMode::LandWater
        );
        assert!(AnalysisMode::from_str("Bogus").is_err());
    }

    #[test]
    fn test_affine_geocoding_roundtrip() {
        let gc = AffineGeoCoding {
            origin_lat: 45.0,
            origin_lon: 7.0,
            lat_per_pixel: -0.001,
            lon_per_pixel: 0.001,
            width: 100,
            height: 100,
        };
        let geo = gc.geo_pos(PixelPos::new(10.0, 20.0));
        let back = gc.pixel_pos(geo).unwrap();
        assert!((back.x - 10.0).abs() < 1e-9);
        assert!((back.y - 20.0).abs() < 1e-9);
        assert!(gc.pixel_pos(GeoPos::new(60.0, 7.0)).is_none());
    }
}
