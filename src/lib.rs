//! Umbra: A Fast, Modular Cloud Shadow Detection Engine
//!
//! This library provides an open-source alternative to the shadow
//! screening in large desktop toolboxes for flagging cloud shadow in
//! optical satellite imagery from the cloud mask, the sun/view geometry
//! and the surface elevation.

pub mod types;
pub mod core;

// Re-export main types and functions for easier access
pub use types::{
    AffineGeoCoding, AnalysisMode, Connectivity, FlagRaster, GeoCoding, GeoPos, PixelFlags,
    PixelGrid, PixelPos, Rect, ShadowConfig, ShadowError, ShadowResult,
};

pub use core::CloudShadowProcessor;
