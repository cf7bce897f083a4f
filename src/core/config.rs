//! Engine configuration
//!
//! A single configuration object consumed at engine construction. All
//! knobs have defaults tuned for desktop; the splat budget scales with
//! the device class unless `lod_splat_count` pins it explicitly.

use serde::{Deserialize, Serialize};

/// Splats per cache page. Fixed: paged splat indices pack the page into
/// the high 16 bits and the intra-page offset into the low 16.
pub const PAGE_SIZE: u32 = 65_536;

/// Device class used to pick the default splat budget.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    /// Desktop / laptop discrete or capable integrated GPU
    #[default]
    Desktop,
    /// Standalone head-mounted displays and low-end mobile
    MobileHmd,
}

impl DeviceClass {
    /// Default splat budget for this device class.
    pub fn default_splat_budget(&self) -> u32 {
        match self {
            DeviceClass::Desktop => 2_500_000,
            DeviceClass::MobileHmd => 500_000,
        }
    }
}

/// Configuration for the LoD streaming engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Pool size in splats. Must be a multiple of [`PAGE_SIZE`].
    pub max_paged_splats: u32,
    /// Parallel fetch/decode workers.
    pub num_fetchers: usize,
    /// Max spherical-harmonic level to retain (0..=3).
    pub max_sh: u32,
    /// Global target splat count; `None` uses the device default.
    pub lod_splat_count: Option<u32>,
    /// Multiplier on the target splat count.
    pub lod_splat_scale: f32,
    /// Multiplier on the pixel scale; raises the acceptable minimum
    /// projected splat size.
    pub lod_render_scale: f32,
    /// Foveation factor for directions behind the viewer.
    pub behind_foveate: f32,
    /// Full-resolution cone angle in degrees (0 disables the cone).
    pub cone_fov0: f32,
    /// Outer cone angle in degrees.
    pub cone_fov: f32,
    /// Foveation factor at the outer cone boundary.
    pub cone_foveate: f32,
    /// Lower bound between sort kicks, in milliseconds.
    pub min_sort_interval_ms: u64,
    /// Idle tree eviction delay, in milliseconds.
    pub dispose_timeout_ms: u64,
    /// Master switch for LoD selection.
    pub enable_lod: bool,
    /// Whether this driver updates trees and cache, or merely consumes.
    pub enable_drive_lod: bool,
    /// Device class for budget defaults.
    pub device_class: DeviceClass,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_paged_splats: 64 * PAGE_SIZE,
            num_fetchers: 3,
            max_sh: 3,
            lod_splat_count: None,
            lod_splat_scale: 1.0,
            lod_render_scale: 1.0,
            behind_foveate: 0.1,
            cone_fov0: 0.0,
            cone_fov: 0.0,
            cone_foveate: 1.0,
            min_sort_interval_ms: 0,
            dispose_timeout_ms: 3_000,
            enable_lod: true,
            enable_drive_lod: true,
            device_class: DeviceClass::default(),
        }
    }
}

impl EngineConfig {
    /// Validate the configuration at engine construction time.
    pub fn validate(&self) -> crate::core::Result<()> {
        if self.max_paged_splats == 0 || self.max_paged_splats % PAGE_SIZE != 0 {
            return Err(crate::core::Error::InvalidArgument(format!(
                "max_paged_splats ({}) must be a non-zero multiple of {}",
                self.max_paged_splats, PAGE_SIZE
            )));
        }
        if self.num_fetchers == 0 {
            return Err(crate::core::Error::InvalidArgument(
                "num_fetchers must be at least 1".into(),
            ));
        }
        if self.max_sh > 3 {
            return Err(crate::core::Error::InvalidArgument(format!(
                "max_sh ({}) must be 0..=3",
                self.max_sh
            )));
        }
        Ok(())
    }

    /// Number of pages in the splat pool.
    pub fn page_count(&self) -> u32 {
        self.max_paged_splats / PAGE_SIZE
    }

    /// Effective splat budget: explicit count or device default, scaled.
    pub fn splat_budget(&self) -> u32 {
        let base = self
            .lod_splat_count
            .unwrap_or_else(|| self.device_class.default_splat_budget());
        (base as f32 * self.lod_splat_scale).max(1.0) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.page_count(), 64);
    }

    #[test]
    fn test_unaligned_pool_rejected() {
        let config = EngineConfig {
            max_paged_splats: PAGE_SIZE + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_budget_scaling() {
        let config = EngineConfig {
            lod_splat_count: Some(1_000_000),
            lod_splat_scale: 0.5,
            ..Default::default()
        };
        assert_eq!(config.splat_budget(), 500_000);

        let hmd = EngineConfig {
            device_class: DeviceClass::MobileHmd,
            ..Default::default()
        };
        assert_eq!(hmd.splat_budget(), 500_000);
    }
}
