//! Cache key types for image lookups.
//!
//! A cache key identifies either the full-resolution bitmap for a URL or a
//! size-specific downsampled variant. Scaled keys normalize the requested
//! display size to whole pixels using the device scale factor, so two
//! requests for the same logical size always resolve to the same key.
//!
//! # Key Format
//!
//! Keys render as `img:{url}` for originals and `img:{url}:{w}x{h}` for
//! scaled variants. Example: `img:https://host/a.png:300x200`

use std::fmt;

/// Requested display size in points, before device scaling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetSize {
    /// Width in points.
    pub width: f32,
    /// Height in points.
    pub height: f32,
}

impl TargetSize {
    /// Creates a target size from point dimensions.
    pub fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }
}

/// Normalized pixel dimensions: a target size multiplied by the device
/// scale factor and rounded to whole pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelSize {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl PixelSize {
    /// Normalizes a target size against the device scale factor.
    ///
    /// Dimensions round to the nearest pixel and never drop below 1.
    /// A non-positive scale factor falls back to 1.0.
    pub fn from_target(target: TargetSize, device_scale: f32) -> Self {
        let scale = if device_scale > 0.0 { device_scale } else { 1.0 };
        Self {
            width: (target.width * scale).round().max(1.0) as u32,
            height: (target.height * scale).round().max(1.0) as u32,
        }
    }

    /// The larger of the two dimensions, used as the decode bound.
    pub fn max_dimension(&self) -> u32 {
        self.width.max(self.height)
    }
}

impl fmt::Display for PixelSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Identity of a cached bitmap.
///
/// The original key and every scaled key for a URL are separate cache
/// identities; distinct scaled keys for the same URL coexist independently.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ImageKey {
    /// Full-resolution bitmap, keyed by source URL.
    Original {
        /// Source URL.
        url: String,
    },
    /// Downsampled variant, keyed by URL plus normalized pixel size.
    Scaled {
        /// Source URL.
        url: String,
        /// Normalized pixel dimensions.
        size: PixelSize,
    },
}

impl ImageKey {
    /// Resolves the lookup key for a request.
    ///
    /// A request with a target size resolves to a scaled key; a request
    /// without one resolves to the original key.
    pub fn for_request(url: &str, target: Option<TargetSize>, device_scale: f32) -> Self {
        match target {
            Some(target) => Self::Scaled {
                url: url.to_string(),
                size: PixelSize::from_target(target, device_scale),
            },
            None => Self::Original {
                url: url.to_string(),
            },
        }
    }

    /// The source URL behind this key.
    pub fn url(&self) -> &str {
        match self {
            Self::Original { url } => url,
            Self::Scaled { url, .. } => url,
        }
    }

    /// The pixel size for scaled keys, `None` for originals.
    pub fn pixel_size(&self) -> Option<PixelSize> {
        match self {
            Self::Original { .. } => None,
            Self::Scaled { size, .. } => Some(*size),
        }
    }
}

impl fmt::Display for ImageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Original { url } => write!(f, "img:{}", url),
            Self::Scaled { url, size } => write!(f, "img:{}:{}", url, size),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_size_rounds_to_nearest_pixel() {
        let size = PixelSize::from_target(TargetSize::new(100.4, 99.6), 1.0);
        assert_eq!(size.width, 100);
        assert_eq!(size.height, 100);
    }

    #[test]
    fn test_pixel_size_applies_device_scale() {
        let size = PixelSize::from_target(TargetSize::new(100.0, 50.0), 3.0);
        assert_eq!(size.width, 300);
        assert_eq!(size.height, 150);
        assert_eq!(size.max_dimension(), 300);
    }

    #[test]
    fn test_pixel_size_never_drops_below_one_pixel() {
        let size = PixelSize::from_target(TargetSize::new(0.1, 0.0), 1.0);
        assert_eq!(size.width, 1);
        assert_eq!(size.height, 1);
    }

    #[test]
    fn test_pixel_size_invalid_scale_falls_back_to_identity() {
        let size = PixelSize::from_target(TargetSize::new(64.0, 32.0), 0.0);
        assert_eq!(size.width, 64);
        assert_eq!(size.height, 32);
    }

    #[test]
    fn test_key_for_request_without_size_is_original() {
        let key = ImageKey::for_request("https://x/a.png", None, 2.0);
        assert_eq!(
            key,
            ImageKey::Original {
                url: "https://x/a.png".to_string()
            }
        );
        assert!(key.pixel_size().is_none());
    }

    #[test]
    fn test_key_for_request_with_size_is_scaled() {
        let key = ImageKey::for_request("https://x/a.png", Some(TargetSize::new(100.0, 80.0)), 2.0);
        assert_eq!(key.url(), "https://x/a.png");
        assert_eq!(
            key.pixel_size(),
            Some(PixelSize {
                width: 200,
                height: 160
            })
        );
    }

    #[test]
    fn test_same_logical_size_resolves_to_same_key() {
        let a = ImageKey::for_request("https://x/a.png", Some(TargetSize::new(100.2, 80.0)), 2.0);
        let b = ImageKey::for_request("https://x/a.png", Some(TargetSize::new(100.0, 79.8)), 2.0);
        assert_eq!(a, b);
    }

    #[test]
    fn test_distinct_sizes_are_distinct_keys() {
        let a = ImageKey::for_request("https://x/a.png", Some(TargetSize::new(100.0, 80.0)), 1.0);
        let b = ImageKey::for_request("https://x/a.png", Some(TargetSize::new(50.0, 40.0)), 1.0);
        let original = ImageKey::for_request("https://x/a.png", None, 1.0);
        assert_ne!(a, b);
        assert_ne!(a, original);
    }

    #[test]
    fn test_key_display_format() {
        let original = ImageKey::for_request("https://x/a.png", None, 1.0);
        assert_eq!(format!("{}", original), "img:https://x/a.png");

        let scaled = ImageKey::for_request("https://x/a.png", Some(TargetSize::new(300.0, 200.0)), 1.0);
        assert_eq!(format!("{}", scaled), "img:https://x/a.png:300x200");
    }
}
