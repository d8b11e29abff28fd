//! Pixel format tags and the derivation of GPU read-back formats from them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::OutputError;

/// Per-channel storage type handed to writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Bit,
    UChar,
    UShort,
    UInt,
    Half,
    Float,
    Double,
    PackedR10G10B10X2,
    PackedX2B10G10R10,
    PackedCb8Y8Cr8Y8,
    PackedY8Cb8Y8Cr8,
}

/// Internal read-back layout of one pixel in GPU memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataFormat {
    Rgb8,
    Rgba8,
    Rgb10X2Rev,
    Rgb16,
    Rgba16,
    Rgb16F,
    Rgba16F,
    Rgb32F,
    Rgba32F,
}

impl DataFormat {
    /// Size of one pixel in bytes.
    pub fn pixel_size(self) -> usize {
        match self {
            DataFormat::Rgb8 => 3,
            DataFormat::Rgba8 => 4,
            DataFormat::Rgb10X2Rev => 4,
            DataFormat::Rgb16 | DataFormat::Rgb16F => 6,
            DataFormat::Rgba16 | DataFormat::Rgba16F => 8,
            DataFormat::Rgb32F => 12,
            DataFormat::Rgba32F => 16,
        }
    }
}

/// Bit depth, channel count and float-ness as requested by a format tag or
/// negotiated with a writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelSpec {
    pub bits: u32,
    pub channels: usize,
    pub float: bool,
}

/// Result of deriving the GPU read-back format from a [`PixelSpec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DerivedFormat {
    pub format: DataFormat,
    pub data_type: DataType,
    /// Channel count as seen by the writer (packed 10-bit collapses to 1).
    pub channels: usize,
}

impl Default for PixelSpec {
    fn default() -> Self {
        Self {
            bits: 8,
            channels: 3,
            float: false,
        }
    }
}

impl PixelSpec {
    pub fn new(bits: u32, channels: usize, float: bool) -> Self {
        Self {
            bits,
            channels,
            float,
        }
    }

    /// Recover bits/float from a writer-negotiated data type.
    pub fn from_data_type(data_type: DataType, channels: usize) -> Self {
        let (bits, float) = match data_type {
            DataType::Bit => (1, false),
            DataType::UChar => (8, false),
            DataType::UShort => (16, false),
            DataType::UInt => (32, false),
            DataType::Half => (16, true),
            DataType::Float => (32, true),
            DataType::Double => (64, true),
            DataType::PackedR10G10B10X2 | DataType::PackedX2B10G10R10 => (10, false),
            DataType::PackedCb8Y8Cr8Y8 | DataType::PackedY8Cb8Y8Cr8 => (8, false),
        };
        Self {
            bits,
            channels,
            float,
        }
    }

    /// Pick the read-back format and writer data type for this spec.
    ///
    /// Unsupported depths fall back to 8-bit.
    pub fn derive(&self) -> DerivedFormat {
        let alpha = self.channels == 4;
        match self.bits {
            10 => DerivedFormat {
                format: DataFormat::Rgb10X2Rev,
                data_type: DataType::PackedX2B10G10R10,
                channels: 1,
            },
            16 if self.float => DerivedFormat {
                format: if alpha {
                    DataFormat::Rgba16F
                } else {
                    DataFormat::Rgb16F
                },
                data_type: DataType::Half,
                channels: self.channels,
            },
            16 => DerivedFormat {
                format: if alpha {
                    DataFormat::Rgba16
                } else {
                    DataFormat::Rgb16
                },
                data_type: DataType::UShort,
                channels: self.channels,
            },
            32 => DerivedFormat {
                format: if alpha {
                    DataFormat::Rgba32F
                } else {
                    DataFormat::Rgb32F
                },
                data_type: DataType::Float,
                channels: self.channels,
            },
            _ => DerivedFormat {
                format: if alpha {
                    DataFormat::Rgba8
                } else {
                    DataFormat::Rgb8
                },
                data_type: DataType::UChar,
                channels: self.channels,
            },
        }
    }
}

impl FromStr for PixelSpec {
    type Err = OutputError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        let spec = match tag {
            "RGB8" => PixelSpec::new(8, 3, false),
            "RGBA8" => PixelSpec::new(8, 4, false),
            "RGB10" => PixelSpec::new(10, 3, false),
            "RGB12" => PixelSpec::new(12, 3, false),
            "RGB16" => PixelSpec::new(16, 3, false),
            "RGBA16" => PixelSpec::new(16, 4, false),
            "RGB16F" => PixelSpec::new(16, 3, true),
            "RGBA16F" => PixelSpec::new(16, 4, true),
            "RGB32F" => PixelSpec::new(32, 3, true),
            "RGBA32F" => PixelSpec::new(32, 4, true),
            other => {
                return Err(OutputError::Config(format!(
                    "--format {other}: expected RGB[A] + {{8,10,12,16,32}} + [F], e.g. RGB8"
                )))
            }
        };
        Ok(spec)
    }
}

impl fmt::Display for PixelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let base = if self.channels == 4 { "RGBA" } else { "RGB" };
        let suffix = if self.float { "F" } else { "" };
        write!(f, "{base}{}{suffix}", self.bits)
    }
}

/// Channel names reported to writers.
pub fn channel_names(channels: usize, bits: u32) -> Vec<String> {
    let names: &[&str] = match channels {
        1 if bits == 10 => &["RGB"],
        1 => &[""],
        4 => &["R", "G", "B", "A"],
        _ => &["R", "G", "B"],
    };
    names.iter().map(|n| n.to_string()).collect()
}
