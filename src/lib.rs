//! Output video pipeline: asynchronous GPU read-back through a ring of frame
//! slots into a movie writer running on its own thread.
//!
//! The render loop calls [`OutputDevice::transfer`] once per frame. A
//! "OVD Transfer" thread turns finished read-backs into queued frames and an
//! "OVD Writer" thread drives the [`MovieWriter`], which pulls frames back
//! through [`FrameSource::images_at_frame`].

pub mod audio;
pub mod device;
pub mod error;
pub mod format;
pub mod frame;
pub mod gpu;
pub mod options;
pub mod pipeline;
pub mod profile;
pub mod transfer;
pub mod utils;
pub mod writer;

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use device::{DeviceStats, OutputDevice, VideoFormat};
pub use error::{OutputError, Result};
pub use format::{DataFormat, DataType, PixelSpec};
pub use frame::{FrameImage, FramePixels, HostImage, ImageMeta};
pub use gpu::{Framebuffer, GpuBackend, SoftwareFramebuffer, SoftwareGpu};
pub use writer::{FrameSource, MovieInfo, MovieWriter, ReadRequest, WriteRequest};

/// Ring length used when none is configured.
#[cfg(target_os = "linux")]
pub const DEFAULT_RING_BUFFER_SIZE: usize = 3;
#[cfg(not(target_os = "linux"))]
pub const DEFAULT_RING_BUFFER_SIZE: usize = 4;

/// Device configuration; open arguments override it per session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub profile: ProfileConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub ring_buffer_size: usize,
    pub method: TransferMethod,
    /// Upper bound on any single wait before it is reported as a stall.
    pub stall_timeout_ms: u64,
    /// How long the idle transfer thread sleeps between polls when not signalled.
    pub idle_wait_us: u64,
    pub verbose: bool,
    pub writer_threads: usize,
    pub output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    pub enabled: bool,
    pub directory: PathBuf,
    /// Leading samples left out of the aggregate statistics.
    pub warmup_samples: usize,
}

/// How frames are read back from the GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMethod {
    /// Pixel-buffer objects, copied to host memory as soon as they are mapped.
    Ipbo,
    /// Pixel-buffer objects kept mapped until the writer copies them out.
    Ppbo,
    /// Synchronous read-back straight into host memory.
    Basic,
}

impl TransferMethod {
    pub fn uses_pbos(self) -> bool {
        !matches!(self, TransferMethod::Basic)
    }

    pub fn immediate_copy(self) -> bool {
        !matches!(self, TransferMethod::Ppbo)
    }
}

impl Default for TransferMethod {
    fn default() -> Self {
        // macOS drivers: keep buffers mapped until the writer copies out.
        if cfg!(target_os = "macos") {
            TransferMethod::Ppbo
        } else {
            TransferMethod::Ipbo
        }
    }
}

impl FromStr for TransferMethod {
    type Err = OutputError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pbo" | "ipbo" => Ok(TransferMethod::Ipbo),
            "ppbo" => Ok(TransferMethod::Ppbo),
            "basic" => Ok(TransferMethod::Basic),
            other => Err(OutputError::Config(format!(
                "--method {other}: expected one of ipbo, ppbo, basic"
            ))),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            ring_buffer_size: DEFAULT_RING_BUFFER_SIZE,
            method: TransferMethod::default(),
            stall_timeout_ms: 5_000,
            idle_wait_us: 500,
            verbose: false,
            writer_threads: 1,
            output: "out.#.tif".into(),
        }
    }
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: PathBuf::from("."),
            warmup_samples: 5,
        }
    }
}

impl Config {
    /// Defaults, overlaid with a TOML file when one is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| OutputError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn method_tags() {
        assert_eq!("pbo".parse::<TransferMethod>().unwrap(), TransferMethod::Ipbo);
        assert_eq!("ppbo".parse::<TransferMethod>().unwrap(), TransferMethod::Ppbo);
        assert!(!TransferMethod::Ppbo.immediate_copy());
        assert!(!TransferMethod::Basic.uses_pbos());
        assert!("dvp".parse::<TransferMethod>().is_err());
    }

    #[test]
    fn toml_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[device]\nring_buffer_size = 6\nmethod = \"basic\"\n[profile]\nenabled = true").unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.device.ring_buffer_size, 6);
        assert_eq!(config.device.method, TransferMethod::Basic);
        assert!(config.profile.enabled);
        assert_eq!(config.profile.warmup_samples, 5);
        assert_eq!(config.device.stall_timeout_ms, 5_000);
    }

    #[test]
    fn no_file_means_defaults() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.device.ring_buffer_size, DEFAULT_RING_BUFFER_SIZE);
    }
}
