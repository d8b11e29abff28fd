use std::time::Duration;

use thiserror::Error;

use crate::format::DataType;

/// Errors raised by the output device and its collaborators.
#[derive(Debug, Error)]
pub enum OutputError {
    /// Invalid or inconsistent open arguments. Aborts `open()`.
    #[error("invalid output configuration: {0}")]
    Config(String),

    #[error("failed to open output writer for {path}: {reason}")]
    WriterOpen { path: String, reason: String },

    /// The writer negotiated a format the device cannot produce.
    #[error("writer format mismatch: device {device:?}/{device_channels}ch, writer {writer:?}/{writer_channels}ch")]
    FormatMismatch {
        device: DataType,
        device_channels: usize,
        writer: DataType,
        writer_channels: usize,
    },

    #[error("output device is not open")]
    NotOpen,

    #[error("output device is not bound")]
    NotBound,

    /// The GPU read-back for this frame could not be mapped; no pixels exist for it.
    #[error("frame {sequence} was dropped during GPU read-back")]
    FrameDropped { sequence: u64 },

    /// The hand-off queue was closed and fully drained.
    #[error("frame hand-off queue closed")]
    Closed,

    #[error("stalled for {waited:?} waiting on {what}")]
    Stall { what: &'static str, waited: Duration },

    #[error("writer failed: {0}")]
    Writer(String),

    #[error("gpu error: {0}")]
    Gpu(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, OutputError>;
