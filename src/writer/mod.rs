//! Movie writer contracts and the writer-side view of the device.

pub mod engine;
pub mod image_seq;

pub use engine::{OutputSource, WriterEngine};
pub use image_seq::ImageSequenceWriter;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::audio::{AudioBuffer, AudioReadRequest};
use crate::error::Result;
use crate::format::{DataFormat, DataType};
use crate::frame::FrameImage;

/// Named frame range embedded in the output movie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    pub title: String,
    pub start_frame: i64,
    pub end_frame: i64,
}

/// What the device produces, as offered to and negotiated with a writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovieInfo {
    pub video: bool,
    pub audio: bool,
    pub start: i64,
    pub end: i64,
    pub inc: i64,
    pub fps: f64,
    pub width: usize,
    pub height: usize,
    pub pixel_aspect: f32,
    /// Channels per pixel as the writer sees them.
    pub num_channels: usize,
    pub data_type: DataType,
    pub channel_names: Vec<String>,
    pub audio_channels: usize,
    pub audio_sample_rate: f64,
    /// One image per view at every frame.
    pub views: usize,
    pub chapters: Vec<Chapter>,
}

/// Encoding parameters passed to [`MovieWriter::open`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteRequest {
    pub verbose: bool,
    pub threads: usize,
    pub fps: f64,
    pub codec: Option<String>,
    pub audio_codec: Option<String>,
    pub quality: Option<f32>,
    pub pixel_aspect: f32,
    pub audio_channels: usize,
    pub audio_rate: f64,
    pub stereo: bool,
    pub comments: Option<String>,
    pub copyright: Option<String>,
    /// Writer-specific `key=value` pairs.
    pub parameters: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub frame: i64,
}

/// The device as seen from the writer thread.
pub trait FrameSource: Send + Sync {
    fn info(&self) -> &MovieInfo;

    /// Block until the next frame is available and return one image per view.
    ///
    /// Frames arrive in render order regardless of `request.frame`.
    fn images_at_frame(&self, request: &ReadRequest) -> Result<Vec<FrameImage>>;

    fn audio_fill_buffer(&self, request: &AudioReadRequest, buffer: &mut AudioBuffer) -> Result<usize>;
}

/// A movie/file writer driven from the "OVD Writer" thread.
pub trait MovieWriter: Send {
    /// Negotiate the output format. The returned info may change the channel
    /// count and data type; the device adapts or fails with a format mismatch.
    fn open(&mut self, info: &MovieInfo, filename: &str, request: &WriteRequest) -> Result<MovieInfo>;

    /// Pull frames from `source` until the range is written or the source is closed.
    fn write(&mut self, source: &dyn FrameSource) -> Result<()>;
}

/// Host-side pixel filter run by the transfer engine before frames are queued.
pub trait PixelTransform: Send + Sync {
    fn apply(&self, format: DataFormat, width: usize, height: usize, pixels: &mut [u8]);
}

pub type WriterFactory = Arc<dyn Fn(&str) -> Option<Box<dyn MovieWriter>> + Send + Sync>;

/// Built-in writer for `path`, if its extension is supported.
pub fn writer_for_path(path: &str) -> Option<Box<dyn MovieWriter>> {
    ImageSequenceWriter::for_path(path).map(|w| Box::new(w) as Box<dyn MovieWriter>)
}

pub fn default_writer_factory() -> WriterFactory {
    Arc::new(writer_for_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_picks_image_sequences_by_extension() {
        let factory = default_writer_factory();
        assert!(factory("out.#.png").is_some());
        assert!(factory("out.#.tif").is_some());
        assert!(factory("movie.mov").is_none());
    }
}
