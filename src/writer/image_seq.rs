//! Numbered still-image output (`out.#.png`, `frames/@.tif`).

use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb, Rgba};
use tracing::{debug, info, warn};

use super::{FrameSource, MovieInfo, MovieWriter, ReadRequest, WriteRequest};
use crate::error::{OutputError, Result};
use crate::format::DataType;
use crate::frame::{FrameImage, Orientation};
use crate::utils::expand_frame_pattern;

const VIEW_NAMES: [&str; 2] = ["left", "right"];

/// Writes every frame to its own file, substituting the frame number into the path.
#[derive(Debug)]
pub struct ImageSequenceWriter {
    pattern: String,
    format: ImageFormat,
    info: Option<MovieInfo>,
    verbose: bool,
    written: usize,
}

impl ImageSequenceWriter {
    /// Writer for `path` if its extension names a supported image format.
    pub fn for_path(path: &str) -> Option<Self> {
        let format = ImageFormat::from_path(path).ok()?;
        matches!(format, ImageFormat::Png | ImageFormat::Tiff | ImageFormat::Jpeg).then(|| Self {
            pattern: path.to_string(),
            format,
            info: None,
            verbose: false,
            written: 0,
        })
    }

    /// Frames saved by the last `write`.
    pub fn written(&self) -> usize {
        self.written
    }

    fn negotiate(&self, offered: &MovieInfo) -> MovieInfo {
        let jpeg = self.format == ImageFormat::Jpeg;
        let num_channels = if offered.num_channels == 4 && !jpeg { 4 } else { 3 };
        let data_type = match offered.data_type {
            DataType::UChar => DataType::UChar,
            _ if jpeg => DataType::UChar,
            _ => DataType::UShort,
        };
        let mut info = offered.clone();
        info.num_channels = num_channels;
        info.data_type = data_type;
        info.channel_names = crate::format::channel_names(num_channels, 8);
        info
    }

    fn frame_path(&self, frame: i64, view: usize, views: usize) -> String {
        let path = expand_frame_pattern(&self.pattern, frame);
        if views < 2 {
            return path;
        }
        let tag = VIEW_NAMES
            .get(view)
            .map(|name| name.to_string())
            .unwrap_or_else(|| format!("view{view}"));
        match path.rsplit_once('.') {
            Some((stem, ext)) => format!("{stem}.{tag}.{ext}"),
            None => format!("{path}.{tag}"),
        }
    }

    fn save(&self, image: &FrameImage, path: &str) -> Result<()> {
        let meta = &image.meta;
        let (w, h) = (meta.width as u32, meta.height as u32);
        let data = image.data();
        let decoded = match (meta.data_type, meta.channels) {
            (DataType::UChar, 4) => {
                ImageBuffer::<Rgba<u8>, _>::from_raw(w, h, data.to_vec()).map(DynamicImage::ImageRgba8)
            }
            (DataType::UChar, _) => {
                ImageBuffer::<Rgb<u8>, _>::from_raw(w, h, data.to_vec()).map(DynamicImage::ImageRgb8)
            }
            (DataType::UShort, 4) => {
                ImageBuffer::<Rgba<u16>, _>::from_raw(w, h, to_u16(data)).map(DynamicImage::ImageRgba16)
            }
            (DataType::UShort, _) => {
                ImageBuffer::<Rgb<u16>, _>::from_raw(w, h, to_u16(data)).map(DynamicImage::ImageRgb16)
            }
            (other, _) => {
                return Err(OutputError::Writer(format!(
                    "image sequence cannot store {other:?} pixels"
                )))
            }
        };
        let mut decoded = decoded.ok_or_else(|| {
            OutputError::Writer(format!(
                "frame {} holds {} bytes, too few for {w}x{h}",
                meta.sequence,
                data.len()
            ))
        })?;

        if meta.orientation == Orientation::BottomLeft {
            decoded = decoded.flipv();
        }
        decoded.save_with_format(path, self.format)?;
        if self.verbose {
            debug!(path, sequence = meta.sequence, "saved frame");
        }
        Ok(())
    }
}

fn to_u16(data: &[u8]) -> Vec<u16> {
    data.chunks_exact(2)
        .map(|pair| u16::from_ne_bytes([pair[0], pair[1]]))
        .collect()
}

impl MovieWriter for ImageSequenceWriter {
    fn open(&mut self, info: &MovieInfo, filename: &str, request: &WriteRequest) -> Result<MovieInfo> {
        self.pattern = filename.to_string();
        self.format = ImageFormat::from_path(filename).map_err(|e| OutputError::WriterOpen {
            path: filename.to_string(),
            reason: e.to_string(),
        })?;
        self.verbose = request.verbose;

        let negotiated = self.negotiate(info);
        info!(
            pattern = %self.pattern,
            format = ?self.format,
            data_type = ?negotiated.data_type,
            channels = negotiated.num_channels,
            "image sequence opened"
        );
        self.info = Some(negotiated.clone());
        Ok(negotiated)
    }

    fn write(&mut self, source: &dyn FrameSource) -> Result<()> {
        let info = self
            .info
            .clone()
            .ok_or_else(|| OutputError::Writer("image sequence written before open".into()))?;
        self.written = 0;
        let step = info.inc.max(1);
        let mut frame = info.start;

        while frame <= info.end {
            match source.images_at_frame(&ReadRequest { frame }) {
                Ok(images) => {
                    for (view, image) in images.iter().enumerate() {
                        self.save(image, &self.frame_path(frame, view, images.len()))?;
                    }
                    self.written += 1;
                    frame += step;
                }
                Err(OutputError::FrameDropped { sequence }) => {
                    warn!(frame, sequence, "frame dropped upstream, skipping");
                    frame += step;
                }
                Err(OutputError::Stall { what, waited }) => {
                    warn!(frame, ?waited, "still waiting on {what}");
                }
                Err(OutputError::Closed) => {
                    debug!(frame, "frame source closed");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        info!(frames = self.written, "image sequence complete");
        Ok(())
    }
}
