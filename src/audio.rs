//! Audio pulled by the writer alongside the video frames.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{OutputError, Result};

/// Speaker layout of the produced audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AudioLayout {
    Mono,
    #[default]
    Stereo,
    Surround51,
    Surround71,
}

impl AudioLayout {
    /// Layout from the numeric `--audio-layout` code.
    pub fn from_code(code: u32) -> Result<Self> {
        match code {
            0 => Ok(AudioLayout::Mono),
            1 => Ok(AudioLayout::Stereo),
            2 => Ok(AudioLayout::Surround51),
            3 => Ok(AudioLayout::Surround71),
            other => Err(OutputError::Config(format!(
                "--audio-layout {other}: expected 0 (mono), 1 (stereo), 2 (5.1) or 3 (7.1)"
            ))),
        }
    }

    pub fn channels(self) -> usize {
        match self {
            AudioLayout::Mono => 1,
            AudioLayout::Stereo => 2,
            AudioLayout::Surround51 => 6,
            AudioLayout::Surround71 => 8,
        }
    }
}

pub fn time_to_samples(seconds: f64, rate: f64) -> usize {
    (seconds * rate).round().max(0.0) as usize
}

/// Interleaved float samples covering `[start_time, start_time + len/rate)`.
#[derive(Debug, Clone, Default)]
pub struct AudioBuffer {
    samples: Vec<f32>,
    frames: usize,
    layout: AudioLayout,
    rate: f64,
    start_time: f64,
}

impl AudioBuffer {
    /// Resize to `frames` sample frames of `layout` and zero the contents.
    pub fn reconfigure(&mut self, frames: usize, layout: AudioLayout, rate: f64, start_time: f64) {
        self.samples.clear();
        self.samples.resize(frames * layout.channels(), 0.0);
        self.frames = frames;
        self.layout = layout;
        self.rate = rate;
        self.start_time = start_time;
    }

    /// Sample frames (one sample per speaker).
    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn layout(&self) -> AudioLayout {
        self.layout
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    pub fn start_sample(&self) -> u64 {
        time_to_samples(self.start_time, self.rate) as u64
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn samples_mut(&mut self) -> &mut [f32] {
        &mut self.samples
    }
}

/// Writer-side request for audio.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioReadRequest {
    pub start_time: f64,
    pub duration: f64,
}

/// Parameters an [`AudioGraph`] is configured with before the first fill.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioConfiguration {
    pub rate: f64,
    pub layout: AudioLayout,
    pub block_samples: usize,
    pub fps: f64,
    pub backwards: bool,
    pub start_sample: u64,
    pub total_samples: u64,
}

/// Source of the audio mixed into the output movie.
pub trait AudioGraph: Send + Sync {
    fn configure(&self, config: &AudioConfiguration);

    /// Fill `buffer` (already sized and zeroed) and return the sample frames produced.
    fn fill_buffer(&self, buffer: &mut AudioBuffer, fps: f64) -> usize;
}

/// Per-session audio settings plus the lazily configured graph.
pub struct AudioFeed {
    graph: Option<Arc<dyn AudioGraph>>,
    layout: AudioLayout,
    rate: f64,
    fps: f64,
    frame_start: i64,
    frame_end: i64,
    pending_configure: Mutex<bool>,
}

impl AudioFeed {
    pub fn new(
        graph: Option<Arc<dyn AudioGraph>>,
        layout: AudioLayout,
        rate: f64,
        fps: f64,
        frame_range: (i64, i64),
    ) -> Self {
        Self {
            graph,
            layout,
            rate,
            fps,
            frame_start: frame_range.0,
            frame_end: frame_range.1,
            pending_configure: Mutex::new(true),
        }
    }

    pub fn layout(&self) -> AudioLayout {
        self.layout
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Size `buffer` for the request and have the graph fill it.
    ///
    /// The graph is configured on the first call only. Without a graph the
    /// buffer is left silent and its full length is reported.
    pub fn fill(&self, request: &AudioReadRequest, buffer: &mut AudioBuffer) -> usize {
        let frames = time_to_samples(request.duration, self.rate);
        buffer.reconfigure(frames, self.layout, self.rate, request.start_time);

        let Some(graph) = &self.graph else {
            return frames;
        };

        {
            let mut pending = self.pending_configure.lock();
            if *pending {
                let span = (self.frame_end - self.frame_start) as f64 / self.fps;
                let config = AudioConfiguration {
                    rate: self.rate,
                    layout: self.layout,
                    block_samples: frames,
                    fps: self.fps,
                    backwards: false,
                    start_sample: buffer.start_sample(),
                    total_samples: time_to_samples(span, self.rate) as u64,
                };
                debug!(?config, "configuring audio graph");
                graph.configure(&config);
                *pending = false;
            }
        }

        graph.fill_buffer(buffer, self.fps)
    }
}
