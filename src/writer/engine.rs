//! "OVD Writer" thread and the frame source it hands to the movie writer.

use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument};

use super::{FrameSource, MovieInfo, MovieWriter, ReadRequest};
use crate::audio::{AudioBuffer, AudioFeed, AudioReadRequest};
use crate::device::state::DeviceLock;
use crate::error::{OutputError, Result};
use crate::frame::{FrameImage, FramePixels, ImageMeta};
use crate::pipeline::{Handoff, HandoffPixels, HandoffQueue};
use crate::profile::Profiler;
use crate::utils::spawn_named;

/// Views collected for a frame that is not complete yet.
#[derive(Default)]
struct Partial {
    images: Vec<FrameImage>,
    dropped: Option<u64>,
    views_seen: usize,
}

/// Consumer end of the hand-off queue, exposed to writers as a [`FrameSource`].
pub struct OutputSource {
    info: MovieInfo,
    template: ImageMeta,
    queue: Arc<HandoffQueue>,
    profiler: Arc<Mutex<Profiler>>,
    audio: Arc<AudioFeed>,
    stall_timeout: Duration,
    partial: Mutex<Partial>,
}

impl OutputSource {
    pub fn new(
        info: MovieInfo,
        template: ImageMeta,
        queue: Arc<HandoffQueue>,
        profiler: Arc<Mutex<Profiler>>,
        audio: Arc<AudioFeed>,
        stall_timeout: Duration,
    ) -> Self {
        Self {
            info,
            template,
            queue,
            profiler,
            audio,
            stall_timeout,
            partial: Mutex::new(Partial::default()),
        }
    }

    pub fn queue(&self) -> &HandoffQueue {
        &self.queue
    }

    /// Take the pixels out of `entry` and release its framebuffer.
    ///
    /// Host images are adopted as they are; mapped views are copied here, on
    /// the writer thread.
    fn adopt(&self, mut entry: Handoff) -> Option<FrameImage> {
        self.profiler.lock().start_output();
        let pixels = entry.pixels.take().map(|pixels| match pixels {
            HandoffPixels::Host(image) => FramePixels::Host(image),
            HandoffPixels::Mapped(view) => FramePixels::Shared(Bytes::copy_from_slice(&view)),
        });
        entry.release_framebuffer();
        self.profiler.lock().end_output();

        let meta = Arc::new(ImageMeta {
            sequence: entry.sequence,
            channel: entry.channel,
            ..self.template.clone()
        });
        debug!(
            sequence = entry.sequence,
            channel = entry.channel,
            queued_us = entry.queued_at.elapsed().as_micros() as u64,
            "frame delivered"
        );
        pixels.map(|pixels| FrameImage {
            pixels,
            meta,
            timestamp: Instant::now(),
        })
    }
}

impl FrameSource for OutputSource {
    fn info(&self) -> &MovieInfo {
        &self.info
    }

    fn images_at_frame(&self, _request: &ReadRequest) -> Result<Vec<FrameImage>> {
        let views = self.info.views.max(1);
        let mut partial = self.partial.lock();
        while partial.views_seen < views {
            // A stall leaves the views gathered so far for the next call.
            let entry = self.queue.pop_timeout(self.stall_timeout)?;
            let sequence = entry.sequence;
            partial.views_seen += 1;
            match self.adopt(entry) {
                Some(image) => partial.images.push(image),
                None => partial.dropped = Some(sequence),
            }
        }

        let done = std::mem::take(&mut *partial);
        match done.dropped {
            Some(sequence) => Err(OutputError::FrameDropped { sequence }),
            None => Ok(done.images),
        }
    }

    fn audio_fill_buffer(&self, request: &AudioReadRequest, buffer: &mut AudioBuffer) -> Result<usize> {
        Ok(self.audio.fill(request, buffer))
    }
}

/// Runs [`MovieWriter::write`] against an [`OutputSource`] on its own thread.
pub struct WriterEngine {
    writer: Arc<Mutex<Box<dyn MovieWriter>>>,
    source: Arc<OutputSource>,
    device: Arc<DeviceLock>,
}

impl WriterEngine {
    pub fn new(
        writer: Arc<Mutex<Box<dyn MovieWriter>>>,
        source: Arc<OutputSource>,
        device: Arc<DeviceLock>,
    ) -> Self {
        Self {
            writer,
            source,
            device,
        }
    }

    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        spawn_named("OVD Writer", move || self.run())
    }

    #[instrument(name = "writer", skip_all)]
    fn run(self) {
        info!("writer thread started");
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.writer.lock().write(self.source.as_ref())
        }));
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(payload) => Some(format!("writer panicked: {}", panic_message(payload.as_ref()))),
        };

        let mut state = self.device.lock("WRITER");
        match &failure {
            None => info!("writer finished"),
            Some(reason) => error!(error = %reason, "movie writer failed"),
        }
        state.writer_error = failure;
        state.writer_done = true;
        drop(state);
        self.device.notify();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioLayout;
    use crate::format::DataType;
    use crate::frame::{HostImage, Orientation};
    use crate::gpu::{Framebuffer, SoftwareFramebuffer};

    fn info(views: usize) -> MovieInfo {
        MovieInfo {
            video: true,
            audio: false,
            start: 1,
            end: 10,
            inc: 1,
            fps: 24.0,
            width: 2,
            height: 1,
            pixel_aspect: 1.0,
            num_channels: 3,
            data_type: DataType::UChar,
            channel_names: vec!["R".into(), "G".into(), "B".into()],
            audio_channels: 2,
            audio_sample_rate: 48_000.0,
            views,
            chapters: vec![],
        }
    }

    fn template() -> ImageMeta {
        ImageMeta {
            sequence: 0,
            channel: 0,
            width: 2,
            height: 1,
            stride: 6,
            channels: 3,
            data_type: DataType::UChar,
            channel_names: vec![],
            orientation: Orientation::BottomLeft,
        }
    }

    fn source(views: usize) -> OutputSource {
        OutputSource::new(
            info(views),
            template(),
            Arc::new(HandoffQueue::new()),
            Arc::new(Mutex::new(Profiler::new(false, 5))),
            Arc::new(AudioFeed::new(None, AudioLayout::Stereo, 48_000.0, 24.0, (1, 10))),
            Duration::from_millis(20),
        )
    }

    fn host_entry(sequence: u64, channel: usize, fb: Option<Arc<SoftwareFramebuffer>>) -> Handoff {
        let mut image = HostImage::zeroed(6).unwrap();
        image.fill(sequence as u8);
        Handoff {
            sequence,
            channel,
            slot: 0,
            pixels: Some(HandoffPixels::Host(image)),
            framebuffer: fb.map(|fb| fb as Arc<dyn Framebuffer>),
            queued_at: Instant::now(),
        }
    }

    #[test]
    fn host_pixels_are_adopted_without_copy() {
        let source = source(1);
        let entry = host_entry(3, 0, None);
        let ptr = match &entry.pixels {
            Some(HandoffPixels::Host(image)) => image.as_ptr(),
            _ => unreachable!(),
        };
        source.queue().push(entry).unwrap();

        let images = source.images_at_frame(&ReadRequest { frame: 1 }).unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].sequence(), 3);
        match &images[0].pixels {
            FramePixels::Host(image) => assert_eq!(image.as_ptr(), ptr),
            other => panic!("expected adopted host image, got {other:?}"),
        }
    }

    #[test]
    fn delivery_releases_the_framebuffer() {
        let source = source(1);
        let fb = Arc::new(SoftwareFramebuffer::filled(1, 6, 0));
        fb.begin_external_readback();
        source.queue().push(host_entry(0, 0, Some(fb.clone()))).unwrap();

        source.images_at_frame(&ReadRequest { frame: 1 }).unwrap();
        assert!(!fb.in_readback());
    }

    #[test]
    fn dropped_entry_surfaces_its_sequence() {
        let source = source(1);
        let fb = Arc::new(SoftwareFramebuffer::filled(1, 6, 0));
        fb.begin_external_readback();
        let mut entry = host_entry(4, 0, Some(fb.clone()));
        entry.pixels = None;
        source.queue().push(entry).unwrap();

        assert!(matches!(
            source.images_at_frame(&ReadRequest { frame: 1 }),
            Err(OutputError::FrameDropped { sequence: 4 })
        ));
        assert!(!fb.in_readback());
    }

    #[test]
    fn stereo_stall_keeps_the_first_view() {
        let source = source(2);
        source.queue().push(host_entry(0, 0, None)).unwrap();
        assert!(matches!(
            source.images_at_frame(&ReadRequest { frame: 1 }),
            Err(OutputError::Stall { .. })
        ));

        source.queue().push(host_entry(0, 1, None)).unwrap();
        let images = source.images_at_frame(&ReadRequest { frame: 1 }).unwrap();
        let channels: Vec<_> = images.iter().map(|i| i.meta.channel).collect();
        assert_eq!(channels, vec![0, 1]);
    }

    #[test]
    fn closed_queue_ends_the_stream() {
        let source = source(1);
        source.queue().close();
        assert!(matches!(
            source.images_at_frame(&ReadRequest { frame: 1 }),
            Err(OutputError::Closed)
        ));
    }

    struct Panicking;

    impl MovieWriter for Panicking {
        fn open(&mut self, info: &MovieInfo, _: &str, _: &crate::writer::WriteRequest) -> Result<MovieInfo> {
            Ok(info.clone())
        }

        fn write(&mut self, _source: &dyn FrameSource) -> Result<()> {
            panic!("encoder exploded");
        }
    }

    #[test]
    fn panicking_writer_is_recorded_as_failure() {
        let device = Arc::new(DeviceLock::new(2, false));
        let writer: Arc<Mutex<Box<dyn MovieWriter>>> = Arc::new(Mutex::new(Box::new(Panicking)));
        let handle = WriterEngine::new(writer, Arc::new(source(1)), device.clone())
            .spawn()
            .unwrap();

        assert!(handle.join().is_ok());
        let state = device.lock("TEST");
        assert!(state.writer_done);
        let reason = state.writer_error.as_deref().unwrap();
        assert!(reason.contains("encoder exploded"), "{reason}");
    }
}
