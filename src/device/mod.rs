//! The output device: ties the read-back ring, the transfer engine and the
//! movie writer together behind an open / bind / transfer / unbind / close
//! lifecycle driven from the render thread.

pub mod state;

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use self::state::DeviceLock;
use crate::audio::{AudioFeed, AudioGraph};
use crate::error::{OutputError, Result};
use crate::format::{channel_names, DataFormat, DataType, DerivedFormat, PixelSpec};
use crate::frame::{ImageMeta, Orientation};
use crate::gpu::{Framebuffer, GpuBackend, ReadLayout};
use crate::options::OutputOptions;
use crate::pipeline::{HandoffQueue, QueueStats};
use crate::profile::Profiler;
use crate::transfer::{Channel, Readback, TransferEngine};
use crate::writer::{
    default_writer_factory, MovieInfo, MovieWriter, OutputSource, PixelTransform, WriteRequest,
    WriterEngine, WriterFactory,
};
use crate::{Config, TransferMethod};

const RENDER: &str = "RENDER";
const UNBIND: &str = "UNBIND";

/// Counters and cursors of a device, for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub read_count: u64,
    pub read_index: usize,
    pub write_count: u64,
    pub write_index: usize,
    pub frames_dropped: u64,
    pub transfer_done: bool,
    pub writer_done: bool,
    pub queue: QueueStats,
}

/// Output format as reported to the host application.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFormat {
    pub width: usize,
    pub height: usize,
    pub pixel_aspect: f32,
    pub fps: f64,
    pub description: String,
}

struct Bound {
    queue: Arc<HandoffQueue>,
    transfer: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

/// Everything that exists between `open()` and `close()`.
struct Session<G: GpuBackend> {
    options: OutputOptions,
    pixel: PixelSpec,
    derived: DerivedFormat,
    info: MovieInfo,
    template: ImageMeta,
    writer: Arc<Mutex<Box<dyn MovieWriter>>>,
    channels: Arc<Vec<Channel>>,
    device: Arc<DeviceLock>,
    readback: Readback<G>,
    profiler: Arc<Mutex<Profiler>>,
    audio: Arc<AudioFeed>,
    bound: Option<Bound>,
}

impl<G: GpuBackend> Session<G> {
    fn cursor(&self) -> (u64, usize) {
        let state = self.device.lock(RENDER);
        (state.read_count, state.read_index)
    }

    fn advance_read(&self) {
        self.device.lock(RENDER).advance_read();
        self.device.notify();
    }

    fn begin_readback(framebuffer: &Arc<G::Framebuffer>) {
        framebuffer.bind();
        framebuffer.begin_external_readback();
    }
}

/// Output video device over the GPU context `G`.
pub struct OutputDevice<G: GpuBackend> {
    name: String,
    config: Config,
    gpu: Arc<G>,
    writer_factory: WriterFactory,
    audio_graph: Option<Arc<dyn AudioGraph>>,
    transform: Option<Arc<dyn PixelTransform>>,
    session: Option<Session<G>>,
}

impl<G: GpuBackend> OutputDevice<G> {
    pub fn new(name: impl Into<String>, gpu: Arc<G>, config: Config) -> Self {
        Self {
            name: name.into(),
            config,
            gpu,
            writer_factory: default_writer_factory(),
            audio_graph: None,
            transform: None,
            session: None,
        }
    }

    /// Replace the writer lookup (by output file name) used by `open()`.
    pub fn with_writer_factory(mut self, factory: WriterFactory) -> Self {
        self.writer_factory = factory;
        self
    }

    pub fn with_audio_graph(mut self, graph: Arc<dyn AudioGraph>) -> Self {
        self.audio_graph = Some(graph);
        self
    }

    pub fn with_pixel_transform(mut self, transform: Arc<dyn PixelTransform>) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parse `args`, open and negotiate with the writer, and size the ring.
    ///
    /// Any error leaves the device closed.
    #[instrument(skip_all, fields(device = %self.name))]
    pub fn open(&mut self, args: &[String]) -> Result<()> {
        if self.session.is_some() {
            self.close()?;
        }
        let options = OutputOptions::parse(args, &self.config)?;
        let derived = options.pixel.derive();
        let offered = MovieInfo {
            video: true,
            audio: options.has_audio,
            start: options.frame_start,
            end: options.frame_end,
            inc: 1,
            fps: options.fps,
            width: options.width,
            height: options.height,
            pixel_aspect: options.pixel_aspect,
            num_channels: derived.channels,
            data_type: derived.data_type,
            channel_names: channel_names(derived.channels, options.pixel.bits),
            audio_channels: options.audio_layout.channels(),
            audio_sample_rate: options.audio_rate,
            views: if options.stereo { 2 } else { 1 },
            chapters: options.chapters.clone(),
        };

        let mut writer = (self.writer_factory)(&options.output).ok_or_else(|| OutputError::WriterOpen {
            path: options.output.clone(),
            reason: "no writer handles this file type".into(),
        })?;
        let negotiated = writer
            .open(&offered, &options.output, &write_request(&options))
            .map_err(|e| match e {
                e @ OutputError::WriterOpen { .. } => e,
                other => OutputError::WriterOpen {
                    path: options.output.clone(),
                    reason: other.to_string(),
                },
            })?;

        let (pixel, derived) = reconcile(&options, &offered, &negotiated)?;
        let layout = ReadLayout {
            width: options.width,
            height: options.height,
            format: derived.format,
        };
        let names = channel_names(derived.channels, pixel.bits);
        let template = ImageMeta {
            sequence: 0,
            channel: 0,
            width: options.width,
            height: options.height,
            stride: layout.stride(),
            channels: derived.channels,
            data_type: derived.data_type,
            channel_names: names.clone(),
            orientation: Orientation::BottomLeft,
        };
        let info = MovieInfo {
            num_channels: derived.channels,
            data_type: derived.data_type,
            channel_names: names,
            views: offered.views,
            ..negotiated
        };

        let views = info.views;
        let channels = (0..views)
            .map(|c| Channel::new(c, options.ring_buffer_size, layout.len(), options.verbose))
            .collect();
        let profiler = Arc::new(Mutex::new(Profiler::new(
            options.profile,
            self.config.profile.warmup_samples,
        )));
        let readback = Readback::new(
            self.gpu.clone(),
            layout,
            options.method,
            options.stall_timeout,
            profiler.clone(),
        );
        let audio = Arc::new(AudioFeed::new(
            self.audio_graph.clone(),
            options.audio_layout,
            options.audio_rate,
            options.fps,
            (options.frame_start, options.frame_end),
        ));

        info!(
            output = %options.output,
            method = ?options.method,
            ring = options.ring_buffer_size,
            views,
            "{}x{} {} ({:?}/{:?}) at {} fps",
            options.width,
            options.height,
            pixel,
            derived.format,
            derived.data_type,
            options.fps
        );

        self.session = Some(Session {
            device: Arc::new(DeviceLock::new(options.ring_buffer_size, options.verbose)),
            options,
            pixel,
            derived,
            info,
            template,
            writer: Arc::new(Mutex::new(writer)),
            channels: Arc::new(channels),
            readback,
            profiler,
            audio,
            bound: None,
        });
        Ok(())
    }

    /// Unbind if bound, then drop the session.
    pub fn close(&mut self) -> Result<()> {
        if self.session.is_none() {
            return Ok(());
        }
        let result = self.unbind();
        self.session = None;
        info!(device = %self.name, "closed");
        result
    }

    /// Allocate ring resources and start the transfer and writer threads.
    #[instrument(skip_all, fields(device = %self.name))]
    pub fn bind(&mut self) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        if session.bound.is_some() {
            return Ok(());
        }

        session.device.lock(RENDER).reset();
        session.profiler.lock().reset();
        for channel in session.channels.iter() {
            if let Err(e) = session.readback.allocate(channel) {
                session.channels.iter().for_each(|c| session.readback.release(c));
                return Err(e);
            }
        }

        let queue = Arc::new(HandoffQueue::new());
        let source = Arc::new(OutputSource::new(
            session.info.clone(),
            session.template.clone(),
            queue.clone(),
            session.profiler.clone(),
            session.audio.clone(),
            session.options.stall_timeout,
        ));
        let engine = TransferEngine::new(
            session.channels.clone(),
            session.device.clone(),
            queue.clone(),
            *session.readback.layout(),
            self.transform.clone(),
            session.options.stall_timeout,
            Duration::from_micros(self.config.device.idle_wait_us),
            session.options.verbose,
        );
        let mut bound = Bound {
            queue,
            transfer: None,
            writer: None,
        };
        let spawned = engine.spawn().and_then(|transfer| {
            bound.transfer = Some(transfer);
            WriterEngine::new(session.writer.clone(), source, session.device.clone()).spawn()
        });
        session.device.lock(RENDER).bound = true;
        match spawned {
            Ok(writer) => bound.writer = Some(writer),
            Err(e) => {
                session.bound = Some(bound);
                if let Err(unbind) = self.unbind() {
                    warn!(error = %unbind, "unbind after failed spawn");
                }
                return Err(e.into());
            }
        }
        session.bound = Some(bound);
        info!("bound");
        Ok(())
    }

    /// Read back one rendered frame. Called once per frame from the render thread.
    pub fn transfer(&self, framebuffer: &Arc<G::Framebuffer>) -> Result<()> {
        let Some(session) = &self.session else {
            return Ok(());
        };
        if session.bound.is_none() {
            return Err(OutputError::NotBound);
        }
        let (count, index) = session.cursor();
        let channel = &session.channels[0];
        Session::<G>::begin_readback(framebuffer);
        if let Err(e) = session.readback.read(channel, count, index, framebuffer) {
            framebuffer.end_external_readback();
            return Err(e);
        }
        session.advance_read();
        Ok(())
    }

    /// Read back both views of a stereo frame. Falls back to `transfer(left)` in mono.
    pub fn transfer2(&self, left: &Arc<G::Framebuffer>, right: &Arc<G::Framebuffer>) -> Result<()> {
        let Some(session) = &self.session else {
            return Ok(());
        };
        if session.channels.len() < 2 {
            return self.transfer(left);
        }
        if session.bound.is_none() {
            return Err(OutputError::NotBound);
        }

        let (count, index) = session.cursor();
        let views = [(&session.channels[0], left), (&session.channels[1], right)];
        for (channel, _) in views {
            session.readback.finalize_outstanding(channel, count, index);
        }
        session.readback.claim(views[0].0, index)?;
        if let Err(e) = session.readback.claim(views[1].0, index) {
            session.readback.abandon(views[0].0, index);
            return Err(e);
        }
        for (n, (channel, framebuffer)) in views.iter().enumerate() {
            Session::<G>::begin_readback(framebuffer);
            if let Err(e) = session.readback.issue(channel, count, index, framebuffer) {
                framebuffer.end_external_readback();
                if n == 0 {
                    session.readback.abandon(views[1].0, index);
                }
                return Err(e);
            }
        }
        session.advance_read();
        Ok(())
    }

    /// Drain in-flight frames, stop both threads and release ring resources.
    ///
    /// Returns the first failure seen: a thread that did not exit in time, a
    /// panicked thread, or an error recorded by the writer.
    #[instrument(skip_all, fields(device = %self.name))]
    pub fn unbind(&mut self) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let Some(mut bound) = session.bound.take() else {
            return Ok(());
        };
        let timeout = session.options.stall_timeout;
        let device = session.device.clone();
        let mut failure: Option<OutputError> = None;

        let (read_count, read_index) = session.cursor();
        for channel in session.channels.iter() {
            session.readback.finalize_outstanding(channel, read_count, read_index);
        }
        device.notify();
        if !device.wait_until(UNBIND, timeout, |s| s.write_count >= s.read_count || s.transfer_done) {
            warn!(
                in_flight = device.lock(UNBIND).in_flight(),
                "transfer engine did not drain before unbind"
            );
        }

        device.lock(UNBIND).thread_stop = true;
        device.notify();
        for channel in session.channels.iter() {
            for slot in channel.slots() {
                if slot.release_stuck_reader(UNBIND) {
                    debug!(channel = channel.index(), slot = slot.index(), "released stuck reader lock");
                }
            }
        }

        if let Some(handle) = bound.transfer.take() {
            if let Err(e) = join_within(&device, handle, timeout, "transfer thread exit", |s| {
                s.transfer_done
            }) {
                failure.get_or_insert(e);
            }
        }

        bound.queue.close();
        if let Some(handle) = bound.writer.take() {
            if let Err(e) = join_within(&device, handle, timeout, "writer thread exit", |s| s.writer_done) {
                failure.get_or_insert(e);
            }
        }

        let mut undelivered = 0;
        while let Ok(mut entry) = bound.queue.pop() {
            entry.release_framebuffer();
            undelivered += 1;
        }
        if undelivered > 0 {
            debug!(undelivered, "discarded frames the writer never consumed");
        }

        for channel in session.channels.iter() {
            session.readback.release(channel);
        }

        let (write_count, writer_error) = {
            let mut state = device.lock(UNBIND);
            state.bound = false;
            (state.write_count, state.writer_error.take())
        };

        let profiler = session.profiler.lock();
        if profiler.enabled() {
            profiler.log_summary();
            let path = Profiler::csv_path(&session.options.profile_dir);
            match profiler.write_csv(&path) {
                Ok(rows) => info!(path = %path.display(), rows, "wrote profile"),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "could not write profile");
                    failure.get_or_insert(e.into());
                }
            }
        }
        drop(profiler);

        info!(
            frames = write_count,
            dropped = session.readback.dropped(),
            queued = bound.queue.stats().pushed,
            "unbound"
        );
        match (failure, writer_error) {
            (Some(e), _) => Err(e),
            (None, Some(msg)) => Err(OutputError::Writer(msg)),
            (None, None) => Ok(()),
        }
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    pub fn is_bound(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.bound.is_some())
    }

    pub fn is_stereo(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.channels.len() > 1)
    }

    /// Transfers never wait for the writer; the ring absorbs the difference.
    pub fn will_block_on_transfer(&self) -> bool {
        false
    }

    pub fn width(&self) -> usize {
        self.session.as_ref().map_or(0, |s| s.options.width)
    }

    pub fn height(&self) -> usize {
        self.session.as_ref().map_or(0, |s| s.options.height)
    }

    pub fn resolution(&self) -> (usize, usize) {
        (self.width(), self.height())
    }

    pub fn format(&self) -> Option<VideoFormat> {
        self.session.as_ref().map(|s| VideoFormat {
            width: s.options.width,
            height: s.options.height,
            pixel_aspect: s.options.pixel_aspect,
            fps: s.options.fps,
            description: format!(
                "{}x{} {} {}fps",
                s.options.width, s.options.height, s.pixel, s.options.fps
            ),
        })
    }

    pub fn pixel_spec(&self) -> Option<PixelSpec> {
        self.session.as_ref().map(|s| s.pixel)
    }

    pub fn data_format(&self) -> Option<DataFormat> {
        self.session.as_ref().map(|s| s.derived.format)
    }

    pub fn data_type(&self) -> Option<DataType> {
        self.session.as_ref().map(|s| s.derived.data_type)
    }

    pub fn channel_count(&self) -> usize {
        self.session.as_ref().map_or(0, |s| s.derived.channels)
    }

    pub fn method(&self) -> Option<TransferMethod> {
        self.session.as_ref().map(|s| s.options.method)
    }

    /// Movie description as negotiated with the writer.
    pub fn movie_info(&self) -> Option<&MovieInfo> {
        self.session.as_ref().map(|s| &s.info)
    }

    /// Output clock: frames transferred since bind, in seconds.
    pub fn output_time(&self) -> f64 {
        self.session.as_ref().map_or(0.0, |s| {
            s.device.lock(RENDER).read_count as f64 / s.options.fps
        })
    }

    pub fn async_max_mapped_buffers(&self) -> usize {
        self.session.as_ref().map_or(0, |s| s.options.ring_buffer_size)
    }

    pub fn stats(&self) -> DeviceStats {
        let Some(session) = &self.session else {
            return DeviceStats::default();
        };
        let state = session.device.lock(RENDER).clone();
        DeviceStats {
            read_count: state.read_count,
            read_index: state.read_index,
            write_count: state.write_count,
            write_index: state.write_index,
            frames_dropped: session.readback.dropped(),
            transfer_done: state.transfer_done,
            writer_done: state.writer_done,
            queue: session
                .bound
                .as_ref()
                .map(|b| b.queue.stats())
                .unwrap_or_default(),
        }
    }
}

impl<G: GpuBackend> Drop for OutputDevice<G> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(device = %self.name, error = %e, "close on drop failed");
        }
    }
}

/// Re-derive the read-back format after the writer's negotiation and check
/// that device and writer agree.
fn reconcile(
    options: &OutputOptions,
    offered: &MovieInfo,
    negotiated: &MovieInfo,
) -> Result<(PixelSpec, DerivedFormat)> {
    let pixel = if negotiated.data_type == offered.data_type && negotiated.num_channels == offered.num_channels {
        options.pixel
    } else {
        debug!(
            data_type = ?negotiated.data_type,
            channels = negotiated.num_channels,
            "writer changed the pixel format"
        );
        PixelSpec::from_data_type(negotiated.data_type, negotiated.num_channels)
    };
    let derived = pixel.derive();
    if derived.data_type != negotiated.data_type || derived.channels != negotiated.num_channels {
        return Err(OutputError::FormatMismatch {
            device: derived.data_type,
            device_channels: derived.channels,
            writer: negotiated.data_type,
            writer_channels: negotiated.num_channels,
        });
    }
    Ok((pixel, derived))
}

fn write_request(options: &OutputOptions) -> WriteRequest {
    WriteRequest {
        verbose: options.verbose,
        threads: options.writer_threads,
        fps: options.fps,
        codec: options.codec.clone(),
        audio_codec: options.audio_codec.clone(),
        quality: Some(options.quality),
        pixel_aspect: options.pixel_aspect,
        audio_channels: options.audio_layout.channels(),
        audio_rate: options.audio_rate,
        stereo: options.stereo,
        comments: options.comments.clone(),
        copyright: options.copyright.clone(),
        parameters: writer_parameters(options),
    }
}

/// Writer arguments plus `yuv=<sampling>`. Chroma subsampling is left to the
/// writer or to a [`PixelTransform`]; the device itself never resamples.
fn writer_parameters(options: &OutputOptions) -> Vec<(String, String)> {
    let mut parameters = options.writer_args.clone();
    if let Some(yuv) = &options.yuv {
        if !parameters.iter().any(|(key, _)| key == "yuv") {
            parameters.push(("yuv".to_string(), yuv.clone()));
        }
    }
    parameters
}

/// Wait up to `timeout` for `done`, then join. A thread that does not finish
/// in time is left detached and reported as a stall.
fn join_within<F>(
    device: &DeviceLock,
    handle: JoinHandle<()>,
    timeout: Duration,
    what: &'static str,
    done: F,
) -> Result<()>
where
    F: FnMut(&state::DeviceState) -> bool,
{
    if !device.wait_until(UNBIND, timeout, done) {
        warn!(?timeout, "{what} timed out, detaching thread");
        return Err(OutputError::Stall { what, waited: timeout });
    }
    handle
        .join()
        .map_err(|_| OutputError::Writer(format!("{what}: thread panicked")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::SoftwareGpu;
    use crate::writer::{FrameSource, ReadRequest};

    /// Writer that accepts whatever it is offered, optionally overriding the type.
    struct Negotiating {
        data_type: Option<DataType>,
        channels: Option<usize>,
    }

    impl MovieWriter for Negotiating {
        fn open(&mut self, info: &MovieInfo, _: &str, _: &WriteRequest) -> Result<MovieInfo> {
            let mut info = info.clone();
            if let Some(dt) = self.data_type {
                info.data_type = dt;
            }
            if let Some(c) = self.channels {
                info.num_channels = c;
            }
            Ok(info)
        }

        fn write(&mut self, source: &dyn FrameSource) -> Result<()> {
            loop {
                match source.images_at_frame(&ReadRequest { frame: 0 }) {
                    Err(OutputError::Closed) => return Ok(()),
                    Err(OutputError::Stall { .. }) | Ok(_) | Err(OutputError::FrameDropped { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
        }
    }

    fn device(data_type: Option<DataType>, channels: Option<usize>) -> OutputDevice<SoftwareGpu> {
        let factory: WriterFactory = Arc::new(move |_: &str| {
            Some(Box::new(Negotiating { data_type, channels }) as Box<dyn MovieWriter>)
        });
        OutputDevice::new("test", Arc::new(SoftwareGpu::new()), Config::default())
            .with_writer_factory(factory)
    }

    fn args(line: &str) -> Vec<String> {
        line.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn lifecycle_calls_are_noops_when_closed() {
        let mut dev = device(None, None);
        let fb = Arc::new(crate::gpu::SoftwareFramebuffer::filled(1, 12, 0));
        assert!(dev.bind().is_ok());
        assert!(dev.transfer(&fb).is_ok());
        assert!(dev.unbind().is_ok());
        assert!(!dev.is_bound());
    }

    #[test]
    fn transfer_before_bind_is_an_error() {
        let mut dev = device(None, None);
        dev.open(&args("--size 2 2")).unwrap();
        let fb = Arc::new(crate::gpu::SoftwareFramebuffer::filled(1, 12, 0));
        assert!(matches!(dev.transfer(&fb), Err(OutputError::NotBound)));
    }

    #[test]
    fn writer_type_override_rederives_format() {
        let mut dev = device(Some(DataType::UShort), None);
        dev.open(&args("--size 4 4 --format RGBA8")).unwrap();
        assert_eq!(dev.data_format(), Some(DataFormat::Rgba16));
        assert_eq!(dev.pixel_spec().unwrap().bits, 16);
    }

    #[test]
    fn irreconcilable_writer_format_fails_open() {
        let mut dev = device(Some(DataType::PackedR10G10B10X2), Some(1));
        assert!(matches!(
            dev.open(&args("--size 4 4")),
            Err(OutputError::FormatMismatch { .. })
        ));
        assert!(!dev.is_open());
    }

    #[test]
    fn unknown_output_type_fails_open() {
        let mut dev = OutputDevice::new("test", Arc::new(SoftwareGpu::new()), Config::default());
        assert!(matches!(
            dev.open(&args("--output movie.xyz")),
            Err(OutputError::WriterOpen { .. })
        ));
        assert!(!dev.is_open());
    }

    #[test]
    fn introspection_after_open() {
        let mut dev = device(None, None);
        dev.open(&args("--size 64 32 --fps 25 --ring-buffer-size 4 --stereo")).unwrap();
        assert_eq!(dev.resolution(), (64, 32));
        assert_eq!(dev.async_max_mapped_buffers(), 4);
        assert!(dev.is_stereo());
        assert!(!dev.will_block_on_transfer());
        assert_eq!(dev.format().unwrap().description, "64x32 RGB8 25fps");
        assert_eq!(dev.movie_info().unwrap().views, 2);
        dev.close().unwrap();
        assert!(!dev.is_open());
    }

    #[test]
    fn yuv_sampling_reaches_the_writer() {
        let options = OutputOptions::parse_with_env(
            &args("--yuv 4:2:2 --args crf=18"),
            &Config::default(),
            Some(config::Map::new()),
        )
        .unwrap();
        let request = write_request(&options);
        assert_eq!(
            request.parameters,
            vec![
                ("crf".to_string(), "18".to_string()),
                ("yuv".to_string(), "4:2:2".to_string())
            ]
        );

        let explicit = OutputOptions::parse_with_env(
            &args("--yuv 4:2:2 --args yuv=4:4:4"),
            &Config::default(),
            Some(config::Map::new()),
        )
        .unwrap();
        assert_eq!(
            write_request(&explicit).parameters,
            vec![("yuv".to_string(), "4:4:4".to_string())]
        );
    }
}
