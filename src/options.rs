//! Parsing of device open arguments.
//!
//! Arguments are command-line style (`--size 1920 1080 --format RGBA8`). They
//! are layered over `OVD_*` environment variables with the `config` crate,
//! the command line winning, and over the device [`Config`](crate::Config).

use std::path::PathBuf;
use std::time::Duration;

use config::{Environment, Map};
use serde::Deserialize;

use crate::audio::AudioLayout;
use crate::error::{OutputError, Result};
use crate::format::PixelSpec;
use crate::writer::Chapter;
use crate::{Config, TransferMethod};

const USAGE: &str = "\
Output Device Options:
  -h, --help                   usage message
  -v, --verbose                verbose lock and frame diagnostics
  -o, --output FILE            output file (default out.#.tif)
  -s, --size W H               output resolution (also WxH)
  -f, --format FMT             RGB[A] + {8,10,12,16,32} + [F], e.g. RGB8
      --fps FPS                output frame rate
  -a, --pixel-aspect RATIO     output pixel aspect ratio
  -m, --method M               ipbo | ppbo | basic (pbo = ipbo)
  -p, --profile                write ovd_profile_<pid>.csv at unbind
      --profile-dir DIR        where the profile CSV goes
      --ring-buffer-size N     read-back ring length
      --threads N              writer threads
      --stereo                 two views per frame
      --stall-timeout-ms MS    report waits longer than this
      --codec, --audio-codec   writer codecs
      --audio-rate HZ, --audio-layout N, --has-audio 0|1
      --quality Q, --comments TEXT, --copyright TEXT
      --frame-start N, --frame-end N
      --args K=V ...           writer arguments
      --chapter-ranges A B ... chapter in/out pairs
      --chapter-titles T ...   chapter titles
      --yuv SAMPLING           output YUV sampling (e.g. 4:2:2)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arity {
    Flag,
    One,
    Many,
}

const OPTIONS: &[(&str, Arity)] = &[
    ("help", Arity::Flag),
    ("verbose", Arity::Flag),
    ("profile", Arity::Flag),
    ("stereo", Arity::Flag),
    ("size", Arity::Many),
    ("args", Arity::Many),
    ("chapter_ranges", Arity::Many),
    ("chapter_titles", Arity::Many),
    ("output", Arity::One),
    ("format", Arity::One),
    ("yuv", Arity::One),
    ("fps", Arity::One),
    ("pixel_aspect", Arity::One),
    ("method", Arity::One),
    ("threads", Arity::One),
    ("ring_buffer_size", Arity::One),
    ("profile_dir", Arity::One),
    ("stall_timeout_ms", Arity::One),
    ("codec", Arity::One),
    ("audio_codec", Arity::One),
    ("audio_rate", Arity::One),
    ("audio_layout", Arity::One),
    ("has_audio", Arity::One),
    ("quality", Arity::One),
    ("comments", Arity::One),
    ("copyright", Arity::One),
    ("frame_start", Arity::One),
    ("frame_end", Arity::One),
];

const SHORT: &[(char, &str)] = &[
    ('h', "help"),
    ('v', "verbose"),
    ('o', "output"),
    ('s', "size"),
    ('f', "format"),
    ('a', "pixel_aspect"),
    ('p', "profile"),
    ('m', "method"),
];

/// Everything the environment and command line may set, before validation.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawOptions {
    help: bool,
    verbose: Option<bool>,
    profile: Option<bool>,
    stereo: bool,
    size: Option<String>,
    args: Vec<String>,
    chapter_ranges: Vec<i64>,
    chapter_titles: Vec<String>,
    output: Option<String>,
    format: Option<String>,
    yuv: Option<String>,
    fps: Option<f64>,
    pixel_aspect: Option<f32>,
    method: Option<String>,
    threads: Option<usize>,
    ring_buffer_size: Option<usize>,
    profile_dir: Option<PathBuf>,
    stall_timeout_ms: Option<u64>,
    codec: Option<String>,
    audio_codec: Option<String>,
    audio_rate: Option<f64>,
    audio_layout: Option<u32>,
    has_audio: Option<i32>,
    quality: Option<f32>,
    comments: Option<String>,
    copyright: Option<String>,
    frame_start: Option<i64>,
    frame_end: Option<i64>,
}

/// Validated settings of one open session.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputOptions {
    pub width: usize,
    pub height: usize,
    pub pixel: PixelSpec,
    pub fps: f64,
    pub pixel_aspect: f32,
    pub output: String,
    pub method: TransferMethod,
    pub ring_buffer_size: usize,
    pub writer_threads: usize,
    pub verbose: bool,
    pub stereo: bool,
    pub profile: bool,
    pub profile_dir: PathBuf,
    pub stall_timeout: Duration,
    pub codec: Option<String>,
    pub audio_codec: Option<String>,
    pub audio_rate: f64,
    pub audio_layout: AudioLayout,
    pub has_audio: bool,
    pub quality: f32,
    pub comments: Option<String>,
    pub copyright: Option<String>,
    pub yuv: Option<String>,
    pub frame_start: i64,
    pub frame_end: i64,
    pub writer_args: Vec<(String, String)>,
    pub chapters: Vec<Chapter>,
}

impl OutputOptions {
    /// Parse `args` over the process environment and `defaults`.
    pub fn parse(args: &[String], defaults: &Config) -> Result<Self> {
        Self::parse_with_env(args, defaults, None)
    }

    /// Like [`OutputOptions::parse`] with an explicit environment in place of
    /// the process one.
    pub fn parse_with_env(args: &[String], defaults: &Config, env: Option<Map<String, String>>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(Environment::with_prefix("OVD").try_parsing(false).source(env));
        for (key, value) in tokenize(args)? {
            builder = match value {
                Value::Flag => builder.set_override(key, true),
                Value::One(v) => builder.set_override(key, v),
                Value::Many(vs) if key == "size" => builder.set_override(key, vs.join(" ")),
                Value::Many(vs) => builder.set_override(key, vs),
            }
            .map_err(config_error)?;
        }
        let raw: RawOptions = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(config_error)?;
        Self::validate(raw, defaults)
    }

    fn validate(raw: RawOptions, defaults: &Config) -> Result<Self> {
        if raw.help {
            return Err(OutputError::Config(format!("--help\n{USAGE}")));
        }

        let (width, height) = match &raw.size {
            Some(size) => parse_size(size)?,
            None => (1920, 1080),
        };

        let fps = raw.fps.unwrap_or(24.0);
        if !fps.is_finite() || fps <= 0.0 {
            return Err(bad("--fps FPS invalid value"));
        }
        let pixel_aspect = raw.pixel_aspect.unwrap_or(1.0);
        if !pixel_aspect.is_finite() || pixel_aspect <= 0.0 {
            return Err(bad("--pixel-aspect FLOAT invalid value"));
        }

        let pixel = match &raw.format {
            Some(tag) => tag.parse()?,
            None => PixelSpec::default(),
        };
        let method = match &raw.method {
            Some(m) => m.parse()?,
            None => defaults.device.method,
        };

        let ring_buffer_size = raw.ring_buffer_size.unwrap_or(defaults.device.ring_buffer_size);
        if ring_buffer_size == 0 {
            return Err(bad("--ring-buffer-size must be at least 1"));
        }
        if ring_buffer_size < 2 && method.uses_pbos() {
            return Err(bad(
                "--ring-buffer-size 1 cannot overlap pixel-buffer read-backs; use 2 or more, or --method basic",
            ));
        }

        let writer_threads = raw.threads.unwrap_or(defaults.device.writer_threads);
        if writer_threads == 0 {
            return Err(bad("--threads must be at least 1"));
        }
        let stall_timeout_ms = raw.stall_timeout_ms.unwrap_or(defaults.device.stall_timeout_ms);
        if stall_timeout_ms == 0 {
            return Err(bad("--stall-timeout-ms must be positive"));
        }

        let frame_start = raw.frame_start.unwrap_or(1);
        let frame_end = raw.frame_end.unwrap_or(frame_start);
        if frame_end < frame_start {
            return Err(bad("--frame-end comes before --frame-start"));
        }

        let audio_layout = match raw.audio_layout {
            Some(code) => AudioLayout::from_code(code)?,
            None => AudioLayout::default(),
        };

        Ok(Self {
            width,
            height,
            pixel,
            fps,
            pixel_aspect,
            output: raw.output.unwrap_or_else(|| defaults.device.output.clone()),
            method,
            ring_buffer_size,
            writer_threads,
            verbose: raw.verbose.unwrap_or(defaults.device.verbose),
            stereo: raw.stereo,
            profile: raw.profile.unwrap_or(defaults.profile.enabled),
            profile_dir: raw.profile_dir.unwrap_or_else(|| defaults.profile.directory.clone()),
            stall_timeout: Duration::from_millis(stall_timeout_ms),
            codec: raw.codec,
            audio_codec: raw.audio_codec,
            audio_rate: raw.audio_rate.unwrap_or(48_000.0),
            audio_layout,
            has_audio: raw.has_audio.is_some_and(|v| v != 0),
            quality: raw.quality.unwrap_or(1.0),
            comments: raw.comments,
            copyright: raw.copyright,
            yuv: raw.yuv,
            frame_start,
            frame_end,
            writer_args: raw.args.iter().filter_map(|a| split_writer_arg(a)).collect(),
            chapters: chapters(&raw.chapter_ranges, &raw.chapter_titles)?,
        })
    }
}

fn bad(msg: &str) -> OutputError {
    OutputError::Config(msg.to_string())
}

fn config_error(e: config::ConfigError) -> OutputError {
    OutputError::Config(e.to_string())
}

enum Value {
    Flag,
    One(String),
    Many(Vec<String>),
}

fn is_option(arg: &str) -> bool {
    if arg.starts_with("--") {
        return true;
    }
    let mut chars = arg.chars();
    chars.next() == Some('-') && chars.next().is_some_and(|c| c.is_ascii_alphabetic())
}

/// Canonical key for `--name` / `-n`. Dashes become underscores; camelCase
/// chapter options are accepted too.
fn canonical(arg: &str) -> Option<&'static str> {
    let name = if let Some(long) = arg.strip_prefix("--") {
        match long {
            "chapterRanges" => "chapter_ranges".to_string(),
            "chapterTitles" => "chapter_titles".to_string(),
            other => other.replace('-', "_"),
        }
    } else {
        let short = arg.strip_prefix('-')?;
        let mut chars = short.chars();
        let (c, rest) = (chars.next()?, chars.as_str());
        if !rest.is_empty() {
            return None;
        }
        return SHORT.iter().find(|(s, _)| *s == c).map(|(_, key)| *key);
    };
    OPTIONS.iter().find(|(key, _)| *key == name).map(|(key, _)| *key)
}

fn arity(key: &str) -> Arity {
    OPTIONS
        .iter()
        .find(|(k, _)| *k == key)
        .map_or(Arity::One, |(_, a)| *a)
}

fn tokenize(args: &[String]) -> Result<Vec<(&'static str, Value)>> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < args.len() {
        let arg = args[i].as_str();
        if !is_option(arg) {
            return Err(OutputError::Config(format!("unexpected argument {arg:?}")));
        }
        let (name, inline) = match arg.split_once('=') {
            Some((name, value)) if name.starts_with("--") => (name, Some(value.to_string())),
            _ => (arg, None),
        };
        let key = canonical(name)
            .ok_or_else(|| OutputError::Config(format!("unknown option {name}\n{USAGE}")))?;
        i += 1;

        let mut values: Vec<String> = inline.into_iter().collect();
        let arity = arity(key);
        if arity != Arity::Flag {
            while i < args.len() && !is_option(&args[i]) {
                if arity == Arity::One && !values.is_empty() {
                    break;
                }
                values.push(args[i].clone());
                i += 1;
            }
        }

        let value = match arity {
            Arity::Flag if values.is_empty() => Value::Flag,
            Arity::Flag => return Err(OutputError::Config(format!("{name} takes no value"))),
            _ if values.is_empty() => {
                return Err(OutputError::Config(format!("{name} requires a value")))
            }
            Arity::One => Value::One(values.remove(0)),
            Arity::Many => Value::Many(values),
        };
        out.push((key, value));
    }
    Ok(out)
}

fn parse_size(size: &str) -> Result<(usize, usize)> {
    let dims: Vec<&str> = size
        .split(|c: char| c.is_whitespace() || c == 'x')
        .filter(|s| !s.is_empty())
        .collect();
    let parsed: Option<Vec<usize>> = dims.iter().map(|d| d.parse().ok()).collect();
    match parsed.as_deref() {
        Some(&[w, h]) if w > 0 && h > 0 => Ok((w, h)),
        Some(&[_, _]) => Err(bad("--size WIDTH HEIGHT sizes must be non-0")),
        _ => Err(bad("--size WIDTH HEIGHT is required")),
    }
}

/// `key=value` writer argument; repeated `=` collapse, a bare key gets an empty value.
fn split_writer_arg(arg: &str) -> Option<(String, String)> {
    let mut parts = arg.split('=').filter(|s| !s.is_empty());
    let key = parts.next()?;
    Some((key.to_string(), parts.next().unwrap_or("").to_string()))
}

fn chapters(ranges: &[i64], titles: &[String]) -> Result<Vec<Chapter>> {
    if ranges.is_empty() || titles.is_empty() {
        return Ok(Vec::new());
    }
    if ranges.len() != 2 * titles.len() {
        return Err(bad("mismatched number of --chapter-ranges and --chapter-titles"));
    }
    Ok(titles
        .iter()
        .zip(ranges.chunks_exact(2))
        .map(|(title, range)| Chapter {
            title: title.clone(),
            start_frame: range[0],
            end_frame: range[1],
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(line: &str) -> Vec<String> {
        line.split_whitespace().map(str::to_string).collect()
    }

    fn parse(line: &str) -> Result<OutputOptions> {
        OutputOptions::parse_with_env(&args(line), &Config::default(), Some(Map::new()))
    }

    #[test]
    fn defaults_without_arguments() {
        let opts = parse("").unwrap();
        assert_eq!((opts.width, opts.height), (1920, 1080));
        assert_eq!(opts.fps, 24.0);
        assert_eq!(opts.output, "out.#.tif");
        assert_eq!((opts.frame_start, opts.frame_end), (1, 1));
        assert_eq!(opts.pixel, PixelSpec::default());
        assert_eq!(opts.stall_timeout, Duration::from_secs(5));
    }

    #[test]
    fn command_line_values() {
        let opts = parse(
            "--size 64 64 -f RGBA16F --fps 30 --ring-buffer-size 4 --method ppbo -o clip.#.png \
             --frame-start 10 --frame-end 20 --args crf=18 preset --stereo -p",
        )
        .unwrap();
        assert_eq!((opts.width, opts.height), (64, 64));
        assert_eq!(opts.pixel, PixelSpec::new(16, 4, true));
        assert_eq!(opts.method, TransferMethod::Ppbo);
        assert_eq!(opts.ring_buffer_size, 4);
        assert_eq!(opts.output, "clip.#.png");
        assert_eq!((opts.frame_start, opts.frame_end), (10, 20));
        assert_eq!(
            opts.writer_args,
            vec![("crf".into(), "18".into()), ("preset".into(), String::new())]
        );
        assert!(opts.stereo && opts.profile);
    }

    #[test]
    fn environment_under_command_line() {
        let mut env = Map::new();
        env.insert("OVD_RING_BUFFER_SIZE".to_string(), "5".to_string());
        env.insert("OVD_FPS".to_string(), "25".to_string());
        env.insert("OVD_PROFILE".to_string(), "1".to_string());
        let opts =
            OutputOptions::parse_with_env(&args("--fps 50"), &Config::default(), Some(env)).unwrap();
        assert_eq!(opts.ring_buffer_size, 5);
        assert_eq!(opts.fps, 50.0);
        assert!(opts.profile);
    }

    #[test]
    fn size_accepts_wxh() {
        let opts = parse("--size=640x480").unwrap();
        assert_eq!((opts.width, opts.height), (640, 480));
        assert!(parse("--size 0 480").is_err());
        assert!(parse("--size 640").is_err());
    }

    #[test]
    fn fatal_configuration_errors() {
        for line in [
            "--help",
            "--bogus 1",
            "--fps 0",
            "--pixel-aspect -1",
            "--fps nan",
            "--fps inf",
            "--pixel-aspect NaN",
            "--format RGB7",
            "--ring-buffer-size 1",
            "--method dvp",
            "--chapter-ranges 1 10 11 --chapter-titles intro",
            "--verbose yes",
            "stray",
        ] {
            assert!(
                matches!(parse(line), Err(OutputError::Config(_))),
                "{line} should be rejected"
            );
        }
    }

    #[test]
    fn direct_path_allows_single_slot_ring() {
        let opts = parse("--ring-buffer-size 1 --method basic").unwrap();
        assert_eq!(opts.ring_buffer_size, 1);
    }

    #[test]
    fn chapters_pair_ranges_with_titles() {
        let opts = parse("--chapter-ranges 1 10 11 20 --chapterTitles intro outro").unwrap();
        assert_eq!(opts.chapters.len(), 2);
        assert_eq!(opts.chapters[1].title, "outro");
        assert_eq!((opts.chapters[1].start_frame, opts.chapters[1].end_frame), (11, 20));
    }

    #[test]
    fn negative_numbers_are_values() {
        let opts = parse("--frame-start -5 --frame-end 5").unwrap();
        assert_eq!(opts.frame_start, -5);
    }
}
