//! GPU read-back and output-transfer timing.
//!
//! Every read-back contributes a GPU sample (issue to host-visible) and every
//! delivered frame an output sample (pop to release). Times are seconds since
//! the last bind.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingSummary {
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

impl TimingSummary {
    fn of(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let (min, max, sum) = samples
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY, 0.0), |(lo, hi, sum), &t| {
                (lo.min(t), hi.max(t), sum + t)
            });
        Some(Self {
            count: samples.len(),
            mean: sum / samples.len() as f64,
            min,
            max,
        })
    }
}

#[derive(Debug)]
pub struct Profiler {
    enabled: bool,
    warmup: usize,
    epoch: Instant,
    gpu_begin: Vec<f64>,
    gpu_time: Vec<f64>,
    output_begin: Vec<f64>,
    output_time: Vec<f64>,
}

impl Profiler {
    pub fn new(enabled: bool, warmup: usize) -> Self {
        Self {
            enabled,
            warmup,
            epoch: Instant::now(),
            gpu_begin: Vec::new(),
            gpu_time: Vec::new(),
            output_begin: Vec::new(),
            output_time: Vec::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Drop all samples and restart the clock.
    pub fn reset(&mut self) {
        self.epoch = Instant::now();
        self.gpu_begin.clear();
        self.gpu_time.clear();
        self.output_begin.clear();
        self.output_time.clear();
    }

    fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    pub fn start_gpu(&mut self) {
        if self.enabled {
            let now = self.now();
            self.gpu_begin.push(now);
        }
    }

    /// Close the oldest open GPU sample.
    pub fn end_gpu(&mut self) {
        if !self.enabled || self.gpu_time.len() >= self.gpu_begin.len() {
            return;
        }
        let elapsed = self.now() - self.gpu_begin[self.gpu_time.len()];
        metrics::histogram!("ovd_gpu_readback_ms").record(elapsed * 1e3);
        self.gpu_time.push(elapsed);
    }

    pub fn start_output(&mut self) {
        if self.enabled {
            let now = self.now();
            self.output_begin.push(now);
        }
    }

    pub fn end_output(&mut self) {
        if !self.enabled || self.output_time.len() >= self.output_begin.len() {
            return;
        }
        let elapsed = self.now() - self.output_begin[self.output_time.len()];
        metrics::histogram!("ovd_output_transfer_ms").record(elapsed * 1e3);
        self.output_time.push(elapsed);
    }

    /// Number of complete rows the CSV would contain.
    pub fn rows(&self) -> usize {
        self.gpu_time.len().min(self.output_time.len())
    }

    fn steady(&self, samples: &[f64]) -> Option<TimingSummary> {
        let tail = samples.get(self.warmup..).filter(|s| !s.is_empty());
        TimingSummary::of(tail.unwrap_or(samples))
    }

    /// Aggregates past the warm-up samples, falling back to all samples on short runs.
    pub fn gpu_summary(&self) -> Option<TimingSummary> {
        self.steady(&self.gpu_time)
    }

    pub fn output_summary(&self) -> Option<TimingSummary> {
        self.steady(&self.output_time)
    }

    pub fn log_summary(&self) {
        if let Some(gpu) = self.gpu_summary() {
            info!(
                samples = gpu.count,
                "GPU read-back mean {:.3} ms, min {:.3} ms, max {:.3} ms",
                gpu.mean * 1e3,
                gpu.min * 1e3,
                gpu.max * 1e3
            );
        }
        if let Some(out) = self.output_summary() {
            info!(
                samples = out.count,
                "output transfer mean {:.3} ms, min {:.3} ms, max {:.3} ms",
                out.mean * 1e3,
                out.min * 1e3,
                out.max * 1e3
            );
        }
    }

    /// `ovd_profile_<pid>.csv` inside `dir`.
    pub fn csv_path(dir: &Path) -> PathBuf {
        dir.join(format!("ovd_profile_{}.csv", std::process::id()))
    }

    /// Write one row per frame with both samples. Returns the row count.
    pub fn write_csv(&self, path: &Path) -> io::Result<usize> {
        let mut out = BufWriter::new(File::create(path)?);
        writeln!(out, "GPUStart,GPUDuration,OutputBegin,OutputDuration")?;
        let rows = self.rows();
        for i in 0..rows {
            writeln!(
                out,
                "{},{},{},{}",
                self.gpu_begin[i], self.gpu_time[i], self.output_begin[i], self.output_time[i]
            )?;
        }
        out.flush()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_profiler_records_nothing() {
        let mut profiler = Profiler::new(false, 5);
        profiler.start_gpu();
        profiler.end_gpu();
        assert_eq!(profiler.rows(), 0);
        assert!(profiler.gpu_summary().is_none());
    }

    #[test]
    fn pipelined_gpu_samples_pair_in_order() {
        let mut profiler = Profiler::new(true, 0);
        profiler.start_gpu();
        profiler.start_gpu();
        profiler.end_gpu();
        profiler.end_gpu();
        profiler.end_gpu();
        assert_eq!(profiler.gpu_time.len(), 2);
    }

    #[test]
    fn summary_skips_warmup() {
        let mut profiler = Profiler::new(true, 2);
        profiler.gpu_time = vec![9.0, 9.0, 1.0, 3.0];
        let summary = profiler.gpu_summary().unwrap();
        assert_eq!(summary.count, 2);
        assert_eq!((summary.min, summary.max, summary.mean), (1.0, 3.0, 2.0));

        profiler.gpu_time.truncate(2);
        assert_eq!(profiler.gpu_summary().unwrap().count, 2);
    }

    #[test]
    fn csv_has_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut profiler = Profiler::new(true, 5);
        for _ in 0..3 {
            profiler.start_gpu();
            profiler.end_gpu();
            profiler.start_output();
            profiler.end_output();
        }
        let path = Profiler::csv_path(dir.path());
        assert_eq!(profiler.write_csv(&path).unwrap(), 3);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "GPUStart,GPUDuration,OutputBegin,OutputDuration");
        assert_eq!(lines.len(), 4);
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("ovd_profile_"));
    }
}
