//! Per-transfer progress accounting and throughput estimation
//!
//! Speed is a moving average over a ring of timestamped byte counts; report
//! lines are throttled to one per second and pushed to a display callback so
//! the tracker itself never touches stdout or the logger directly.

use std::time::{Duration, Instant};

const SAMPLE_WINDOW_SECONDS: u64 = 5;
const SAMPLES_PER_SECOND: u64 = 20;
const MAX_SAMPLE_COUNT: usize = (SAMPLE_WINDOW_SECONDS * SAMPLES_PER_SECOND) as usize;

const SAMPLING_INTERVAL: Duration = Duration::from_millis(1000 / SAMPLES_PER_SECOND);
const REPORTING_INTERVAL: Duration = Duration::from_secs(1);

/// Newest sample older than this bleeds the estimate toward zero.
const STALE_SAMPLE_AGE: Duration = Duration::from_millis(250);

pub type DisplayCallback = Box<dyn Fn(&str) + Send>;

struct Transfer {
    name: String,
    total_size: u64,
    transferred_size: u64,
    transferred_compressed_size: u64,
    is_compressed: bool,
    start_time: Instant,
    last_report_time: Instant,
    last_sample_time: Instant,
}

#[derive(Clone, Copy)]
struct Sample {
    time: Instant,
    transferred_size: u64,
}

pub struct TransferTracker {
    transfer_verb: &'static str,
    display: DisplayCallback,
    transfer: Option<Transfer>,
    samples: Vec<Sample>,
    next_sample_index: usize,
}

impl TransferTracker {
    pub fn new(transfer_verb: &'static str, display: DisplayCallback) -> Self {
        TransferTracker {
            transfer_verb,
            display,
            transfer: None,
            samples: Vec::new(),
            next_sample_index: 0,
        }
    }

    pub fn begin(&mut self, name: &str, total_size: u64, is_compressed: bool) {
        let now = Instant::now();
        self.transfer = Some(Transfer {
            name: name.to_string(),
            total_size,
            transferred_size: 0,
            transferred_compressed_size: 0,
            is_compressed,
            start_time: now,
            last_report_time: now,
            last_sample_time: now,
        });
        self.samples.clear();
        self.next_sample_index = 0;

        let (size, units) = human_bytes(total_size as f64);
        (self.display)(&format!(
            "{} file `{}` {}({:.1} {})...",
            self.transfer_verb,
            name,
            if is_compressed { "[compressed] " } else { "" },
            size,
            units,
        ));
    }

    pub fn progress(&mut self, chunk_size: u64, compressed_size: u64) {
        self.progress_at(Instant::now(), chunk_size, compressed_size);
    }

    fn progress_at(&mut self, now: Instant, chunk_size: u64, compressed_size: u64) {
        let Some(transfer) = self.transfer.as_mut() else {
            return;
        };
        transfer.transferred_size += chunk_size;
        transfer.transferred_compressed_size += compressed_size;

        if now.duration_since(transfer.last_sample_time) >= SAMPLING_INTERVAL {
            let sample = Sample {
                time: now,
                transferred_size: transfer.transferred_size,
            };
            if self.samples.len() < MAX_SAMPLE_COUNT {
                self.samples.push(sample);
            } else {
                self.samples[self.next_sample_index] = sample;
                self.next_sample_index = (self.next_sample_index + 1) % MAX_SAMPLE_COUNT;
            }
            transfer.last_sample_time = now;
        }

        if now.duration_since(transfer.last_report_time) >= REPORTING_INTERVAL {
            let percentage = if transfer.total_size == 0 {
                100.0
            } else {
                transfer.transferred_size as f64 / transfer.total_size as f64 * 100.0
            };
            let speed = speed_estimate(&self.samples, self.next_sample_index, transfer, now);
            let remaining = (transfer.total_size - transfer.transferred_size) as f64;
            let eta = Duration::from_secs_f64(remaining / speed.max(1.0));

            let (done, done_units) = human_bytes(transfer.transferred_size as f64);
            let (total, total_units) = human_bytes(transfer.total_size as f64);
            let (speed_value, speed_units) = human_bytes(speed);
            (self.display)(&format!(
                "`{}`: {:.1}% - {:.1} {}/{:.1} {} - {:.1} {}/s - remaining {}",
                transfer.name,
                percentage,
                done,
                done_units,
                total,
                total_units,
                speed_value,
                speed_units,
                human_duration(eta),
            ));
            transfer.last_report_time = now;
        }
    }

    pub fn end(&mut self) {
        let Some(transfer) = self.transfer.take() else {
            return;
        };
        let elapsed = transfer.start_time.elapsed();
        let speed = transfer.total_size as f64 / elapsed.as_secs_f64().max(0.0001);

        let (size, size_units) = human_bytes(transfer.total_size as f64);
        let (speed_value, speed_units) = human_bytes(speed);
        let compression_info = if transfer.is_compressed && transfer.total_size > 0 {
            let ratio = transfer.transferred_compressed_size as f64
                / transfer.total_size as f64
                * 100.0;
            format!(", compression {ratio:.1}%")
        } else {
            String::new()
        };
        (self.display)(&format!(
            "finished {} file `{}` ({:.1} {}) in {} ({:.1} {}/s){}",
            self.transfer_verb,
            transfer.name,
            size,
            size_units,
            human_duration(elapsed),
            speed_value,
            speed_units,
            compression_info,
        ));
    }
}

/// Bytes per second at `now`. Falls back to the whole-transfer average until
/// two samples exist; decays to zero once the ring goes stale.
fn speed_estimate(
    samples: &[Sample],
    next_sample_index: usize,
    transfer: &Transfer,
    now: Instant,
) -> f64 {
    let Some((oldest, newest)) = min_max_samples(samples, next_sample_index) else {
        let elapsed = now.duration_since(transfer.start_time).as_secs_f64();
        return transfer.transferred_size as f64 / elapsed.max(0.0001);
    };

    let since_newest = now.duration_since(newest.time);
    if since_newest >= Duration::from_secs(SAMPLE_WINDOW_SECONDS + 1) {
        return 0.0;
    }

    let newest_time = if since_newest >= STALE_SAMPLE_AGE {
        now
    } else {
        newest.time
    };

    let window = newest_time.duration_since(oldest.time).as_secs_f64();
    let transferred = newest.transferred_size - oldest.transferred_size;
    transferred as f64 / window.max(0.0001)
}

fn min_max_samples(samples: &[Sample], next_sample_index: usize) -> Option<(Sample, Sample)> {
    if samples.len() < 2 {
        return None;
    }
    if samples.len() < MAX_SAMPLE_COUNT {
        return Some((samples[0], samples[samples.len() - 1]));
    }
    let newest_index = if next_sample_index == 0 {
        samples.len() - 1
    } else {
        next_sample_index - 1
    };
    Some((samples[next_sample_index], samples[newest_index]))
}

/// Scales a byte count into the largest unit that keeps the value < 1024.
pub fn human_bytes(bytes: f64) -> (f64, &'static str) {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes;
    for unit in &UNITS[..UNITS.len() - 1] {
        if value < 1024.0 {
            return (value, *unit);
        }
        value /= 1024.0;
    }
    (value, UNITS[UNITS.len() - 1])
}

pub fn human_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}
