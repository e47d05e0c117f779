use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
    time::{Duration, Instant},
};

use crate::{distributed::DistributedContext, TrainingError};

pub const DEFAULT_WINDOW: usize = 20;

/// How a meter renders itself in progress lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterFormat {
    /// `median (global_avg)`
    MedianAndGlobal { precision: usize },
    /// Most recent value.
    Latest { precision: usize },
    /// Window average.
    WindowAvg { precision: usize },
    /// Epoch average only.
    Global { precision: usize },
}

impl Default for MeterFormat {
    fn default() -> Self {
        MeterFormat::MedianAndGlobal { precision: 4 }
    }
}

/// Tracks a series of values and exposes smoothed views over a window as
/// well as the average over every value ever recorded.
#[derive(Debug, Clone)]
pub struct SmoothedValue {
    window: VecDeque<f64>,
    window_size: usize,
    total: f64,
    count: f64,
    format: MeterFormat,
}

impl Default for SmoothedValue {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, MeterFormat::default())
    }
}

impl SmoothedValue {
    pub fn new(window_size: usize, format: MeterFormat) -> Self {
        let window_size = window_size.max(1);
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size,
            total: 0.0,
            count: 0.0,
            format,
        }
    }

    pub fn update(&mut self, value: f64) {
        self.update_weighted(value, 1.0);
    }

    /// Records `value` once in the window and `weight` times in the totals.
    pub fn update_weighted(&mut self, value: f64, weight: f64) {
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(value);
        self.count += weight;
        self.total += value * weight;
    }

    pub fn count(&self) -> f64 {
        self.count
    }

    pub fn total(&self) -> f64 {
        self.total
    }

    /// Lower median of the window.
    pub fn median(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.window.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        sorted[(sorted.len() - 1) / 2]
    }

    pub fn avg(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }

    pub fn global_avg(&self) -> f64 {
        if self.count == 0.0 {
            0.0
        } else {
            self.total / self.count
        }
    }

    pub fn max(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    pub fn value(&self) -> f64 {
        self.window.back().copied().unwrap_or(0.0)
    }

    fn totals(&self) -> [f64; 2] {
        [self.count, self.total]
    }

    fn set_totals(&mut self, count: f64, total: f64) {
        self.count = count;
        self.total = total;
    }
}

impl fmt::Display for SmoothedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.format {
            MeterFormat::MedianAndGlobal { precision } => write!(
                f,
                "{:.p$} ({:.p$})",
                self.median(),
                self.global_avg(),
                p = precision
            ),
            MeterFormat::Latest { precision } => write!(f, "{:.p$}", self.value(), p = precision),
            MeterFormat::WindowAvg { precision } => write!(f, "{:.p$}", self.avg(), p = precision),
            MeterFormat::Global { precision } => {
                write!(f, "{:.p$}", self.global_avg(), p = precision)
            }
        }
    }
}

/// Named meters plus periodic console reporting.
#[derive(Debug, Clone)]
pub struct MetricLogger {
    meters: BTreeMap<String, SmoothedValue>,
    delimiter: String,
    print: bool,
}

impl Default for MetricLogger {
    fn default() -> Self {
        Self::new("  ")
    }
}

impl MetricLogger {
    pub fn new(delimiter: impl Into<String>) -> Self {
        Self {
            meters: BTreeMap::new(),
            delimiter: delimiter.into(),
            print: true,
        }
    }

    /// Suppresses console output, e.g. on every rank but the main one.
    pub fn with_printing(mut self, enabled: bool) -> Self {
        self.print = enabled;
        self
    }

    pub fn add_meter(&mut self, name: impl Into<String>, meter: SmoothedValue) {
        self.meters.insert(name.into(), meter);
    }

    pub fn update(&mut self, name: &str, value: f64) {
        self.update_weighted(name, value, 1.0);
    }

    pub fn update_weighted(&mut self, name: &str, value: f64, weight: f64) {
        self.meters
            .entry(name.to_string())
            .or_default()
            .update_weighted(value, weight);
    }

    pub fn meter(&self, name: &str) -> Option<&SmoothedValue> {
        self.meters.get(name)
    }

    pub fn meters(&self) -> impl Iterator<Item = (&str, &SmoothedValue)> {
        self.meters.iter().map(|(name, meter)| (name.as_str(), meter))
    }

    pub fn global_avg(&self, name: &str) -> Option<f64> {
        self.meters.get(name).map(SmoothedValue::global_avg)
    }

    /// Replaces every meter's (count, total) with the sum over all ranks.
    /// Issues exactly one collective; meters are visited in name order.
    pub fn synchronize_between_processes(
        &mut self,
        ctx: &DistributedContext,
    ) -> Result<(), TrainingError> {
        if !ctx.is_distributed() {
            return Ok(());
        }
        let mut buffer: Vec<f64> = self.meters.values().flat_map(|m| m.totals()).collect();
        ctx.all_reduce_sum(&mut buffer)?;
        for (meter, pair) in self.meters.values_mut().zip(buffer.chunks_exact(2)) {
            meter.set_totals(pair[0], pair[1]);
        }
        Ok(())
    }

    /// Drives `iterable`, handing each item to `body`, and prints a progress
    /// line every `print_freq` steps and on the last step.
    pub fn log_every<I, F>(
        &mut self,
        iterable: I,
        print_freq: usize,
        header: &str,
        mut body: F,
    ) -> Result<(), TrainingError>
    where
        I: IntoIterator,
        I::IntoIter: ExactSizeIterator,
        F: FnMut(&mut MetricLogger, usize, I::Item) -> Result<(), TrainingError>,
    {
        let iter = iterable.into_iter();
        let total = iter.len();
        let print_freq = print_freq.max(1);
        let width = total.to_string().len();
        let timer_format = MeterFormat::WindowAvg { precision: 4 };
        let mut iter_time = SmoothedValue::new(DEFAULT_WINDOW, timer_format);
        let mut data_time = SmoothedValue::new(DEFAULT_WINDOW, timer_format);

        let start = Instant::now();
        let mut end = Instant::now();
        let mut steps = 0usize;
        for (index, item) in iter.enumerate() {
            data_time.update(end.elapsed().as_secs_f64());
            body(self, index, item)?;
            iter_time.update(end.elapsed().as_secs_f64());

            if self.print && (index % print_freq == 0 || index + 1 == total) {
                let remaining = total.saturating_sub(index);
                let eta = iter_time.avg() * remaining as f64;
                let mut line = format!(
                    "{header}{d}[{index:>width$}/{total}]{d}eta: {eta}",
                    d = self.delimiter,
                    eta = format_hms(eta),
                );
                let meters = self.to_string();
                if !meters.is_empty() {
                    line.push_str(&self.delimiter);
                    line.push_str(&meters);
                }
                line.push_str(&format!(
                    "{d}time: {iter_time}{d}data: {data_time}",
                    d = self.delimiter
                ));
                println!("{}", line);
            }
            steps += 1;
            end = Instant::now();
        }

        if self.print {
            let elapsed = start.elapsed();
            println!(
                "{} Total time: {} ({:.4} s / it)",
                header,
                format_hms(elapsed.as_secs_f64()),
                elapsed.as_secs_f64() / steps.max(1) as f64
            );
        }
        Ok(())
    }
}

impl fmt::Display for MetricLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, meter) in &self.meters {
            if !first {
                f.write_str(&self.delimiter)?;
            }
            write!(f, "{}: {}", name, meter)?;
            first = false;
        }
        Ok(())
    }
}

/// Renders whole seconds as `H:MM:SS`.
pub fn format_hms(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 {
        seconds as u64
    } else {
        0
    };
    format!("{}:{:02}:{:02}", total / 3600, (total / 60) % 60, total % 60)
}

pub fn format_duration(duration: Duration) -> String {
    format_hms(duration.as_secs_f64())
}
