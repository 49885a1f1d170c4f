//! Runtime statistics used as the load balancer's workload metric.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Average over the last `capacity` samples.
#[derive(Debug, Clone)]
pub struct MovingAverage {
    capacity: usize,
    window: VecDeque<f64>,
}

impl MovingAverage {
    pub fn new(capacity: usize) -> Self {
        MovingAverage {
            capacity: capacity.max(1),
            window: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    /// Adds a sample and returns the updated average.
    pub fn next(&mut self, value: f64) -> f64 {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(value);
        self.average()
    }

    pub fn average(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }

    /// Sample standard deviation of the window.
    pub fn stdev(&self) -> f64 {
        let n = self.window.len();
        if n < 2 {
            return 0.0;
        }
        let avg = self.average();
        let var = self.window.iter().map(|x| (x - avg) * (x - avg)).sum::<f64>() / (n - 1) as f64;
        var.sqrt()
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Running statistics over every sample plus a moving window.
#[derive(Debug, Clone)]
pub struct TimingStat {
    count: u64,
    mean: f64,
    min: f64,
    max: f64,
    m2: f64,
    window: MovingAverage,
}

impl TimingStat {
    pub fn new(window: usize) -> Self {
        TimingStat {
            count: 0,
            mean: 0.0,
            min: f64::MAX,
            max: 0.0,
            m2: 0.0,
            window: MovingAverage::new(window),
        }
    }

    pub fn add(&mut self, value: f64) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.count += 1;
        let old_mean = self.mean;
        self.mean += (value - old_mean) / self.count as f64;
        self.m2 += (value - old_mean) * (value - self.mean);
        self.window.next(value);
    }

    /// Records a duration in milliseconds.
    pub fn add_duration(&mut self, elapsed: Duration) {
        self.add(elapsed.as_secs_f64() * 1000.0);
    }

    pub fn reset(&mut self) {
        *self = TimingStat::new(self.window.capacity());
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn min(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.min
        }
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn stdev(&self) -> f64 {
        if self.count > 1 {
            (self.m2 / (self.count - 1) as f64).sqrt()
        } else {
            0.0
        }
    }

    pub fn moving_average(&self) -> f64 {
        self.window.average()
    }

    pub fn moving_stdev(&self) -> f64 {
        self.window.stdev()
    }
}

/// Named stopwatches backed by `TimingStat`.
#[derive(Debug, Default)]
pub struct Timings {
    window: usize,
    stats: HashMap<String, TimingStat>,
    running: HashMap<String, Instant>,
}

impl Timings {
    pub fn new(window: usize) -> Self {
        Timings {
            window,
            stats: HashMap::new(),
            running: HashMap::new(),
        }
    }

    pub fn start(&mut self, name: &str) {
        self.running.insert(name.to_string(), Instant::now());
    }

    /// Stops a running stopwatch and records its elapsed time.
    pub fn stop(&mut self, name: &str) -> Option<Duration> {
        let started = self.running.remove(name)?;
        let elapsed = started.elapsed();
        self.stat_mut(name).add_duration(elapsed);
        Some(elapsed)
    }

    pub fn record(&mut self, name: &str, value: f64) {
        self.stat_mut(name).add(value);
    }

    pub fn get(&self, name: &str) -> Option<&TimingStat> {
        self.stats.get(name)
    }

    fn stat_mut(&mut self, name: &str) -> &mut TimingStat {
        let window = self.window;
        self.stats
            .entry(name.to_string())
            .or_insert_with(|| TimingStat::new(window))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_moving_average_window() {
        let mut avg = MovingAverage::new(4);
        let expected = [
            (10.0, 10.0),
            (20.0, 15.0),
            (15.0, 15.0),
            (5.0, 12.5),
            (0.0, 10.0),
            (30.0, 12.5),
            (10.0, 11.25),
            (20.0, 15.0),
            (50.0, 27.5),
        ];
        for (value, average) in expected {
            assert_eq!(avg.next(value), average);
        }
        assert_eq!(avg.len(), 4);
    }

    #[test]
    fn test_empty_average_is_zero() {
        let avg = MovingAverage::new(3);
        assert_eq!(avg.average(), 0.0);
        assert_eq!(avg.stdev(), 0.0);
    }

    #[test]
    fn test_timing_stat() {
        let mut stat = TimingStat::new(2);
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            stat.add(v);
        }
        assert_eq!(stat.count(), 8);
        assert!((stat.mean() - 5.0).abs() < 1e-12);
        assert_eq!(stat.min(), 2.0);
        assert_eq!(stat.max(), 9.0);
        assert!((stat.stdev() - (32.0f64 / 7.0).sqrt()).abs() < 1e-12);
        assert_eq!(stat.moving_average(), 8.0);

        stat.reset();
        assert_eq!(stat.count(), 0);
        assert_eq!(stat.min(), 0.0);
    }

    #[test]
    fn test_named_timings() {
        let mut timings = Timings::new(8);
        assert!(timings.stop("step").is_none());
        timings.start("step");
        assert!(timings.stop("step").is_some());
        timings.record("step", 3.0);
        assert_eq!(timings.get("step").map(|s| s.count()), Some(2));
        assert!(timings.get("balance").is_none());
    }
}
