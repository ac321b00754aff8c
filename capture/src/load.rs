use std::time::{Duration, Instant};
use sysinfo::System;

/// sysinfo needs some time between refreshes for a meaningful CPU figure.
const SAMPLE_EVERY: Duration = Duration::from_secs(1);

/// Source of the system load figure the acquisition loop sheds against.
pub trait LoadProbe: Send {
    /// Current load in percent.
    fn percent(&mut self) -> f32;
}

/// Global CPU usage probe used to shed capture load on small boards.
pub struct CpuLoad {
    system: System,
    last_sample: Instant,
    last_percent: f32,
}

impl CpuLoad {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        Self {
            system,
            last_sample: Instant::now(),
            last_percent: 0.0,
        }
    }

}

impl LoadProbe for CpuLoad {
    /// Global CPU usage. Refreshes at most once per second and returns the
    /// cached figure in between.
    fn percent(&mut self) -> f32 {
        if self.last_sample.elapsed() >= SAMPLE_EVERY {
            self.system.refresh_cpu_usage();
            self.last_percent = self.system.global_cpu_usage();
            self.last_sample = Instant::now();
        }
        self.last_percent
    }
}

impl Default for CpuLoad {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refreshes_at_most_once_per_second() {
        let mut load = CpuLoad::new();
        assert_eq!(load.percent(), 0.0, "no refresh before the first second");

        load.last_percent = -1.0;
        load.last_sample = Instant::now() - SAMPLE_EVERY;
        let sampled = load.percent();
        assert!((0.0..=100.0).contains(&sampled), "got {sampled}");
        let refreshed_at = load.last_sample;
        assert!(refreshed_at.elapsed() < SAMPLE_EVERY);

        load.last_percent = 42.0;
        assert_eq!(load.percent(), 42.0, "cached figure within the second");
        assert_eq!(load.last_sample, refreshed_at);
    }
}
