//! Fixed-step frame clock for the headless driver.
//!
//! Simulation time advances by exactly [`FIXED_DT`] per frame so a run is
//! reproducible regardless of how long each frame takes on the wall clock.
//! Wall-clock frame times are only recorded for the summary.

use std::time::Instant;

use tracing::warn;

/// Simulated time per frame: 60 Hz.
pub const FIXED_DT: f64 = 1.0 / 60.0;

/// Frames slower than this are reported.
pub const SLOW_FRAME_TIME: f64 = 0.25;

/// Frame counter, simulation time and wall-clock frame statistics.
#[derive(Debug)]
pub struct FrameClock {
    frame_start: Option<Instant>,
    frame_count: u64,
    sim_time: f64,
    total_frame_time: f64,
    max_frame_time: f64,
    slow_frames: u64,
}

impl FrameClock {
    pub fn new() -> Self {
        Self {
            frame_start: None,
            frame_count: 0,
            sim_time: 0.0,
            total_frame_time: 0.0,
            max_frame_time: 0.0,
            slow_frames: 0,
        }
    }

    /// Start a frame. Returns the simulation time the frame renders.
    pub fn begin_frame(&mut self) -> f64 {
        self.frame_start = Some(Instant::now());
        self.sim_time
    }

    /// Finish the frame started by [`begin_frame`](Self::begin_frame).
    /// Returns the measured wall-clock duration in seconds.
    pub fn end_frame(&mut self) -> f64 {
        let frame_time = self
            .frame_start
            .take()
            .map_or(0.0, |start| start.elapsed().as_secs_f64());
        self.record(frame_time);
        frame_time
    }

    fn record(&mut self, frame_time: f64) {
        if frame_time > SLOW_FRAME_TIME {
            warn!(
                frame = self.frame_count,
                "Frame took {:.1}ms, over the {:.1}ms budget",
                frame_time * 1000.0,
                SLOW_FRAME_TIME * 1000.0
            );
            self.slow_frames += 1;
        }
        self.total_frame_time += frame_time;
        self.max_frame_time = self.max_frame_time.max(frame_time);
        self.sim_time += FIXED_DT;
        self.frame_count += 1;
    }

    /// Frames completed.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Simulation time of the next frame in seconds.
    pub fn sim_time(&self) -> f64 {
        self.sim_time
    }

    /// Mean wall-clock frame time in milliseconds.
    pub fn average_frame_ms(&self) -> f64 {
        if self.frame_count == 0 {
            return 0.0;
        }
        self.total_frame_time * 1000.0 / self.frame_count as f64
    }

    /// Longest wall-clock frame time in milliseconds.
    pub fn max_frame_ms(&self) -> f64 {
        self.max_frame_time * 1000.0
    }

    /// Frames that exceeded [`SLOW_FRAME_TIME`].
    pub fn slow_frames(&self) -> u64 {
        self.slow_frames
    }
}

impl Default for FrameClock {
    fn default() -> Self {
        Self::new()
    }
}
