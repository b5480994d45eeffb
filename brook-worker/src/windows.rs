use brook_rpc::config::{ConfigError, WindowConfig};
use brook_types::{from_nanos, to_nanos, Window};
use std::time::{Duration, SystemTime};

/// Maps an event time onto the windows it belongs to. Windows are aligned to the unix epoch.
pub trait TimeWindowAssigner: Send + 'static {
    /// All windows containing `ts`, ordered by start.
    fn windows(&self, ts: SystemTime) -> Vec<Window>;

    fn size(&self) -> Duration;
}

#[derive(Clone, Copy, Debug)]
pub struct TumblingWindowAssigner {
    size: Duration,
}

impl TumblingWindowAssigner {
    pub fn new(size: Duration) -> Self {
        Self { size }
    }
}

impl TimeWindowAssigner for TumblingWindowAssigner {
    fn windows(&self, ts: SystemTime) -> Vec<Window> {
        let ts = to_nanos(ts);
        let size = self.size.as_nanos();
        let start = ts - ts % size;

        vec![Window::new(from_nanos(start), from_nanos(start + size))]
    }

    fn size(&self) -> Duration {
        self.size
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SlidingWindowAssigner {
    size: Duration,
    slide: Duration,
}
//  012345678
//  --x------
// [--x]
//  [-x-]
//   [x--]
//    [---]

impl SlidingWindowAssigner {
    pub fn new(size: Duration, slide: Duration) -> Self {
        Self { size, slide }
    }
}

impl TimeWindowAssigner for SlidingWindowAssigner {
    fn windows(&self, ts: SystemTime) -> Vec<Window> {
        let ts = to_nanos(ts);
        let size = self.size.as_nanos();
        let slide = self.slide.as_nanos();

        let mut windows = Vec::with_capacity(size.div_ceil(slide) as usize);

        // latest window containing ts, then step back while windows still cover it; windows
        // that would start before the epoch are never produced
        let mut start = ts - ts % slide;
        while start + size > ts {
            windows.push(Window::new(from_nanos(start), from_nanos(start + size)));
            if start < slide {
                break;
            }
            start -= slide;
        }

        windows.reverse();
        windows
    }

    fn size(&self) -> Duration {
        self.size
    }
}

pub fn window_assigner(config: &WindowConfig) -> Result<Box<dyn TimeWindowAssigner>, ConfigError> {
    config.validate()?;

    Ok(if config.is_tumbling() {
        Box::new(TumblingWindowAssigner::new(*config.width))
    } else {
        Box::new(SlidingWindowAssigner::new(*config.width, config.slide()))
    })
}
