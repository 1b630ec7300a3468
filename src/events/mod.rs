//! Exposure and custom event pipeline.
//!
//! Evaluations produce [`StatsigEvent`]s that are queued on the [`EventLogger`] and delivered to
//! the log event endpoint in batches.
pub(crate) mod event;
pub(crate) mod logger;
mod queue;

pub use event::{
    StatsigEvent, CONFIG_EXPOSURE_EVENT, DIAGNOSTICS_EVENT, GATE_EXPOSURE_EVENT,
    LAYER_EXPOSURE_EVENT,
};
pub use logger::{EventLogger, EventLoggerConfig};
