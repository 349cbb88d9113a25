//! Arrival generation (spec.md §4.6, §4.7): expanding trips × calendar ×
//! frequency into concrete, time-ordered arrival events, optionally overlaid
//! with realtime predictions.

pub mod realtime;
pub mod scheduled;

pub use realtime::RealtimeGenerator;
pub use scheduled::ScheduledGenerator;

/// Inputs shared by both generators before stop/route normalization.
#[derive(Debug, Clone, Default)]
pub struct ArrivalQuery {
    pub stops: Option<Vec<String>>,
    pub routes: Option<Vec<String>>,
}
