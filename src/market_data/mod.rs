// =============================================================================
// Market Data — one-minute bars: buffer, live feed, historical store
// =============================================================================

pub mod bar_buffer;
pub mod feed;
pub mod historical;

pub use bar_buffer::{AdmissionOutcome, Bar, BarBuffer};
pub use feed::FeedBar;
