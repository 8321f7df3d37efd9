//! Broadcasting of job progress for real-time streaming.
//!
//! Used by the HTTP server's event stream and by anything else that wants
//! push updates instead of polling the store.

pub mod job_progress;

pub use job_progress::{JobProgressBroadcaster, JobProgressEvent, JobProgressTracker};
