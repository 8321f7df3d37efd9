pub mod batch;
pub mod config;
pub mod error;
pub mod progress;
pub mod runner;

pub use batch::{partition, BatchScheduler, ScheduleOutcome};
pub use config::PipelineConfig;
pub use error::PipelineError;
pub use progress::{BroadcastProgress, NoopProgress, ProgressEvent, ProgressReporter};
pub use runner::{Pipeline, PipelineOutcome, ResumeStrategy};

/// Progress after planning.
pub const PLANNED_PERCENT: u8 = 10;
/// Progress when assembly starts.
pub const ASSEMBLING_PERCENT: u8 = 95;
const GENERATION_SPAN: usize = 80;

/// Maps persisted units to a percentage between planning and assembly.
pub fn unit_progress(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return PLANNED_PERCENT;
    }
    let done = completed.min(total);
    PLANNED_PERCENT + (GENERATION_SPAN * done / total) as u8
}
