//! Job execution: command launch, heartbeat, and the run driver.

pub mod command;
pub mod heartbeat;
pub mod runner;

pub use command::{
    parse_args, run_raw, CapturedOutput, CommandContext, CommandHandler, CommandRegistry,
    TaskError,
};
pub use heartbeat::{HeartbeatHandle, HeartbeatMonitor, ProgressRecorder};
pub use runner::{JobRunner, RunOutcome, RunnerError};
