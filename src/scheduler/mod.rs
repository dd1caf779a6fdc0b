//! Job records and the dispatch protocol.
//!
//! - [`JobStore`]: authoritative records, FIFO queue, state transitions
//! - [`Dispatcher`]: shared handle that serializes assignment and completion
//!
//! Jobs move strictly `queued -> running -> completed | failed`; only the
//! worker a job was assigned to can finish it.

pub mod dispatcher;
pub mod job;
pub mod store;

pub use dispatcher::{CompletionReport, Dispatcher, WorkerState};
pub use job::{Job, JobSpec, JobStatus, SubmissionForm};
pub use store::{Completion, JobStore};
