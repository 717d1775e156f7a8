//! Admission, task records, the depth counter and the job list.
//!
//! [`Lane`] ties these together for submitters and operators; executors use
//! the individual components through it.

mod admission;
mod depth;
mod error;
mod job_queue;
mod lane;
mod staging;
mod task_store;

pub use admission::{Accepted, AdmissionGate, InputArtifact, Submission};
pub use depth::{DepthCounter, Reconciled, Reservation};
pub use error::{LaneError, RichError};
pub use job_queue::{Dequeued, JobQueue};
pub use lane::{HealthReport, Lane, LaneStats, StatusCounts, StatusView};
pub use staging::{is_valid_input_name, ArtifactStager};
pub use task_store::{TaskList, TaskStore, TaskStoreError};
