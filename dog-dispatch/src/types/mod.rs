pub mod ids;
pub mod priority;
pub mod job;
pub mod result;
pub mod worker;
pub mod events;

pub use ids::{JobId, RequestId, WorkerId};
pub use priority::JobPriority;
pub use job::{Job, JobStatus, RankKey};
pub use result::JobResult;
pub use worker::{ResourceMetrics, WorkerState, WorkerStatus};
pub use events::JobEvent;
