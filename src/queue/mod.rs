pub mod job_queue;
pub mod worker;

pub use job_queue::JobQueue;
pub use worker::WorkerPool;
