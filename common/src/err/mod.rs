pub mod worker_error;

pub use worker_error::WorkerError;

pub type WResult<T> = Result<T, WorkerError>;
