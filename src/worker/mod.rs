pub mod runtime;

pub use runtime::{Worker, connector_for, run_worker, run_worker_with};
