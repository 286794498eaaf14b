//! `meetflow-core`: shared identifiers and error primitives.
//!
//! No I/O and no runtime concerns live here.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{BatchId, JobId, SubjectId};
