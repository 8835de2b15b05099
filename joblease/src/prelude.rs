//! Brings the types needed to write and run workers into scope in one import.
//!
//! ```
//! # #![allow(unused_imports)]
//! use joblease::prelude::*;
//! ```
pub use crate::backoff::{BackoffStrategy, Jitter, Strategy};
pub use crate::classify::{ErrorClass, ErrorClassifier, UnitError, UnitErrorKind};
pub use crate::config::Config;
pub use crate::job::{ErrorKind, Job, JobError, JobId, JobStatus, StatusReport};
pub use crate::retry::RetryPolicy;
pub use crate::runner::{JobContext, JobHandle, Submission};
pub use crate::worker::{WorkError, Worker};
pub use crate::{Joblease, JobleaseError};
