//! Sorting unit failures into the ones worth retrying and the ones that are not.
//!
//! The primary signal is the [`UnitErrorKind`] attached where the error is produced. Message text
//! is only inspected for [`UnitErrorKind::Other`], as a last resort.
use std::{fmt::Debug, io};

use thiserror::Error;

/// The structured cause of a unit failure, set at the I/O or domain boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitErrorKind {
    Timeout,
    RateLimited,
    ConnectionReset,
    Unavailable,
    Validation,
    NotFound,
    MalformedInput,
    /// Nothing structured is known about the failure.
    Other,
}

/// An error raised while processing a single unit of work.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{kind:?}: {message}")]
pub struct UnitError {
    pub kind: UnitErrorKind,
    pub message: String,
}

impl UnitError {
    pub fn new(kind: UnitErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(UnitErrorKind::Timeout, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(UnitErrorKind::RateLimited, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(UnitErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(UnitErrorKind::NotFound, message)
    }

    pub fn malformed_input(message: impl Into<String>) -> Self {
        Self::new(UnitErrorKind::MalformedInput, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(UnitErrorKind::Other, message)
    }
}

impl From<io::Error> for UnitError {
    fn from(error: io::Error) -> Self {
        let kind = match error.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => UnitErrorKind::Timeout,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => UnitErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionRefused | io::ErrorKind::NotConnected => {
                UnitErrorKind::Unavailable
            }
            io::ErrorKind::NotFound => UnitErrorKind::NotFound,
            io::ErrorKind::InvalidData => UnitErrorKind::MalformedInput,
            io::ErrorKind::InvalidInput => UnitErrorKind::Validation,
            _ => UnitErrorKind::Other,
        };
        Self::new(kind, error.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Retrying the same unit may succeed.
    Transient,
    Fatal,
}

pub trait ErrorClassifier: Debug + Send + Sync + 'static {
    fn classify(&self, error: &UnitError) -> ErrorClass;
}

/// Message fragments that mark an unstructured error as transient.
const TRANSIENT_MARKERS: &[&str] = &[
    "timed out",
    "timeout",
    "rate limit",
    "too many requests",
    "429",
    "503",
    "connection reset",
    "connection refused",
    "temporarily unavailable",
    "try again",
];

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl ErrorClassifier for DefaultClassifier {
    fn classify(&self, error: &UnitError) -> ErrorClass {
        match error.kind {
            UnitErrorKind::Timeout
            | UnitErrorKind::RateLimited
            | UnitErrorKind::ConnectionReset
            | UnitErrorKind::Unavailable => ErrorClass::Transient,
            UnitErrorKind::Validation | UnitErrorKind::NotFound | UnitErrorKind::MalformedInput => {
                ErrorClass::Fatal
            }
            UnitErrorKind::Other => {
                let message = error.message.to_lowercase();
                if TRANSIENT_MARKERS
                    .iter()
                    .any(|marker| message.contains(marker))
                {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Fatal
                }
            }
        }
    }
}
