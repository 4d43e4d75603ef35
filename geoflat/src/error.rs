use crate::ids::FeatureId;

use itertools::Itertools;
use thiserror::Error;

use std::io;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("I/O error while {phase}: {source}")]
    IoDuring {
        phase: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("bad magic number {found:#018x}, expected {expected:#018x}")]
    BadMagic { found: u64, expected: u64 },

    #[error("incompatible version {found}, expected {expected}")]
    VersionMismatch { found: String, expected: &'static str },

    #[error("truncated data: {0}")]
    Truncated(&'static str),

    #[error("corrupt data: {0}")]
    Corrupt(String),

    #[error("malformed header message: {0}")]
    HeaderProto(#[from] prost::DecodeError),

    #[error("reservation mismatch: {0}")]
    Reservation(String),

    #[error("{} invalid features: {}", .0.len(), .0.iter().join(", "))]
    InvalidFeatures(Vec<FeatureId>),

    #[error("source error: {0}")]
    Source(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn corrupt(details: impl Into<String>) -> Self {
        Error::Corrupt(details.into())
    }
}

/// Attaches the name of the failing phase to I/O errors.
pub trait Context<T> {
    fn during(self, phase: &'static str) -> Result<T>;
}

impl<T> Context<T> for std::result::Result<T, io::Error> {
    fn during(self, phase: &'static str) -> Result<T> {
        self.map_err(|source| Error::IoDuring { phase, source })
    }
}

impl<T> Context<T> for Result<T> {
    fn during(self, phase: &'static str) -> Result<T> {
        self.map_err(|e| match e {
            Error::Io(source) => Error::IoDuring { phase, source },
            e => e,
        })
    }
}
