//! Error type.
//!
//! This is the shared error type for the whole crate.

use std::{error, fmt, io};

#[derive(Debug)]
pub enum Error {
    /// The tag does not name a live record.
    InvalidTag,
    /// The record is still referenced and cannot be deleted.
    StillReferenced,
    /// The record type has no registered codec and cannot be paged out.
    NotFlushable,
    /// The record type has no registered generator.
    NoGenerator,
    /// A record type id was registered twice with different descriptors.
    TypeAlreadyRegistered,
    /// The record type id is unknown to the registry.
    UnknownType,
    /// The stored payload does not match the requested type.
    TypeMismatch,
    /// The page file rejected a read or write.
    PageFile(io::Error),
    /// Decoding a paged-out record failed.
    Corrupt(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::InvalidTag => write!(f, "invalid tag"),
            Error::StillReferenced => write!(f, "record is still referenced"),
            Error::NotFlushable => write!(f, "record type has no codec"),
            Error::NoGenerator => write!(f, "record type has no generator"),
            Error::TypeAlreadyRegistered => write!(f, "record type registered twice"),
            Error::UnknownType => write!(f, "unknown record type"),
            Error::TypeMismatch => write!(f, "record payload type mismatch"),
            Error::PageFile(e) => write!(f, "page file error: {}", e),
            Error::Corrupt(what) => write!(f, "corrupt paged record: {}", what),
        }
    }
}

impl error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::PageFile(e)
    }
}

pub type Result<T> = ::std::result::Result<T, Error>;
