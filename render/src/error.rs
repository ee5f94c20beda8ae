//! Error type.
//!
//! This is the shared error type for the whole crate. User scene errors
//! are logged and skipped at the call site; only genuinely fallible
//! operations surface through here.

use std::{error, fmt};

#[derive(Debug)]
pub enum Error {
    Db(ember_db::Error),
    Plugin(ember_plugin::Error),
    /// An element reference did not name a previously closed element.
    UnresolvedElement(String),
    /// Instance groups must be acyclic.
    CyclicInstanceGroup(String),
    /// No object element is registered for this object kind.
    UnsupportedObjectKind(String),
    /// The texture file is malformed or of a foreign format.
    BadTextureFile(&'static str),
    Io(std::io::Error),
    /// The render was aborted from the progress callback.
    Aborted,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Db(e) => write!(f, "database error: {}", e),
            Error::Plugin(e) => write!(f, "plug-in error: {}", e),
            Error::UnresolvedElement(name) => write!(f, "unresolved element: {}", name),
            Error::CyclicInstanceGroup(name) => {
                write!(f, "cyclic instance group: {}", name)
            }
            Error::UnsupportedObjectKind(name) => {
                write!(f, "unsupported object kind: {}", name)
            }
            Error::BadTextureFile(what) => write!(f, "bad texture file: {}", what),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Aborted => write!(f, "render aborted"),
        }
    }
}

impl error::Error for Error {}

impl From<ember_db::Error> for Error {
    fn from(e: ember_db::Error) -> Error {
        Error::Db(e)
    }
}

impl From<ember_plugin::Error> for Error {
    fn from(e: ember_plugin::Error) -> Error {
        Error::Plugin(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::Io(e)
    }
}

pub type Result<T> = ::std::result::Result<T, Error>;
