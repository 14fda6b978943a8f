use core::fmt;

/// Filesystem error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    NotFound,
    AlreadyExists,
    InvalidPath,
    StaleHandle,
    NoFreeDescriptor,
    BadDescriptor,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FsError::NotFound => write!(f, "No such file"),
            FsError::AlreadyExists => write!(f, "File exists"),
            FsError::InvalidPath => write!(f, "Invalid path"),
            FsError::StaleHandle => write!(f, "Stale file handle"),
            FsError::NoFreeDescriptor => write!(f, "Too many open files"),
            FsError::BadDescriptor => write!(f, "Bad file descriptor"),
        }
    }
}

pub type FsResult<T> = Result<T, FsError>;
