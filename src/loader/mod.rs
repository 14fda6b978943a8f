//! Program loading: command-line parsing, ELF64 images and the initial
//! user stack.

pub mod elf;
pub mod stack;

use alloc::vec::Vec;
use core::fmt;

pub use elf::{load, LoadedImage, SegmentFlags};
pub use stack::{build_args, ArgLayout, StackBuilder};

use crate::config::MAX_ARGS;
use crate::fs::FsError;
use crate::memory::MapError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecError {
    EmptyCommand,
    TooManyArgs,
    FileNotFound,
    InvalidFormat,
    UnsupportedArch,
    UnsupportedType,
    TooManySegments,
    DynamicLinking,
    BadSegment,
    ReadError,
    ArgsTooLarge,
    Memory(MapError),
    Fs(FsError),
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExecError::EmptyCommand    => write!(f, "Empty command line"),
            ExecError::TooManyArgs     => write!(f, "Too many arguments (max {})", MAX_ARGS),
            ExecError::FileNotFound    => write!(f, "open failed"),
            ExecError::InvalidFormat   => write!(f, "error loading executable"),
            ExecError::UnsupportedArch => write!(f, "Unsupported architecture"),
            ExecError::UnsupportedType => write!(f, "Unsupported ELF type (need ET_EXEC)"),
            ExecError::TooManySegments => write!(f, "Too many program headers"),
            ExecError::DynamicLinking  => write!(f, "Dynamically linked executables are not supported"),
            ExecError::BadSegment      => write!(f, "Invalid loadable segment"),
            ExecError::ReadError       => write!(f, "File read error"),
            ExecError::ArgsTooLarge    => write!(f, "Arguments do not fit on the stack page"),
            ExecError::Memory(e)       => write!(f, "Memory error: {}", e),
            ExecError::Fs(e)           => write!(f, "File error: {}", e),
        }
    }
}

impl From<MapError> for ExecError {
    fn from(e: MapError) -> Self {
        ExecError::Memory(e)
    }
}

impl From<FsError> for ExecError {
    fn from(e: FsError) -> Self {
        match e {
            FsError::NotFound | FsError::InvalidPath => ExecError::FileNotFound,
            other => ExecError::Fs(other),
        }
    }
}

/// Split a command line into whitespace-separated words. The first word
/// names the program.
pub fn parse_args(cmdline: &str) -> Result<Vec<&str>, ExecError> {
    let mut args = Vec::new();
    for word in cmdline.split_ascii_whitespace() {
        if args.len() == MAX_ARGS {
            return Err(ExecError::TooManyArgs);
        }
        args.push(word);
    }
    if args.is_empty() {
        return Err(ExecError::EmptyCommand);
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::String;

    #[test]
    fn test_parse_args_collapses_whitespace() {
        assert_eq!(
            parse_args("  echo\ta   bb \n").unwrap(),
            alloc::vec!["echo", "a", "bb"]
        );
    }

    #[test]
    fn test_parse_args_rejects_empty() {
        assert_eq!(parse_args(""), Err(ExecError::EmptyCommand));
        assert_eq!(parse_args(" \t "), Err(ExecError::EmptyCommand));
    }

    #[test]
    fn test_parse_args_cap_is_enforced() {
        let mut line = String::from("prog");
        for _ in 1..MAX_ARGS {
            line.push_str(" x");
        }
        assert_eq!(parse_args(&line).unwrap().len(), MAX_ARGS);
        line.push_str(" overflow");
        assert_eq!(parse_args(&line), Err(ExecError::TooManyArgs));
    }
}
