use std::io;

use thiserror::Error;

/// Errors surfaced by the filesystem core and the descriptor layer above it.
#[derive(Error, Debug)]
pub enum FsError {
    #[error("file not found")]
    NotFound,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("no space left on partition")]
    NoSpace,

    #[error("flash i/o failure: {0}")]
    Io(&'static str),

    #[error("image i/o error: {0}")]
    Image(#[from] io::Error),

    #[error("simulated power loss")]
    PowerLoss,

    #[error("partition too small: {size} bytes")]
    PartitionTooSmall { size: u32 },

    #[error("bad file descriptor")]
    BadFd,

    #[error("too many open files")]
    TooManyOpen,

    #[error("seek on write-only descriptor")]
    NotSeekable,
}

pub type Result<T> = std::result::Result<T, FsError>;
