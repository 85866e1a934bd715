use std::fmt;

/// Error type for the core library. Command-layer code converts these into
/// `anyhow::Error` with `?`; the core itself never depends on anyhow so it
/// stays usable as a standalone library.
#[derive(Debug)]
pub enum CoreError {
    Io { block: u64, source: std::io::Error },
    OutOfRange { block: u64, device_blocks: u64 },
    CorruptBlock { block: u64, reason: &'static str },
    NoRoot,
    RollbackDesync { expected: u64, found: u64 },
    StageDump(&'static str),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::Io { block, source } => write!(f, "I/O error on block {block}: {source}"),
            CoreError::OutOfRange { block, device_blocks } => {
                write!(f, "block {block} is outside the device (has {device_blocks} blocks)")
            }
            CoreError::CorruptBlock { block, reason } => {
                write!(f, "block {block} is corrupt: {reason}")
            }
            CoreError::NoRoot => write!(f, "tree has no root block"),
            CoreError::RollbackDesync { expected, found } => {
                write!(f, "rollback log desync: expected block {expected}, found {found}")
            }
            CoreError::StageDump(reason) => write!(f, "stage dump error: {reason}"),
        }
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CoreError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
