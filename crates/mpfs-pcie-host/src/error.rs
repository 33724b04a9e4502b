use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors surfaced by bridge bring-up and the runtime interrupt API.
///
/// Status bits that do not map to anything are not errors; they are logged and skipped
/// during dispatch so one stray bit never blocks the rest of a batch.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BridgeError {
    #[error("invalid bridge configuration: {0}")]
    Configuration(#[from] ConfigError),

    #[error("inbound span needs {required} windows but only {available} are available")]
    InsufficientWindows { required: u64, available: usize },

    #[error("all {capacity} MSI vectors are in use")]
    ResourceExhausted { capacity: u32 },

    #[error("MSI vector {vector} freed while not allocated")]
    DoubleFree { vector: u32 },

    #[error("no event named {0:?}")]
    UnknownEvent(String),

    #[error("event {0} is a pass-through line and cannot take a terminal handler")]
    PassThroughEvent(&'static str),

    #[error("{kind} line {line} already has a handler")]
    HandlerBound { kind: &'static str, line: u32 },

    #[error("{kind} line {line} has no handler")]
    NotBound { kind: &'static str, line: u32 },

    #[error("{kind} line {line} out of range (have {count})")]
    InvalidLine {
        kind: &'static str,
        line: u32,
        count: u32,
    },
}

/// Reasons a configuration is rejected before any register is touched.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{count} inbound ranges exceed the maximum of {max}")]
    TooManyInboundRanges { count: usize, max: usize },

    #[error("{count} outbound ranges exceed the {max} windows left after config space")]
    TooManyOutboundRanges { count: usize, max: usize },

    #[error("upstream address list has {upstream} entries for {ranges} inbound ranges")]
    UpstreamMismatch { upstream: usize, ranges: usize },

    #[error("window at {addr:#x} has size {size:#x}, expected a power of two of at least 4 KiB")]
    BadWindowSize { addr: u64, size: u64 },

    #[error("window at {addr:#x} is not aligned to its size {size:#x}")]
    MisalignedWindow { addr: u64, size: u64 },

    #[error("ranges at {first:#x} and {second:#x} overlap")]
    OverlappingRanges { first: u64, second: u64 },

    #[error("inbound range at {addr:#x} is empty or wraps")]
    EmptyRange { addr: u64 },

    #[error("merge alignment {0:#x} is not a power of two of at least 4 KiB")]
    BadAlignment(u64),

    #[error("hardware reports {0} MSI vectors, expected a power of two between 1 and 32")]
    UnsupportedVectorCount(u32),

    #[error("event table has {0} entries, more than the 64 a poll snapshot can carry")]
    TooManyEvents(usize),

    #[error("pass-through index {0} is outside the event table")]
    BadPassThrough(usize),
}
