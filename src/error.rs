//! Errors raised while reading tracefiles and decoding events.

use compact_str::CompactString;

/// Errors that make a tracefile (or one read on it) fail.
#[derive(Debug, thiserror::Error)]
pub enum TracefileError {
    #[error("I/O error while reading tracefile: {0}")]
    Io(#[from] std::io::Error),
    #[error("Tracefile is truncated ({size} bytes, need at least {needed})")]
    Truncated { size: u64, needed: u64 },
    #[error("Unrecognized magic number {0:#010x} (not an LTT trace?)")]
    UnrecognizedFormat(u32),
    #[error("Unsupported trace version {major}.{minor}")]
    UnsupportedVersion { major: u8, minor: u8 },
    #[error("Invalid subbuffer header: {0}")]
    InvalidHeader(String),
    #[error("Event position belongs to another tracefile")]
    ForeignPosition,
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl TracefileError {
    /// Errors that condemn the whole trace rather than one tracefile.
    pub fn is_format_error(&self) -> bool {
        matches!(
            self,
            Self::UnrecognizedFormat(_) | Self::UnsupportedVersion { .. }
        )
    }
}

/// Errors decoding an event header or payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Event references unregistered marker id {id}")]
    UnknownMarker { id: u16 },
    #[error("Field data at offset {offset} needs {needed} bytes, only {available} available")]
    OutOfBounds {
        offset: usize,
        needed: usize,
        available: usize,
    },
    #[error("String at offset {offset} is not NUL terminated")]
    UnterminatedString { offset: usize },
    #[error("Event size mismatch for marker {marker}: header says {declared}, layout says {computed}")]
    SizeMismatch {
        marker: CompactString,
        declared: usize,
        computed: usize,
    },
    #[error("Enumeration value {value} out of range ({count} labels)")]
    EnumOutOfRange { value: u64, count: usize },
    #[error("Union selector {discriminant} = {value} does not name a member")]
    UnionSelector {
        discriminant: CompactString,
        value: u64,
    },
    #[error("Union discriminant {0} was not decoded before the union")]
    MissingDiscriminant(CompactString),
    #[error("No field named {0}")]
    NoSuchField(CompactString),
    #[error("Field {field} is not {expected}")]
    TypeMismatch {
        field: CompactString,
        expected: &'static str,
    },
    #[error("Value of field {field} does not fit the requested type")]
    ValueOutOfRange { field: CompactString },
    #[error("Integer width of {size} bytes is not supported")]
    InvalidWidth { size: usize },
    #[error("Invalid control event: {0}")]
    InvalidControlEvent(String),
}

impl DecodeError {
    /// True for errors meaning the record bytes cannot be trusted, as
    /// opposed to a value that merely fails to map (enums) or a caller
    /// asking for the wrong type.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::OutOfBounds { .. }
                | Self::UnterminatedString { .. }
                | Self::SizeMismatch { .. }
                | Self::UnionSelector { .. }
                | Self::MissingDiscriminant(_)
                | Self::InvalidWidth { .. }
                | Self::InvalidControlEvent(_)
        )
    }
}
