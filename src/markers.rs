//! Marker metadata: which fields each event id carries and how they are
//! laid out.

use crate::error::DecodeError;
use crate::event::Event;
use crate::types::ArchWidths;
use compact_str::CompactString;

pub mod field;
pub mod format;
pub mod parser;
pub mod registry;
pub mod system;
pub mod typedecl;

/// Ids below this are reserved for the metadata channel's own markers.
pub const CORE_MARKER_IDS: u16 = 8;
/// Binds a marker name to an id.
pub const SET_MARKER_ID: u16 = 0;
/// Attaches a format to a marker name.
pub const SET_MARKER_FORMAT: u16 = 1;
/// Defines a named type for `#{name}` format tokens.
pub const SET_TYPE_DEFINITION: u16 = 2;

/// Name of the channel carrying marker definitions.
pub const METADATA_CHANNEL: &str = "metadata";

/// Errors building marker descriptions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MarkerError {
    #[error("Failed to parse format of marker {marker}: {message}")]
    FormatParse {
        marker: CompactString,
        message: String,
    },
    #[error("Reference to undefined type {0}")]
    UndefinedType(CompactString),
    #[error("Marker id {id} already belongs to {existing}, cannot give it to {name}")]
    IdCollision {
        id: u16,
        existing: CompactString,
        name: CompactString,
    },
    #[error("Invalid type declaration: {0}")]
    TypeDecl(String),
    #[error("No marker named {0}")]
    UnknownMarker(CompactString),
    #[error("Marker {marker} has no field {field}")]
    MissingField {
        marker: CompactString,
        field: CompactString,
    },
}

/// Registry for a control channel, with the bootstrap markers in place.
///
/// Their payloads use the widths of the tracefile that carries them.
pub fn control_registry(
    channel: &str,
    widths: ArchWidths,
) -> Result<registry::MarkerRegistry, MarkerError> {
    let mut registry = registry::MarkerRegistry::new(channel);
    for (id, name, format) in [
        (
            SET_MARKER_ID,
            "core_marker_id",
            "channel %s name %s event_id #2u%u int #1u%u long #1u%u pointer #1u%u \
             size_t #1u%u alignment #1u%u",
        ),
        (
            SET_MARKER_FORMAT,
            "core_marker_format",
            "channel %s name %s format %s",
        ),
        (
            SET_TYPE_DEFINITION,
            "core_type_definition",
            "channel %s name %s declaration %s",
        ),
    ] {
        registry.register_id(name, id, widths)?;
        registry.register_format(name, format)?;
    }
    Ok(registry)
}

/// Trait for structs that can be parsed from the events of one marker.
pub trait Marker {
    /// Channel and name of the marker, e.g. "`kernel:sched_schedule`".
    const MARKER_NAME: &'static str;

    /// Create a parser from the registry of the marker's channel. Covers
    /// every generation of the marker.
    fn parser_from_registry(
        registry: &registry::MarkerRegistry,
    ) -> Result<parser::FieldParser, MarkerError>;

    /// Create a parser for one marker description.
    fn parser_from_info(info: &registry::MarkerInfo) -> Result<parser::FieldParser, MarkerError>;

    /// Parse an event using this struct.
    fn parse(parser: &parser::FieldParser, event: &Event<'_>) -> Result<Self, DecodeError>
    where
        Self: Sized;
}
