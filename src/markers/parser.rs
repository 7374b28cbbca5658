//! Code taking the [`super::registry::MarkerInfo`] generations of a marker
//! and making a parser to a specific marker struct.

use super::MarkerError;
use super::registry::MarkerInfo;
use super::registry::MarkerRegistry;
use crate::error::DecodeError;
use crate::event::Event;
use bstr::BString;
use bstr::ByteSlice;
use compact_str::CompactString;
use pastey::paste;
use smallvec::SmallVec;

/// Struct mapping the members of a marker struct to field indices, for
/// every generation of the marker.
#[derive(Debug, Clone)]
pub struct FieldParser {
    channel: CompactString,
    name: CompactString,
    /// Marker id and the field index of each member.
    generations: SmallVec<[(u16, SmallVec<[usize; 8]>); 2]>,
}

/// Parser for an integer type
macro_rules! scalar_parser {
    ($ty: tt) => {
        paste! {
            pub fn [<parse_ $ty>](
                &self,
                index: usize,
                event: &Event<'_>,
            ) -> Result<$ty, DecodeError> {
                event.[<get_ $ty>](self.field(index, event)?)
            }
        }
    };
}

impl FieldParser {
    scalar_parser!(i8);

    scalar_parser!(u8);

    scalar_parser!(i16);

    scalar_parser!(u16);

    scalar_parser!(i32);

    scalar_parser!(u32);

    scalar_parser!(i64);

    scalar_parser!(u64);

    pub fn parse_string(&self, index: usize, event: &Event<'_>) -> Result<String, DecodeError> {
        let data = event.get_string(self.field(index, event)?)?;
        Ok(data.to_str_lossy().into_owned())
    }

    pub fn parse_compact_string(
        &self,
        index: usize,
        event: &Event<'_>,
    ) -> Result<CompactString, DecodeError> {
        let data = event.get_string(self.field(index, event)?)?;
        Ok(CompactString::from_utf8_lossy(data))
    }

    pub fn parse_b_string(&self, index: usize, event: &Event<'_>) -> Result<BString, DecodeError> {
        let data = event.get_string(self.field(index, event)?)?;
        Ok(data.to_owned())
    }

    /// True if `event` comes from one of the generations this parser knows.
    pub fn accepts(&self, event: &Event<'_>) -> bool {
        event.channel() == self.channel && self.generation(event.id()).is_some()
    }

    fn generation(&self, id: u16) -> Option<&[usize]> {
        self.generations
            .iter()
            .find(|(gen_id, _)| *gen_id == id)
            .map(|(_, fields)| fields.as_slice())
    }

    fn field(&self, index: usize, event: &Event<'_>) -> Result<usize, DecodeError> {
        if event.channel() != self.channel {
            return Err(DecodeError::UnknownMarker { id: event.id() });
        }
        self.generation(event.id())
            .and_then(|fields| fields.get(index).copied())
            .ok_or(DecodeError::UnknownMarker { id: event.id() })
    }

    /// Create a parser from the given marker generations. Generations
    /// lacking a format or one of `names` are left out.
    pub fn new<'a>(
        generations: impl IntoIterator<Item = &'a MarkerInfo>,
        names: &[&str],
    ) -> Result<Self, MarkerError> {
        let mut parser = Self {
            channel: CompactString::default(),
            name: CompactString::default(),
            generations: SmallVec::new(),
        };
        let mut missing = None;
        for info in generations {
            parser.channel.clone_from(&info.channel);
            parser.name.clone_from(&info.name);
            let fields = names
                .iter()
                .map(|name| {
                    info.fields
                        .iter()
                        .position(|f| f.name == *name)
                        .ok_or_else(|| MarkerError::MissingField {
                            marker: info.name.clone(),
                            field: (*name).into(),
                        })
                })
                .collect::<Result<SmallVec<_>, _>>();
            match fields {
                Ok(fields) => parser.generations.push((info.id, fields)),
                Err(err) => {
                    log::debug!("Marker {}.{} id {}: {err}", info.channel, info.name, info.id);
                    missing.get_or_insert(err);
                }
            }
        }
        if parser.generations.is_empty() {
            return Err(missing.unwrap_or_else(|| MarkerError::UnknownMarker(parser.name)));
        }
        Ok(parser)
    }
}

#[doc(hidden)]
pub fn make_parser_from_registry(
    marker_name: &str,
    registry: &MarkerRegistry,
    names: &[&str],
) -> Result<FieldParser, MarkerError> {
    let (channel, name) = marker_name
        .split_once(':')
        .ok_or_else(|| MarkerError::UnknownMarker(marker_name.into()))?;
    if registry.channel() != channel || registry.get_by_name(name).is_none() {
        return Err(MarkerError::UnknownMarker(marker_name.into()));
    }
    FieldParser::new(registry.generations(name), names)
}

#[doc(hidden)]
pub fn make_parser_from_info(
    marker_name: &str,
    info: &MarkerInfo,
    names: &[&str],
) -> Result<FieldParser, MarkerError> {
    let matches = marker_name
        .split_once(':')
        .is_some_and(|(channel, name)| info.channel == channel && info.name == name);
    if !matches {
        return Err(MarkerError::UnknownMarker(marker_name.into()));
    }
    FieldParser::new(std::iter::once(info), names)
}

#[doc(hidden)]
#[macro_export]
macro_rules! struct_def {
    ($name:ident { $($field:ident: $type:ident,)* }) => {
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name {
            $(
                pub $field: $type,
            )*
        }
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! common_members {
    ($marker_name:tt) => {
        const MARKER_NAME: &'static str = $marker_name;

        fn parser_from_registry(
            registry: &$crate::markers::registry::MarkerRegistry,
        ) -> Result<$crate::markers::parser::FieldParser, $crate::markers::MarkerError> {
            $crate::markers::parser::make_parser_from_registry(
                Self::MARKER_NAME,
                registry,
                Self::FIELD_NAMES,
            )
        }

        fn parser_from_info(
            info: &$crate::markers::registry::MarkerInfo,
        ) -> Result<$crate::markers::parser::FieldParser, $crate::markers::MarkerError> {
            $crate::markers::parser::make_parser_from_info(
                Self::MARKER_NAME,
                info,
                Self::FIELD_NAMES,
            )
        }
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! parser {
    ($parser:ident $event:ident { $field:ident: $type:ident, $($tail:tt)* } @ $counter:tt @ $($result:tt)*) => {
        pastey::paste! {
            $crate::parser!(
                $parser $event { $($tail)* }
                @ ($counter + 1)
                @ $($result)* $field: $parser.[<parse_ $type:snake>]($counter, $event)?,);
        }
    };
    ($parser:ident $event:ident { } @ $counter:tt @ $($result:tt)*) => {
        #[allow(unused_variables)]
        fn parse(
            $parser: &$crate::markers::parser::FieldParser,
            $event: &$crate::event::Event<'_>,
        ) -> Result<Self, $crate::error::DecodeError> {
            Ok(Self {
                $($result)*
            })
        }
    };
}

/// Macro to generate a parser for a marker struct based on the marker
/// descriptions found in a trace.
#[doc(hidden)]
#[macro_export]
macro_rules! marker_parser {
    (#[marker_name($marker_name:tt)] pub struct $name:ident { $($fields:tt)* }) => {
        $crate::struct_def!($name { $($fields)* });

        $crate::field_names!($name { $($fields)* });

        impl $crate::markers::Marker for $name {
            $crate::common_members!($marker_name);
            $crate::parser!(parser event { $($fields)* } @ 0 @ );
        }
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! field_names {
    ($name:ident { $($field:ident: $type:ident,)* }) => {
        impl $name {
            /// Marker fields read into the struct, in member order.
            pub const FIELD_NAMES: &'static [&'static str] = &[
                $(
                    stringify!($field),
                )*
            ];
        }
    };
}

#[doc(inline)]
pub use marker_parser;
