//! Field descriptions shared by every event of a marker.

use crate::types::align_padding;
use compact_str::CompactString;
use compact_str::format_compact;

/// Storage type of a marker field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    SignedInt { size: u8 },
    UnsignedInt { size: u8 },
    Pointer { size: u8 },
    /// NUL terminated.
    String,
    /// Value carried in the top bits of the event header timestamp.
    /// Takes no room in the payload.
    Compact { bits: u8 },
    /// Unsigned integer of `size` bytes mapping `0..labels.len()` to labels.
    Enum {
        size: u8,
        labels: Vec<CompactString>,
    },
    Array {
        length: usize,
        element: Box<FieldType>,
    },
    /// Element count stored as an unsigned integer before the elements.
    Sequence {
        length_size: u8,
        element: Box<FieldType>,
    },
    Struct { members: Vec<Member> },
    /// Member picked by the value of an integer sibling decoded earlier.
    Union {
        discriminant: CompactString,
        members: Vec<Member>,
    },
}

/// Named member of a struct or union.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub name: CompactString,
    pub ty: FieldType,
}

impl FieldType {
    /// Alignment the type asks for, before the producer's rule is applied.
    pub fn natural_alignment(&self) -> usize {
        match self {
            Self::SignedInt { size }
            | Self::UnsignedInt { size }
            | Self::Pointer { size }
            | Self::Enum { size, .. } => usize::from(*size),
            Self::String => 1,
            Self::Compact { .. } => 0,
            Self::Array { element, .. } => element.natural_alignment(),
            Self::Sequence {
                length_size,
                element,
            } => usize::from(*length_size).max(element.natural_alignment()),
            Self::Struct { members } | Self::Union { members, .. } => members
                .iter()
                .map(|m| m.ty.natural_alignment())
                .max()
                .unwrap_or(1),
        }
    }

    /// Size in the payload when it does not depend on the data.
    ///
    /// `alignment` is the producer's alignment rule (0 for packed).
    pub fn static_size(&self, alignment: usize) -> Option<usize> {
        match self {
            Self::SignedInt { size }
            | Self::UnsignedInt { size }
            | Self::Pointer { size }
            | Self::Enum { size, .. } => Some(usize::from(*size)),
            Self::Compact { .. } => Some(0),
            Self::String | Self::Sequence { .. } | Self::Union { .. } => None,
            Self::Array { length, element } => {
                Some(element.static_size(alignment)?.checked_mul(*length)?)
            }
            Self::Struct { members } => {
                let mut offset = 0;
                for member in members {
                    offset += align_padding(offset, member.ty.natural_alignment(), alignment);
                    offset += member.ty.static_size(alignment)?;
                }
                offset += align_padding(offset, self.natural_alignment(), alignment);
                Some(offset)
            }
        }
    }

    /// True for types that decode to a single integer.
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            Self::SignedInt { .. }
                | Self::UnsignedInt { .. }
                | Self::Pointer { .. }
                | Self::Compact { .. }
                | Self::Enum { .. }
        )
    }

    /// Short description used in error messages and listings.
    pub fn describe(&self) -> CompactString {
        match self {
            Self::SignedInt { size } => format_compact!("s{}", size * 8),
            Self::UnsignedInt { size } => format_compact!("u{}", size * 8),
            Self::Pointer { size } => format_compact!("ptr{}", size * 8),
            Self::String => CompactString::const_new("string"),
            Self::Compact { bits } => format_compact!("compact{bits}"),
            Self::Enum { size, labels } => {
                format_compact!("enum{}[{}]", size * 8, labels.len())
            }
            Self::Array { length, element } => {
                format_compact!("array<{length}, {}>", element.describe())
            }
            Self::Sequence {
                length_size,
                element,
            } => format_compact!(
                "sequence<u{}, {}>",
                length_size * 8,
                element.describe()
            ),
            Self::Struct { members } => format_compact!("struct[{}]", members.len()),
            Self::Union {
                discriminant,
                members,
            } => format_compact!("union<{discriminant}>[{}]", members.len()),
        }
    }
}

/// How an integer field is rendered, taken from the printf conversion.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum IntDisplay {
    #[default]
    Decimal,
    Hex {
        upper: bool,
        alternate: bool,
    },
    Octal {
        alternate: bool,
    },
    Char,
}

/// Flags from the trace type (`#`) part of a format.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FieldAttributes {
    /// Stored big endian whatever the tracefile byte order.
    pub network_byte_order: bool,
}

/// A top level field of a marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerField {
    pub name: CompactString,
    pub ty: FieldType,
    /// Position in the marker's field list.
    pub index: usize,
    /// Natural alignment of the type.
    pub alignment: usize,
    pub attributes: FieldAttributes,
    /// Offset from the payload start when every earlier field has a static
    /// size.
    pub static_offset: Option<usize>,
    pub display: IntDisplay,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(name: &str, ty: FieldType) -> Member {
        Member {
            name: name.into(),
            ty,
        }
    }

    #[test]
    fn test_struct_static_size_pads() {
        let ty = FieldType::Struct {
            members: vec![
                member("a", FieldType::UnsignedInt { size: 1 }),
                member("b", FieldType::UnsignedInt { size: 4 }),
                member("c", FieldType::UnsignedInt { size: 1 }),
            ],
        };
        assert_eq!(ty.natural_alignment(), 4);
        assert_eq!(ty.static_size(8), Some(12));
        assert_eq!(ty.static_size(0), Some(6));
    }

    #[test]
    fn test_dynamic_sizes() {
        let seq = FieldType::Sequence {
            length_size: 4,
            element: Box::new(FieldType::UnsignedInt { size: 2 }),
        };
        assert_eq!(seq.static_size(8), None);
        let arr = FieldType::Array {
            length: 3,
            element: Box::new(FieldType::String),
        };
        assert_eq!(arr.static_size(8), None);
        let arr = FieldType::Array {
            length: 3,
            element: Box::new(FieldType::SignedInt { size: 8 }),
        };
        assert_eq!(arr.static_size(4), Some(24));
    }

    #[test]
    fn test_describe() {
        let ty = FieldType::Sequence {
            length_size: 1,
            element: Box::new(FieldType::SignedInt { size: 4 }),
        };
        assert_eq!(ty.describe(), "sequence<u8, s32>");
    }
}
