//! Decoding of event payloads according to marker field descriptions.
//!
//! Field offsets depend on the data as soon as a variable length field
//! (string, sequence, union, or a compound containing one) has been seen, so
//! the layout is recomputed for every event. Fields with a static offset
//! skip the walk.

use crate::error::DecodeError;
use crate::markers::field::FieldType;
use crate::markers::field::Member;
use crate::markers::registry::MarkerInfo;
use crate::types::Endianness;
use crate::types::align_padding;
use bstr::BString;
use bstr::ByteSlice;
use byteorder::BigEndian;
use byteorder::ByteOrder;
use byteorder::LittleEndian;
use compact_str::CompactString;
use serde::Serialize;
use serde::Serializer;
use serde::ser::SerializeMap;
use serde::ser::SerializeSeq;
use smallvec::SmallVec;

/// Where one top level field lives, relative to the payload start.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FieldSlot {
    pub offset: usize,
    pub size: usize,
}

/// Field slots of the current event. Inline for typical markers.
pub type Layout = SmallVec<[FieldSlot; 16]>;

/// Per tracefile parameters needed to read numbers out of a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeContext {
    pub endian: Endianness,
    /// Producer alignment rule, 0 when packed.
    pub alignment: usize,
    /// Value carried in the event header for a leading compact field.
    pub compact: u64,
}

/// Running position while laying out a payload.
///
/// `to_base` is where the current run of fixed size fields starts, `to`
/// the offset inside that run and `len` the size of the last field placed.
/// A variable length field ends the run.
#[derive(Debug, Default, Clone, Copy)]
struct Scratch {
    to_base: usize,
    to: usize,
    len: usize,
}

impl Scratch {
    fn position(&self) -> usize {
        self.to_base + self.to
    }

    /// Place a fixed size field at payload offset `offset`.
    fn place(&mut self, offset: usize, len: usize) {
        self.to = offset - self.to_base;
        self.len = len;
        self.to += len;
    }

    /// Place a variable length field and start a new run after it.
    fn flush(&mut self, offset: usize, len: usize) {
        self.len = len;
        self.to_base = offset + len;
        self.to = 0;
    }
}

fn check_bounds(data: &[u8], offset: usize, needed: usize) -> Result<(), DecodeError> {
    match offset.checked_add(needed) {
        Some(end) if end <= data.len() => Ok(()),
        _ => Err(DecodeError::OutOfBounds {
            offset,
            needed,
            available: data.len().saturating_sub(offset),
        }),
    }
}

fn read_uint_impl<O: ByteOrder>(bytes: &[u8]) -> u64 {
    O::read_uint(bytes, bytes.len())
}

fn read_int_impl<O: ByteOrder>(bytes: &[u8]) -> i64 {
    O::read_int(bytes, bytes.len())
}

fn integer_bytes(data: &[u8], offset: usize, size: usize) -> Result<&[u8], DecodeError> {
    if size == 0 || size > 8 {
        return Err(DecodeError::InvalidWidth { size });
    }
    check_bounds(data, offset, size)?;
    Ok(&data[offset..offset + size])
}

/// Read an unsigned integer of `size` bytes. Network byte order fields are
/// big endian whatever the tracefile says.
pub fn read_unsigned(
    data: &[u8],
    offset: usize,
    size: usize,
    endian: Endianness,
    network: bool,
) -> Result<u64, DecodeError> {
    let bytes = integer_bytes(data, offset, size)?;
    Ok(match (endian, network) {
        (Endianness::Big, _) | (_, true) => read_uint_impl::<BigEndian>(bytes),
        (Endianness::Little, false) => read_uint_impl::<LittleEndian>(bytes),
    })
}

/// Read a sign extended integer of `size` bytes.
pub fn read_signed(
    data: &[u8],
    offset: usize,
    size: usize,
    endian: Endianness,
    network: bool,
) -> Result<i64, DecodeError> {
    let bytes = integer_bytes(data, offset, size)?;
    Ok(match (endian, network) {
        (Endianness::Big, _) | (_, true) => read_int_impl::<BigEndian>(bytes),
        (Endianness::Little, false) => read_int_impl::<LittleEndian>(bytes),
    })
}

/// Bytes of the NUL terminated string at `offset`, without the NUL.
pub fn read_string(data: &[u8], offset: usize) -> Result<&[u8], DecodeError> {
    let rest = data
        .get(offset..)
        .ok_or(DecodeError::OutOfBounds {
            offset,
            needed: 1,
            available: 0,
        })?;
    let len = memchr::memchr(0, rest).ok_or(DecodeError::UnterminatedString { offset })?;
    Ok(&rest[..len])
}

/// Looks up the integer value of an already decoded sibling, for unions.
type SiblingLookup<'l> = dyn Fn(&str) -> Option<u64> + 'l;

fn union_member<'t>(
    discriminant: &CompactString,
    members: &'t [Member],
    lookup: &SiblingLookup<'_>,
) -> Result<&'t Member, DecodeError> {
    let value =
        lookup(discriminant).ok_or_else(|| DecodeError::MissingDiscriminant(discriminant.clone()))?;
    usize::try_from(value)
        .ok()
        .and_then(|index| members.get(index))
        .ok_or_else(|| DecodeError::UnionSelector {
            discriminant: discriminant.clone(),
            value,
        })
}

fn sequence_count(
    data: &[u8],
    offset: usize,
    length_size: u8,
    element: &FieldType,
    ctx: &DecodeContext,
) -> Result<usize, DecodeError> {
    let count = read_unsigned(data, offset, usize::from(length_size), ctx.endian, false)?;
    let remaining = data.len().saturating_sub(offset);
    // Empty elements still take one byte each, so the loops stay bounded.
    let fits = match element.static_size(ctx.alignment) {
        Some(size) => count <= (remaining / size.max(1)) as u64,
        None => count <= remaining as u64,
    };
    if !fits {
        return Err(DecodeError::OutOfBounds {
            offset,
            needed: usize::try_from(count).unwrap_or(usize::MAX),
            available: remaining,
        });
    }
    Ok(count as usize)
}

/// End offset of a value of type `ty` starting at `offset` (already
/// aligned). Allocates nothing.
pub fn extent(
    ty: &FieldType,
    data: &[u8],
    offset: usize,
    ctx: &DecodeContext,
    lookup: &SiblingLookup<'_>,
) -> Result<usize, DecodeError> {
    if let Some(size) = ty.static_size(ctx.alignment) {
        check_bounds(data, offset, size)?;
        return Ok(offset + size);
    }
    match ty {
        FieldType::String => Ok(offset + read_string(data, offset)?.len() + 1),
        FieldType::Array { length, element } => {
            elements_extent(data, offset, *length, element, ctx, lookup)
        }
        FieldType::Sequence {
            length_size,
            element,
        } => {
            let count = sequence_count(data, offset, *length_size, element, ctx)?;
            elements_extent(data, offset + usize::from(*length_size), count, element, ctx, lookup)
        }
        FieldType::Struct { members } => {
            let mut siblings: SmallVec<[(&str, u64); 8]> = SmallVec::new();
            let mut pos = offset;
            for member in members {
                pos += align_padding(pos, member.ty.natural_alignment(), ctx.alignment);
                let nested = |name: &str| {
                    siblings
                        .iter()
                        .find(|(n, _)| *n == name)
                        .map(|(_, v)| *v)
                        .or_else(|| lookup(name))
                };
                let end = extent(&member.ty, data, pos, ctx, &nested)?;
                if let Some(value) = integer_value(&member.ty, data, pos, ctx, false) {
                    siblings.push((member.name.as_str(), value));
                }
                pos = end;
            }
            pos += align_padding(pos, ty.natural_alignment(), ctx.alignment);
            Ok(pos)
        }
        FieldType::Union {
            discriminant,
            members,
        } => {
            let member = union_member(discriminant, members, lookup)?;
            let pos = offset + align_padding(offset, member.ty.natural_alignment(), ctx.alignment);
            extent(&member.ty, data, pos, ctx, lookup)
        }
        // Static types were handled above.
        _ => Err(DecodeError::TypeMismatch {
            field: ty.describe(),
            expected: "a variable length type",
        }),
    }
}

fn elements_extent(
    data: &[u8],
    offset: usize,
    count: usize,
    element: &FieldType,
    ctx: &DecodeContext,
    lookup: &SiblingLookup<'_>,
) -> Result<usize, DecodeError> {
    let alignment = element.natural_alignment();
    let mut pos = offset;
    for _ in 0..count {
        pos += align_padding(pos, alignment, ctx.alignment);
        pos = extent(element, data, pos, ctx, lookup)?;
    }
    Ok(pos)
}

/// Integer value of a scalar field, for union discriminants.
fn integer_value(
    ty: &FieldType,
    data: &[u8],
    offset: usize,
    ctx: &DecodeContext,
    network: bool,
) -> Option<u64> {
    match ty {
        FieldType::SignedInt { size } => {
            read_signed(data, offset, usize::from(*size), ctx.endian, network)
                .ok()
                .map(|v| v as u64)
        }
        FieldType::UnsignedInt { size }
        | FieldType::Pointer { size }
        | FieldType::Enum { size, .. } => {
            read_unsigned(data, offset, usize::from(*size), ctx.endian, network).ok()
        }
        FieldType::Compact { .. } => Some(ctx.compact),
        _ => None,
    }
}

/// Compute the slot of every field of `info` in `payload` and return the
/// payload size.
pub fn compute_layout(
    info: &MarkerInfo,
    payload: &[u8],
    ctx: &DecodeContext,
    slots: &mut Layout,
) -> Result<usize, DecodeError> {
    slots.clear();
    let mut scratch = Scratch::default();
    for field in &info.fields {
        if let Some(offset) = field.static_offset
            && let Some(size) = field.ty.static_size(ctx.alignment)
        {
            check_bounds(payload, offset, size)?;
            scratch.place(offset, size);
            slots.push(FieldSlot { offset, size });
            continue;
        }
        let position = scratch.position();
        let offset = field
            .static_offset
            .unwrap_or_else(|| position + align_padding(position, field.alignment, ctx.alignment));
        let end = {
            let done: &[FieldSlot] = slots;
            let lookup = |name: &str| {
                info.fields[..done.len()]
                    .iter()
                    .zip(done)
                    .find(|(f, _)| f.name == name)
                    .and_then(|(f, slot)| {
                        integer_value(
                            &f.ty,
                            payload,
                            slot.offset,
                            ctx,
                            f.attributes.network_byte_order,
                        )
                    })
            };
            extent(&field.ty, payload, offset, ctx, &lookup)?
        };
        scratch.flush(offset, end - offset);
        slots.push(FieldSlot {
            offset,
            size: end - offset,
        });
    }
    Ok(scratch.position())
}

/// A decoded field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Signed(i64),
    Unsigned(u64),
    Pointer(u64),
    String(BString),
    /// `label` is `None` when the value is out of range.
    Enum {
        value: u64,
        label: Option<CompactString>,
    },
    Array(Vec<Value>),
    Struct(Vec<(CompactString, Value)>),
    Union {
        member: CompactString,
        value: Box<Value>,
    },
}

impl Value {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Unsigned(v) | Self::Pointer(v) | Self::Enum { value: v, .. } => Some(*v),
            Self::Signed(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Signed(v) => Some(*v),
            Self::Unsigned(v) | Self::Pointer(v) | Self::Enum { value: v, .. } => {
                i64::try_from(*v).ok()
            }
            _ => None,
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Signed(v) => serializer.serialize_i64(*v),
            Self::Unsigned(v) | Self::Pointer(v) => serializer.serialize_u64(*v),
            Self::String(s) => serializer.serialize_str(&s.to_str_lossy()),
            Self::Enum {
                label: Some(label), ..
            } => serializer.serialize_str(label),
            Self::Enum { value, label: None } => serializer.serialize_u64(*value),
            Self::Array(values) => {
                let mut seq = serializer.serialize_seq(Some(values.len()))?;
                for value in values {
                    seq.serialize_element(value)?;
                }
                seq.end()
            }
            Self::Struct(members) => {
                let mut map = serializer.serialize_map(Some(members.len()))?;
                for (name, value) in members {
                    map.serialize_entry(name.as_str(), value)?;
                }
                map.end()
            }
            Self::Union { member, value } => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(member.as_str(), value)?;
                map.end()
            }
        }
    }
}

/// Decode a value of type `ty` at `offset` (already aligned). Returns the
/// value and its end offset.
pub fn decode(
    ty: &FieldType,
    data: &[u8],
    offset: usize,
    ctx: &DecodeContext,
    network: bool,
    lookup: &SiblingLookup<'_>,
) -> Result<(Value, usize), DecodeError> {
    match ty {
        FieldType::SignedInt { size } => {
            let size = usize::from(*size);
            let value = read_signed(data, offset, size, ctx.endian, network)?;
            Ok((Value::Signed(value), offset + size))
        }
        FieldType::UnsignedInt { size } => {
            let size = usize::from(*size);
            let value = read_unsigned(data, offset, size, ctx.endian, network)?;
            Ok((Value::Unsigned(value), offset + size))
        }
        FieldType::Pointer { size } => {
            let size = usize::from(*size);
            let value = read_unsigned(data, offset, size, ctx.endian, network)?;
            Ok((Value::Pointer(value), offset + size))
        }
        FieldType::Compact { .. } => Ok((Value::Unsigned(ctx.compact), offset)),
        FieldType::String => {
            let bytes = read_string(data, offset)?;
            Ok((Value::String(BString::from(bytes)), offset + bytes.len() + 1))
        }
        FieldType::Enum { size, labels } => {
            let size = usize::from(*size);
            let value = read_unsigned(data, offset, size, ctx.endian, network)?;
            let label = usize::try_from(value)
                .ok()
                .and_then(|index| labels.get(index))
                .cloned();
            Ok((Value::Enum { value, label }, offset + size))
        }
        FieldType::Array { length, element } => {
            decode_elements(data, offset, *length, element, ctx, lookup)
        }
        FieldType::Sequence {
            length_size,
            element,
        } => {
            let count = sequence_count(data, offset, *length_size, element, ctx)?;
            decode_elements(
                data,
                offset + usize::from(*length_size),
                count,
                element,
                ctx,
                lookup,
            )
        }
        FieldType::Struct { members } => {
            let mut values: Vec<(CompactString, Value)> = Vec::with_capacity(members.len());
            let mut pos = offset;
            for member in members {
                pos += align_padding(pos, member.ty.natural_alignment(), ctx.alignment);
                let nested = |name: &str| {
                    values
                        .iter()
                        .find(|(n, _)| n == name)
                        .and_then(|(_, v)| v.as_u64())
                        .or_else(|| lookup(name))
                };
                let (value, end) = decode(&member.ty, data, pos, ctx, false, &nested)?;
                values.push((member.name.clone(), value));
                pos = end;
            }
            pos += align_padding(pos, ty.natural_alignment(), ctx.alignment);
            Ok((Value::Struct(values), pos))
        }
        FieldType::Union {
            discriminant,
            members,
        } => {
            let member = union_member(discriminant, members, lookup)?;
            let pos = offset + align_padding(offset, member.ty.natural_alignment(), ctx.alignment);
            let (value, end) = decode(&member.ty, data, pos, ctx, false, lookup)?;
            Ok((
                Value::Union {
                    member: member.name.clone(),
                    value: Box::new(value),
                },
                end,
            ))
        }
    }
}

fn decode_elements(
    data: &[u8],
    offset: usize,
    count: usize,
    element: &FieldType,
    ctx: &DecodeContext,
    lookup: &SiblingLookup<'_>,
) -> Result<(Value, usize), DecodeError> {
    let alignment = element.natural_alignment();
    let mut values = Vec::with_capacity(count.min(data.len()));
    let mut pos = offset;
    for _ in 0..count {
        pos += align_padding(pos, alignment, ctx.alignment);
        let (value, end) = decode(element, data, pos, ctx, false, lookup)?;
        values.push(value);
        pos = end;
    }
    Ok((Value::Array(values), pos))
}
