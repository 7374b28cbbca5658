//! The current event of a tracefile and typed access to its fields.

use crate::decoder::DecodeContext;
use crate::decoder::FieldSlot;
use crate::decoder::Value;
use crate::decoder::decode;
use crate::decoder::read_signed;
use crate::decoder::read_string;
use crate::decoder::read_unsigned;
use crate::error::DecodeError;
use crate::markers::field::FieldType;
use crate::markers::field::MarkerField;
use crate::markers::registry::MarkerInfo;
use crate::time::LttTime;
use crate::types::Endianness;
use bstr::BStr;
use bstr::ByteSlice;
use compact_str::CompactString;
use pastey::paste;
use serde_derive::Serialize;

/// Process-unique identity of an opened tracefile. Allocated in opening
/// order, which makes it usable as a tie breaker when merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TracefileId(pub(crate) u32);

/// Durable handle on an event, valid across reads and seeks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct EventPosition {
    pub tracefile: TracefileId,
    pub block: usize,
    /// Offset of the event header in the subbuffer.
    pub offset: usize,
    /// Cycle count of the event.
    pub tsc: u64,
}

/// View of the event a tracefile is positioned on.
///
/// Borrows the tracefile, so it cannot outlive the next read.
#[derive(Debug, Clone, Copy)]
pub struct Event<'a> {
    pub(crate) info: &'a MarkerInfo,
    /// Exactly the payload bytes.
    pub(crate) payload: &'a [u8],
    pub(crate) slots: &'a [FieldSlot],
    pub(crate) ctx: DecodeContext,
    pub(crate) tsc: u64,
    pub(crate) time: LttTime,
    pub(crate) position: EventPosition,
    pub(crate) cpu: u32,
    pub(crate) tracefile_name: &'a str,
    pub(crate) declared_size: Option<usize>,
}

macro_rules! unsigned_getter {
    ($ty: tt) => {
        paste! {
            #[doc = concat!("Value of an integer field as `", stringify!($ty), "`.")]
            pub fn [<get_ $ty>](&self, index: usize) -> Result<$ty, DecodeError> {
                let value = self.get_unsigned(index)?;
                $ty::try_from(value).map_err(|_| self.out_of_range(index))
            }
        }
    };
}

macro_rules! signed_getter {
    ($ty: tt) => {
        paste! {
            #[doc = concat!("Value of an integer field as `", stringify!($ty), "`.")]
            pub fn [<get_ $ty>](&self, index: usize) -> Result<$ty, DecodeError> {
                let value = self.get_signed(index)?;
                $ty::try_from(value).map_err(|_| self.out_of_range(index))
            }
        }
    };
}

impl<'a> Event<'a> {
    pub fn marker(&self) -> &'a MarkerInfo {
        self.info
    }

    pub fn id(&self) -> u16 {
        self.info.id
    }

    pub fn name(&self) -> &'a str {
        &self.info.name
    }

    pub fn channel(&self) -> &'a str {
        &self.info.channel
    }

    pub fn time(&self) -> LttTime {
        self.time
    }

    pub fn tsc(&self) -> u64 {
        self.tsc
    }

    pub fn cpu(&self) -> u32 {
        self.cpu
    }

    pub fn tracefile_name(&self) -> &'a str {
        self.tracefile_name
    }

    pub fn position(&self) -> EventPosition {
        self.position
    }

    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    /// Payload size.
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Size announced by an extended event header.
    pub fn declared_size(&self) -> Option<usize> {
        self.declared_size
    }

    pub fn endian(&self) -> Endianness {
        self.ctx.endian
    }

    /// Alignment rule the payload was written with, 0 when packed.
    pub fn alignment(&self) -> usize {
        self.ctx.alignment
    }

    pub fn fields(&self) -> &'a [MarkerField] {
        &self.info.fields
    }

    /// Offset and size of every field in the payload.
    pub fn slots(&self) -> &'a [FieldSlot] {
        self.slots
    }

    pub fn field_index(&self, name: &str) -> Result<usize, DecodeError> {
        self.info
            .fields
            .iter()
            .position(|f| f.name == name)
            .ok_or_else(|| DecodeError::NoSuchField(name.into()))
    }

    fn field(&self, index: usize) -> Result<(&'a MarkerField, FieldSlot), DecodeError> {
        match (self.info.fields.get(index), self.slots.get(index)) {
            (Some(field), Some(slot)) => Ok((field, *slot)),
            _ => Err(DecodeError::NoSuchField(
                format!("#{index} of {}", self.info.name).into(),
            )),
        }
    }

    fn out_of_range(&self, index: usize) -> DecodeError {
        let field = self
            .info
            .fields
            .get(index)
            .map(|f| f.name.clone())
            .unwrap_or_default();
        DecodeError::ValueOutOfRange { field }
    }

    fn mismatch(field: &MarkerField, expected: &'static str) -> DecodeError {
        DecodeError::TypeMismatch {
            field: field.name.clone(),
            expected,
        }
    }

    /// Raw unsigned value of an integer, pointer or enumeration field.
    pub fn get_unsigned(&self, index: usize) -> Result<u64, DecodeError> {
        let (field, slot) = self.field(index)?;
        match &field.ty {
            FieldType::SignedInt { size }
            | FieldType::UnsignedInt { size }
            | FieldType::Pointer { size }
            | FieldType::Enum { size, .. } => read_unsigned(
                self.payload,
                slot.offset,
                usize::from(*size),
                self.ctx.endian,
                field.attributes.network_byte_order,
            ),
            FieldType::Compact { .. } => Ok(self.ctx.compact),
            _ => Err(Self::mismatch(field, "an integer")),
        }
    }

    /// Sign extended value of a signed field, or the value of an unsigned
    /// one when it fits.
    pub fn get_signed(&self, index: usize) -> Result<i64, DecodeError> {
        let (field, slot) = self.field(index)?;
        match &field.ty {
            FieldType::SignedInt { size } => read_signed(
                self.payload,
                slot.offset,
                usize::from(*size),
                self.ctx.endian,
                field.attributes.network_byte_order,
            ),
            ty if ty.is_integer() => {
                let value = self.get_unsigned(index)?;
                i64::try_from(value).map_err(|_| self.out_of_range(index))
            }
            _ => Err(Self::mismatch(field, "an integer")),
        }
    }

    unsigned_getter!(u8);

    unsigned_getter!(u16);

    unsigned_getter!(u32);

    unsigned_getter!(u64);

    signed_getter!(i8);

    signed_getter!(i16);

    signed_getter!(i32);

    signed_getter!(i64);

    /// Bytes of a string field, without the terminating NUL.
    pub fn get_string(&self, index: usize) -> Result<&'a BStr, DecodeError> {
        let (field, slot) = self.field(index)?;
        match field.ty {
            FieldType::String => Ok(read_string(self.payload, slot.offset)?.as_bstr()),
            _ => Err(Self::mismatch(field, "a string")),
        }
    }

    /// Label of an enumeration field.
    pub fn get_enum_label(&self, index: usize) -> Result<&'a str, DecodeError> {
        let (field, _) = self.field(index)?;
        let FieldType::Enum { labels, .. } = &field.ty else {
            return Err(Self::mismatch(field, "an enumeration"));
        };
        let value = self.get_unsigned(index)?;
        usize::try_from(value)
            .ok()
            .and_then(|i| labels.get(i))
            .map(CompactString::as_str)
            .ok_or(DecodeError::EnumOutOfRange {
                value,
                count: labels.len(),
            })
    }

    /// Element count of an array or sequence field.
    pub fn get_length(&self, index: usize) -> Result<usize, DecodeError> {
        let (field, slot) = self.field(index)?;
        match &field.ty {
            FieldType::Array { length, .. } => Ok(*length),
            FieldType::Sequence { length_size, .. } => {
                let count = read_unsigned(
                    self.payload,
                    slot.offset,
                    usize::from(*length_size),
                    self.ctx.endian,
                    false,
                )?;
                usize::try_from(count).map_err(|_| self.out_of_range(index))
            }
            _ => Err(Self::mismatch(field, "an array or sequence")),
        }
    }

    /// Decode any field into an owned value.
    pub fn get_value(&self, index: usize) -> Result<Value, DecodeError> {
        let (field, slot) = self.field(index)?;
        let lookup = |name: &str| {
            self.info.fields[..index]
                .iter()
                .position(|f| f.name == name)
                .and_then(|i| self.get_unsigned(i).ok())
        };
        let (value, _) = decode(
            &field.ty,
            self.payload,
            slot.offset,
            &self.ctx,
            field.attributes.network_byte_order,
            &lookup,
        )?;
        Ok(value)
    }

    /// Every field with its decoded value, in declaration order.
    pub fn values(&self) -> Result<Vec<(&'a str, Value)>, DecodeError> {
        self.info
            .fields
            .iter()
            .enumerate()
            .map(|(index, field)| Ok((field.name.as_str(), self.get_value(index)?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::Layout;
    use crate::decoder::compute_layout;
    use crate::markers::registry::MarkerRegistry;
    use crate::testutil::PayloadBuilder;
    use crate::types::ArchWidths;

    fn info(format: &str) -> MarkerInfo {
        let mut registry = MarkerRegistry::new("kernel");
        registry
            .define_type("state", "enum<u8>{RUNNING, WAITING}")
            .unwrap();
        registry.register_id("test", 8, ArchWidths::LP64).unwrap();
        registry.register_format("test", format).unwrap();
        registry.get(8).unwrap().clone()
    }

    fn with_event<R>(info: &MarkerInfo, payload: &[u8], f: impl FnOnce(Event<'_>) -> R) -> R {
        let ctx = DecodeContext {
            endian: Endianness::Little,
            alignment: 8,
            compact: 0,
        };
        let mut slots = Layout::new();
        let size = compute_layout(info, payload, &ctx, &mut slots).unwrap();
        let event = Event {
            info,
            payload: &payload[..size],
            slots: &slots,
            ctx,
            tsc: 0,
            time: LttTime::ZERO,
            position: EventPosition {
                tracefile: TracefileId(0),
                block: 0,
                offset: 0,
                tsc: 0,
            },
            cpu: 0,
            tracefile_name: "kernel_0",
            declared_size: None,
        };
        f(event)
    }

    #[test]
    fn test_integer_accessors() {
        let info = info("pid %d state %ld flags %hu");
        let payload = PayloadBuilder::new(Endianness::Little)
            .i32(-3)
            .u32(0)
            .i64(70_000)
            .u16(0xffff)
            .finish();
        with_event(&info, &payload, |event| {
            assert_eq!(event.get_i32(0).unwrap(), -3);
            assert_eq!(event.get_signed(0).unwrap(), -3);
            assert_eq!(event.get_u32(0).unwrap(), 0xffff_fffd);
            assert_eq!(event.get_i64(1).unwrap(), 70_000);
            assert_eq!(
                event.get_u16(1),
                Err(DecodeError::ValueOutOfRange {
                    field: "state".into()
                })
            );
            let flags = event.field_index("flags").unwrap();
            assert_eq!(event.get_u16(flags).unwrap(), 0xffff);
            assert_eq!(event.get_i16(flags).unwrap_err().to_string(), "Value of field flags does not fit the requested type");
            assert_eq!(
                event.field_index("nope"),
                Err(DecodeError::NoSuchField("nope".into()))
            );
        });
    }

    #[test]
    fn test_string_and_type_mismatch() {
        let info = info("comm %s pid %d");
        let payload = PayloadBuilder::new(Endianness::Little)
            .string("bash")
            .align(4)
            .i32(12)
            .finish();
        with_event(&info, &payload, |event| {
            assert_eq!(event.get_string(0).unwrap(), "bash");
            assert_eq!(event.get_i32(1).unwrap(), 12);
            assert!(matches!(
                event.get_u32(0),
                Err(DecodeError::TypeMismatch { .. })
            ));
            assert!(matches!(
                event.get_string(1),
                Err(DecodeError::TypeMismatch { .. })
            ));
            assert_eq!(event.size(), 12);
        });
    }

    #[test]
    fn test_enum_label_out_of_range() {
        let info = info("state #{state}%u");
        with_event(&info, &[1], |event| {
            assert_eq!(event.get_enum_label(0).unwrap(), "WAITING");
        });
        with_event(&info, &[9], |event| {
            assert_eq!(
                event.get_enum_label(0),
                Err(DecodeError::EnumOutOfRange { value: 9, count: 2 })
            );
            // The value itself is still readable.
            assert_eq!(event.get_u8(0).unwrap(), 9);
            assert_eq!(
                event.get_value(0).unwrap(),
                Value::Enum {
                    value: 9,
                    label: None
                }
            );
        });
    }

    #[test]
    fn test_values() {
        let info = info("a %u s %s");
        let payload = PayloadBuilder::new(Endianness::Little)
            .u32(5)
            .string("x")
            .finish();
        with_event(&info, &payload, |event| {
            let values = event.values().unwrap();
            assert_eq!(
                values,
                [
                    ("a", Value::Unsigned(5)),
                    ("s", Value::String("x".into()))
                ]
            );
            // Decoding twice gives the same result.
            assert_eq!(event.values().unwrap(), values);
        });
    }
}
