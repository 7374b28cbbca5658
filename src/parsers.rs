//! Parsers for the bootstrap events of the metadata channel.

use crate::error::DecodeError;
use crate::markers::SET_MARKER_FORMAT;
use crate::markers::SET_MARKER_ID;
use crate::markers::SET_TYPE_DEFINITION;
use crate::types::ArchWidths;
use crate::types::Endianness;
use crate::types::align_padding;
use byteorder::BigEndian;
use byteorder::ByteOrder;
use byteorder::LittleEndian;
use byteorder::ReadBytesExt;
use compact_str::CompactString;
use std::io::Cursor;

/// An event of the metadata channel that changes the marker registries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    SetMarkerId {
        channel: CompactString,
        name: CompactString,
        id: u16,
        widths: ArchWidths,
    },
    SetMarkerFormat {
        channel: CompactString,
        name: CompactString,
        format: String,
    },
    SetTypeDefinition {
        channel: CompactString,
        name: CompactString,
        declaration: String,
    },
}

impl ControlEvent {
    /// Channel whose registry the event changes.
    pub fn channel(&self) -> &CompactString {
        match self {
            Self::SetMarkerId { channel, .. }
            | Self::SetMarkerFormat { channel, .. }
            | Self::SetTypeDefinition { channel, .. } => channel,
        }
    }

    /// Parse the payload of a metadata event. Returns `None` for marker ids
    /// that are not bootstrap events.
    pub fn parse(
        marker_id: u16,
        payload: &[u8],
        endian: Endianness,
        alignment: usize,
    ) -> Result<Option<Self>, DecodeError> {
        match endian {
            Endianness::Little => Self::parse_impl::<LittleEndian>(marker_id, payload, alignment),
            Endianness::Big => Self::parse_impl::<BigEndian>(marker_id, payload, alignment),
        }
    }

    fn parse_impl<O: ByteOrder>(
        marker_id: u16,
        payload: &[u8],
        alignment: usize,
    ) -> Result<Option<Self>, DecodeError> {
        if !matches!(
            marker_id,
            SET_MARKER_ID | SET_MARKER_FORMAT | SET_TYPE_DEFINITION
        ) {
            return Ok(None);
        }
        let mut data = Cursor::new(payload);
        let channel = CompactString::from_utf8_lossy(read_cstr(&mut data)?);
        let name = CompactString::from_utf8_lossy(read_cstr(&mut data)?);
        let event = match marker_id {
            SET_MARKER_ID => {
                let pos = data.position() as usize;
                data.set_position((pos + align_padding(pos, 2, alignment)) as u64);
                let id = data.read_u16::<O>().map_err(truncated)?;
                let mut sizes = [0u8; 5];
                for size in &mut sizes {
                    *size = data.read_u8().map_err(truncated)?;
                }
                let [int_size, long_size, pointer_size, size_t_size, alignment] = sizes;
                Self::SetMarkerId {
                    channel,
                    name,
                    id,
                    widths: ArchWidths {
                        int_size,
                        long_size,
                        pointer_size,
                        size_t_size,
                        alignment,
                    },
                }
            }
            SET_MARKER_FORMAT => Self::SetMarkerFormat {
                channel,
                name,
                format: String::from_utf8_lossy(read_cstr(&mut data)?).into_owned(),
            },
            SET_TYPE_DEFINITION => Self::SetTypeDefinition {
                channel,
                name,
                declaration: String::from_utf8_lossy(read_cstr(&mut data)?).into_owned(),
            },
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

fn truncated(err: std::io::Error) -> DecodeError {
    DecodeError::InvalidControlEvent(format!("Payload too short: {err}"))
}

/// Read a NUL terminated string and move past the NUL.
fn read_cstr<'a>(data: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], DecodeError> {
    let buf: &'a [u8] = *data.get_ref();
    let start = data.position() as usize;
    let rest = buf.get(start..).unwrap_or_default();
    let len = memchr::memchr(0, rest).ok_or_else(|| {
        DecodeError::InvalidControlEvent("Unterminated string in control event".to_string())
    })?;
    data.set_position((start + len + 1) as u64);
    Ok(&rest[..len])
}
