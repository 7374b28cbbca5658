//! Reading a tracefile one subbuffer (block) at a time, and splitting
//! subbuffers into event records.

use crate::error::DecodeError;
use crate::error::TracefileError;
use crate::types::Endianness;
use crate::types::align_padding;
use byteorder::BigEndian;
use byteorder::ByteOrder;
use byteorder::LittleEndian;
use std::fs::File;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::path::Path;

/// Subbuffer header magic, as written by the producer.
pub const MAGIC: u32 = 0x00D6_B7ED;
/// Size of the subbuffer header. No padding follows it.
pub const HEADER_SIZE: usize = 68;

/// Header found at the start of every subbuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubbufferHeader {
    pub cycle_count_begin: u64,
    pub cycle_count_end: u64,
    pub magic_number: u32,
    pub major_version: u8,
    pub minor_version: u8,
    pub arch_size: u8,
    /// 0 for packed data.
    pub alignment: u8,
    pub start_time_sec: u64,
    pub start_time_usec: u64,
    pub start_freq: u64,
    pub freq_scale: u32,
    /// Bytes used in the subbuffer, header included.
    pub data_size: u32,
    pub sb_size: u32,
    pub events_lost: u32,
    pub subbuf_corrupt: u32,
}

impl SubbufferHeader {
    /// Detect the byte order from the magic number.
    pub fn detect_endianness(data: &[u8]) -> Result<Endianness, TracefileError> {
        let magic = data.get(16..20).ok_or(TracefileError::Truncated {
            size: data.len() as u64,
            needed: HEADER_SIZE as u64,
        })?;
        let magic = LittleEndian::read_u32(magic);
        if magic == MAGIC {
            Ok(Endianness::Little)
        } else if magic == MAGIC.swap_bytes() {
            Ok(Endianness::Big)
        } else {
            Err(TracefileError::UnrecognizedFormat(magic))
        }
    }

    pub fn parse(data: &[u8], endian: Endianness) -> Result<Self, TracefileError> {
        if data.len() < HEADER_SIZE {
            return Err(TracefileError::Truncated {
                size: data.len() as u64,
                needed: HEADER_SIZE as u64,
            });
        }
        let header = match endian {
            Endianness::Little => Self::parse_impl::<LittleEndian>(data),
            Endianness::Big => Self::parse_impl::<BigEndian>(data),
        };
        header.validate()?;
        Ok(header)
    }

    fn parse_impl<O: ByteOrder>(data: &[u8]) -> Self {
        Self {
            cycle_count_begin: O::read_u64(&data[0..]),
            cycle_count_end: O::read_u64(&data[8..]),
            magic_number: O::read_u32(&data[16..]),
            major_version: data[20],
            minor_version: data[21],
            arch_size: data[22],
            alignment: data[23],
            start_time_sec: O::read_u64(&data[24..]),
            start_time_usec: O::read_u64(&data[32..]),
            start_freq: O::read_u64(&data[40..]),
            freq_scale: O::read_u32(&data[48..]),
            data_size: O::read_u32(&data[52..]),
            sb_size: O::read_u32(&data[56..]),
            events_lost: O::read_u32(&data[60..]),
            subbuf_corrupt: O::read_u32(&data[64..]),
        }
    }

    fn validate(&self) -> Result<(), TracefileError> {
        if self.magic_number != MAGIC {
            return Err(TracefileError::UnrecognizedFormat(self.magic_number));
        }
        EventHeaderLayout::for_version(self.major_version, self.minor_version)?;
        if (self.sb_size as usize) < HEADER_SIZE {
            return Err(TracefileError::InvalidHeader(format!(
                "subbuffer size {} is smaller than its header",
                self.sb_size
            )));
        }
        if (self.data_size as usize) < HEADER_SIZE || self.data_size > self.sb_size {
            return Err(TracefileError::InvalidHeader(format!(
                "data size {} outside of [{HEADER_SIZE}, {}]",
                self.data_size, self.sb_size
            )));
        }
        if self.start_freq == 0 || self.freq_scale == 0 {
            return Err(TracefileError::InvalidHeader(
                "zero counter frequency".to_string(),
            ));
        }
        Ok(())
    }
}

/// How the 32-bit event header word is split between event id and
/// truncated cycle count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHeaderLayout {
    pub tsc_bits: u8,
    pub event_bits: u8,
}

impl EventHeaderLayout {
    pub fn for_version(major: u8, minor: u8) -> Result<Self, TracefileError> {
        match (major, minor) {
            (2, 3..=5) => Ok(Self {
                tsc_bits: 27,
                event_bits: 5,
            }),
            _ => Err(TracefileError::UnsupportedVersion { major, minor }),
        }
    }

    /// Code escaping to a 16-bit id.
    pub fn id_escape(self) -> u16 {
        (1 << self.event_bits) - 1
    }

    /// Code escaping to a 16-bit id and an explicit size.
    pub fn id_size_escape(self) -> u16 {
        self.id_escape() - 1
    }

    /// Code escaping to a 16-bit id, explicit size and full cycle count.
    pub fn id_size_tsc_escape(self) -> u16 {
        self.id_escape() - 2
    }
}

/// Header of one event record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Offset of the record in the subbuffer.
    pub offset: usize,
    pub id: u16,
    /// Truncated cycle count from the header word.
    pub tsc_field: u32,
    /// Full cycle count of the extended form.
    pub full_tsc: Option<u64>,
    /// Payload size announced by the extended forms.
    pub declared_size: Option<usize>,
    /// Offset just past the header.
    pub payload_offset: usize,
}

impl RecordHeader {
    /// Only the short form packs a compact value in the header word.
    pub fn is_short(&self) -> bool {
        self.declared_size.is_none() && self.full_tsc.is_none()
    }
}

/// Cycle counts covered by one subbuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubbufferBounds {
    pub begin_tsc: u64,
    pub end_tsc: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderState {
    /// Subbuffer `next` must be loaded before reading.
    HeaderPending { next: usize },
    Ready,
    EndOfSubbuffer,
    EndOfFile,
}

/// Sequential reader of the subbuffers of one tracefile.
#[derive(Debug)]
pub struct SubbufferReader {
    file: File,
    file_size: u64,
    endian: Endianness,
    layout: EventHeaderLayout,
    first_header: SubbufferHeader,
    sb_size: usize,
    num_subbuffers: usize,
    /// Current subbuffer contents, reused across loads.
    buffer: Vec<u8>,
    block: usize,
    header: SubbufferHeader,
    cursor: usize,
    state: ReaderState,
    /// Reconstructed cycle count of the last record.
    tsc: u64,
    /// Lazily built, filled by header reads.
    index: Vec<Option<SubbufferBounds>>,
    events_lost: u64,
    corrupt_subbuffers: u64,
}

impl SubbufferReader {
    pub fn open(path: &Path) -> Result<Self, TracefileError> {
        let mut file = File::open(path)?;
        let file_size = file.metadata()?.len();
        if file_size < HEADER_SIZE as u64 {
            return Err(TracefileError::Truncated {
                size: file_size,
                needed: HEADER_SIZE as u64,
            });
        }
        let mut raw = [0u8; HEADER_SIZE];
        file.read_exact(&mut raw)?;
        let endian = SubbufferHeader::detect_endianness(&raw)?;
        let first_header = SubbufferHeader::parse(&raw, endian)?;
        let layout =
            EventHeaderLayout::for_version(first_header.major_version, first_header.minor_version)?;
        let sb_size = first_header.sb_size as usize;
        let num_subbuffers = (file_size / sb_size as u64) as usize;
        if num_subbuffers == 0 {
            return Err(TracefileError::Truncated {
                size: file_size,
                needed: sb_size as u64,
            });
        }
        if file_size % sb_size as u64 != 0 {
            log::warn!(
                "{}: {} trailing bytes after the last complete subbuffer ignored",
                path.display(),
                file_size % sb_size as u64
            );
        }
        Ok(Self {
            file,
            file_size,
            endian,
            layout,
            first_header,
            sb_size,
            num_subbuffers,
            buffer: Vec::with_capacity(sb_size),
            block: 0,
            header: first_header,
            cursor: 0,
            state: ReaderState::HeaderPending { next: 0 },
            tsc: first_header.cycle_count_begin,
            index: vec![None; num_subbuffers],
            events_lost: 0,
            corrupt_subbuffers: 0,
        })
    }

    pub fn endian(&self) -> Endianness {
        self.endian
    }

    pub fn layout(&self) -> EventHeaderLayout {
        self.layout
    }

    pub fn first_header(&self) -> &SubbufferHeader {
        &self.first_header
    }

    pub fn alignment(&self) -> usize {
        usize::from(self.first_header.alignment)
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn num_subbuffers(&self) -> usize {
        self.num_subbuffers
    }

    pub fn block(&self) -> usize {
        self.block
    }

    pub fn tsc(&self) -> u64 {
        self.tsc
    }

    /// Events the producer reported as lost, over the subbuffers seen.
    pub fn events_lost(&self) -> u64 {
        self.events_lost
    }

    /// Subbuffers the producer reported as corrupt.
    pub fn corrupt_subbuffers(&self) -> u64 {
        self.corrupt_subbuffers
    }

    /// Valid data of the current subbuffer, header included.
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.header.data_size as usize]
    }

    /// Account for a newly seen header.
    fn record_bounds(&mut self, index: usize, header: &SubbufferHeader) -> SubbufferBounds {
        let bounds = SubbufferBounds {
            begin_tsc: header.cycle_count_begin,
            end_tsc: header.cycle_count_end,
        };
        if self.index[index].is_none() {
            if header.events_lost > 0 {
                log::warn!(
                    "Subbuffer {index}: producer lost {} events",
                    header.events_lost
                );
            }
            if header.subbuf_corrupt > 0 {
                log::warn!(
                    "Subbuffer {index}: producer reports {} corrupt subbuffers",
                    header.subbuf_corrupt
                );
            }
            self.events_lost += u64::from(header.events_lost);
            self.corrupt_subbuffers += u64::from(header.subbuf_corrupt);
            self.index[index] = Some(bounds);
        }
        bounds
    }

    fn parse_header(&self, raw: &[u8]) -> Result<SubbufferHeader, TracefileError> {
        let endian = SubbufferHeader::detect_endianness(raw)?;
        if endian != self.endian {
            return Err(TracefileError::InvalidHeader(
                "byte order changes between subbuffers".to_string(),
            ));
        }
        let header = SubbufferHeader::parse(raw, endian)?;
        if header.sb_size as usize != self.sb_size {
            return Err(TracefileError::InvalidHeader(format!(
                "subbuffer size changes from {} to {}",
                self.sb_size, header.sb_size
            )));
        }
        Ok(header)
    }

    /// Load subbuffer `index` and place the cursor after its header.
    pub fn load_subbuffer(&mut self, index: usize) -> Result<(), TracefileError> {
        if index >= self.num_subbuffers {
            self.state = ReaderState::EndOfFile;
            return Ok(());
        }
        self.file
            .seek(SeekFrom::Start(index as u64 * self.sb_size as u64))?;
        self.buffer.resize(self.sb_size, 0);
        self.file.read_exact(&mut self.buffer)?;
        let header = self.parse_header(&self.buffer)?;
        self.record_bounds(index, &header);
        self.block = index;
        self.header = header;
        self.cursor = HEADER_SIZE;
        self.tsc = header.cycle_count_begin;
        self.state = ReaderState::Ready;
        Ok(())
    }

    /// Cycle bounds of subbuffer `index`, reading only its header when it
    /// was never seen.
    pub fn bounds(&mut self, index: usize) -> Result<SubbufferBounds, TracefileError> {
        if let Some(Some(bounds)) = self.index.get(index) {
            return Ok(*bounds);
        }
        let mut raw = [0u8; HEADER_SIZE];
        self.file
            .seek(SeekFrom::Start(index as u64 * self.sb_size as u64))?;
        self.file.read_exact(&mut raw)?;
        let header = self.parse_header(&raw)?;
        Ok(self.record_bounds(index, &header))
    }

    /// Start again from the first subbuffer.
    pub fn rewind(&mut self) {
        self.state = ReaderState::HeaderPending { next: 0 };
        self.tsc = self.first_header.cycle_count_begin;
    }

    /// Continue at `offset` of subbuffer `block` with `tsc` as the last
    /// known cycle count.
    pub fn set_cursor(&mut self, block: usize, offset: usize, tsc: u64) -> Result<(), TracefileError> {
        if block >= self.num_subbuffers {
            self.state = ReaderState::EndOfFile;
            return Ok(());
        }
        if self.state == ReaderState::EndOfFile
            || matches!(self.state, ReaderState::HeaderPending { .. })
            || self.block != block
        {
            self.load_subbuffer(block)?;
        }
        self.cursor = offset.max(HEADER_SIZE);
        self.tsc = tsc;
        self.state = ReaderState::Ready;
        Ok(())
    }

    /// Give up on the rest of the current subbuffer.
    pub fn skip_subbuffer(&mut self) {
        if self.state == ReaderState::Ready {
            self.state = ReaderState::EndOfSubbuffer;
        }
    }

    /// Move past the payload of the record just read.
    pub fn advance(&mut self, end: usize) {
        self.cursor = end;
    }

    /// Decode the next record header, crossing subbuffer boundaries as
    /// needed. `None` at end of file.
    pub fn next_record(&mut self) -> Result<Option<RecordHeader>, TracefileError> {
        loop {
            match self.state {
                ReaderState::EndOfFile => return Ok(None),
                ReaderState::HeaderPending { next } => self.load_subbuffer(next)?,
                ReaderState::EndOfSubbuffer => {
                    self.state = ReaderState::HeaderPending {
                        next: self.block + 1,
                    };
                }
                ReaderState::Ready => {
                    if self.cursor >= self.header.data_size as usize {
                        self.state = ReaderState::EndOfSubbuffer;
                        continue;
                    }
                    return match self.endian {
                        Endianness::Little => self.record_header::<LittleEndian>().map(Some),
                        Endianness::Big => self.record_header::<BigEndian>().map(Some),
                    };
                }
            }
        }
    }

    fn record_header<O: ByteOrder>(&self) -> Result<RecordHeader, TracefileError> {
        let data = self.data();
        let alignment = self.alignment();
        let take = |pos: usize, size: usize| -> Result<&[u8], TracefileError> {
            data.get(pos..pos + size).ok_or_else(|| {
                TracefileError::Decode(DecodeError::OutOfBounds {
                    offset: pos,
                    needed: size,
                    available: data.len().saturating_sub(pos),
                })
            })
        };
        let offset = self.cursor;
        let mut pos = offset + align_padding(offset, 4, alignment);
        let word = O::read_u32(take(pos, 4)?);
        pos += 4;
        let tsc_mask = (1u32 << self.layout.tsc_bits) - 1;
        let code = (word >> self.layout.tsc_bits) as u16;
        let mut header = RecordHeader {
            offset,
            id: code,
            tsc_field: word & tsc_mask,
            full_tsc: None,
            declared_size: None,
            payload_offset: 0,
        };
        if code >= self.layout.id_size_tsc_escape() {
            header.id = O::read_u16(take(pos, 2)?);
            pos += 2;
        }
        if code == self.layout.id_size_escape() || code == self.layout.id_size_tsc_escape() {
            let mut size = usize::from(O::read_u16(take(pos, 2)?));
            pos += 2;
            if size == 0xFFFF {
                size = O::read_u32(take(pos, 4)?) as usize;
                pos += 4;
            }
            header.declared_size = Some(size);
        }
        if code == self.layout.id_size_tsc_escape() {
            pos += align_padding(pos, 8, alignment);
            header.full_tsc = Some(O::read_u64(take(pos, 8)?));
            pos += 8;
        }
        header.payload_offset = pos;
        Ok(header)
    }

    /// Rebuild the full cycle count of `record` from the last one, with
    /// `tsc_bits` valid low bits in the header word.
    pub fn update_tsc(&mut self, record: &RecordHeader, tsc_bits: u8) -> u64 {
        if let Some(full) = record.full_tsc {
            self.tsc = full;
            return full;
        }
        let mask = (1u64 << tsc_bits) - 1;
        let truncated = u64::from(record.tsc_field) & mask;
        self.tsc = if truncated < (self.tsc & mask) {
            (self.tsc & !mask).wrapping_add(mask + 1) | truncated
        } else {
            (self.tsc & !mask) | truncated
        };
        self.tsc
    }
}
