//! Builders for synthetic tracefiles used by the unit tests.

use crate::markers::SET_MARKER_FORMAT;
use crate::markers::SET_MARKER_ID;
use crate::markers::SET_TYPE_DEFINITION;
use crate::subbuffer::HEADER_SIZE;
use crate::subbuffer::MAGIC;
use crate::types::ArchWidths;
use crate::types::Endianness;
use crate::types::align_padding;
use byteorder::BigEndian;
use byteorder::ByteOrder;
use byteorder::LittleEndian;
use std::path::Path;
use std::path::PathBuf;

const TSC_BITS: u32 = 27;
const TSC_MASK: u64 = (1 << TSC_BITS) - 1;

fn put_u16(out: &mut Vec<u8>, endian: Endianness, value: u16) {
    let mut buf = [0u8; 2];
    match endian {
        Endianness::Little => LittleEndian::write_u16(&mut buf, value),
        Endianness::Big => BigEndian::write_u16(&mut buf, value),
    }
    out.extend_from_slice(&buf);
}

fn put_u32(out: &mut Vec<u8>, endian: Endianness, value: u32) {
    let mut buf = [0u8; 4];
    match endian {
        Endianness::Little => LittleEndian::write_u32(&mut buf, value),
        Endianness::Big => BigEndian::write_u32(&mut buf, value),
    }
    out.extend_from_slice(&buf);
}

fn put_u64(out: &mut Vec<u8>, endian: Endianness, value: u64) {
    let mut buf = [0u8; 8];
    match endian {
        Endianness::Little => LittleEndian::write_u64(&mut buf, value),
        Endianness::Big => BigEndian::write_u64(&mut buf, value),
    }
    out.extend_from_slice(&buf);
}

/// Event payload in a given byte order. `align` pads relative to the
/// payload start.
#[derive(Debug, Clone)]
pub struct PayloadBuilder {
    endian: Endianness,
    data: Vec<u8>,
}

impl PayloadBuilder {
    pub fn new(endian: Endianness) -> Self {
        Self {
            endian,
            data: Vec::new(),
        }
    }

    pub fn u8(mut self, value: u8) -> Self {
        self.data.push(value);
        self
    }

    pub fn u16(mut self, value: u16) -> Self {
        put_u16(&mut self.data, self.endian, value);
        self
    }

    pub fn u32(mut self, value: u32) -> Self {
        put_u32(&mut self.data, self.endian, value);
        self
    }

    pub fn u64(mut self, value: u64) -> Self {
        put_u64(&mut self.data, self.endian, value);
        self
    }

    pub fn i32(self, value: i32) -> Self {
        self.u32(value as u32)
    }

    pub fn i64(self, value: i64) -> Self {
        self.u64(value as u64)
    }

    pub fn string(mut self, value: &str) -> Self {
        self.data.extend_from_slice(value.as_bytes());
        self.data.push(0);
        self
    }

    pub fn bytes(mut self, value: &[u8]) -> Self {
        self.data.extend_from_slice(value);
        self
    }

    pub fn align(mut self, align: usize) -> Self {
        while self.data.len() % align != 0 {
            self.data.push(0);
        }
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.data
    }
}

/// One subbuffer: header fields plus events appended in order.
#[derive(Debug, Clone)]
pub struct SubbufferBuilder {
    endian: Endianness,
    sb_size: u32,
    begin: u64,
    end: Option<u64>,
    major: u8,
    minor: u8,
    arch_size: u8,
    alignment: u8,
    start_time_sec: u64,
    start_time_usec: u64,
    freq: u64,
    freq_scale: u32,
    events_lost: u32,
    subbuf_corrupt: u32,
    payload_align: usize,
    last_tsc: u64,
    /// Bytes after the header.
    body: Vec<u8>,
}

impl SubbufferBuilder {
    pub fn new(endian: Endianness, sb_size: u32) -> Self {
        Self {
            endian,
            sb_size,
            begin: 0,
            end: None,
            major: 2,
            minor: 5,
            arch_size: 8,
            alignment: 8,
            start_time_sec: 1000,
            start_time_usec: 0,
            freq: 1_000_000_000,
            freq_scale: 1,
            events_lost: 0,
            subbuf_corrupt: 0,
            payload_align: 1,
            last_tsc: 0,
            body: Vec::new(),
        }
    }

    pub fn begin(mut self, tsc: u64) -> Self {
        self.begin = tsc;
        self.last_tsc = tsc;
        self
    }

    pub fn end(mut self, tsc: u64) -> Self {
        self.end = Some(tsc);
        self
    }

    pub fn version(mut self, major: u8, minor: u8) -> Self {
        self.major = major;
        self.minor = minor;
        self
    }

    pub fn arch(mut self, arch_size: u8, alignment: u8) -> Self {
        self.arch_size = arch_size;
        self.alignment = alignment;
        self
    }

    pub fn clock(mut self, freq: u64, freq_scale: u32) -> Self {
        self.freq = freq;
        self.freq_scale = freq_scale;
        self
    }

    pub fn start_time(mut self, sec: u64, usec: u64) -> Self {
        self.start_time_sec = sec;
        self.start_time_usec = usec;
        self
    }

    pub fn lost(mut self, events: u32) -> Self {
        self.events_lost = events;
        self
    }

    pub fn corrupt(mut self, subbuffers: u32) -> Self {
        self.subbuf_corrupt = subbuffers;
        self
    }

    /// Alignment applied before the payloads of the following events.
    pub fn payload_align(mut self, align: usize) -> Self {
        self.payload_align = align;
        self
    }

    fn pad(&mut self, size: usize) {
        let padding = align_padding(
            HEADER_SIZE + self.body.len(),
            size,
            usize::from(self.alignment),
        );
        self.body.resize(self.body.len() + padding, 0);
    }

    fn header_word(&mut self, code: u16, tsc_field: u64) {
        self.pad(4);
        let word = (u32::from(code) << TSC_BITS) | (tsc_field & TSC_MASK) as u32;
        put_u32(&mut self.body, self.endian, word);
    }

    fn size_field(&mut self, size: usize) {
        if size < 0xFFFF {
            put_u16(&mut self.body, self.endian, size as u16);
        } else {
            put_u16(&mut self.body, self.endian, 0xFFFF);
            put_u32(&mut self.body, self.endian, size as u32);
        }
    }

    fn payload(mut self, tsc: u64, payload: &[u8]) -> Self {
        self.pad(self.payload_align);
        self.body.extend_from_slice(payload);
        self.last_tsc = tsc;
        self
    }

    /// Event in the shortest header form able to carry `id`.
    pub fn event(mut self, id: u16, tsc: u64, payload: &[u8]) -> Self {
        if id < 29 {
            self.header_word(id, tsc);
        } else {
            self.header_word(31, tsc);
            put_u16(&mut self.body, self.endian, id);
        }
        self.payload(tsc, payload)
    }

    /// Event with a declared payload size.
    pub fn event_sized(self, id: u16, tsc: u64, payload: &[u8]) -> Self {
        let size = payload.len();
        self.event_declaring(id, tsc, size, payload)
    }

    /// Event whose header declares `size`, whatever the payload is.
    pub fn event_declaring(mut self, id: u16, tsc: u64, size: usize, payload: &[u8]) -> Self {
        self.header_word(30, tsc);
        put_u16(&mut self.body, self.endian, id);
        self.size_field(size);
        self.payload(tsc, payload)
    }

    /// Event carrying its full cycle count.
    pub fn event_full_tsc(mut self, id: u16, tsc: u64, payload: &[u8]) -> Self {
        self.header_word(29, tsc);
        put_u16(&mut self.body, self.endian, id);
        self.size_field(payload.len());
        self.pad(8);
        put_u64(&mut self.body, self.endian, tsc);
        self.payload(tsc, payload)
    }

    /// Short form event packing `value` in the top `bits` of the cycle
    /// count field.
    pub fn compact_event(mut self, id: u16, tsc: u64, bits: u8, value: u64, payload: &[u8]) -> Self {
        let tsc_bits = TSC_BITS - u32::from(bits);
        let field = (value << tsc_bits) | (tsc & ((1 << tsc_bits) - 1));
        self.header_word(id, field);
        self.payload(tsc, payload)
    }

    /// Raw bytes, for corrupt records.
    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.body.extend_from_slice(bytes);
        self
    }

    pub fn set_marker_id(self, channel: &str, name: &str, id: u16, widths: ArchWidths) -> Self {
        let payload = PayloadBuilder::new(self.endian)
            .string(channel)
            .string(name)
            .align(2)
            .u16(id)
            .u8(widths.int_size)
            .u8(widths.long_size)
            .u8(widths.pointer_size)
            .u8(widths.size_t_size)
            .u8(widths.alignment)
            .finish();
        // Control payloads start 4 byte aligned, so aligning the strings to
        // 2 relative to the payload matches the producer.
        let tsc = self.last_tsc;
        self.event(SET_MARKER_ID, tsc, &payload)
    }

    pub fn set_marker_format(self, channel: &str, name: &str, format: &str) -> Self {
        let payload = PayloadBuilder::new(self.endian)
            .string(channel)
            .string(name)
            .string(format)
            .finish();
        let tsc = self.last_tsc;
        self.event(SET_MARKER_FORMAT, tsc, &payload)
    }

    pub fn set_type_definition(self, channel: &str, name: &str, declaration: &str) -> Self {
        let payload = PayloadBuilder::new(self.endian)
            .string(channel)
            .string(name)
            .string(declaration)
            .finish();
        let tsc = self.last_tsc;
        self.event(SET_TYPE_DEFINITION, tsc, &payload)
    }

    /// Register `name` under `id` with LP64 widths and give it `format`.
    pub fn marker(self, channel: &str, name: &str, id: u16, format: &str) -> Self {
        self.set_marker_id(channel, name, id, ArchWidths::LP64)
            .set_marker_format(channel, name, format)
    }

    pub fn finish(&self) -> Vec<u8> {
        let data_size = HEADER_SIZE + self.body.len();
        assert!(
            data_size <= self.sb_size as usize,
            "subbuffer overflow: {data_size} > {}",
            self.sb_size
        );
        let endian = self.endian;
        let mut out = Vec::with_capacity(self.sb_size as usize);
        put_u64(&mut out, endian, self.begin);
        put_u64(&mut out, endian, self.end.unwrap_or(self.last_tsc));
        put_u32(&mut out, endian, MAGIC);
        out.extend_from_slice(&[self.major, self.minor, self.arch_size, self.alignment]);
        put_u64(&mut out, endian, self.start_time_sec);
        put_u64(&mut out, endian, self.start_time_usec);
        put_u64(&mut out, endian, self.freq);
        put_u32(&mut out, endian, self.freq_scale);
        put_u32(&mut out, endian, data_size as u32);
        put_u32(&mut out, endian, self.sb_size);
        put_u32(&mut out, endian, self.events_lost);
        put_u32(&mut out, endian, self.subbuf_corrupt);
        out.extend_from_slice(&self.body);
        out.resize(self.sb_size as usize, 0);
        out
    }
}

/// Write the given subbuffers to `dir/name`.
pub fn write_tracefile(dir: &Path, name: &str, subbuffers: &[SubbufferBuilder]) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    let data: Vec<u8> = subbuffers.iter().flat_map(SubbufferBuilder::finish).collect();
    std::fs::write(&path, data).unwrap();
    path
}

/// A trace directory with a metadata tracefile defining the markers used
/// by the kernel test tracefiles.
pub fn kernel_trace(dir: &Path, cpus: &[Vec<SubbufferBuilder>]) {
    let metadata = SubbufferBuilder::new(Endianness::Little, 4096)
        .marker("kernel", "sched_schedule", 8, "prev_pid %d next_pid %d prev_state %ld")
        .marker("kernel", "irq_entry", 9, "irq_id %u kernel_mode %u")
        .marker("kernel", "process_fork", 10, "parent_pid %d child_pid %d")
        .marker("kernel", "printk", 11, "level %d text %s");
    write_tracefile(dir, "metadata_0", &[metadata]);
    for (cpu, subbuffers) in cpus.iter().enumerate() {
        write_tracefile(dir, &format!("kernel_{cpu}"), subbuffers);
    }
}
