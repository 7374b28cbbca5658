//! One tracefile: a channel's event stream for one CPU.

use crate::decoder::DecodeContext;
use crate::decoder::Layout;
use crate::decoder::compute_layout;
use crate::error::DecodeError;
use crate::error::TracefileError;
use crate::event::Event;
use crate::event::EventPosition;
use crate::event::TracefileId;
use crate::markers::registry::MarkerRegistry;
use crate::subbuffer::HEADER_SIZE;
use crate::subbuffer::SubbufferHeader;
use crate::subbuffer::SubbufferReader;
use crate::time::LttTime;
use crate::time::NANOSECONDS_PER_SECOND;
use crate::types::ArchWidths;
use crate::types::Endianness;
use crate::types::align_padding;
use compact_str::CompactString;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

static NEXT_TRACEFILE_ID: AtomicU32 = AtomicU32::new(0);

/// Cycle counter to time conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockParams {
    pub start_freq: u64,
    pub freq_scale: u32,
}

impl ClockParams {
    pub fn from_header(header: &SubbufferHeader) -> Self {
        Self {
            start_freq: header.start_freq,
            freq_scale: header.freq_scale,
        }
    }

    /// Time elapsed after `tsc` cycles.
    pub fn time(&self, tsc: u64) -> LttTime {
        let ns = u128::from(tsc) * u128::from(NANOSECONDS_PER_SECOND) * u128::from(self.freq_scale)
            / u128::from(self.start_freq.max(1));
        LttTime::from_u128(ns)
    }

    /// Smallest cycle count at or after `time`.
    pub fn tsc(&self, time: LttTime) -> u64 {
        let ns = u128::from(time.seconds) * u128::from(NANOSECONDS_PER_SECOND)
            + u128::from(time.nanoseconds);
        let per_cycle = u128::from(NANOSECONDS_PER_SECOND) * u128::from(self.freq_scale.max(1));
        let cycles = (ns * u128::from(self.start_freq)).div_ceil(per_cycle);
        u64::try_from(cycles).unwrap_or(u64::MAX)
    }
}

/// Where the current event lives in the reader's buffer.
#[derive(Debug, Clone, Copy)]
struct CurrentRecord {
    id: u16,
    tsc: u64,
    time: LttTime,
    position: EventPosition,
    payload_start: usize,
    size: usize,
    declared_size: Option<usize>,
    ctx: DecodeContext,
}

#[derive(Debug)]
pub struct Tracefile {
    id: TracefileId,
    path: PathBuf,
    /// Path relative to the trace directory.
    name: CompactString,
    channel: CompactString,
    cpu: u32,
    reader: SubbufferReader,
    clock: ClockParams,
    registry: Arc<MarkerRegistry>,
    verify_size: bool,
    current: Option<CurrentRecord>,
    slots: Layout,
    /// Subbuffers whose tail was dropped, so rereading does not count twice.
    dropped_in: Vec<bool>,
    records_dropped: u64,
}

impl Tracefile {
    /// Open a tracefile, reading its first subbuffer header. Events cannot
    /// be decoded until a registry is attached.
    pub fn open(
        path: &Path,
        name: &str,
        channel: &str,
        cpu: u32,
    ) -> Result<Self, TracefileError> {
        let reader = SubbufferReader::open(path)?;
        let clock = ClockParams::from_header(reader.first_header());
        let dropped_in = vec![false; reader.num_subbuffers()];
        log::debug!(
            "Opened {name}: {} subbuffers of {} bytes, {:?}",
            reader.num_subbuffers(),
            reader.first_header().sb_size,
            reader.endian()
        );
        Ok(Self {
            id: TracefileId(NEXT_TRACEFILE_ID.fetch_add(1, Ordering::Relaxed)),
            path: path.to_owned(),
            name: name.into(),
            channel: channel.into(),
            cpu,
            reader,
            clock,
            registry: Arc::new(MarkerRegistry::new(channel)),
            verify_size: true,
            current: None,
            slots: Layout::new(),
            dropped_in,
            records_dropped: 0,
        })
    }

    pub fn id(&self) -> TracefileId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn cpu(&self) -> u32 {
        self.cpu
    }

    pub fn header(&self) -> &SubbufferHeader {
        self.reader.first_header()
    }

    pub fn endian(&self) -> Endianness {
        self.reader.endian()
    }

    /// Widths implied by the subbuffer header, used for the bootstrap
    /// markers.
    pub fn widths(&self) -> ArchWidths {
        let header = self.reader.first_header();
        ArchWidths::from_header(header.arch_size, header.alignment)
    }

    pub fn clock(&self) -> ClockParams {
        self.clock
    }

    pub fn set_clock(&mut self, clock: ClockParams) {
        self.clock = clock;
    }

    pub fn registry(&self) -> &Arc<MarkerRegistry> {
        &self.registry
    }

    pub fn set_registry(&mut self, registry: Arc<MarkerRegistry>) {
        self.registry = registry;
    }

    /// Check payload sizes against sizes declared in event headers.
    pub fn set_verify_size(&mut self, verify: bool) {
        self.verify_size = verify;
    }

    pub fn num_subbuffers(&self) -> usize {
        self.reader.num_subbuffers()
    }

    /// Events lost: those the producer reported plus records dropped
    /// while reading.
    pub fn events_lost(&self) -> u64 {
        self.reader.events_lost() + self.records_dropped
    }

    /// Subbuffers the producer reported as corrupt.
    pub fn corrupt_subbuffers(&self) -> u64 {
        self.reader.corrupt_subbuffers()
    }

    /// Records dropped while reading because they could not be decoded.
    pub fn records_dropped(&self) -> u64 {
        self.records_dropped
    }

    /// Position of the current event.
    pub fn position(&self) -> Option<EventPosition> {
        self.current.map(|c| c.position)
    }

    /// Time of the current event.
    pub fn current_time(&self) -> Option<LttTime> {
        self.current.map(|c| c.time)
    }

    /// Read the next event, decoded with the attached registry.
    pub fn read_next(&mut self) -> Result<Option<Event<'_>>, TracefileError> {
        let registry = Arc::clone(&self.registry);
        if !self.read_record(&registry)? {
            return Ok(None);
        }
        Ok(self.current())
    }

    /// The event last read, decoded with the attached registry.
    pub fn current(&self) -> Option<Event<'_>> {
        self.current_event(&self.registry)
    }

    /// Read the next event, decoded with `registry`. Used while the
    /// registry is still being built from the stream itself.
    pub fn read_next_with<'a>(
        &'a mut self,
        registry: &'a MarkerRegistry,
    ) -> Result<Option<Event<'a>>, TracefileError> {
        if !self.read_record(registry)? {
            return Ok(None);
        }
        Ok(self.current_event(registry))
    }

    /// View of the current event.
    pub fn current_event<'a>(&'a self, registry: &'a MarkerRegistry) -> Option<Event<'a>> {
        let current = self.current?;
        let info = registry.get(current.id)?;
        let data = self.reader.data();
        Some(Event {
            info,
            payload: &data[current.payload_start..current.payload_start + current.size],
            slots: &self.slots,
            ctx: current.ctx,
            tsc: current.tsc,
            time: current.time,
            position: current.position,
            cpu: self.cpu,
            tracefile_name: &self.name,
            declared_size: current.declared_size,
        })
    }

    /// Advance to the next decodable record. Corrupt records are dropped
    /// together with the rest of their subbuffer.
    fn read_record(&mut self, registry: &MarkerRegistry) -> Result<bool, TracefileError> {
        loop {
            match self.decode_record(registry) {
                Ok(found) => return Ok(found),
                Err(TracefileError::Decode(err)) if err.is_corruption() => {
                    log::warn!(
                        "{}: dropping corrupt record in subbuffer {}: {err}",
                        self.name,
                        self.reader.block()
                    );
                    self.current = None;
                    self.drop_subbuffer();
                }
                Err(err) => {
                    self.current = None;
                    return Err(err);
                }
            }
        }
    }

    /// Drop the rest of the current subbuffer, counting one lost record.
    fn drop_subbuffer(&mut self) {
        let block = self.reader.block();
        if self.dropped_in.get(block) == Some(&false) {
            self.dropped_in[block] = true;
            self.records_dropped += 1;
        }
        self.reader.skip_subbuffer();
    }

    fn decode_record(&mut self, registry: &MarkerRegistry) -> Result<bool, TracefileError> {
        let Some(record) = self.reader.next_record()? else {
            self.current = None;
            return Ok(false);
        };
        let Some(info) = registry.get(record.id) else {
            log::warn!(
                "{}: unknown marker id {} in subbuffer {}, skipping the subbuffer",
                self.name,
                record.id,
                self.reader.block()
            );
            self.drop_subbuffer();
            return Err(DecodeError::UnknownMarker { id: record.id }.into());
        };

        let tsc_bits = self.reader.layout().tsc_bits;
        let (compact, valid_bits) = match info.compact_bits() {
            Some(bits) if record.is_short() => {
                let valid_bits = tsc_bits.saturating_sub(bits);
                (u64::from(record.tsc_field) >> valid_bits, valid_bits)
            }
            _ => (0, tsc_bits),
        };
        let tsc = self.reader.update_tsc(&record, valid_bits);

        let alignment = usize::from(info.widths.alignment);
        let payload_start = record.payload_offset
            + align_padding(record.payload_offset, info.largest_align, alignment);
        let ctx = DecodeContext {
            endian: self.reader.endian(),
            alignment,
            compact,
        };
        let data = self.reader.data();
        let payload = data.get(payload_start..).ok_or(DecodeError::OutOfBounds {
            offset: payload_start,
            needed: 0,
            available: 0,
        })?;
        let size = if info.has_format() {
            compute_layout(info, payload, &ctx, &mut self.slots)?
        } else {
            self.slots.clear();
            record.declared_size.unwrap_or(0)
        };
        let size = match record.declared_size {
            Some(declared) if declared != size => {
                if self.verify_size {
                    return Err(DecodeError::SizeMismatch {
                        marker: info.name.clone(),
                        declared,
                        computed: size,
                    }
                    .into());
                }
                log::debug!(
                    "{}: {} declares {declared} bytes, layout gives {size}",
                    self.name,
                    info.name
                );
                declared
            }
            _ => size,
        };
        if size > payload.len() {
            return Err(DecodeError::OutOfBounds {
                offset: payload_start,
                needed: size,
                available: payload.len(),
            }
            .into());
        }
        self.reader.advance(payload_start + size);
        self.current = Some(CurrentRecord {
            id: record.id,
            tsc,
            time: self.clock.time(tsc),
            position: EventPosition {
                tracefile: self.id,
                block: self.reader.block(),
                offset: record.offset,
                tsc,
            },
            payload_start,
            size,
            declared_size: record.declared_size,
            ctx,
        });
        Ok(true)
    }

    /// Position on the first event at or after `time`. The next read
    /// returns that event.
    pub fn seek_time(&mut self, time: LttTime) -> Result<(), TracefileError> {
        self.current = None;
        let target = self.clock.tsc(time);
        let blocks = self.reader.num_subbuffers();
        let (mut low, mut high) = (0, blocks);
        while low < high {
            let mid = low + (high - low) / 2;
            if self.reader.bounds(mid)?.end_tsc < target {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        if low == blocks {
            return self.reader.set_cursor(blocks, 0, 0);
        }
        let begin = self.reader.bounds(low)?.begin_tsc;
        self.reader.set_cursor(low, HEADER_SIZE, begin)?;

        let registry = Arc::clone(&self.registry);
        loop {
            match self.read_record(&registry) {
                Ok(true) => {}
                Ok(false) => return Ok(()),
                Err(TracefileError::Decode(DecodeError::UnknownMarker { .. })) => continue,
                Err(err) => return Err(err),
            }
            if let Some(current) = self.current
                && current.time >= time
            {
                return self.seek_position(current.position);
            }
        }
    }

    /// Position on a previously seen event. The next read returns it.
    pub fn seek_position(&mut self, position: EventPosition) -> Result<(), TracefileError> {
        if position.tracefile != self.id {
            return Err(TracefileError::ForeignPosition);
        }
        self.current = None;
        self.reader
            .set_cursor(position.block, position.offset, position.tsc)
    }

    /// Go back to the first event.
    pub fn rewind(&mut self) {
        self.current = None;
        self.reader.rewind();
    }

    /// Times of the start of the first subbuffer and the end of the last.
    pub fn time_span(&mut self) -> Result<(LttTime, LttTime), TracefileError> {
        let first = self.reader.bounds(0)?;
        let last = self.reader.bounds(self.reader.num_subbuffers() - 1)?;
        Ok((
            self.clock.time(first.begin_tsc),
            self.clock.time(last.end_tsc),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::PayloadBuilder;
    use crate::testutil::SubbufferBuilder;
    use crate::testutil::write_tracefile;
    use crate::types::ArchWidths;

    fn registry() -> Arc<MarkerRegistry> {
        let mut registry = MarkerRegistry::new("kernel");
        registry.register_id("irq_entry", 8, ArchWidths::LP64).unwrap();
        registry
            .register_format("irq_entry", "irq_id %u kernel_mode %u")
            .unwrap();
        registry.register_id("printk", 9, ArchWidths::LP64).unwrap();
        registry.register_format("printk", "text %s").unwrap();
        registry.register_id("tick", 10, ArchWidths::LP64).unwrap();
        registry.register_id("packed", 11, ArchWidths::LP64).unwrap();
        registry.register_format("packed", "cpu #b3%u value %u").unwrap();
        Arc::new(registry)
    }

    fn irq(irq_id: u32) -> Vec<u8> {
        PayloadBuilder::new(Endianness::Little)
            .u32(irq_id)
            .u32(1)
            .finish()
    }

    fn open(dir: &Path, subbuffers: &[SubbufferBuilder]) -> Tracefile {
        let path = write_tracefile(dir, "kernel_0", subbuffers);
        let mut tracefile = Tracefile::open(&path, "kernel_0", "kernel", 0).unwrap();
        tracefile.set_registry(registry());
        tracefile
    }

    fn read_times(tracefile: &mut Tracefile) -> Vec<u64> {
        let mut times = Vec::new();
        loop {
            match tracefile.read_next() {
                Ok(Some(event)) => times.push(event.time().to_u64()),
                Ok(None) => return times,
                Err(_) => {}
            }
        }
    }

    #[test]
    fn test_clock() {
        let clock = ClockParams {
            start_freq: 500_000_000,
            freq_scale: 1,
        };
        assert_eq!(clock.time(1000), LttTime::from_u64(2000));
        assert_eq!(clock.tsc(LttTime::from_u64(2000)), 1000);
        assert_eq!(clock.tsc(LttTime::from_u64(2001)), 1001);
        // No overflow in the intermediate product.
        let slow = ClockParams {
            start_freq: 1,
            freq_scale: 1,
        };
        assert_eq!(slow.time(u64::MAX).seconds, u64::MAX);
    }

    #[test]
    fn test_monotonic_across_subbuffers_and_overflow() {
        let dir = tempfile::tempdir().unwrap();
        let wrap = 1u64 << 27;
        let mut tracefile = open(
            dir.path(),
            &[
                SubbufferBuilder::new(Endianness::Little, 256)
                    .begin(wrap - 100)
                    .event(8, wrap - 50, &irq(1))
                    .event(8, wrap + 20, &irq(2)),
                SubbufferBuilder::new(Endianness::Little, 256)
                    .begin(wrap + 30)
                    .event(8, 3 * wrap + 1, &irq(3))
                    .event_full_tsc(8, 5 * wrap, &irq(4)),
            ],
        );
        // The third field only keeps its low bits, so it lands in the wrap
        // following the subbuffer start.
        assert_eq!(
            read_times(&mut tracefile),
            [wrap - 50, wrap + 20, 2 * wrap + 1, 5 * wrap]
        );
    }

    #[test]
    fn test_decode_fields() {
        let dir = tempfile::tempdir().unwrap();
        let text = PayloadBuilder::new(Endianness::Little)
            .string("hello")
            .finish();
        let mut tracefile = open(
            dir.path(),
            &[SubbufferBuilder::new(Endianness::Little, 512)
                .event(8, 1, &irq(33))
                .event_sized(9, 2, &text)
                .event(10, 3, &[])],
        );

        let event = tracefile.read_next().unwrap().unwrap();
        assert_eq!(event.name(), "irq_entry");
        assert_eq!(event.get_u32(0).unwrap(), 33);
        assert_eq!(event.get_u32(1).unwrap(), 1);
        assert_eq!(event.time(), LttTime::from_u64(1));

        let event = tracefile.read_next().unwrap().unwrap();
        assert_eq!(event.get_string(0).unwrap(), "hello");
        assert_eq!(event.declared_size(), Some(6));

        let event = tracefile.read_next().unwrap().unwrap();
        assert_eq!(event.name(), "tick");
        assert_eq!(event.size(), 0);

        assert!(tracefile.read_next().unwrap().is_none());
        assert_eq!(tracefile.records_dropped(), 0);
    }

    #[test]
    fn test_compact_event() {
        let dir = tempfile::tempdir().unwrap();
        let payload = PayloadBuilder::new(Endianness::Little).u32(99).finish();
        let mut tracefile = open(
            dir.path(),
            &[SubbufferBuilder::new(Endianness::Little, 256)
                .begin(100)
                .compact_event(11, 150, 3, 5, &payload)],
        );
        let event = tracefile.read_next().unwrap().unwrap();
        assert_eq!(event.get_u8(0).unwrap(), 5);
        assert_eq!(event.get_u32(1).unwrap(), 99);
        assert_eq!(event.tsc(), 150);
    }

    #[test]
    fn test_corrupt_record_resyncs() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracefile = open(
            dir.path(),
            &[
                SubbufferBuilder::new(Endianness::Little, 256)
                    .event(8, 1, &irq(1))
                    // Header says 3 bytes, the format says 8.
                    .event_declaring(8, 2, 3, &irq(2))
                    .event(8, 3, &irq(3)),
                SubbufferBuilder::new(Endianness::Little, 256)
                    .begin(10)
                    .event(8, 11, &irq(4)),
            ],
        );
        let mut ids = Vec::new();
        while let Some(event) = tracefile.read_next().unwrap() {
            ids.push(event.get_u32(0).unwrap());
        }
        assert_eq!(ids, [1, 4]);
        assert_eq!(tracefile.records_dropped(), 1);
        assert_eq!(tracefile.events_lost(), 1);

        // Reading the same subbuffers again does not count twice.
        tracefile.rewind();
        while tracefile.read_next().unwrap().is_some() {}
        assert_eq!(tracefile.events_lost(), 1);
    }

    #[test]
    fn test_unterminated_string_resyncs() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracefile = open(
            dir.path(),
            &[
                SubbufferBuilder::new(Endianness::Little, 128)
                    .event(9, 1, &[])
                    .raw(b"abc"),
                SubbufferBuilder::new(Endianness::Little, 128)
                    .begin(10)
                    .event(8, 11, &irq(4)),
            ],
        );
        // Padding after the data is not part of the subbuffer.
        let event = tracefile.read_next().unwrap().unwrap();
        assert_eq!(event.get_u32(0).unwrap(), 4);
        assert_eq!(tracefile.records_dropped(), 1);
    }

    #[test]
    fn test_unknown_marker() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracefile = open(
            dir.path(),
            &[
                SubbufferBuilder::new(Endianness::Little, 256)
                    .event(20, 1, &[])
                    .event(8, 2, &irq(1)),
                SubbufferBuilder::new(Endianness::Little, 256)
                    .begin(10)
                    .event(8, 11, &irq(2)),
            ],
        );
        let err = tracefile.read_next().unwrap_err();
        assert!(matches!(
            err,
            TracefileError::Decode(DecodeError::UnknownMarker { id: 20 })
        ));
        let event = tracefile.read_next().unwrap().unwrap();
        assert_eq!(event.get_u32(0).unwrap(), 2);
    }

    #[test]
    fn test_lost_events() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracefile = open(
            dir.path(),
            &[
                SubbufferBuilder::new(Endianness::Little, 128)
                    .lost(4)
                    .event(8, 1, &irq(1)),
                SubbufferBuilder::new(Endianness::Little, 128)
                    .lost(2)
                    .corrupt(1)
                    .begin(5)
                    .event(8, 6, &irq(2)),
            ],
        );
        assert_eq!(read_times(&mut tracefile), [1, 6]);
        assert_eq!(tracefile.events_lost(), 6);
        assert_eq!(tracefile.corrupt_subbuffers(), 1);
        tracefile.rewind();
        assert_eq!(read_times(&mut tracefile).len(), 2);
        assert_eq!(tracefile.events_lost(), 6);
    }

    #[test]
    fn test_seek_time_and_position() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracefile = open(
            dir.path(),
            &[
                SubbufferBuilder::new(Endianness::Little, 128)
                    .begin(0)
                    .event(8, 10, &irq(1))
                    .event(8, 20, &irq(2)),
                SubbufferBuilder::new(Endianness::Little, 128)
                    .begin(30)
                    .event(8, 40, &irq(3))
                    .event(8, 50, &irq(4)),
                SubbufferBuilder::new(Endianness::Little, 128)
                    .begin(60)
                    .event(8, 70, &irq(5)),
            ],
        );
        tracefile.seek_time(LttTime::from_u64(45)).unwrap();
        let event = tracefile.read_next().unwrap().unwrap();
        assert_eq!(event.get_u32(0).unwrap(), 4);
        let position = event.position();

        tracefile.seek_time(LttTime::from_u64(20)).unwrap();
        assert_eq!(tracefile.read_next().unwrap().unwrap().tsc(), 20);

        tracefile.seek_time(LttTime::ZERO).unwrap();
        assert_eq!(tracefile.read_next().unwrap().unwrap().tsc(), 10);

        tracefile.seek_time(LttTime::from_u64(71)).unwrap();
        assert!(tracefile.read_next().unwrap().is_none());

        tracefile.seek_position(position).unwrap();
        let event = tracefile.read_next().unwrap().unwrap();
        assert_eq!(event.get_u32(0).unwrap(), 4);
        assert_eq!(event.tsc(), 50);
        assert_eq!(tracefile.read_next().unwrap().unwrap().tsc(), 70);

        assert_eq!(
            tracefile.time_span().unwrap(),
            (LttTime::ZERO, LttTime::from_u64(70))
        );
    }

    #[test]
    fn test_foreign_position() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = open(
            dir.path(),
            &[SubbufferBuilder::new(Endianness::Little, 128).event(8, 1, &irq(1))],
        );
        let position = first.read_next().unwrap().unwrap().position();
        let path = write_tracefile(
            dir.path(),
            "kernel_1",
            &[SubbufferBuilder::new(Endianness::Little, 128)],
        );
        let mut second = Tracefile::open(&path, "kernel_1", "kernel", 1).unwrap();
        assert!(matches!(
            second.seek_position(position),
            Err(TracefileError::ForeignPosition)
        ));
    }
}
