//! A trace directory: its tracefiles, marker registries and the description
//! of the traced system.

use crate::config::TraceOptions;
use crate::error::TracefileError;
use crate::markers::CORE_MARKER_IDS;
use crate::markers::Marker;
use crate::markers::MarkerError;
use crate::markers::control_registry;
use crate::markers::system::SystemInfo;
use crate::markers::registry::MarkerRegistry;
use crate::parsers::ControlEvent;
use crate::time::LttTime;
use crate::tracefile::Tracefile;
use crate::types::ArchSize;
use crate::types::Endianness;
use compact_str::CompactString;
use serde_derive::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

/// Errors that prevent a trace from being opened.
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("Failed to read trace directory {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("No control tracefile found in {0:?}")]
    NoControlTracefile(PathBuf),
    #[error("Tracefile {name} is not a readable LTT tracefile")]
    Format {
        name: CompactString,
        #[source]
        source: TracefileError,
    },
    #[error("Failed to read control tracefile {name}")]
    Control {
        name: CompactString,
        #[source]
        source: TracefileError,
    },
    #[error("Invalid marker definition in control tracefile {name}")]
    Marker {
        name: CompactString,
        #[source]
        source: MarkerError,
    },
}

/// A data tracefile that could not be opened. The rest of the trace is
/// usable.
#[derive(Debug)]
pub struct TracefileFailure {
    pub path: PathBuf,
    pub error: TracefileError,
}

/// Description of the traced system, fixed once the trace is open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SystemDescription {
    pub node_name: Option<CompactString>,
    pub domain_name: Option<CompactString>,
    pub kernel_name: Option<CompactString>,
    pub kernel_release: Option<CompactString>,
    pub kernel_version: Option<CompactString>,
    pub cpu_count: u32,
    pub arch_size: ArchSize,
    pub endianness: Endianness,
    pub major_version: u8,
    pub minor_version: u8,
    /// Alignment rule of the producer, 0 when packed.
    pub alignment: u8,
    /// Wall clock time when tracing started.
    pub start_time: LttTime,
    pub start_tsc: u64,
    /// Start time derived from the cycle counter.
    pub start_monotonic: LttTime,
    pub start_freq: u64,
    pub freq_scale: u32,
}

impl SystemDescription {
    fn new(first: &Tracefile, cpu_count: u32) -> Self {
        let header = first.header();
        let clock = first.clock();
        Self {
            node_name: None,
            domain_name: None,
            kernel_name: None,
            kernel_release: None,
            kernel_version: None,
            cpu_count,
            arch_size: ArchSize::from_pointer_size(header.arch_size),
            endianness: first.endian(),
            major_version: header.major_version,
            minor_version: header.minor_version,
            alignment: header.alignment,
            start_time: LttTime::new(
                header
                    .start_time_sec
                    .saturating_add(header.start_time_usec / 1_000_000),
                (header.start_time_usec % 1_000_000) as u32 * 1000,
            ),
            start_tsc: header.cycle_count_begin,
            start_monotonic: clock.time(header.cycle_count_begin),
            start_freq: clock.start_freq,
            freq_scale: clock.freq_scale,
        }
    }

    fn apply_system_info(&mut self, info: SystemInfo) {
        self.node_name = Some(info.node_name);
        self.domain_name = Some(info.domain_name);
        self.kernel_name = Some(info.kernel_name);
        self.kernel_release = Some(info.kernel_release);
        self.kernel_version = Some(info.kernel_version);
    }
}

/// An open trace directory.
#[derive(Debug)]
pub struct Trace {
    path: PathBuf,
    system: SystemDescription,
    control: Vec<Tracefile>,
    /// Data tracefiles ordered by channel then CPU.
    tracefiles: Vec<Tracefile>,
    registries: HashMap<CompactString, Arc<MarkerRegistry>>,
    failures: Vec<TracefileFailure>,
}

/// List files under `dir` recursively, skipping hidden entries. Names are
/// relative to `root` and sorted.
fn walk(root: &Path, dir: &Path, out: &mut Vec<(String, PathBuf)>) -> Result<(), TraceError> {
    let io_error = |source| TraceError::Io {
        path: dir.to_owned(),
        source,
    };
    let mut entries = std::fs::read_dir(dir)
        .map_err(io_error)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_error)?;
    entries.sort_by_key(std::fs::DirEntry::file_name);
    for entry in entries {
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        if file_name.starts_with('.') {
            continue;
        }
        let path = entry.path();
        if entry.file_type().map_err(io_error)?.is_dir() {
            walk(root, &path, out)?;
            continue;
        }
        let name = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        out.push((name, path));
    }
    Ok(())
}

/// What a control event changes.
enum ControlAction {
    Control(ControlEvent),
    SystemInfo(SystemInfo),
}

impl Trace {
    pub fn open(path: &Path) -> Result<Self, TraceError> {
        Self::open_with(path, &TraceOptions::default())
    }

    pub fn open_with(path: &Path, options: &TraceOptions) -> Result<Self, TraceError> {
        let mut files = Vec::new();
        walk(path, path, &mut files)?;

        let mut control = Vec::new();
        let mut tracefiles = Vec::new();
        let mut failures = Vec::new();
        for (name, file_path) in files {
            let Some(classified) = options.classifier.classify(&name) else {
                log::debug!("Skipping {name}: not a tracefile name");
                continue;
            };
            let is_control = options.is_control_channel(&classified.channel);
            match Tracefile::open(&file_path, &name, &classified.channel, classified.cpu) {
                Ok(tracefile) if is_control => control.push(tracefile),
                Ok(tracefile) => tracefiles.push(tracefile),
                Err(error) if error.is_format_error() => {
                    return Err(TraceError::Format {
                        name: name.into(),
                        source: error,
                    });
                }
                Err(error) if is_control => {
                    return Err(TraceError::Control {
                        name: name.into(),
                        source: error,
                    });
                }
                Err(error) => {
                    log::warn!("Skipping tracefile {name}: {error}");
                    failures.push(TracefileFailure {
                        path: file_path,
                        error,
                    });
                }
            }
        }
        let Some(first) = control.first() else {
            return Err(TraceError::NoControlTracefile(path.to_owned()));
        };
        tracefiles.sort_by(|a, b| (a.channel(), a.cpu()).cmp(&(b.channel(), b.cpu())));

        let clock = first.clock();
        let cpu_count = tracefiles
            .iter()
            .chain(&control)
            .map(|t| t.cpu() + 1)
            .max()
            .unwrap_or(0);
        let mut system = SystemDescription::new(first, cpu_count);

        let mut registries: HashMap<CompactString, MarkerRegistry> = HashMap::new();
        for tracefile in &mut control {
            tracefile.set_clock(clock);
            read_control(tracefile, &mut registries, &mut system)?;
        }

        let registries: HashMap<CompactString, Arc<MarkerRegistry>> = registries
            .into_iter()
            .map(|(channel, registry)| (channel, Arc::new(registry)))
            .collect();
        for tracefile in control.iter_mut().chain(tracefiles.iter_mut()) {
            tracefile.set_clock(clock);
            tracefile.set_verify_size(options.verify_event_size);
            tracefile.rewind();
            match registries.get(tracefile.channel()) {
                Some(registry) => tracefile.set_registry(Arc::clone(registry)),
                None => log::warn!(
                    "No markers defined for channel {} ({})",
                    tracefile.channel(),
                    tracefile.name()
                ),
            }
        }
        log::debug!(
            "Opened trace {}: {} control and {} data tracefiles, {} channels",
            path.display(),
            control.len(),
            tracefiles.len(),
            registries.len()
        );

        Ok(Self {
            path: path.to_owned(),
            system,
            control,
            tracefiles,
            registries,
            failures,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn system(&self) -> &SystemDescription {
        &self.system
    }

    pub fn registry(&self, channel: &str) -> Option<&Arc<MarkerRegistry>> {
        self.registries.get(channel)
    }

    pub fn registries(&self) -> impl Iterator<Item = &Arc<MarkerRegistry>> {
        self.registries.values()
    }

    /// Data tracefiles, ordered by channel then CPU.
    pub fn tracefiles(&self) -> impl Iterator<Item = &Tracefile> {
        self.tracefiles.iter()
    }

    pub fn tracefiles_mut(&mut self) -> impl Iterator<Item = &mut Tracefile> {
        self.tracefiles.iter_mut()
    }

    pub fn tracefile(&self, index: usize) -> Option<&Tracefile> {
        self.tracefiles.get(index)
    }

    pub fn tracefile_mut(&mut self, index: usize) -> Option<&mut Tracefile> {
        self.tracefiles.get_mut(index)
    }

    pub fn num_tracefiles(&self) -> usize {
        self.tracefiles.len()
    }

    pub fn control_tracefiles(&self) -> impl Iterator<Item = &Tracefile> {
        self.control.iter()
    }

    /// Data tracefiles that could not be opened.
    pub fn failures(&self) -> &[TracefileFailure] {
        &self.failures
    }

    /// Events lost over all data tracefiles, either reported by the
    /// producer or dropped while reading.
    pub fn events_lost(&self) -> u64 {
        self.tracefiles.iter().map(Tracefile::events_lost).sum()
    }

    /// Earliest start and latest end over the data tracefiles.
    pub fn time_span(&mut self) -> Result<Option<(LttTime, LttTime)>, TracefileError> {
        let mut span: Option<(LttTime, LttTime)> = None;
        for tracefile in &mut self.tracefiles {
            let (start, end) = tracefile.time_span()?;
            span = Some(match span {
                Some((s, e)) => (s.min(start), e.max(end)),
                None => (start, end),
            });
        }
        Ok(span)
    }
}

/// Read a control tracefile to its end, applying marker definitions to
/// `registries`.
fn read_control(
    tracefile: &mut Tracefile,
    registries: &mut HashMap<CompactString, MarkerRegistry>,
    system: &mut SystemDescription,
) -> Result<(), TraceError> {
    let own_channel = CompactString::from(tracefile.channel());
    let name = CompactString::from(tracefile.name());
    let mut registry = match registries.remove(&own_channel) {
        Some(registry) => registry,
        None => control_registry(&own_channel, tracefile.widths()).map_err(|source| {
            TraceError::Marker {
                name: name.clone(),
                source,
            }
        })?,
    };
    let control_error = |source| TraceError::Control {
        name: name.clone(),
        source,
    };

    loop {
        let action = {
            let Some(event) = tracefile
                .read_next_with(&registry)
                .map_err(control_error)?
            else {
                break;
            };
            if event.id() < CORE_MARKER_IDS {
                ControlEvent::parse(
                    event.id(),
                    event.payload(),
                    event.endian(),
                    event.alignment(),
                )
                .map_err(|err| control_error(err.into()))?
                .map(ControlAction::Control)
            } else if event.name() == "system_info" {
                match SystemInfo::parser_from_info(event.marker()) {
                    Ok(parser) => Some(ControlAction::SystemInfo(
                        SystemInfo::parse(&parser, &event).map_err(|err| control_error(err.into()))?,
                    )),
                    Err(err) => {
                        log::warn!("Ignoring system_info in {name}: {err}");
                        None
                    }
                }
            } else {
                log::debug!("Ignoring {} event in {name}", event.name());
                None
            }
        };
        match action {
            Some(ControlAction::Control(event)) => {
                apply_control(event, &own_channel, &mut registry, registries)
                    .map_err(|source| TraceError::Marker {
                        name: name.clone(),
                        source,
                    })?;
            }
            Some(ControlAction::SystemInfo(info)) => system.apply_system_info(info),
            None => {}
        }
    }
    registries.insert(own_channel, registry);
    Ok(())
}

fn apply_control(
    event: ControlEvent,
    own_channel: &str,
    own: &mut MarkerRegistry,
    registries: &mut HashMap<CompactString, MarkerRegistry>,
) -> Result<(), MarkerError> {
    let channel = event.channel().clone();
    let registry = if channel == own_channel {
        own
    } else {
        registries
            .entry(channel.clone())
            .or_insert_with(|| MarkerRegistry::new(&channel))
    };
    match event {
        ControlEvent::SetMarkerId {
            name, id, widths, ..
        } => match registry.register_id(&name, id, widths) {
            Err(err @ MarkerError::IdCollision { .. }) => {
                log::warn!("Channel {channel}: {err}, ignoring");
                Ok(())
            }
            result => result,
        },
        ControlEvent::SetMarkerFormat { name, format, .. } => {
            registry.register_format(&name, &format)
        }
        ControlEvent::SetTypeDefinition {
            name, declaration, ..
        } => registry.define_type(&name, &declaration),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::PayloadBuilder;
    use crate::testutil::SubbufferBuilder;
    use crate::testutil::kernel_trace;
    use crate::testutil::write_tracefile;
    use crate::types::ArchWidths;

    fn irq(irq_id: u32) -> Vec<u8> {
        PayloadBuilder::new(Endianness::Little)
            .u32(irq_id)
            .u32(0)
            .finish()
    }

    #[test]
    fn test_open_kernel_trace() {
        let dir = tempfile::tempdir().unwrap();
        kernel_trace(
            dir.path(),
            &[
                vec![SubbufferBuilder::new(Endianness::Little, 256).event(9, 5, &irq(1))],
                vec![SubbufferBuilder::new(Endianness::Little, 256).event(9, 7, &irq(2))],
            ],
        );
        std::fs::write(dir.path().join(".hidden_0"), b"junk").unwrap();
        std::fs::write(dir.path().join("README"), b"junk").unwrap();

        let mut trace = Trace::open(dir.path()).unwrap();
        let names: Vec<_> = trace.tracefiles().map(Tracefile::name).collect();
        assert_eq!(names, ["kernel_0", "kernel_1"]);
        assert_eq!(trace.control_tracefiles().count(), 1);
        assert!(trace.failures().is_empty());

        let system = trace.system();
        assert_eq!(system.cpu_count, 2);
        assert_eq!(system.arch_size, ArchSize::Lp64);
        assert_eq!(system.endianness, Endianness::Little);
        assert_eq!((system.major_version, system.minor_version), (2, 5));
        assert_eq!(system.start_time, LttTime::new(1000, 0));
        assert_eq!(system.node_name, None);

        let kernel = trace.registry("kernel").unwrap();
        assert_eq!(kernel.len(), 4);
        assert_eq!(kernel.get(9).unwrap().name, "irq_entry");
        let metadata = trace.registry("metadata").unwrap();
        assert_eq!(metadata.get(0).unwrap().name, "core_marker_id");

        let tracefile = trace.tracefiles_mut().nth(1).unwrap();
        let event = tracefile.read_next().unwrap().unwrap();
        assert_eq!(event.name(), "irq_entry");
        assert_eq!(event.cpu(), 1);
        assert_eq!(event.get_u32(0).unwrap(), 2);

        assert_eq!(
            trace.time_span().unwrap(),
            Some((LttTime::ZERO, LttTime::from_u64(7)))
        );
    }

    #[test]
    fn test_missing_control_tracefile() {
        let dir = tempfile::tempdir().unwrap();
        write_tracefile(
            dir.path(),
            "kernel_0",
            &[SubbufferBuilder::new(Endianness::Little, 128)],
        );
        assert!(matches!(
            Trace::open(dir.path()),
            Err(TraceError::NoControlTracefile(_))
        ));
        assert!(matches!(
            Trace::open(&dir.path().join("missing")),
            Err(TraceError::Io { .. })
        ));
    }

    #[test]
    fn test_bad_tracefiles() {
        let dir = tempfile::tempdir().unwrap();
        kernel_trace(dir.path(), &[]);
        std::fs::write(dir.path().join("kernel_0"), [0u8; 10]).unwrap();
        let trace = Trace::open(dir.path()).unwrap();
        assert_eq!(trace.failures().len(), 1);
        assert!(matches!(
            trace.failures()[0].error,
            TracefileError::Truncated { .. }
        ));

        let mut raw = SubbufferBuilder::new(Endianness::Little, 128).finish();
        raw[16] ^= 0xff;
        std::fs::write(dir.path().join("kernel_1"), raw).unwrap();
        assert!(matches!(
            Trace::open(dir.path()),
            Err(TraceError::Format { .. })
        ));
    }

    #[test]
    fn test_control_stream() {
        let dir = tempfile::tempdir().unwrap();
        let system_info = PayloadBuilder::new(Endianness::Little)
            .string("node1")
            .string("example.org")
            .string("Linux")
            .string("2.6.24")
            .string("#1 SMP")
            .finish();
        let metadata = SubbufferBuilder::new(Endianness::Little, 4096)
            // Formats may come before ids, and ids may collide.
            .set_marker_format("fs", "open", "fd %d name %s")
            .set_type_definition("net", "addr", "struct { port: u16; ip: u32; }")
            .set_marker_id("fs", "open", 8, ArchWidths::ILP32)
            .set_marker_id("fs", "close", 8, ArchWidths::ILP32)
            .marker("net", "connect", 8, "to #{addr}%p")
            .marker(
                "metadata",
                "system_info",
                8,
                "node_name %s domain_name %s kernel_name %s kernel_release %s kernel_version %s",
            )
            .event(8, 0, &system_info);
        write_tracefile(dir.path(), "metadata_0", &[metadata]);
        write_tracefile(
            dir.path(),
            "fs_0",
            &[SubbufferBuilder::new(Endianness::Little, 128)],
        );

        let trace = Trace::open(dir.path()).unwrap();
        let fs = trace.registry("fs").unwrap();
        assert_eq!(fs.get(8).unwrap().name, "open");
        assert_eq!(fs.get(8).unwrap().fields.len(), 2);
        assert!(fs.get_by_name("close").is_none());
        let net = trace.registry("net").unwrap();
        assert_eq!(net.get(8).unwrap().size, Some(8));

        let system = trace.system();
        assert_eq!(system.node_name.as_deref(), Some("node1"));
        assert_eq!(system.kernel_release.as_deref(), Some("2.6.24"));
    }

    #[test]
    fn test_undefined_type_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = SubbufferBuilder::new(Endianness::Little, 1024)
            .marker("net", "connect", 8, "to #{addr}%p");
        write_tracefile(dir.path(), "metadata_0", &[metadata]);
        let err = Trace::open(dir.path()).unwrap_err();
        assert!(matches!(
            err,
            TraceError::Marker {
                source: MarkerError::UndefinedType(_),
                ..
            }
        ));
    }

    #[test]
    fn test_subdirectory_channels() {
        let dir = tempfile::tempdir().unwrap();
        kernel_trace(dir.path(), &[]);
        write_tracefile(
            dir.path(),
            "ust/app_0",
            &[SubbufferBuilder::new(Endianness::Little, 128)],
        );
        let trace = Trace::open(dir.path()).unwrap();
        let tracefile = trace.tracefiles().next().unwrap();
        assert_eq!(tracefile.name(), "ust/app_0");
        assert_eq!(tracefile.channel(), "ust/app");
    }
}
