use clap::Parser;
use eyre::Context;
use ltt_reader::LttTime;
use ltt_reader::Traceset;
use ltt_reader::event::TracefileId;
use ltt_reader::print::EventText;
use ltt_reader::print::PrintOptions;
use ltt_reader::traceset::HookAction;
use ltt_reader::traceset::Hooks;
use serde::Serializer;
use serde_derive::Serialize;
use std::collections::HashMap;
use std::io::Write;

mod cli {
    use std::path::PathBuf;

    #[derive(clap_derive::Parser)]
    #[command(version, about)]
    /// Dump the events of LTT traces in time order
    pub struct Cli {
        #[clap(short, long)]
        pub verbose: bool,
        /// Write one JSON object per event
        #[clap(long)]
        pub json: bool,
        /// Print field names along with values
        #[clap(short = 'n', long)]
        pub field_names: bool,
        /// Skip events before this time (seconds)
        #[clap(short, long)]
        pub start: Option<f64>,
        /// Skip events after this time (seconds)
        #[clap(short, long)]
        pub end: Option<f64>,
        /// The name of the output file to write
        #[clap(short, long)]
        pub output: Option<PathBuf>,
        /// Trace directories to read
        #[clap(required = true)]
        pub traces: Vec<PathBuf>,
    }
}

/// One event of the JSON output.
#[derive(Serialize)]
struct JsonEvent<'a> {
    trace: &'a str,
    tracefile: &'a str,
    channel: &'a str,
    name: &'a str,
    cpu: u32,
    time: LttTime,
    #[serde(serialize_with = "serialize_fields")]
    fields: Vec<(&'a str, ltt_reader::Value)>,
}

fn serialize_fields<S: Serializer>(
    fields: &[(&str, ltt_reader::Value)],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_map(fields.iter().map(|(name, value)| (name, value)))
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let cli = cli::Cli::parse();
    let filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    let traceset = Traceset::open(&cli.traces).wrap_err("Failed to open traces")?;
    let names: Vec<String> = cli.traces.iter().map(|p| p.display().to_string()).collect();
    for (trace, name) in traceset.traces().iter().zip(&names) {
        let trace = trace.borrow();
        let system = trace.system();
        log::info!(
            "{name}: {} CPUs, format {}.{}, {} tracefiles",
            system.cpu_count,
            system.major_version,
            system.minor_version,
            trace.num_tracefiles()
        );
        for failure in trace.failures() {
            log::warn!("{}: {}", failure.path.display(), failure.error);
        }
    }

    let file: &mut dyn Write = match &cli.output {
        Some(output) => &mut std::fs::File::create(output)
            .wrap_err_with(|| format!("Failed to create {}", output.display()))?,
        None => &mut std::io::stdout().lock(),
    };
    let mut writer = std::io::BufWriter::new(file);

    let start = cli.start.map_or(LttTime::ZERO, LttTime::from_f64);
    let end = cli.end.map_or(LttTime::INFINITE, LttTime::from_f64);
    let options = PrintOptions {
        field_names: cli.field_names,
    };

    let trace_of: HashMap<TracefileId, usize> = traceset
        .traces()
        .iter()
        .enumerate()
        .flat_map(|(index, trace)| {
            let ids: Vec<_> = trace.borrow().tracefiles().map(|t| t.id()).collect();
            ids.into_iter().map(move |id| (id, index))
        })
        .collect();

    // Hooks cannot return errors, keep the first one and stop.
    let mut failure: Option<eyre::Report> = None;
    let count = {
        let mut hooks = Hooks::new();
        hooks.on_event(|event| {
            let trace = trace_of
                .get(&event.position().tracefile)
                .and_then(|&index| names.get(index))
                .map_or("?", String::as_str);
            let result = if cli.json {
                write_json(&mut writer, event, trace)
            } else {
                EventText::new(event, trace, options)
                    .wrap_err_with(|| {
                        format!("Failed to decode {}.{}", event.channel(), event.name())
                    })
                    .and_then(|text| writeln!(writer, "{text}").map_err(Into::into))
            };
            match result {
                Ok(()) => HookAction::Continue,
                Err(err) => {
                    failure = Some(err);
                    HookAction::Stop
                }
            }
        });
        traceset.process(start, end, &mut hooks)
    };
    if let Some(err) = failure {
        return Err(err);
    }
    writer.flush()?;

    let lost: u64 = traceset
        .traces()
        .iter()
        .map(|trace| trace.borrow().events_lost())
        .sum();
    if lost > 0 {
        log::warn!(
            "{lost} events were lost while tracing. Data is incomplete and may not be \
             trustworthy!"
        );
    }
    log::info!("Dumped {count} events");
    Ok(())
}

fn write_json(
    writer: &mut impl Write,
    event: &ltt_reader::Event<'_>,
    trace: &str,
) -> eyre::Result<()> {
    let fields = event
        .values()
        .wrap_err_with(|| format!("Failed to decode {}.{}", event.channel(), event.name()))?;
    let json = JsonEvent {
        trace,
        tracefile: event.tracefile_name(),
        channel: event.channel(),
        name: event.name(),
        cpu: event.cpu(),
        time: event.time(),
        fields,
    };
    serde_json::to_writer(&mut *writer, &json)?;
    writeln!(writer)?;
    Ok(())
}
