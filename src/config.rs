//! Options controlling how a trace directory is opened.

use crate::markers::METADATA_CHANNEL;
use compact_str::CompactString;
use regex::Regex;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::LazyLock;

/// Default tracefile naming: `[flight-]<channel>_<cpu>`.
static DEFAULT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:flight-)?(?P<channel>.+)_(?P<cpu>\d+)$").expect("Invalid regex")
});

/// Channel and CPU a tracefile belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracefileName {
    pub channel: CompactString,
    pub cpu: u32,
}

/// Decides which files of a trace directory are tracefiles.
pub trait TracefileClassifier: Debug {
    /// `None` for files that are not tracefiles. `name` is the path
    /// relative to the trace directory.
    fn classify(&self, name: &str) -> Option<TracefileName>;
}

/// Classifier matching file names against a regular expression with
/// `channel` and `cpu` capture groups. Subdirectories become part of the
/// channel name, separated with `/`.
#[derive(Debug, Clone)]
pub struct RegexClassifier {
    pattern: Regex,
}

impl RegexClassifier {
    pub fn new(pattern: Regex) -> Self {
        Self { pattern }
    }
}

impl Default for RegexClassifier {
    fn default() -> Self {
        Self {
            pattern: DEFAULT_PATTERN.clone(),
        }
    }
}

impl TracefileClassifier for RegexClassifier {
    fn classify(&self, name: &str) -> Option<TracefileName> {
        let (dir, file) = match name.rsplit_once('/') {
            Some((dir, file)) => (Some(dir), file),
            None => (None, name),
        };
        let captures = self.pattern.captures(file)?;
        let channel = captures.name("channel")?.as_str();
        let cpu = captures.name("cpu")?.as_str().parse().ok()?;
        let channel = match dir {
            Some(dir) => CompactString::from(format!("{dir}/{channel}")),
            None => channel.into(),
        };
        Some(TracefileName { channel, cpu })
    }
}

/// Options for [`crate::trace::Trace::open_with`].
#[derive(Debug, Clone)]
pub struct TraceOptions {
    /// Channels whose tracefiles define markers.
    pub control_channels: Vec<CompactString>,
    pub classifier: Arc<dyn TracefileClassifier>,
    /// Treat a payload size differing from the one declared in the event
    /// header as corruption.
    pub verify_event_size: bool,
}

impl Default for TraceOptions {
    fn default() -> Self {
        Self {
            control_channels: vec![METADATA_CHANNEL.into()],
            classifier: Arc::new(RegexClassifier::default()),
            verify_event_size: true,
        }
    }
}

impl TraceOptions {
    pub fn is_control_channel(&self, channel: &str) -> bool {
        self.control_channels.iter().any(|c| c == channel)
    }
}
