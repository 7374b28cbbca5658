//! Typed struct for the trace description marker.

use super::parser::marker_parser;
use compact_str::CompactString;

marker_parser!(
    #[marker_name("metadata:system_info")]
    pub struct SystemInfo {
        node_name: CompactString,
        domain_name: CompactString,
        kernel_name: CompactString,
        kernel_release: CompactString,
        kernel_version: CompactString,
    }
);
