//! Text rendering of events, one line per event.

use crate::decoder::Value;
use crate::error::DecodeError;
use crate::event::Event;
use crate::markers::field::IntDisplay;
use crate::time::LttTime;
use std::fmt;
use std::fmt::Write;

/// Options for [`EventText`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PrintOptions {
    /// Print `name = value` rather than bare values.
    pub field_names: bool,
}

/// A decoded event ready to be displayed.
///
/// ```text
/// kernel.sched_schedule: 12.000000345 (trace/kernel_0) { prev_pid = 10, next_pid = 20 }
/// ```
#[derive(Debug, Clone)]
pub struct EventText<'a> {
    channel: &'a str,
    name: &'a str,
    time: LttTime,
    trace: &'a str,
    tracefile: &'a str,
    fields: Vec<(&'a str, IntDisplay, Value)>,
    options: PrintOptions,
}

impl<'a> EventText<'a> {
    /// Decode every field of `event`. `trace` names the trace the event
    /// comes from.
    pub fn new(
        event: &Event<'a>,
        trace: &'a str,
        options: PrintOptions,
    ) -> Result<Self, DecodeError> {
        let fields = event
            .fields()
            .iter()
            .zip(event.values()?)
            .map(|(field, (name, value))| (name, field.display, value))
            .collect();
        Ok(Self {
            channel: event.channel(),
            name: event.name(),
            time: event.time(),
            trace,
            tracefile: event.tracefile_name(),
            fields,
            options,
        })
    }
}

impl fmt::Display for EventText<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}: {} ({}/{})",
            self.channel, self.name, self.time, self.trace, self.tracefile
        )?;
        if self.fields.is_empty() {
            return Ok(());
        }
        f.write_str(" {")?;
        for (i, (name, display, value)) in self.fields.iter().enumerate() {
            f.write_str(if i == 0 { " " } else { ", " })?;
            if self.options.field_names {
                write!(f, "{name} = ")?;
            }
            write_value(f, value, *display, self.options)?;
        }
        f.write_str(" }")
    }
}

fn write_integer(f: &mut impl Write, value: u64, display: IntDisplay) -> fmt::Result {
    match display {
        IntDisplay::Decimal => write!(f, "{value}"),
        IntDisplay::Hex {
            upper: false,
            alternate: false,
        } => write!(f, "{value:x}"),
        IntDisplay::Hex {
            upper: false,
            alternate: true,
        } => write!(f, "{value:#x}"),
        IntDisplay::Hex {
            upper: true,
            alternate: false,
        } => write!(f, "{value:X}"),
        IntDisplay::Hex {
            upper: true,
            alternate: true,
        } => write!(f, "{value:#X}"),
        IntDisplay::Octal { alternate: false } => write!(f, "{value:o}"),
        IntDisplay::Octal { alternate: true } => write!(f, "0{value:o}"),
        IntDisplay::Char => match u8::try_from(value) {
            Ok(c) if c.is_ascii_graphic() || c == b' ' => write!(f, "'{}'", char::from(c)),
            _ => write!(f, "{value}"),
        },
    }
}

/// Write `value`. `display` only applies to top level integers.
fn write_value(
    f: &mut impl Write,
    value: &Value,
    display: IntDisplay,
    options: PrintOptions,
) -> fmt::Result {
    match value {
        Value::Signed(v) => match display {
            IntDisplay::Decimal => write!(f, "{v}"),
            // Non decimal conversions show the bit pattern.
            _ => write_integer(f, *v as u64, display),
        },
        Value::Unsigned(v) => write_integer(f, *v, display),
        Value::Pointer(v) => write!(f, "{v:#x}"),
        Value::String(s) => write!(f, "{s:?}"),
        Value::Enum { label: Some(label), .. } => f.write_str(label),
        Value::Enum { value, label: None } => write!(f, "{value}"),
        Value::Array(elements) => {
            f.write_str("{")?;
            for (i, element) in elements.iter().enumerate() {
                f.write_str(if i == 0 { " " } else { ", " })?;
                write_value(f, element, IntDisplay::Decimal, options)?;
            }
            f.write_str(" }")
        }
        Value::Struct(members) => {
            f.write_str("{")?;
            for (i, (name, member)) in members.iter().enumerate() {
                f.write_str(if i == 0 { " " } else { ", " })?;
                if options.field_names {
                    write!(f, "{name} = ")?;
                }
                write_value(f, member, IntDisplay::Decimal, options)?;
            }
            f.write_str(" }")
        }
        Value::Union { member, value } => {
            f.write_str("{ ")?;
            if options.field_names {
                write!(f, "{member} = ")?;
            }
            write_value(f, value, IntDisplay::Decimal, options)?;
            f.write_str(" }")
        }
    }
}
