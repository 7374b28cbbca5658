//! Parser for marker format strings.
//!
//! A format looks like a printf format with each conversion preceded by the
//! name of the argument, e.g. `"pid %d comm %s"`. A trace type (`#...`)
//! placed before a conversion overrides how the argument was stored:
//! `"ip #p%lx"`, `"port #n2u%hu"`, `"state #b3%u"`, `"task #{task_info}%p"`.

use super::MarkerError;
use super::field::FieldAttributes;
use super::field::FieldType;
use super::field::IntDisplay;
use super::field::MarkerField;
use super::typedecl::TypeDecl;
use crate::types::ArchWidths;
use crate::types::align_padding;
use compact_str::CompactString;
use compact_str::format_compact;
use std::collections::HashMap;

/// Fields and layout summary derived from a format string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFormat {
    pub fields: Vec<MarkerField>,
    /// Total payload size if every field has a static size.
    pub size: Option<usize>,
    /// Largest natural alignment of any field (at least 1).
    pub largest_align: usize,
}

/// Storage decided by a `#` trace type.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TraceType {
    Scalar(Scalar),
    Compact(u8),
    Named(FieldType),
}

/// Scalar kind plus size, as produced by either part of a conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scalar {
    Signed(u8),
    Unsigned(u8),
    Pointer(u8),
    String,
}

impl Scalar {
    fn into_field_type(self) -> FieldType {
        match self {
            Self::Signed(size) => FieldType::SignedInt { size },
            Self::Unsigned(size) => FieldType::UnsignedInt { size },
            Self::Pointer(size) => FieldType::Pointer { size },
            Self::String => FieldType::String,
        }
    }
}

struct FormatParser<'a> {
    marker: &'a str,
    format: &'a str,
    pos: usize,
    widths: &'a ArchWidths,
    types: &'a HashMap<CompactString, TypeDecl>,
}

/// Parse `format` for marker `marker` (used in errors only).
pub fn parse_format(
    marker: &str,
    format: &str,
    widths: &ArchWidths,
    types: &HashMap<CompactString, TypeDecl>,
) -> Result<ParsedFormat, MarkerError> {
    let mut parser = FormatParser {
        marker,
        format,
        pos: 0,
        widths,
        types,
    };
    parser.parse()
}

impl FormatParser<'_> {
    fn error(&self, message: impl Into<String>) -> MarkerError {
        MarkerError::FormatParse {
            marker: self.marker.into(),
            message: format!("{} (at offset {} of {:?})", message.into(), self.pos, self.format),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.format.as_bytes().get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    /// Integer size for a printf qualifier.
    fn qualifier_size(&self, qualifier: Option<u8>) -> u8 {
        match qualifier {
            Some(b'L') => 8,
            Some(b'l') => self.widths.long_size,
            Some(b'z' | b'Z') => self.widths.size_t_size,
            Some(b't') => self.widths.pointer_size,
            Some(b'h') => 2,
            Some(b'1') => 1,
            Some(b'2') => 2,
            Some(b'4') => 4,
            Some(b'8') => 8,
            _ => self.widths.int_size,
        }
    }

    fn qualifier(&mut self, allowed: &[u8]) -> Option<u8> {
        let c = self.peek().filter(|c| allowed.contains(c))?;
        self.pos += 1;
        if c == b'l' && self.peek() == Some(b'l') {
            self.pos += 1;
            return Some(b'L');
        }
        Some(c)
    }

    fn conversion(&mut self, qualifier: Option<u8>) -> Result<(Scalar, u8), MarkerError> {
        let conversion = self
            .bump()
            .ok_or_else(|| self.error("Format ends inside a conversion"))?;
        let scalar = match conversion {
            b'c' => Scalar::Unsigned(1),
            b's' => Scalar::String,
            b'p' => Scalar::Pointer(self.widths.pointer_size),
            b'd' | b'i' => Scalar::Signed(self.qualifier_size(qualifier)),
            b'o' | b'u' | b'x' | b'X' => Scalar::Unsigned(self.qualifier_size(qualifier)),
            other => {
                self.pos -= 1;
                return Err(self.error(format!("Unknown conversion {:?}", char::from(other))));
            }
        };
        Ok((scalar, conversion))
    }

    /// Parse what follows a `#`.
    fn trace_type(&mut self) -> Result<(TraceType, FieldAttributes), MarkerError> {
        let mut attributes = FieldAttributes::default();
        while self.peek() == Some(b'n') {
            attributes.network_byte_order = true;
            self.pos += 1;
        }
        match self.peek() {
            Some(b'b') => {
                self.pos += 1;
                let start = self.pos;
                while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    self.pos += 1;
                }
                let bits: u8 = self.format[start..self.pos]
                    .parse()
                    .map_err(|_| self.error("Expected a bit count after #b"))?;
                if bits == 0 || bits > 32 {
                    return Err(self.error(format!("Invalid compact bit count {bits}")));
                }
                return Ok((TraceType::Compact(bits), attributes));
            }
            Some(b'{') => {
                self.pos += 1;
                let format = self.format;
                let rest = &format[self.pos..];
                let len = rest
                    .find('}')
                    .ok_or_else(|| self.error("Unterminated type name"))?;
                let name = rest[..len].trim();
                self.pos += len + 1;
                let decl = self
                    .types
                    .get(name)
                    .ok_or_else(|| MarkerError::UndefinedType(name.into()))?;
                return Ok((TraceType::Named(decl.resolve(self.widths)), attributes));
            }
            _ => {}
        }
        let qualifier = self.qualifier(b"hlLzZt1248");
        let (scalar, _) = self.conversion(qualifier)?;
        Ok((TraceType::Scalar(scalar), attributes))
    }

    /// Parse what follows a `%`.
    fn c_type(&mut self) -> Result<(Scalar, IntDisplay), MarkerError> {
        let mut alternate = false;
        while let Some(c) = self.peek() {
            match c {
                b'#' => alternate = true,
                b'-' | b'+' | b' ' | b'0' => {}
                _ => break,
            }
            self.pos += 1;
        }
        // Width and precision do not change the stored size.
        while self.peek().is_some_and(|c| c.is_ascii_digit() || c == b'.') {
            self.pos += 1;
        }
        let qualifier = self.qualifier(b"hlLzZtS");
        let (scalar, conversion) = self.conversion(qualifier)?;
        let display = match conversion {
            b'x' => IntDisplay::Hex {
                upper: false,
                alternate,
            },
            b'X' => IntDisplay::Hex {
                upper: true,
                alternate,
            },
            b'p' => IntDisplay::Hex {
                upper: false,
                alternate: true,
            },
            b'o' => IntDisplay::Octal { alternate },
            b'c' => IntDisplay::Char,
            _ => IntDisplay::Decimal,
        };
        Ok((scalar, display))
    }

    fn parse(&mut self) -> Result<ParsedFormat, MarkerError> {
        let format = self.format;
        let mut fields: Vec<MarkerField> = Vec::new();
        let mut offset = Some(0usize);
        let mut largest_align = 1;
        let mut pending: Option<(TraceType, FieldAttributes)> = None;
        // First word of the text before a conversion names the field.
        let mut name_begin: Option<usize> = Some(0);
        let mut name: Option<&str> = None;

        while let Some(c) = self.peek() {
            match c {
                b'#' => {
                    self.pos += 1;
                    if self.peek() == Some(b'#') {
                        self.pos += 1;
                        continue;
                    }
                    pending = Some(self.trace_type()?);
                }
                b'%' => {
                    self.pos += 1;
                    if self.peek() == Some(b'%') {
                        self.pos += 1;
                        continue;
                    }
                    let (c_scalar, display) = self.c_type()?;
                    let (ty, attributes) = match pending.take() {
                        Some((TraceType::Scalar(scalar), attributes)) => {
                            // A string conversion always wins.
                            let scalar = if c_scalar == Scalar::String {
                                c_scalar
                            } else {
                                scalar
                            };
                            (scalar.into_field_type(), attributes)
                        }
                        Some((TraceType::Compact(bits), attributes)) => {
                            if !fields.is_empty() {
                                return Err(self.error("Compact field must be the first field"));
                            }
                            (FieldType::Compact { bits }, attributes)
                        }
                        Some((TraceType::Named(ty), attributes)) => (ty, attributes),
                        None => (c_scalar.into_field_type(), FieldAttributes::default()),
                    };
                    let index = fields.len();
                    let name = match name.take() {
                        Some(name) => CompactString::from(name),
                        None => format_compact!("field {}", index + 1),
                    };
                    let alignment = ty.natural_alignment();
                    largest_align = largest_align.max(alignment);
                    let static_offset = match ty {
                        FieldType::Compact { .. } => offset,
                        _ => offset.map(|o| {
                            o + align_padding(o, alignment, usize::from(self.widths.alignment))
                        }),
                    };
                    offset = static_offset.and_then(|o| {
                        Some(o + ty.static_size(usize::from(self.widths.alignment))?)
                    });
                    fields.push(MarkerField {
                        name,
                        ty,
                        index,
                        alignment,
                        attributes,
                        static_offset,
                        display,
                    });
                    name_begin = None;
                }
                b' ' => {
                    if let Some(begin) = name_begin
                        && name.is_none()
                    {
                        name = Some(&format[begin..self.pos]);
                    }
                    self.pos += 1;
                }
                _ => {
                    if name_begin.is_none() {
                        name_begin = Some(self.pos);
                        name = None;
                    }
                    self.pos += 1;
                }
            }
        }
        if pending.is_some() {
            return Err(self.error("Trace type without a conversion"));
        }
        Ok(ParsedFormat {
            fields,
            size: offset,
            largest_align,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(format: &str) -> ParsedFormat {
        parse_format("test", format, &ArchWidths::LP64, &HashMap::new()).unwrap()
    }

    fn summary(parsed: &ParsedFormat) -> Vec<(String, String, Option<usize>)> {
        parsed
            .fields
            .iter()
            .map(|f| (f.name.to_string(), f.ty.describe().to_string(), f.static_offset))
            .collect()
    }

    #[test]
    fn test_simple_format() {
        let parsed = parse("prev_pid %d next_pid %d prev_state %ld");
        insta::assert_debug_snapshot!(summary(&parsed), @r#"
        [
            (
                "prev_pid",
                "s32",
                Some(
                    0,
                ),
            ),
            (
                "next_pid",
                "s32",
                Some(
                    4,
                ),
            ),
            (
                "prev_state",
                "s64",
                Some(
                    8,
                ),
            ),
        ]
        "#);
        assert_eq!(parsed.size, Some(16));
        assert_eq!(parsed.largest_align, 8);
    }

    #[test]
    fn test_string_makes_rest_dynamic() {
        let parsed = parse("a %u s %s b %u");
        assert_eq!(parsed.fields[1].static_offset, Some(4));
        assert_eq!(parsed.fields[2].static_offset, None);
        assert_eq!(parsed.size, None);
    }

    #[test]
    fn test_trace_types() {
        let parsed = parse("event_id #2u%u int #1u%u port #n2u%hu ip #p%lx");
        assert_eq!(parsed.fields[0].ty, FieldType::UnsignedInt { size: 2 });
        assert_eq!(parsed.fields[1].ty, FieldType::UnsignedInt { size: 1 });
        assert_eq!(parsed.fields[1].static_offset, Some(2));
        assert!(parsed.fields[2].attributes.network_byte_order);
        assert_eq!(parsed.fields[2].static_offset, Some(4));
        assert_eq!(parsed.fields[3].ty, FieldType::Pointer { size: 8 });
        assert_eq!(parsed.fields[3].static_offset, Some(8));
        assert_eq!(
            parsed.fields[3].display,
            IntDisplay::Hex {
                upper: false,
                alternate: false
            }
        );
    }

    #[test]
    fn test_unnamed_and_escapes() {
        let parsed = parse("%d %% %#x ## %c");
        let names: Vec<_> = parsed.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["field 1", "field 2", "field 3"]);
        assert_eq!(
            parsed.fields[1].display,
            IntDisplay::Hex {
                upper: false,
                alternate: true
            }
        );
        assert_eq!(parsed.fields[2].display, IntDisplay::Char);
    }

    #[test]
    fn test_packed_layout() {
        let widths = ArchWidths {
            alignment: 0,
            ..ArchWidths::LP64
        };
        let parsed = parse_format("test", "a %c b %lu", &widths, &HashMap::new()).unwrap();
        assert_eq!(parsed.fields[1].static_offset, Some(1));
        assert_eq!(parsed.size, Some(9));
    }

    #[test]
    fn test_compact_first_only() {
        let parsed = parse("state #b3%u pid %d");
        assert_eq!(parsed.fields[0].ty, FieldType::Compact { bits: 3 });
        assert_eq!(parsed.fields[1].static_offset, Some(0));
        assert_eq!(parsed.size, Some(4));

        let err = parse_format("test", "pid %d state #b3%u", &ArchWidths::LP64, &HashMap::new());
        assert!(matches!(err, Err(MarkerError::FormatParse { .. })));
    }

    #[test]
    fn test_named_type() {
        let mut types = HashMap::new();
        types.insert(
            CompactString::from("pair"),
            TypeDecl::parse("struct { a: u16; b: u64; }", &HashMap::new()).unwrap(),
        );
        let parsed =
            parse_format("test", "x %c p #{pair}%p", &ArchWidths::LP64, &types).unwrap();
        assert_eq!(parsed.fields[1].static_offset, Some(8));
        assert_eq!(parsed.size, Some(24));

        let err = parse_format("test", "p #{nope}%p", &ArchWidths::LP64, &types);
        assert_eq!(err, Err(MarkerError::UndefinedType("nope".into())));
    }

    #[test]
    fn test_bad_conversion() {
        let err = parse_format("test", "a %q", &ArchWidths::LP64, &HashMap::new());
        assert!(matches!(err, Err(MarkerError::FormatParse { .. })));
    }
}
