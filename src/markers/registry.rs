//! Per channel table of marker descriptions, built from the metadata
//! stream.

use super::MarkerError;
use super::field::FieldType;
use super::field::MarkerField;
use super::format::ParsedFormat;
use super::format::parse_format;
use super::typedecl::TypeDecl;
use crate::types::ArchWidths;
use compact_str::CompactString;
use std::collections::HashMap;

/// Everything known about one marker id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerInfo {
    pub id: u16,
    pub channel: CompactString,
    pub name: CompactString,
    pub format: Option<String>,
    pub fields: Vec<MarkerField>,
    /// Payload size when it does not depend on the data.
    pub size: Option<usize>,
    pub largest_align: usize,
    /// Producer widths captured when the id was registered.
    pub widths: ArchWidths,
    /// Previous generation of the same name.
    pub next: Option<u16>,
}

impl MarkerInfo {
    fn new(channel: &str, name: &str, id: u16, widths: ArchWidths) -> Self {
        Self {
            id,
            channel: channel.into(),
            name: name.into(),
            format: None,
            fields: Vec::new(),
            size: Some(0),
            largest_align: 1,
            widths,
            next: None,
        }
    }

    fn apply_format(
        &mut self,
        format: &str,
        types: &HashMap<CompactString, TypeDecl>,
    ) -> Result<(), MarkerError> {
        let parsed = parse_format(&self.name, format, &self.widths, types)?;
        self.set_format(format, parsed);
        Ok(())
    }

    fn set_format(&mut self, format: &str, parsed: ParsedFormat) {
        let ParsedFormat {
            fields,
            size,
            largest_align,
        } = parsed;
        self.format = Some(format.to_owned());
        self.fields = fields;
        self.size = size;
        self.largest_align = largest_align;
    }

    pub fn has_format(&self) -> bool {
        self.format.is_some()
    }

    pub fn field(&self, name: &str) -> Option<&MarkerField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Compact field carried in the event header, if any.
    pub fn compact_bits(&self) -> Option<u8> {
        match self.fields.first()?.ty {
            FieldType::Compact { bits } => Some(bits),
            _ => None,
        }
    }
}

/// Marker descriptions of one channel.
#[derive(Debug, Clone, Default)]
pub struct MarkerRegistry {
    channel: CompactString,
    markers: Vec<Option<MarkerInfo>>,
    /// Name to the id of the newest generation.
    by_name: HashMap<CompactString, u16>,
    formats: HashMap<CompactString, String>,
    types: HashMap<CompactString, TypeDecl>,
}

impl MarkerRegistry {
    pub fn new(channel: &str) -> Self {
        Self {
            channel: channel.into(),
            ..Default::default()
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Bind `name` to `id`, with the producer widths in effect for it.
    pub fn register_id(
        &mut self,
        name: &str,
        id: u16,
        widths: ArchWidths,
    ) -> Result<(), MarkerError> {
        let slot = usize::from(id);
        if let Some(Some(existing)) = self.markers.get(slot) {
            if existing.name == name {
                return Ok(());
            }
            return Err(MarkerError::IdCollision {
                id,
                existing: existing.name.clone(),
                name: name.into(),
            });
        }
        log::debug!("Registering marker {}.{name} as id {id}", self.channel);

        let mut info = MarkerInfo::new(&self.channel, name, id, widths);
        if let Some(format) = self.formats.get(name) {
            info.apply_format(format, &self.types)?;
        }
        info.next = self.by_name.get(name).copied();
        if self.markers.len() <= slot {
            self.markers.resize(slot + 1, None);
        }
        self.markers[slot] = Some(info);
        self.by_name.insert(name.into(), id);
        Ok(())
    }

    /// Attach `format` to `name` and re-derive the fields of every
    /// generation.
    pub fn register_format(&mut self, name: &str, format: &str) -> Result<(), MarkerError> {
        let previous = self.formats.get(name);
        if previous.is_some_and(|previous| previous == format) {
            return Ok(());
        }

        // Nothing changes unless the format parses for every generation.
        let mut parsed = Vec::new();
        let mut cursor = self.by_name.get(name).copied();
        while let Some(id) = cursor {
            let Some(info) = self.get(id) else {
                break;
            };
            parsed.push((id, parse_format(name, format, &info.widths, &self.types)?));
            cursor = info.next;
        }
        if parsed.is_empty() {
            // No producer widths yet, check the syntax alone.
            parse_format(name, format, &ArchWidths::LP64, &self.types)?;
        }

        match previous {
            Some(previous) => log::warn!(
                "Marker {}.{name} changes format from {previous:?} to {format:?}",
                self.channel
            ),
            None => log::debug!("Format of marker {}.{name}: {format:?}", self.channel),
        }
        self.formats.insert(name.into(), format.to_owned());
        for (id, parsed) in parsed {
            if let Some(Some(info)) = self.markers.get_mut(usize::from(id)) {
                info.set_format(format, parsed);
            }
        }
        Ok(())
    }

    /// Define a named type usable from formats as `#{name}`.
    pub fn define_type(&mut self, name: &str, declaration: &str) -> Result<(), MarkerError> {
        let decl = TypeDecl::parse(declaration, &self.types)?;
        log::debug!("Type {}.{name} = {declaration}", self.channel);
        if let Some(previous) = self.types.insert(name.into(), decl.clone())
            && previous != decl
        {
            log::warn!("Type {}.{name} redefined", self.channel);
        }
        Ok(())
    }

    pub fn get(&self, id: u16) -> Option<&MarkerInfo> {
        self.markers.get(usize::from(id))?.as_ref()
    }

    /// Newest generation of `name`.
    pub fn get_by_name(&self, name: &str) -> Option<&MarkerInfo> {
        self.get(*self.by_name.get(name)?)
    }

    /// Every generation of `name`, newest first.
    pub fn generations<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a MarkerInfo> + 'a {
        let mut cursor = self.by_name.get(name).copied();
        std::iter::from_fn(move || {
            let info = self.get(cursor?)?;
            cursor = info.next;
            Some(info)
        })
    }

    pub fn format(&self, name: &str) -> Option<&str> {
        self.formats.get(name).map(String::as_str)
    }

    pub fn type_decl(&self, name: &str) -> Option<&TypeDecl> {
        self.types.get(name)
    }

    /// All registered markers in id order.
    pub fn iter(&self) -> impl Iterator<Item = &MarkerInfo> {
        self.markers.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}
