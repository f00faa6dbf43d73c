//! Value formatter.
//!
//! Turns typed native values into one-line summaries and lazily expandable containers.
//! A [`Container`] is a small description of how to produce children, nothing is read
//! from the debugee until [`Formatter::children`] is called for it.

pub mod directive;
mod specialization;
pub mod string;

pub use directive::{split_directive, Directive, Radix};

use crate::debugger::backend::{
    Address, Backend, Discriminant, Field, Location, NativeType, NativeValue, TypeId, TypeKind,
    VariantCase,
};
use crate::debugger::Error;
use bytes::Bytes;
use directive::format_int;
use std::fmt::Write;
use std::sync::Arc;

/// Nested aggregates deeper than this level are summarized as `{...}`.
const PREVIEW_DEPTH: usize = 1;
/// Guard against garbage lengths of uninitialized containers.
const LEN_GUARD: u64 = 10_000;
const STRING_CHUNK: u64 = 64;
/// String length read for an unabridged summary.
const UNABRIDGED_STRING_LIMIT: usize = 64 * 1024;

#[derive(Clone, Debug)]
pub struct FormatOptions {
    /// Number of leading container elements shown in a summary.
    pub preview_len: usize,
    /// Maximum number of characters read for a string summary.
    pub string_limit: usize,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            preview_len: 10,
            string_limit: 1024,
        }
    }
}

impl FormatOptions {
    /// Options for a summary shown in full (container previews up to the length guard).
    pub fn unabridged(self) -> Self {
        Self {
            preview_len: LEN_GUARD as usize,
            string_limit: self.string_limit.max(UNABRIDGED_STRING_LIMIT),
        }
    }
}

/// Native value with a display radix.
#[derive(Clone, Debug)]
pub struct TypedValue {
    pub name: String,
    pub type_id: TypeId,
    pub location: Location,
    pub radix: Option<Radix>,
}

impl From<NativeValue> for TypedValue {
    fn from(value: NativeValue) -> Self {
        Self {
            name: value.name,
            type_id: value.type_id,
            location: value.location,
            radix: None,
        }
    }
}

impl TypedValue {
    pub fn with_radix(mut self, radix: Option<Radix>) -> Self {
        if radix.is_some() {
            self.radix = radix;
        }
        self
    }

    pub fn renamed(mut self, name: impl ToString) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn address(&self) -> Option<Address> {
        match self.location {
            Location::Memory(addr) => Some(addr),
            _ => None,
        }
    }

    fn member(&self, name: impl ToString, type_id: TypeId, offset: u64, size: u64) -> Self {
        Self {
            name: name.to_string(),
            type_id,
            location: offset_location(&self.location, offset, size),
            radix: self.radix,
        }
    }
}

fn offset_location(location: &Location, offset: u64, size: u64) -> Location {
    match location {
        Location::Memory(addr) => addr
            .checked_add(offset)
            .map_or(Location::Unavailable, Location::Memory),
        Location::Immediate(bytes) => {
            let range = offset.checked_add(size).and_then(|end| {
                let start = usize::try_from(offset).ok()?;
                let end = usize::try_from(end).ok()?;
                (end <= bytes.len()).then_some(start..end)
            });
            match range {
                Some(range) => Location::Immediate(bytes.slice(range)),
                None => Location::Unavailable,
            }
        }
        Location::Unavailable => Location::Unavailable,
    }
}

/// Description of children of an expandable value.
#[derive(Clone, Debug)]
pub enum Container {
    /// Struct or union members in declaration order.
    Fields {
        value: TypedValue,
        fields: Vec<Field>,
    },
    /// Payload of an active enum variant, tuple fields are named by position.
    Variant {
        value: TypedValue,
        fields: Vec<Field>,
    },
    /// Contiguous elements.
    Elements {
        element: TypeId,
        base: Location,
        len: u64,
        radix: Option<Radix>,
    },
    /// Ring buffer elements (`VecDeque`).
    Ring {
        element: TypeId,
        base: Address,
        head: u64,
        cap: u64,
        len: u64,
        radix: Option<Radix>,
    },
    /// Single dereferenced value.
    Deref { value: TypedValue },
    /// Hashbrown table buckets, `map` tables render key-value pairs.
    HashTable {
        element: TypeId,
        ctrl: Address,
        buckets: u64,
        items: u64,
        map: bool,
        radix: Option<Radix>,
    },
    Values(Vec<TypedValue>),
    Registers(Vec<(String, u64)>),
}

impl Container {
    pub fn len(&self) -> u64 {
        match self {
            Container::Fields { fields, .. } | Container::Variant { fields, .. } => {
                fields.len() as u64
            }
            Container::Elements { len, .. } | Container::Ring { len, .. } => (*len).min(LEN_GUARD),
            Container::Deref { .. } => 1,
            Container::HashTable { items, .. } => (*items).min(LEN_GUARD),
            Container::Values(values) => values.len() as u64,
            Container::Registers(regs) => regs.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element count before the length guard, if the guard cut it.
    fn capped_len(&self) -> Option<u64> {
        match self {
            Container::Elements { len, .. } | Container::Ring { len, .. } => Some(*len),
            Container::HashTable { items, .. } => Some(*items),
            _ => None,
        }
        .filter(|&len| len > LEN_GUARD)
    }

    /// True if children are addressed by index (arrays and sequences).
    pub fn is_indexed(&self) -> bool {
        matches!(
            self,
            Container::Elements { .. } | Container::Ring { .. } | Container::HashTable { .. }
        )
    }
}

/// Display form of a value.
#[derive(Clone, Debug)]
pub struct ValueNode {
    pub name: String,
    pub summary: String,
    pub type_name: Option<String>,
    /// `None` if value is not expandable.
    pub children: Option<Container>,
    pub memory_reference: Option<Address>,
}

impl ValueNode {
    pub fn scalar(name: impl ToString, summary: impl ToString, type_name: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            summary: summary.to_string(),
            type_name: type_name.map(ToString::to_string),
            children: None,
            memory_reference: None,
        }
    }
}

/// Primitive value, as seen by expression evaluators.
#[derive(Clone, Debug, PartialEq)]
pub enum Primitive {
    Bool(bool),
    Int(i128),
    Float(f64),
    Char(char),
    Pointer(Address),
}

pub struct Formatter<'a> {
    backend: &'a dyn Backend,
    options: &'a FormatOptions,
}

impl<'a> Formatter<'a> {
    pub fn new(backend: &'a dyn Backend, options: &'a FormatOptions) -> Self {
        Self { backend, options }
    }

    pub fn type_of(&self, id: TypeId) -> Result<Arc<NativeType>, Error> {
        self.backend.type_info(id)
    }

    fn bytes(&self, location: &Location, offset: u64, len: u64) -> Result<Bytes, Error> {
        match location {
            Location::Memory(addr) => self
                .backend
                .read_memory(addr.wrapping_add(offset), len as usize),
            Location::Immediate(bytes) => {
                let (start, end) = (offset as usize, (offset + len) as usize);
                if end <= bytes.len() {
                    Ok(bytes.slice(start..end))
                } else {
                    Err(Error::Backend("value is truncated".to_string()))
                }
            }
            Location::Unavailable => Err(Error::Backend("value is optimized out".to_string())),
        }
    }

    fn read_uint(&self, location: &Location, offset: u64, size: u64) -> Result<u64, Error> {
        let size = size.min(8);
        let bytes = self.bytes(location, offset, size)?;
        let mut buf = [0u8; 8];
        buf[..size as usize].copy_from_slice(&bytes);
        Ok(u64::from_le_bytes(buf))
    }

    fn read_int(&self, location: &Location, size: u64, signed: bool) -> Result<i128, Error> {
        let raw = self.read_uint(location, 0, size)?;
        if signed && size > 0 && size < 8 {
            let shift = 64 - size * 8;
            Ok((((raw << shift) as i64) >> shift) as i128)
        } else if signed {
            Ok(raw as i64 as i128)
        } else {
            Ok(raw as i128)
        }
    }

    fn is_mapped(&self, address: Address) -> bool {
        self.backend.read_memory(address, 1).is_ok()
    }

    /// Build a display node, errors are rendered into the summary.
    pub fn node(&self, value: &TypedValue) -> ValueNode {
        let type_name = self.type_of(value.type_id).ok().map(|t| t.name.clone());
        let (summary, children) = match self.describe(value, 0) {
            Ok(description) => description,
            Err(Error::InvalidAddress(_)) => ("<invalid address>".to_string(), None),
            Err(e) => (format!("<error: {e}>"), None),
        };

        ValueNode {
            name: value.name.clone(),
            summary,
            type_name,
            children: children.filter(|c| !c.is_empty()),
            memory_reference: value.address(),
        }
    }

    /// Build a node of a synthetic array of `len` elements (`expr,[N]` directive).
    pub fn synthetic_array(&self, value: &TypedValue, len: u64) -> Result<ValueNode, Error> {
        let ty = self.type_of(value.type_id)?;
        let (element, base) = match ty.kind {
            TypeKind::Pointer { pointee } | TypeKind::Reference { pointee } => {
                let addr = self.read_uint(&value.location, 0, ty.size)?;
                (pointee, Location::Memory(addr))
            }
            TypeKind::Array { element, .. } => (element, value.location.clone()),
            _ => (value.type_id, value.location.clone()),
        };
        let element_ty = self.type_of(element)?;
        let container = Container::Elements {
            element,
            base: base.clone(),
            len,
            radix: value.radix,
        };
        let summary = self.elements_preview(&container, 0, "[", "]")?;

        Ok(ValueNode {
            name: value.name.clone(),
            summary,
            type_name: Some(format!("{}[{len}]", element_ty.name)),
            children: Some(container).filter(|c| !c.is_empty()),
            memory_reference: match base {
                Location::Memory(addr) => Some(addr),
                _ => None,
            },
        })
    }

    /// Summary and container of a value.
    fn describe(
        &self,
        value: &TypedValue,
        depth: usize,
    ) -> Result<(String, Option<Container>), Error> {
        if value.location == Location::Unavailable {
            return Ok(("<unavailable>".to_string(), None));
        }
        let ty = self.type_of(value.type_id)?;

        if let Some(visualizer) = specialization::detect(&ty) {
            if let Some(description) = self.describe_special(visualizer, value, &ty, depth)? {
                return Ok(description);
            }
        }

        let summary = match &ty.kind {
            TypeKind::Void => "void".to_string(),
            TypeKind::Bool => {
                if let Some(radix) = value.radix {
                    let raw = self.read_uint(&value.location, 0, 1)?;
                    format_int(raw, false, 1, Some(radix))
                } else {
                    (self.read_uint(&value.location, 0, 1)? != 0).to_string()
                }
            }
            TypeKind::Int { signed } => {
                let raw = self.read_uint(&value.location, 0, ty.size)?;
                format_int(raw, *signed, ty.size, value.radix)
            }
            TypeKind::Float => match ty.size {
                4 => {
                    let raw = self.read_uint(&value.location, 0, 4)?;
                    f32::from_bits(raw as u32).to_string()
                }
                _ => f64::from_bits(self.read_uint(&value.location, 0, 8)?).to_string(),
            },
            TypeKind::Char { unicode } => {
                let raw = self.read_uint(&value.location, 0, ty.size)?;
                char_summary(raw, ty.size, *unicode, value.radix)
            }
            TypeKind::Enum { enumerators } => {
                let raw = self.read_int(&value.location, ty.size, true)?;
                match value.radix {
                    Some(radix) => format_int(raw as u64, true, ty.size, Some(radix)),
                    None => enumerators
                        .iter()
                        .find(|e| e.value as i128 == raw)
                        .map(|e| e.name.clone())
                        .unwrap_or_else(|| raw.to_string()),
                }
            }
            TypeKind::Function => match value.address() {
                Some(addr) => self
                    .backend
                    .symbol_at(addr)
                    .map(|sym| sym.display_name())
                    .unwrap_or_else(|| format!("{addr:#018x}")),
                None => "<function>".to_string(),
            },
            TypeKind::Reference { pointee } => {
                let addr = self.read_uint(&value.location, 0, ty.size)?;
                if addr == 0 {
                    return Ok(("<null>".to_string(), None));
                }
                let referent = TypedValue {
                    name: value.name.clone(),
                    type_id: *pointee,
                    location: Location::Memory(addr),
                    radix: value.radix,
                };
                return match self.describe(&referent, depth) {
                    Err(Error::InvalidAddress(_)) => Ok(("<invalid address>".to_string(), None)),
                    other => other,
                };
            }
            TypeKind::Pointer { pointee } => return self.describe_pointer(value, &ty, *pointee, depth),
            TypeKind::Array { element, len } => {
                return self.describe_array(value, *element, *len, depth)
            }
            TypeKind::Struct { fields } | TypeKind::Union { fields } => {
                let container = Container::Fields {
                    value: value.clone(),
                    fields: fields.clone(),
                };
                let summary = self.fields_preview(value, fields, depth, false)?;
                return Ok((summary, (!fields.is_empty()).then_some(container)));
            }
            TypeKind::Variant {
                discriminant,
                variants,
            } => {
                let case = self.active_variant(value, discriminant.as_ref(), variants)?;
                let Some(case) = case else {
                    return Ok(("<invalid discriminant>".to_string(), None));
                };
                if case.fields.is_empty() {
                    return Ok((case.name.clone(), None));
                }
                let tuple_like = case
                    .fields
                    .iter()
                    .all(|f| f.name.as_deref().map_or(true, |n| n.starts_with("__")));
                let payload = self.fields_preview(value, &case.fields, depth, tuple_like)?;
                let container = Container::Variant {
                    value: value.clone(),
                    fields: case.fields.clone(),
                };
                return Ok((format!("{}{payload}", case.name), Some(container)));
            }
        };

        Ok((summary, None))
    }

    fn active_variant<'v>(
        &self,
        value: &TypedValue,
        discriminant: Option<&Discriminant>,
        variants: &'v [VariantCase],
    ) -> Result<Option<&'v VariantCase>, Error> {
        let Some(discriminant) = discriminant else {
            return Ok(variants.first());
        };
        let disc = self.read_uint(&value.location, discriminant.offset, discriminant.size)?;
        Ok(variants
            .iter()
            .find(|v| v.value == Some(disc))
            .or_else(|| variants.iter().find(|v| v.value.is_none())))
    }

    fn describe_pointer(
        &self,
        value: &TypedValue,
        ty: &NativeType,
        pointee: TypeId,
        depth: usize,
    ) -> Result<(String, Option<Container>), Error> {
        let addr = self.read_uint(&value.location, 0, ty.size)?;
        if addr == 0 {
            return Ok(("<null>".to_string(), None));
        }

        let pointee_ty = self.type_of(pointee)?;
        if let TypeKind::Char { unicode: false } = pointee_ty.kind {
            if value.radix.is_none() {
                return match self.read_c_string(addr, pointee_ty.size) {
                    Ok(s) => Ok((s, None)),
                    Err(Error::InvalidAddress(_)) => Ok(("<invalid address>".to_string(), None)),
                    Err(e) => Err(e),
                };
            }
        }

        if !self.is_mapped(addr) {
            return Ok(("<invalid address>".to_string(), None));
        }

        let summary = format!("{addr:#018x}");
        let target = TypedValue {
            name: format!("*{}", value.name),
            type_id: pointee,
            location: Location::Memory(addr),
            radix: value.radix,
        };
        let container = match pointee_ty.kind {
            TypeKind::Void | TypeKind::Function => None,
            TypeKind::Struct { .. }
            | TypeKind::Union { .. }
            | TypeKind::Variant { .. }
            | TypeKind::Array { .. } => {
                // expand pointee directly, one level deref
                self.describe(&target, depth.max(PREVIEW_DEPTH))?.1
            }
            _ if specialization::detect(&pointee_ty).is_some() => {
                self.describe(&target, depth.max(PREVIEW_DEPTH))?.1
            }
            _ => Some(Container::Deref { value: target }),
        };
        Ok((summary, container))
    }

    fn describe_array(
        &self,
        value: &TypedValue,
        element: TypeId,
        len: u64,
        depth: usize,
    ) -> Result<(String, Option<Container>), Error> {
        let element_ty = self.type_of(element)?;
        let container = Container::Elements {
            element,
            base: value.location.clone(),
            len,
            radix: value.radix,
        };

        if let TypeKind::Char { unicode: false } = element_ty.kind {
            if element_ty.size == 1 && value.radix.is_none() {
                let read_len = len.min(self.options.string_limit as u64);
                let bytes = self.bytes(&value.location, 0, read_len)?;
                let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
                let truncated = end == bytes.len() && read_len < len;
                let summary = string::quote_utf8(&bytes[..end], truncated);
                return Ok((summary, (len > 0).then_some(container)));
            }
        }

        let summary = self.elements_preview(&container, depth, "[", "]")?;
        Ok((summary, (len > 0).then_some(container)))
    }

    /// `[a, b, c, ...]` style preview of leading elements.
    fn elements_preview(
        &self,
        container: &Container,
        depth: usize,
        open: &str,
        close: &str,
    ) -> Result<String, Error> {
        if depth >= PREVIEW_DEPTH {
            return Ok(format!("{open}...{close}"));
        }
        let total = container.len();
        let shown = (self.options.preview_len as u64).min(total);
        let mut out = String::from(open);
        for (i, child) in self.child_values(container, 0, shown as usize)?.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(&self.inline_summary(child, depth + 1));
        }
        if shown < total {
            out.push_str(if shown > 0 { ", ..." } else { "..." });
        }
        out.push_str(close);
        if let Some(len) = container.capped_len() {
            _ = write!(out, " (first {total} of {len})");
        }
        Ok(out)
    }

    /// `{x:1, y:2}` style preview of members.
    fn fields_preview(
        &self,
        value: &TypedValue,
        fields: &[Field],
        depth: usize,
        tuple_like: bool,
    ) -> Result<String, Error> {
        let (open, close) = if tuple_like { ("(", ")") } else { ("{", "}") };
        if depth >= PREVIEW_DEPTH {
            return Ok(format!("{open}...{close}"));
        }

        let mut out = String::from(open);
        for (i, field) in fields.iter().enumerate() {
            if out.len() > self.options.string_limit {
                out.push_str("...");
                break;
            }
            if i > 0 {
                out.push_str(", ");
            }
            let child = self.field_value(value, field)?;
            if !tuple_like {
                if let Some(name) = field.name.as_deref() {
                    _ = write!(out, "{name}:");
                }
            }
            out.push_str(&self.inline_summary(&child, depth + 1));
        }
        out.push_str(close);
        Ok(out)
    }

    fn inline_summary(&self, value: &TypedValue, depth: usize) -> String {
        match self.describe(value, depth) {
            Ok((summary, _)) => summary,
            Err(Error::InvalidAddress(_)) => "<invalid address>".to_string(),
            Err(_) => "<error>".to_string(),
        }
    }

    fn field_value(&self, value: &TypedValue, field: &Field) -> Result<TypedValue, Error> {
        let field_ty = self.type_of(field.type_id)?;
        Ok(value.member(
            field.name.clone().unwrap_or_default(),
            field.type_id,
            field.offset,
            field_ty.size,
        ))
    }

    fn element_value(
        &self,
        element: TypeId,
        base: &Location,
        index: u64,
        radix: Option<Radix>,
    ) -> Result<TypedValue, Error> {
        let size = self.type_of(element)?.size;
        let offset = index.checked_mul(size).ok_or(Error::IndexOutOfBounds {
            index,
            len: u64::MAX / size.max(1),
        })?;
        if let Location::Memory(addr) = base {
            addr.checked_add(offset).ok_or(Error::InvalidAddress(*addr))?;
        }
        Ok(TypedValue {
            name: format!("[{index}]"),
            type_id: element,
            location: offset_location(base, offset, size),
            radix,
        })
    }

    /// Materialize child values of a container, `count` is bounded by container length.
    fn child_values(
        &self,
        container: &Container,
        start: usize,
        count: usize,
    ) -> Result<Vec<TypedValue>, Error> {
        let total = container.len() as usize;
        let range = start.min(total)..(start.saturating_add(count)).min(total);

        match container {
            Container::Fields { value, fields } => fields[range]
                .iter()
                .map(|f| self.field_value(value, f))
                .collect(),
            Container::Variant { value, fields } => fields[range]
                .iter()
                .map(|f| {
                    let child = self.field_value(value, f)?;
                    let name = child.name.trim_start_matches("__").to_string();
                    Ok(child.renamed(name))
                })
                .collect(),
            Container::Elements {
                element,
                base,
                radix,
                ..
            } => range
                .map(|i| self.element_value(*element, base, i as u64, *radix))
                .collect(),
            Container::Ring {
                element,
                base,
                head,
                cap,
                radix,
                ..
            } => range
                .map(|i| {
                    let physical = if *cap == 0 { 0 } else { (head + i as u64) % cap };
                    let value =
                        self.element_value(*element, &Location::Memory(*base), physical, *radix)?;
                    Ok(value.renamed(format!("[{i}]")))
                })
                .collect(),
            Container::Deref { value } => Ok(if range.is_empty() {
                vec![]
            } else {
                vec![value.clone()]
            }),
            Container::HashTable {
                element,
                ctrl,
                buckets,
                map,
                radix,
                ..
            } => {
                let entries = self.hash_table_entries(*element, *ctrl, *buckets, *map, *radix)?;
                Ok(entries.into_iter().skip(range.start).take(range.len()).collect())
            }
            Container::Values(values) => Ok(values[range].to_vec()),
            Container::Registers(_) => Ok(vec![]),
        }
    }

    /// Child value with a display name `name`.
    pub fn child(&self, container: &Container, name: &str) -> Result<Option<TypedValue>, Error> {
        Ok(self
            .child_values(container, 0, usize::MAX)?
            .into_iter()
            .find(|child| child.name == name))
    }

    /// Expand a container, `count` of `None` means all remaining children.
    pub fn children(
        &self,
        container: &Container,
        start: usize,
        count: Option<usize>,
    ) -> Result<Vec<ValueNode>, Error> {
        let count = count.filter(|c| *c > 0).unwrap_or(usize::MAX);
        if let Container::Registers(regs) = container {
            return Ok(regs
                .iter()
                .skip(start)
                .take(count)
                .map(|(name, value)| {
                    ValueNode::scalar(name, format!("{value:#018x}"), Some("unsigned long"))
                })
                .collect());
        }

        Ok(self
            .child_values(container, start, count)?
            .iter()
            .map(|child| self.node(child))
            .collect())
    }

    // --------------------------------- navigation ------------------------------------------------

    /// Value of a member `name`, references, pointers and transparent wrappers are followed.
    pub fn member(&self, value: &TypedValue, name: &str) -> Result<TypedValue, Error> {
        let value = self.auto_deref(value)?;
        let ty = self.type_of(value.type_id)?;

        let fields = match &ty.kind {
            TypeKind::Struct { fields } | TypeKind::Union { fields } => fields.clone(),
            TypeKind::Variant {
                discriminant,
                variants,
            } => self
                .active_variant(&value, discriminant.as_ref(), variants)?
                .map(|case| case.fields.clone())
                .unwrap_or_default(),
            _ => vec![],
        };

        let positional = format!("__{name}");
        let field = fields
            .iter()
            .find(|f| f.name.as_deref() == Some(name))
            .or_else(|| fields.iter().find(|f| f.name.as_deref() == Some(&positional)));
        if let Some(field) = field {
            return self.field_value(&value, field).map(|v| v.renamed(name));
        }

        // members of anonymous unions and structs
        for field in fields.iter().filter(|f| f.name.is_none()) {
            let anonymous = self.field_value(&value, field)?;
            if let Ok(found) = self.member(&anonymous, name) {
                return Ok(found);
            }
        }

        Err(Error::FieldNotFound {
            field: name.to_string(),
            type_name: ty.name.clone(),
        })
    }

    /// Element `index` of an array, pointer or sequence container.
    pub fn index(&self, value: &TypedValue, index: u64) -> Result<TypedValue, Error> {
        let value = self.strip_wrappers(value)?;
        let ty = self.type_of(value.type_id)?;

        if let Some(container) = self.sequence(&value, &ty)? {
            let len = container.len();
            if index >= len {
                return Err(Error::IndexOutOfBounds { index, len });
            }
            let mut children = self.child_values(&container, index as usize, 1)?;
            return children
                .pop()
                .ok_or(Error::IndexOutOfBounds { index, len });
        }

        match ty.kind {
            TypeKind::Pointer { pointee } => {
                let addr = self.read_uint(&value.location, 0, ty.size)?;
                self.element_value(pointee, &Location::Memory(addr), index, value.radix)
            }
            _ => Err(Error::NotIndexable(ty.name.clone())),
        }
    }

    /// Dereference a pointer, reference or smart pointer.
    pub fn deref(&self, value: &TypedValue) -> Result<TypedValue, Error> {
        let ty = self.type_of(value.type_id)?;
        match ty.kind {
            TypeKind::Pointer { pointee } | TypeKind::Reference { pointee } => {
                let addr = self.read_uint(&value.location, 0, ty.size)?;
                if addr == 0 {
                    return Err(Error::InvalidAddress(0));
                }
                Ok(TypedValue {
                    name: format!("*{}", value.name),
                    type_id: pointee,
                    location: Location::Memory(addr),
                    radix: value.radix,
                })
            }
            _ => match self.transparent_inner(value, &ty)? {
                Some(inner) => Ok(inner),
                None => Err(Error::NotAPointer(ty.name.clone())),
            },
        }
    }

    /// Follow references and pointers (one level each) and transparent wrappers.
    fn auto_deref(&self, value: &TypedValue) -> Result<TypedValue, Error> {
        let value = self.strip_wrappers(value)?;
        let ty = self.type_of(value.type_id)?;
        match ty.kind {
            TypeKind::Pointer { .. } => self.strip_wrappers(&self.deref(&value)?),
            _ => Ok(value),
        }
    }

    /// Follow references and transparent wrappers (`Rc`, `RefCell`, ...).
    fn strip_wrappers(&self, value: &TypedValue) -> Result<TypedValue, Error> {
        let mut current = value.clone();
        // bounded, wrappers may nest (Rc<RefCell<T>>)
        for _ in 0..8 {
            let ty = self.type_of(current.type_id)?;
            let next = match ty.kind {
                TypeKind::Reference { .. } => Some(self.deref(&current)?),
                _ => self.transparent_inner(&current, &ty)?,
            };
            match next {
                Some(next) => current = next.renamed(&value.name),
                None => break,
            }
        }
        Ok(current)
    }

    /// Read a primitive value, `None` for aggregates.
    pub fn primitive(&self, value: &TypedValue) -> Result<Option<Primitive>, Error> {
        let value = self.strip_wrappers(value)?;
        let ty = self.type_of(value.type_id)?;
        let primitive = match ty.kind {
            TypeKind::Bool => Primitive::Bool(self.read_uint(&value.location, 0, 1)? != 0),
            TypeKind::Int { signed } => {
                Primitive::Int(self.read_int(&value.location, ty.size, signed)?)
            }
            TypeKind::Enum { .. } => Primitive::Int(self.read_int(&value.location, ty.size, true)?),
            TypeKind::Float => match ty.size {
                4 => Primitive::Float(f32::from_bits(self.read_uint(&value.location, 0, 4)? as u32) as f64),
                _ => Primitive::Float(f64::from_bits(self.read_uint(&value.location, 0, 8)?)),
            },
            TypeKind::Char { .. } => {
                let raw = self.read_uint(&value.location, 0, ty.size)?;
                Primitive::Char(char::from_u32(raw as u32).unwrap_or(char::REPLACEMENT_CHARACTER))
            }
            TypeKind::Pointer { .. } | TypeKind::Function => {
                Primitive::Pointer(self.read_uint(&value.location, 0, ty.size)?)
            }
            _ => return Ok(None),
        };
        Ok(Some(primitive))
    }

    /// Read string content of a value if it is a string-like value (`String`, `&str`, `char*`, `char[N]`).
    pub fn string(&self, value: &TypedValue) -> Result<Option<String>, Error> {
        let value = self.strip_wrappers(value)?;
        let ty = self.type_of(value.type_id)?;
        if let Some(bytes) = self.rust_string_bytes(&value, &ty)? {
            return Ok(Some(String::from_utf8_lossy(&bytes).to_string()));
        }
        match ty.kind {
            TypeKind::Pointer { pointee } => {
                let pointee_ty = self.type_of(pointee)?;
                if !matches!(pointee_ty.kind, TypeKind::Char { unicode: false }) || pointee_ty.size != 1 {
                    return Ok(None);
                }
                let addr = self.read_uint(&value.location, 0, ty.size)?;
                let (bytes, _) = self.read_units(addr, 1)?;
                let bytes: Vec<u8> = bytes.into_iter().map(|b| b as u8).collect();
                Ok(Some(String::from_utf8_lossy(&bytes).to_string()))
            }
            TypeKind::Array { element, len } => {
                let element_ty = self.type_of(element)?;
                if !matches!(element_ty.kind, TypeKind::Char { unicode: false }) || element_ty.size != 1 {
                    return Ok(None);
                }
                let bytes = self.bytes(&value.location, 0, len)?;
                let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
                Ok(Some(String::from_utf8_lossy(&bytes[..end]).to_string()))
            }
            _ => Ok(None),
        }
    }

    /// Write a new value parsed from `text`.
    pub fn assign(&self, value: &TypedValue, text: &str) -> Result<(), Error> {
        let value = self.strip_wrappers(value)?;
        let ty = self.type_of(value.type_id)?;
        let address = value
            .address()
            .ok_or_else(|| Error::NotAssignable(value.name.clone()))?;
        let text = text.trim();
        let not_assignable = || Error::NotAssignable(text.to_string());

        let data: Vec<u8> = match &ty.kind {
            TypeKind::Bool => match text {
                "true" => vec![1],
                "false" => vec![0],
                _ => return Err(not_assignable()),
            },
            TypeKind::Int { .. } | TypeKind::Pointer { .. } | TypeKind::Char { .. } => {
                let number = parse_int_literal(text)
                    .or_else(|| {
                        let inner = text.strip_prefix('\'')?.strip_suffix('\'')?;
                        let mut chars = inner.chars();
                        let c = chars.next()?;
                        chars.next().is_none().then_some(c as u32 as i128)
                    })
                    .ok_or_else(not_assignable)?;
                number.to_le_bytes()[..ty.size as usize].to_vec()
            }
            TypeKind::Enum { enumerators } => {
                let number = enumerators
                    .iter()
                    .find(|e| e.name == text)
                    .map(|e| e.value as i128)
                    .or_else(|| parse_int_literal(text))
                    .ok_or_else(not_assignable)?;
                number.to_le_bytes()[..ty.size as usize].to_vec()
            }
            TypeKind::Float => {
                let number: f64 = text.parse().map_err(|_| not_assignable())?;
                if ty.size == 4 {
                    (number as f32).to_le_bytes().to_vec()
                } else {
                    number.to_le_bytes().to_vec()
                }
            }
            _ => return Err(Error::NotAssignable(value.name.clone())),
        };

        self.backend.write_memory(address, &data)
    }

    /// Read NUL terminated code units at `address`, return units and truncation flag.
    fn read_units(&self, address: Address, unit_size: u64) -> Result<(Vec<u32>, bool), Error> {
        let unit_size = unit_size.clamp(1, 4);
        let limit = self.options.string_limit as u64;
        let mut units = vec![];
        let mut chunk_units = STRING_CHUNK;
        let mut cursor = address;

        loop {
            if units.len() as u64 >= limit {
                return Ok((units, true));
            }
            let want = chunk_units.min(limit - units.len() as u64);
            let bytes = match self.backend.read_memory(cursor, (want * unit_size) as usize) {
                Ok(bytes) => bytes,
                Err(e) => {
                    if cursor == address && chunk_units == 1 {
                        return Err(e);
                    }
                    if chunk_units == 1 {
                        // end of mapped memory
                        return Ok((units, true));
                    }
                    // chunk crosses a mapping boundary, continue unit by unit
                    chunk_units = 1;
                    continue;
                }
            };

            for unit in bytes.chunks_exact(unit_size as usize) {
                let mut buf = [0u8; 4];
                buf[..unit.len()].copy_from_slice(unit);
                let unit = u32::from_le_bytes(buf);
                if unit == 0 {
                    return Ok((units, false));
                }
                units.push(unit);
            }
            cursor += want * unit_size;
        }
    }

    fn read_c_string(&self, address: Address, unit_size: u64) -> Result<String, Error> {
        let (units, truncated) = self.read_units(address, unit_size)?;
        Ok(match unit_size {
            1 => {
                let bytes: Vec<u8> = units.into_iter().map(|u| u as u8).collect();
                string::quote_utf8(&bytes, truncated)
            }
            2 => {
                let units: Vec<u16> = units.into_iter().map(|u| u as u16).collect();
                string::quote_utf16(&units, truncated)
            }
            _ => string::quote_utf32(&units, truncated),
        })
    }
}

fn char_summary(raw: u64, size: u64, unicode: bool, radix: Option<Radix>) -> String {
    if radix.is_some() {
        return format_int(raw, !unicode && size == 1, size, radix);
    }
    match (unicode, size) {
        (false, 1) => {
            let byte = raw as u8;
            if byte.is_ascii() {
                string::quote_char(byte as char)
            } else {
                format!("'\\x{byte:02x}'")
            }
        }
        _ => match char::from_u32(raw as u32) {
            Some(c) => string::quote_char(c),
            None => format!("'\\u{{{raw:04x}}}'"),
        },
    }
}

/// Parse decimal, `0x` hex, `0o` octal or `0b` binary integer, optionally negative.
pub fn parse_int_literal(text: &str) -> Option<i128> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let digits = digits.replace('_', "");
    let number = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        i128::from_str_radix(hex, 16).ok()?
    } else if let Some(oct) = digits.strip_prefix("0o") {
        i128::from_str_radix(oct, 8).ok()?
    } else if let Some(bin) = digits.strip_prefix("0b") {
        i128::from_str_radix(bin, 2).ok()?
    } else {
        digits.parse::<i128>().ok()?
    };
    Some(if negative { -number } else { number })
}
