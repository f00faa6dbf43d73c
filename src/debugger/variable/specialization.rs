//! Visualizers of rust standard library types.
//!
//! Layouts of std types are not stable, so members are searched by name with a breadth-first
//! walk over nested structures instead of fixed paths. If a layout is not recognized a value
//! is rendered as a plain structure.

use super::{Container, Formatter, Radix, TypedValue, LEN_GUARD};
use crate::debugger::backend::{Address, Language, Location, NativeType, TypeId, TypeKind};
use crate::debugger::variable::string;
use crate::debugger::Error;
use regex::Regex;
use std::collections::VecDeque;
use std::sync::OnceLock;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum Visualizer {
    Vec,
    VecDeque,
    String,
    Str,
    Slice,
    Rc,
    Arc,
    Weak,
    RefCell,
    Cell,
    HashMap,
    HashSet,
}

/// Dangling pointer of `Weak::new()`.
const DANGLING: Address = usize::MAX as Address;

fn visualizers() -> &'static [(Regex, Visualizer)] {
    static VISUALIZERS: OnceLock<Vec<(Regex, Visualizer)>> = OnceLock::new();
    VISUALIZERS.get_or_init(|| {
        [
            (r"^(alloc::([a-z_]+::)*)?Vec<.+>$", Visualizer::Vec),
            (r"^(alloc::([a-z_]+::)*)?VecDeque<.+>$", Visualizer::VecDeque),
            (r"^(alloc::([a-z_]+::)*)?String$", Visualizer::String),
            (r"^&(mut )?str$", Visualizer::Str),
            (r"^&(mut )?\[.+\]$", Visualizer::Slice),
            (r"^(alloc::([a-z_]+::)*)?Rc<.+>$", Visualizer::Rc),
            (r"^(alloc::([a-z_]+::)*)?Arc<.+>$", Visualizer::Arc),
            (r"^(alloc::)?(rc|sync)::Weak<.+>$", Visualizer::Weak),
            (r"^(core::([a-z_]+::)*)?RefCell<.+>$", Visualizer::RefCell),
            (r"^(core::([a-z_]+::)*)?Cell<.+>$", Visualizer::Cell),
            (r"^(std::([a-z_]+::)*)?HashMap<.+>$", Visualizer::HashMap),
            (r"^(std::([a-z_]+::)*)?HashSet<.+>$", Visualizer::HashSet),
        ]
        .into_iter()
        .map(|(re, v)| (Regex::new(re).expect("valid regex"), v))
        .collect()
    })
}

/// Find a visualizer for a rust type.
pub(super) fn detect(ty: &NativeType) -> Option<Visualizer> {
    if ty.language != Language::Rust {
        return None;
    }
    visualizers()
        .iter()
        .find(|(re, _)| re.is_match(&ty.name))
        .map(|(_, v)| *v)
}

/// Display form of reference counters, `weak` is the number of user visible weak references.
fn refs_prefix(strong: u64, weak: u64) -> String {
    if weak == 0 {
        format!("(refs:{strong})")
    } else {
        format!("(refs:{strong},weak:{weak})")
    }
}

/// Reference counted allocation, as seen through an `Rc`, `Arc` or `Weak`.
struct RcBox {
    strong: u64,
    weak: u64,
    payload: Option<TypedValue>,
}

impl<'a> Formatter<'a> {
    /// Breadth-first search of a member named `name` through nested structures.
    fn find_member(&self, value: &TypedValue, name: &str) -> Result<Option<TypedValue>, Error> {
        let mut queue = VecDeque::from([value.clone()]);
        while let Some(current) = queue.pop_front() {
            let ty = self.type_of(current.type_id)?;
            let (TypeKind::Struct { fields } | TypeKind::Union { fields }) = &ty.kind else {
                continue;
            };
            for field in fields {
                let child = self.field_value(&current, field)?;
                if field.name.as_deref() == Some(name) {
                    return Ok(Some(child));
                }
                queue.push_back(child);
            }
        }
        Ok(None)
    }

    fn direct_member(&self, value: &TypedValue, name: &str) -> Result<Option<TypedValue>, Error> {
        let ty = self.type_of(value.type_id)?;
        let TypeKind::Struct { fields } = &ty.kind else {
            return Ok(None);
        };
        fields
            .iter()
            .find(|f| f.name.as_deref() == Some(name))
            .map(|f| self.field_value(value, f))
            .transpose()
    }

    fn expect_member(&self, value: &TypedValue, name: &str) -> Result<TypedValue, Error> {
        self.find_member(value, name)?
            .ok_or_else(|| Error::FieldNotFound {
                field: name.to_string(),
                type_name: self
                    .type_of(value.type_id)
                    .map(|t| t.name.clone())
                    .unwrap_or_default(),
            })
    }

    /// First integer leaf of a value (`Cell<usize>`, `AtomicUsize`, `Cap(usize)`).
    fn first_int(&self, value: &TypedValue) -> Result<i128, Error> {
        let mut current = value.clone();
        loop {
            let ty = self.type_of(current.type_id)?;
            match &ty.kind {
                TypeKind::Int { signed } => return self.read_int(&current.location, ty.size, *signed),
                TypeKind::Struct { fields } if !fields.is_empty() => {
                    current = self.field_value(&current, &fields[0])?;
                }
                _ => {
                    return Err(Error::FieldNotFound {
                        field: "<integer>".to_string(),
                        type_name: ty.name.clone(),
                    })
                }
            }
        }
    }

    fn uint_member(&self, value: &TypedValue, name: &str) -> Result<u64, Error> {
        Ok(self.first_int(&self.expect_member(value, name)?)? as u64)
    }

    /// Address and pointee type of a pointer member, wrappers like `NonNull` and `Unique` are unwrapped.
    fn pointer_member(&self, value: &TypedValue, name: &str) -> Result<(Address, TypeId), Error> {
        let mut member = self.expect_member(value, name)?;
        loop {
            let ty = self.type_of(member.type_id)?;
            match ty.kind {
                TypeKind::Pointer { pointee } => {
                    return Ok((self.read_uint(&member.location, 0, ty.size)?, pointee))
                }
                TypeKind::Struct { .. } => member = self.expect_member(&member, "pointer")?,
                _ => {
                    return Err(Error::FieldNotFound {
                        field: "pointer".to_string(),
                        type_name: ty.name.clone(),
                    })
                }
            }
        }
    }

    fn unwrap_unsafe_cell(&self, value: TypedValue) -> Result<TypedValue, Error> {
        let ty = self.type_of(value.type_id)?;
        if ty.name.contains("UnsafeCell") {
            let name = value.name.clone();
            return Ok(self.expect_member(&value, "value")?.renamed(name));
        }
        Ok(value)
    }

    fn rc_box(&self, value: &TypedValue) -> Result<Option<RcBox>, Error> {
        let (ptr, box_type) = self.pointer_member(value, "pointer")?;
        if ptr == DANGLING || ptr == 0 {
            return Ok(None);
        }
        let rc_box = TypedValue {
            name: value.name.clone(),
            type_id: box_type,
            location: Location::Memory(ptr),
            radix: value.radix,
        };
        let strong = self.uint_member(&rc_box, "strong")?;
        let weak = self.uint_member(&rc_box, "weak")?;
        // `RcBox::value` or `ArcInner::data`
        let payload = match self.direct_member(&rc_box, "value")? {
            Some(payload) => Some(payload),
            None => self.direct_member(&rc_box, "data")?,
        }
        .map(|p| p.renamed(&value.name));

        Ok(Some(RcBox {
            strong,
            weak,
            payload: (strong > 0).then_some(payload).flatten(),
        }))
    }

    fn vec_container(&self, value: &TypedValue, ty: &NativeType) -> Result<Container, Error> {
        let (ptr, pointee) = self.pointer_member(value, "pointer")?;
        let len = self.uint_member(value, "len")?;
        Ok(Container::Elements {
            element: ty.template_args.first().copied().unwrap_or(pointee),
            base: Location::Memory(ptr),
            len,
            radix: value.radix,
        })
    }

    fn slice_container(&self, value: &TypedValue) -> Result<Container, Error> {
        let (ptr, pointee) = self.pointer_member(value, "data_ptr")?;
        let len = self.uint_member(value, "length")?;
        Ok(Container::Elements {
            element: pointee,
            base: Location::Memory(ptr),
            len,
            radix: value.radix,
        })
    }

    fn vec_deque_container(&self, value: &TypedValue, ty: &NativeType) -> Result<Container, Error> {
        let (ptr, pointee) = self.pointer_member(value, "pointer")?;
        let len = self.uint_member(value, "len")?;
        let head = self.uint_member(value, "head")?;
        let cap = self.uint_member(value, "cap")?;
        Ok(Container::Ring {
            element: ty.template_args.first().copied().unwrap_or(pointee),
            base: ptr,
            head,
            cap,
            len,
            radix: value.radix,
        })
    }

    /// Bucket type of a hashbrown table: a `(K, V)` tuple for maps, `T` (or `(T, ())`) for sets.
    fn table_element(&self, value: &TypedValue, ty: &NativeType) -> Result<TypeId, Error> {
        let mut queue = VecDeque::from([value.type_id]);
        while let Some(type_id) = queue.pop_front() {
            let current = self.type_of(type_id)?;
            if current.name.contains("RawTable") {
                if let Some(arg) = current.template_args.first() {
                    return Ok(*arg);
                }
            }
            if let TypeKind::Struct { fields } = &current.kind {
                queue.extend(fields.iter().map(|f| f.type_id));
            }
        }

        ty.template_args
            .first()
            .copied()
            .ok_or_else(|| Error::FieldNotFound {
                field: "table".to_string(),
                type_name: ty.name.clone(),
            })
    }

    fn hash_container(
        &self,
        value: &TypedValue,
        ty: &NativeType,
        map: bool,
    ) -> Result<Container, Error> {
        let bucket_mask = self.uint_member(value, "bucket_mask")?;
        let items = self.uint_member(value, "items")?;
        let (ctrl, _) = self.pointer_member(value, "ctrl")?;
        Ok(Container::HashTable {
            element: self.table_element(value, ty)?,
            ctrl,
            buckets: bucket_mask + 1,
            items,
            map,
            radix: value.radix,
        })
    }

    /// Values stored in a hashbrown table.
    ///
    /// Buckets are laid out in reverse order right before control bytes,
    /// control byte with a clear top bit marks a full bucket.
    pub(super) fn hash_table_entries(
        &self,
        element: TypeId,
        ctrl: Address,
        buckets: u64,
        map: bool,
        radix: Option<Radix>,
    ) -> Result<Vec<TypedValue>, Error> {
        let buckets = buckets.min(LEN_GUARD * 2);
        let ctrl_bytes = self.backend.read_memory(ctrl, buckets as usize)?;
        let element_ty = self.type_of(element)?;
        let size = element_ty.size;

        let mut entries = vec![];
        for (i, _) in ctrl_bytes.iter().enumerate().filter(|(_, b)| **b & 0x80 == 0) {
            let bucket = TypedValue {
                name: format!("[{}]", entries.len()),
                type_id: element,
                location: Location::Memory(ctrl.wrapping_sub((i as u64 + 1) * size)),
                radix,
            };

            let entry = if map {
                let key = self.expect_member(&bucket, "__0")?;
                let value = self.expect_member(&bucket, "__1")?;
                let key = self.inline_summary(&key, super::PREVIEW_DEPTH);
                value.renamed(format!("[{key}]"))
            } else {
                match self.find_member(&bucket, "__0")? {
                    Some(item) if self.find_member(&bucket, "__1")?.is_some() => {
                        item.renamed(&bucket.name)
                    }
                    _ => bucket,
                }
            };
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Content of a `String` or `&str`, bounded by the string limit.
    pub(super) fn rust_string_bytes(
        &self,
        value: &TypedValue,
        ty: &NativeType,
    ) -> Result<Option<Vec<u8>>, Error> {
        let (ptr, len) = match detect(ty) {
            Some(Visualizer::String) => (
                self.pointer_member(value, "pointer")?.0,
                self.uint_member(value, "len")?,
            ),
            Some(Visualizer::Str) => (
                self.pointer_member(value, "data_ptr")?.0,
                self.uint_member(value, "length")?,
            ),
            _ => return Ok(None),
        };
        let read_len = len.min(self.options.string_limit as u64);
        if read_len == 0 {
            return Ok(Some(vec![]));
        }
        Ok(Some(self.backend.read_memory(ptr, read_len as usize)?.to_vec()))
    }

    /// Element container of sequence-like values: arrays, `Vec`, `VecDeque` and slices.
    pub(super) fn sequence(
        &self,
        value: &TypedValue,
        ty: &NativeType,
    ) -> Result<Option<Container>, Error> {
        if let TypeKind::Array { element, len } = ty.kind {
            return Ok(Some(Container::Elements {
                element,
                base: value.location.clone(),
                len,
                radix: value.radix,
            }));
        }
        let container = match detect(ty) {
            Some(Visualizer::Vec) => self.vec_container(value, ty)?,
            Some(Visualizer::VecDeque) => self.vec_deque_container(value, ty)?,
            Some(Visualizer::Slice) => self.slice_container(value)?,
            _ => return Ok(None),
        };
        Ok(Some(container))
    }

    /// Value wrapped by a smart pointer or a cell.
    pub(super) fn transparent_inner(
        &self,
        value: &TypedValue,
        ty: &NativeType,
    ) -> Result<Option<TypedValue>, Error> {
        match detect(ty) {
            Some(Visualizer::Rc | Visualizer::Arc | Visualizer::Weak) => {
                Ok(self.rc_box(value)?.and_then(|rc| rc.payload))
            }
            Some(Visualizer::RefCell | Visualizer::Cell) => {
                let inner = self.expect_member(value, "value")?.renamed(&value.name);
                self.unwrap_unsafe_cell(inner).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Summary and container of a visualized value, `None` if value layout is not recognized.
    pub(super) fn describe_special(
        &self,
        visualizer: Visualizer,
        value: &TypedValue,
        ty: &NativeType,
        depth: usize,
    ) -> Result<Option<(String, Option<Container>)>, Error> {
        match self.describe_special_inner(visualizer, value, ty, depth) {
            Ok(description) => Ok(Some(description)),
            Err(e @ (Error::FieldNotFound { .. } | Error::UnknownType(_))) => {
                log::debug!(target: "eval", "{visualizer:?} visualizer fallback for `{}`: {e}", ty.name);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn describe_special_inner(
        &self,
        visualizer: Visualizer,
        value: &TypedValue,
        ty: &NativeType,
        depth: usize,
    ) -> Result<(String, Option<Container>), Error> {
        let description = match visualizer {
            Visualizer::Vec | Visualizer::VecDeque | Visualizer::Slice => {
                let container = self
                    .sequence(value, ty)?
                    .ok_or_else(|| Error::NotIndexable(ty.name.clone()))?;
                let (open, close) = if visualizer == Visualizer::Slice {
                    ("[", "]")
                } else {
                    ("vec![", "]")
                };
                let len = match container {
                    Container::Elements { len, .. } | Container::Ring { len, .. } => len,
                    _ => 0,
                };
                let preview = self.elements_preview(&container, depth, open, close)?;
                (format!("({len}) {preview}"), Some(container))
            }
            Visualizer::String | Visualizer::Str => {
                let bytes = self.rust_string_bytes(value, ty)?.unwrap_or_default();
                let len = if visualizer == Visualizer::String {
                    self.uint_member(value, "len")?
                } else {
                    self.uint_member(value, "length")?
                };
                (string::quote_utf8(&bytes, (bytes.len() as u64) < len), None)
            }
            Visualizer::Rc | Visualizer::Arc | Visualizer::Weak => {
                let Some(rc) = self.rc_box(value)? else {
                    return Ok(("<unavailable>".to_string(), None));
                };
                // an implicit weak reference is owned by all strong references together
                let weak = if rc.strong > 0 {
                    rc.weak.saturating_sub(1)
                } else {
                    rc.weak
                };
                let prefix = refs_prefix(rc.strong, weak);
                match rc.payload {
                    Some(payload) => {
                        let (summary, container) = self.describe(&payload, depth)?;
                        (format!("{prefix} {summary}"), container)
                    }
                    None => (format!("{prefix} <unavailable>"), None),
                }
            }
            Visualizer::RefCell => {
                let borrow = self.first_int(&self.expect_member(value, "borrow")?)?;
                let inner = self
                    .transparent_inner(value, ty)?
                    .ok_or_else(|| Error::NotAPointer(ty.name.clone()))?;
                let (summary, container) = self.describe(&inner, depth)?;
                let summary = match borrow {
                    0 => summary,
                    b if b > 0 => format!("(borrowed:{b}) {summary}"),
                    _ => format!("(borrowed:mut) {summary}"),
                };
                (summary, container)
            }
            Visualizer::Cell => {
                let inner = self
                    .transparent_inner(value, ty)?
                    .ok_or_else(|| Error::NotAPointer(ty.name.clone()))?;
                self.describe(&inner, depth)?
            }
            Visualizer::HashMap | Visualizer::HashSet => {
                let container = self.hash_container(value, ty, visualizer == Visualizer::HashMap)?;
                let items = match container {
                    Container::HashTable { items, .. } => items,
                    _ => 0,
                };
                (format!("size={items}"), Some(container))
            }
        };
        Ok(description)
    }
}
