//! Breakpoint definitions and their resolution into code addresses.
//!
//! A breakpoint is a client request (a source line, a function name, an exception filter or
//! an address). Resolution binds it to zero or more addresses, several breakpoints may share
//! one address: the address is installed in the backend while at least one breakpoint uses it.

use crate::debugger::backend::{Address, Backend, SourceFile};
use crate::debugger::pathmap::{file_name, same_path, PathMapper};
use crate::debugger::Error;
use regex::Regex;
use serde::Deserialize;
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::str::FromStr;

pub type BreakpointId = i64;

/// Strategy of matching client source paths with debug information paths.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakpointMode {
    /// Full path, through the path mapper.
    #[default]
    Path,
    /// File name only.
    File,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::EnumString, strum_macros::Display)]
pub enum ExceptionFilter {
    #[strum(serialize = "rust_panic")]
    RustPanic,
    #[strum(serialize = "cpp_throw")]
    CppThrow,
    #[strum(serialize = "cpp_catch")]
    CppCatch,
}

impl ExceptionFilter {
    pub const ALL: [ExceptionFilter; 3] = [
        ExceptionFilter::RustPanic,
        ExceptionFilter::CppThrow,
        ExceptionFilter::CppCatch,
    ];

    /// Runtime hooks intercepted by the filter.
    fn hooks(self) -> &'static [&'static str] {
        match self {
            ExceptionFilter::RustPanic => &["rust_panic"],
            ExceptionFilter::CppThrow => &["__cxa_throw"],
            ExceptionFilter::CppCatch => &["__cxa_begin_catch"],
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ExceptionFilter::RustPanic => "Rust: on panic",
            ExceptionFilter::CppThrow => "C++: on throw",
            ExceptionFilter::CppCatch => "C++: on catch",
        }
    }

    pub fn default_enabled(self) -> bool {
        self == ExceptionFilter::RustPanic
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum BreakpointKind {
    /// Line of a client source file.
    Source { path: String, line: u32 },
    /// Line of a synthetic disassembly document, `address` is `None` for a line past the end.
    Synthetic {
        reference: i64,
        line: u32,
        address: Option<Address>,
    },
    /// Function by exact name, or by regular expression with `/re ` prefix.
    Function { name: String },
    Exception { filter: ExceptionFilter },
    Instruction { address: Address },
}

/// Hit count condition: `N` (same as `>=N`), `==N`, `>N`, `>=N`, `<N`, `<=N`, `%N`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HitCondition {
    Eq(u64),
    Gt(u64),
    Ge(u64),
    Lt(u64),
    Le(u64),
    Every(u64),
}

impl FromStr for HitCondition {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (ctor, number): (fn(u64) -> HitCondition, &str) =
            if let Some(n) = s.strip_prefix("==") {
                (HitCondition::Eq, n)
            } else if let Some(n) = s.strip_prefix(">=") {
                (HitCondition::Ge, n)
            } else if let Some(n) = s.strip_prefix("<=") {
                (HitCondition::Le, n)
            } else if let Some(n) = s.strip_prefix('>') {
                (HitCondition::Gt, n)
            } else if let Some(n) = s.strip_prefix('<') {
                (HitCondition::Lt, n)
            } else if let Some(n) = s.strip_prefix('%') {
                (HitCondition::Every, n)
            } else {
                (HitCondition::Ge, s)
            };

        let number: u64 = number
            .trim()
            .parse()
            .map_err(|_| Error::InvalidHitCondition(s.to_string()))?;
        if matches!(ctor(number), HitCondition::Every(0)) {
            return Err(Error::InvalidHitCondition(s.to_string()));
        }
        Ok(ctor(number))
    }
}

impl HitCondition {
    /// True if a breakpoint hit for the `hits`-th time (1-based) should stop.
    pub fn matches(self, hits: u64) -> bool {
        match self {
            HitCondition::Eq(n) => hits == n,
            HitCondition::Gt(n) => hits > n,
            HitCondition::Ge(n) => hits >= n,
            HitCondition::Lt(n) => hits < n,
            HitCondition::Le(n) => hits <= n,
            HitCondition::Every(n) => hits % n == 0,
        }
    }
}

/// Piece of a log point message.
#[derive(Clone, Debug, PartialEq)]
pub enum LogSegment {
    Text(String),
    /// Expression to interpolate (`{expr}`).
    Expr(String),
}

/// Split a log message into text and `{expr}` pieces, `{{` and `}}` are literal braces.
pub fn parse_log_message(message: &str) -> Vec<LogSegment> {
    let mut segments = vec![];
    let mut text = String::new();
    let mut chars = message.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                text.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                text.push('}');
            }
            '{' => {
                let mut expr = String::new();
                let mut depth = 1;
                for c in chars.by_ref() {
                    match c {
                        '{' => depth += 1,
                        '}' => depth -= 1,
                        _ => {}
                    }
                    if depth == 0 {
                        break;
                    }
                    expr.push(c);
                }
                if depth != 0 {
                    // unterminated, keep as is
                    text.push('{');
                    text.push_str(&expr);
                    continue;
                }
                if !text.is_empty() {
                    segments.push(LogSegment::Text(std::mem::take(&mut text)));
                }
                segments.push(LogSegment::Expr(expr.trim().to_string()));
            }
            _ => text.push(c),
        }
    }
    if !text.is_empty() {
        segments.push(LogSegment::Text(text));
    }
    segments
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BreakpointOptions {
    pub condition: Option<String>,
    pub hit_condition: Option<String>,
    pub log_message: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BreakpointLocation {
    pub address: Address,
    /// Actual source line, may differ from the requested one.
    pub line: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct Breakpoint {
    pub id: BreakpointId,
    pub kind: BreakpointKind,
    pub options: BreakpointOptions,
    hit_condition: Option<HitCondition>,
    pub hits: u64,
    pub locations: Vec<BreakpointLocation>,
    /// Reason of an unresolved breakpoint.
    pub message: Option<String>,
}

impl Breakpoint {
    pub fn verified(&self) -> bool {
        !self.locations.is_empty()
    }

    pub fn is_log_point(&self) -> bool {
        self.options.log_message.is_some()
    }

    /// Line of the first location.
    pub fn line(&self) -> Option<u32> {
        self.locations.iter().find_map(|loc| loc.line)
    }

    fn set_options(&mut self, options: BreakpointOptions) {
        self.hit_condition = None;
        self.message = None;
        if let Some(ref text) = options.hit_condition {
            match text.parse::<HitCondition>() {
                Ok(condition) => self.hit_condition = Some(condition),
                Err(e) => self.message = Some(e.to_string()),
            }
        }
        self.options = options;
    }
}

/// Owner of all breakpoints of a session.
#[derive(Default)]
pub struct BreakpointManager {
    mode: BreakpointMode,
    next_id: BreakpointId,
    breakpoints: BTreeMap<BreakpointId, Breakpoint>,
    /// Installed addresses and breakpoints bound to them.
    addresses: BTreeMap<Address, SmallVec<[BreakpointId; 2]>>,
}

impl BreakpointManager {
    pub fn new(mode: BreakpointMode) -> Self {
        Self {
            mode,
            next_id: 1,
            ..Default::default()
        }
    }

    pub fn mode(&self) -> BreakpointMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: BreakpointMode) {
        self.mode = mode;
    }

    pub fn get(&self, id: BreakpointId) -> Option<&Breakpoint> {
        self.breakpoints.get(&id)
    }

    /// Breakpoints bound to an address.
    pub fn at(&self, address: Address) -> &[BreakpointId] {
        self.addresses
            .get(&address)
            .map(|ids| ids.as_slice())
            .unwrap_or_default()
    }

    /// Replace breakpoints of a source file, return ids in request order.
    pub fn set_source_breakpoints(
        &mut self,
        backend: &dyn Backend,
        mapper: &PathMapper,
        path: &str,
        requested: Vec<(u32, BreakpointOptions)>,
    ) -> Vec<BreakpointId> {
        let requested = requested
            .into_iter()
            .map(|(line, options)| {
                let kind = BreakpointKind::Source {
                    path: path.to_string(),
                    line,
                };
                (kind, options)
            })
            .collect();
        self.replace(
            backend,
            mapper,
            |kind| matches!(kind, BreakpointKind::Source { path: p, .. } if same_path(p, path)),
            requested,
        )
    }

    /// Replace breakpoints of a synthetic disassembly document.
    pub fn set_synthetic_breakpoints(
        &mut self,
        backend: &dyn Backend,
        mapper: &PathMapper,
        reference: i64,
        requested: Vec<(u32, Option<Address>, BreakpointOptions)>,
    ) -> Vec<BreakpointId> {
        let requested = requested
            .into_iter()
            .map(|(line, address, options)| {
                let kind = BreakpointKind::Synthetic {
                    reference,
                    line,
                    address,
                };
                (kind, options)
            })
            .collect();
        self.replace(
            backend,
            mapper,
            |kind| matches!(kind, BreakpointKind::Synthetic { reference: r, .. } if *r == reference),
            requested,
        )
    }

    pub fn set_function_breakpoints(
        &mut self,
        backend: &dyn Backend,
        mapper: &PathMapper,
        requested: Vec<(String, BreakpointOptions)>,
    ) -> Vec<BreakpointId> {
        let requested = requested
            .into_iter()
            .map(|(name, options)| (BreakpointKind::Function { name }, options))
            .collect();
        self.replace(
            backend,
            mapper,
            |kind| matches!(kind, BreakpointKind::Function { .. }),
            requested,
        )
    }

    pub fn set_exception_breakpoints(
        &mut self,
        backend: &dyn Backend,
        mapper: &PathMapper,
        filters: &[String],
    ) -> Vec<BreakpointId> {
        let requested = filters
            .iter()
            .filter_map(|name| match name.parse::<ExceptionFilter>() {
                Ok(filter) => Some((
                    BreakpointKind::Exception { filter },
                    BreakpointOptions::default(),
                )),
                Err(_) => {
                    log::warn!(target: "breakpoint", "unknown exception filter `{name}`");
                    None
                }
            })
            .collect();
        self.replace(
            backend,
            mapper,
            |kind| matches!(kind, BreakpointKind::Exception { .. }),
            requested,
        )
    }

    pub fn set_instruction_breakpoints(
        &mut self,
        backend: &dyn Backend,
        mapper: &PathMapper,
        requested: Vec<(Address, BreakpointOptions)>,
    ) -> Vec<BreakpointId> {
        let requested = requested
            .into_iter()
            .map(|(address, options)| (BreakpointKind::Instruction { address }, options))
            .collect();
        self.replace(
            backend,
            mapper,
            |kind| matches!(kind, BreakpointKind::Instruction { .. }),
            requested,
        )
    }

    /// Replace all breakpoints selected by `group` with `requested` ones.
    /// Breakpoints with unchanged kind keep their ids and hit counts.
    fn replace(
        &mut self,
        backend: &dyn Backend,
        mapper: &PathMapper,
        group: impl Fn(&BreakpointKind) -> bool,
        requested: Vec<(BreakpointKind, BreakpointOptions)>,
    ) -> Vec<BreakpointId> {
        let mut stale: Vec<BreakpointId> = self
            .breakpoints
            .values()
            .filter(|bp| group(&bp.kind))
            .map(|bp| bp.id)
            .collect();

        let mut ids = Vec::with_capacity(requested.len());
        for (kind, options) in requested {
            let reused = stale
                .iter()
                .position(|id| self.breakpoints.get(id).is_some_and(|bp| bp.kind == kind))
                .map(|pos| stale.remove(pos));

            let id = match reused {
                Some(id) => id,
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    self.breakpoints.insert(
                        id,
                        Breakpoint {
                            id,
                            kind,
                            options: BreakpointOptions::default(),
                            hit_condition: None,
                            hits: 0,
                            locations: vec![],
                            message: None,
                        },
                    );
                    id
                }
            };
            if let Some(bp) = self.breakpoints.get_mut(&id) {
                bp.set_options(options);
            }
            self.resolve(backend, mapper, id);
            ids.push(id);
        }

        for id in stale {
            self.remove(backend, id);
        }
        ids
    }

    fn remove(&mut self, backend: &dyn Backend, id: BreakpointId) {
        if let Some(bp) = self.breakpoints.remove(&id) {
            log::debug!(target: "breakpoint", "remove breakpoint {id} ({:?})", bp.kind);
            for location in bp.locations {
                self.unbind(backend, id, location.address);
            }
        }
    }

    /// Remove every breakpoint and uninstall every address.
    pub fn clear(&mut self, backend: &dyn Backend) {
        let ids: Vec<_> = self.breakpoints.keys().copied().collect();
        for id in ids {
            self.remove(backend, id);
        }
    }

    /// Resolve all breakpoints again (after a module load or a path map change),
    /// return ids of breakpoints whose locations changed.
    pub fn resolve_all(&mut self, backend: &dyn Backend, mapper: &PathMapper) -> Vec<BreakpointId> {
        let ids: Vec<_> = self.breakpoints.keys().copied().collect();
        ids.into_iter()
            .filter(|&id| self.resolve(backend, mapper, id))
            .collect()
    }

    /// Register a hit of a breakpoint whose condition holds, return true if the hit count
    /// condition allows a stop.
    pub fn register_hit(&mut self, id: BreakpointId) -> bool {
        let Some(bp) = self.breakpoints.get_mut(&id) else {
            return false;
        };
        bp.hits += 1;
        bp.hit_condition.map_or(true, |condition| condition.matches(bp.hits))
    }

    /// Bind a breakpoint to its current locations, return true if locations changed.
    fn resolve(&mut self, backend: &dyn Backend, mapper: &PathMapper, id: BreakpointId) -> bool {
        let Some(bp) = self.breakpoints.get(&id) else {
            return false;
        };
        let invalid_options = bp.hit_condition.is_none() && bp.options.hit_condition.is_some();
        let resolved = if invalid_options {
            Ok(vec![])
        } else {
            locations(backend, mapper, self.mode, &bp.kind)
        };
        let (mut new, message) = match resolved {
            Ok(locations) => (locations, None),
            Err(e) => (vec![], Some(e.to_string())),
        };
        new.dedup_by_key(|loc| loc.address);

        let old = bp.locations.clone();
        if old == new && (message.is_none() || bp.message == message) {
            return false;
        }

        for loc in old.iter().filter(|old| !new.iter().any(|l| l.address == old.address)) {
            self.unbind(backend, id, loc.address);
        }
        let mut bound = Vec::with_capacity(new.len());
        for loc in new {
            if old.iter().any(|l| l.address == loc.address) || self.bind(backend, id, loc.address) {
                bound.push(loc);
            }
        }

        if let Some(bp) = self.breakpoints.get_mut(&id) {
            log::debug!(target: "breakpoint", "breakpoint {id} resolved to {} location(s)", bound.len());
            let changed = bp.locations != bound;
            bp.locations = bound;
            if !invalid_options {
                bp.message = message;
            }
            return changed;
        }
        false
    }

    fn bind(&mut self, backend: &dyn Backend, id: BreakpointId, address: Address) -> bool {
        let ids = self.addresses.entry(address).or_default();
        if ids.is_empty() {
            if let Err(e) = backend.set_breakpoint(address) {
                log::warn!(target: "breakpoint", "install breakpoint at {address:#x}: {e}");
                self.addresses.remove(&address);
                return false;
            }
        }
        if !ids.contains(&id) {
            ids.push(id);
        }
        true
    }

    fn unbind(&mut self, backend: &dyn Backend, id: BreakpointId, address: Address) {
        let Some(ids) = self.addresses.get_mut(&address) else {
            return;
        };
        ids.retain(|bp| *bp != id);
        if ids.is_empty() {
            self.addresses.remove(&address);
            if let Err(e) = backend.remove_breakpoint(address) {
                log::warn!(target: "breakpoint", "uninstall breakpoint at {address:#x}: {e}");
            }
        }
    }
}

/// Find locations of a breakpoint in loaded modules.
fn locations(
    backend: &dyn Backend,
    mapper: &PathMapper,
    mode: BreakpointMode,
    kind: &BreakpointKind,
) -> Result<Vec<BreakpointLocation>, Error> {
    match kind {
        BreakpointKind::Source { path, line } => {
            let files: Vec<SourceFile> = backend
                .source_files()
                .into_iter()
                .filter(|file| match mode {
                    BreakpointMode::Path => mapper.matches(&file.path, path),
                    BreakpointMode::File => file_name(&file.path) == file_name(path),
                })
                .collect();

            let mut locations: Vec<_> = files
                .iter()
                .flat_map(|file| backend.line_locations(file, *line))
                .map(|loc| BreakpointLocation {
                    address: loc.address,
                    line: Some(loc.line),
                })
                .collect();
            locations.sort_by_key(|loc| loc.address);
            if locations.is_empty() {
                return Err(Error::NoCodeAtLine {
                    source_name: path.clone(),
                    line: *line,
                });
            }
            Ok(locations)
        }
        BreakpointKind::Synthetic {
            reference,
            line,
            address,
        } => match address {
            Some(address) => Ok(vec![BreakpointLocation {
                address: *address,
                line: Some(*line),
            }]),
            None => Err(Error::NoInstructionAtLine {
                reference: *reference,
                line: *line,
            }),
        },
        BreakpointKind::Function { name } => {
            let symbols = match name.strip_prefix("/re ") {
                Some(pattern) => {
                    let re = Regex::new(pattern.trim())?;
                    backend
                        .symbols()
                        .into_iter()
                        .filter(|sym| re.is_match(&sym.display_name()))
                        .collect()
                }
                None => backend.find_functions(name.trim()),
            };
            if symbols.is_empty() {
                return Err(Error::Backend(format!("no function matches `{name}`")));
            }
            let mut locations: Vec<_> = symbols
                .into_iter()
                .map(|sym| BreakpointLocation {
                    address: sym.start,
                    line: backend.line_at(sym.start).map(|l| l.line),
                })
                .collect();
            locations.sort_by_key(|loc| loc.address);
            Ok(locations)
        }
        BreakpointKind::Exception { filter } => Ok(filter
            .hooks()
            .iter()
            .flat_map(|hook| backend.find_functions(hook))
            .map(|sym| BreakpointLocation {
                address: sym.start,
                line: None,
            })
            .collect()),
        BreakpointKind::Instruction { address } => Ok(vec![BreakpointLocation {
            address: *address,
            line: backend.line_at(*address).map(|l| l.line),
        }]),
    }
}
