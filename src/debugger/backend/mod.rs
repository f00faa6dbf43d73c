//! Capability interface of a native debugging engine.
//!
//! The session engine never talks to a process directly: everything it knows about the
//! debugee (threads, frames, memory, types, line tables) comes through the [`Backend`] trait.
//! A backend pushes asynchronous notifications (stops, exits, module loads, program output)
//! into the channel given to [`Backend::subscribe`].

pub mod model;

use crate::debugger::Error;
use bytes::Bytes;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::sync::Arc;

pub type Address = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadId(pub u64);

impl Display for ThreadId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stack frame of a stopped thread, `depth` 0 is the innermost frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FrameId {
    pub thread: ThreadId,
    pub depth: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeId(pub u32);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    C,
    Cpp,
    Rust,
}

/// Native type description, as found in debug information.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NativeType {
    pub name: String,
    pub size: u64,
    #[serde(default)]
    pub language: Language,
    #[serde(flatten)]
    pub kind: TypeKind,
    /// Generic parameters (`T` of `Vec<T>`, `(K, V)` of a hash table).
    #[serde(default)]
    pub template_args: Vec<TypeId>,
}

impl NativeType {
    pub fn new(name: impl ToString, size: u64, kind: TypeKind) -> Self {
        Self {
            name: name.to_string(),
            size,
            language: Language::C,
            kind,
            template_args: vec![],
        }
    }

    pub fn in_language(mut self, language: Language) -> Self {
        self.language = language;
        self
    }

    pub fn with_template_args(mut self, args: impl Into<Vec<TypeId>>) -> Self {
        self.template_args = args.into();
        self
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TypeKind {
    Void,
    Bool,
    Int {
        signed: bool,
    },
    Float,
    /// Character type, `unicode` is set for a rust `char` (a code point, not a code unit).
    Char {
        #[serde(default)]
        unicode: bool,
    },
    Pointer {
        pointee: TypeId,
    },
    Reference {
        pointee: TypeId,
    },
    Array {
        element: TypeId,
        len: u64,
    },
    Struct {
        fields: Vec<Field>,
    },
    Union {
        fields: Vec<Field>,
    },
    Enum {
        enumerators: Vec<Enumerator>,
    },
    /// Discriminated union (rust enum).
    Variant {
        discriminant: Option<Discriminant>,
        variants: Vec<VariantCase>,
    },
    Function,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Field {
    /// `None` for anonymous members (anonymous unions and structs).
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub type_id: TypeId,
    pub offset: u64,
}

impl Field {
    pub fn named(name: impl ToString, type_id: TypeId, offset: u64) -> Self {
        Self {
            name: Some(name.to_string()),
            type_id,
            offset,
        }
    }

    pub fn anonymous(type_id: TypeId, offset: u64) -> Self {
        Self {
            name: None,
            type_id,
            offset,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Enumerator {
    pub name: String,
    pub value: i64,
}

/// Location of a discriminant inside a variant value.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Discriminant {
    pub offset: u64,
    pub size: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VariantCase {
    pub name: String,
    /// Discriminant value of this variant, `None` for the default (dataful) variant.
    pub value: Option<u64>,
    pub fields: Vec<Field>,
}

/// Where the bytes of a value live.
#[derive(Clone, Debug, PartialEq)]
pub enum Location {
    Memory(Address),
    /// Value without an address (register values, results of an evaluation).
    Immediate(Bytes),
    /// Value optimized out or otherwise unreadable.
    Unavailable,
}

/// A typed value handle of the debugee.
#[derive(Clone, Debug)]
pub struct NativeValue {
    pub name: String,
    pub type_id: TypeId,
    pub location: Location,
}

impl NativeValue {
    pub fn in_memory(name: impl ToString, type_id: TypeId, address: Address) -> Self {
        Self {
            name: name.to_string(),
            type_id,
            location: Location::Memory(address),
        }
    }

    pub fn address(&self) -> Option<Address> {
        match self.location {
            Location::Memory(addr) => Some(addr),
            _ => None,
        }
    }
}

/// Parameters of a new debugee process.
#[derive(Clone, Debug, Default)]
pub struct LaunchRequest {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Full environment, already merged with env file and overrides.
    pub env: IndexMap<String, String>,
    pub cwd: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepKind {
    Over,
    Into,
    Out,
    Instruction,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StopReason {
    /// Process stopped at program entry.
    Entry,
    Breakpoint { address: Address },
    Step,
    Pause,
    Signal { name: String },
    Exception { description: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum OutputCategory {
    Stdout,
    Stderr,
    Console,
}

/// Asynchronous notification from a backend.
#[derive(Clone, Debug)]
pub enum BackendEvent {
    /// One thread stopped, a multi-threaded stop produce one event per thread.
    Stopped {
        thread: ThreadId,
        reason: StopReason,
    },
    Exited {
        code: Option<i32>,
    },
    ModuleLoaded(Module),
    ModuleUnloaded(Module),
    Output {
        category: OutputCategory,
        text: String,
    },
    ConnectionLost(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub path: String,
    pub base: Address,
}

/// Source file entry of a compile unit line table.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SourceFile {
    pub module: String,
    /// Path as recorded in debug information (possibly relative).
    pub path: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LineLocation {
    pub address: Address,
    /// Actual line of the location, may differ from requested one.
    pub line: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Symbol {
    /// Raw (possibly mangled) symbol name.
    pub name: String,
    pub start: Address,
    pub end: Address,
    pub module: String,
}

impl Symbol {
    pub fn contains(&self, address: Address) -> bool {
        (self.start..self.end).contains(&address)
    }

    /// Human-readable symbol name, rust and itanium mangling are recognized by rustc-demangle.
    pub fn display_name(&self) -> String {
        format!("{:#}", rustc_demangle::demangle(&self.name))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LineInfo {
    /// Debug information path.
    pub path: String,
    pub line: u32,
    pub column: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub name: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FrameInfo {
    pub pc: Address,
    pub function: Option<String>,
    pub line: Option<LineInfo>,
    pub module: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Registers {
    pub pc: Address,
    pub sp: Address,
    pub fp: Address,
    /// All general purpose registers in architecture order.
    pub all: Vec<(String, u64)>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Instruction {
    pub address: Address,
    pub bytes: Vec<u8>,
    pub mnemonic: String,
    pub operands: String,
}

/// Native debugging engine.
///
/// All methods are called from the session control thread, except evaluation related
/// ones which may be called from a worker thread when the request is time bounded.
pub trait Backend: Send + Sync {
    /// Register a sink for asynchronous notifications.
    fn subscribe(&self, sink: Sender<BackendEvent>);

    // --------------------------------- process control -------------------------------------------

    /// Create a new process, the process must stay suspended until [`Backend::resume`].
    fn launch(&self, request: &LaunchRequest) -> Result<ProcessInfo, Error>;
    /// Attach to a running process, the process stays stopped after attaching.
    fn attach(&self, pid: u32) -> Result<ProcessInfo, Error>;
    /// Process currently under control (useful after custom launch command sequences).
    fn process(&self) -> Option<ProcessInfo>;
    fn resume(&self) -> Result<(), Error>;
    fn step(&self, thread: ThreadId, kind: StepKind) -> Result<(), Error>;
    fn pause(&self) -> Result<(), Error>;
    fn kill(&self) -> Result<(), Error>;
    fn detach(&self) -> Result<(), Error>;

    /// List processes visible to the backend as (pid, name) pairs.
    fn processes(&self) -> Vec<(u32, String)> {
        let mut system = sysinfo::System::new();
        system.refresh_processes();
        system
            .processes()
            .iter()
            .map(|(pid, process)| (pid.as_u32(), process.name().to_string()))
            .collect()
    }

    // --------------------------------- breakpoints -----------------------------------------------

    fn set_breakpoint(&self, address: Address) -> Result<(), Error>;
    fn remove_breakpoint(&self, address: Address) -> Result<(), Error>;

    // --------------------------------- symbols ---------------------------------------------------

    fn modules(&self) -> Vec<Module>;
    /// Source files known from line tables of all loaded modules.
    fn source_files(&self) -> Vec<SourceFile>;
    /// Addresses of a line, if the line has no code backend may move to the next line with code.
    fn line_locations(&self, file: &SourceFile, line: u32) -> Vec<LineLocation>;
    fn symbols(&self) -> Vec<Symbol>;
    fn symbol_at(&self, address: Address) -> Option<Symbol>;
    fn line_at(&self, address: Address) -> Option<LineInfo>;

    /// Find functions by name, a name matches either the full demangled name or its last path segment.
    fn find_functions(&self, name: &str) -> Vec<Symbol> {
        self.symbols()
            .into_iter()
            .filter(|sym| {
                let display = sym.display_name();
                sym.name == name
                    || display == name
                    || display.rsplit("::").next() == Some(name)
            })
            .collect()
    }

    // --------------------------------- program state ---------------------------------------------

    fn threads(&self) -> Result<Vec<ThreadInfo>, Error>;
    fn frames(&self, thread: ThreadId) -> Result<Vec<FrameInfo>, Error>;
    fn registers(&self, frame: FrameId) -> Result<Registers, Error>;
    fn locals(&self, frame: FrameId) -> Result<Vec<NativeValue>, Error>;
    fn statics(&self, frame: FrameId) -> Result<Vec<NativeValue>, Error>;
    fn find_variable(&self, frame: FrameId, name: &str) -> Result<Option<NativeValue>, Error>;
    /// Evaluate an expression with the engine native expression evaluator.
    fn evaluate(&self, frame: Option<FrameId>, expression: &str) -> Result<NativeValue, Error>;
    fn type_info(&self, id: TypeId) -> Result<Arc<NativeType>, Error>;
    fn read_memory(&self, address: Address, len: usize) -> Result<Bytes, Error>;
    fn write_memory(&self, address: Address, data: &[u8]) -> Result<(), Error>;
    fn disassemble(&self, address: Address, count: usize) -> Result<Vec<Instruction>, Error>;

    /// Run a command in the engine console, return command output.
    fn execute_command(&self, command: &str) -> Result<String, Error>;
}
