use crate::debugger::backend::{Address, NativeType, TypeId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Declarative description of a debugee: debug information, memory image and an execution trace.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ModelTarget {
    /// Program name, launch requests must point to a file with this name.
    pub program: String,
    /// Entry point, reported as the only frame of a process stopped at entry.
    #[serde(default)]
    pub entry: Address,
    /// Type table, [`TypeId`] is an index in this table.
    #[serde(default)]
    pub types: Vec<NativeType>,
    #[serde(default)]
    pub memory: Vec<Segment>,
    #[serde(default)]
    pub modules: Vec<ModelModule>,
    #[serde(default)]
    pub threads: Vec<ModelThread>,
    #[serde(default)]
    pub trace: Vec<TraceStep>,
    /// Exit code reported when a trace ends without an explicit exit step.
    #[serde(default)]
    pub exit_code: i32,
    /// Processes visible for attach requests.
    #[serde(default)]
    pub processes: Vec<ModelProcess>,
    /// Canned answers for console commands.
    #[serde(default)]
    pub commands: HashMap<String, String>,
    /// Delay of every natural expression evaluation, simulates a slow engine.
    #[serde(default)]
    pub evaluate_latency_ms: u64,
    /// Delay of a launch request, simulates a slow process start.
    #[serde(default)]
    pub launch_latency_ms: u64,
    /// Environment the program checks at exit, a mismatch turns the exit code into 1.
    #[serde(default)]
    pub expect_env: HashMap<String, String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Segment {
    pub address: Address,
    #[serde(default)]
    pub bytes: Vec<u8>,
    /// Segment size, if greater than `bytes` length the rest is filled with `fill`.
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub fill: u8,
}

impl Segment {
    pub fn materialize(&self) -> Vec<u8> {
        let mut data = self.bytes.clone();
        if let Some(size) = self.size {
            data.resize(size as usize, self.fill);
        }
        data
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ModelModule {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub base: Address,
    /// Trace step index at which module is loaded, `None` means loaded together with the program.
    #[serde(default)]
    pub load_at_step: Option<usize>,
    #[serde(default)]
    pub files: Vec<ModelFile>,
    #[serde(default)]
    pub functions: Vec<ModelFunction>,
    #[serde(default)]
    pub statics: Vec<ModelVariable>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ModelFile {
    /// Path as recorded in debug information.
    pub path: String,
    #[serde(default)]
    pub lines: Vec<LineRow>,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct LineRow {
    pub address: Address,
    pub line: u32,
    #[serde(default)]
    pub column: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ModelFunction {
    pub name: String,
    pub start: Address,
    pub end: Address,
    #[serde(default)]
    pub variables: Vec<ModelVariable>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelVariable {
    pub name: String,
    #[serde(rename = "type")]
    pub type_id: TypeId,
    pub address: Address,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelThread {
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    /// Program counter reported while the thread is not the one executing the trace.
    #[serde(default)]
    pub idle_pc: Address,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelProcess {
    pub pid: u32,
    pub name: String,
    /// Number of process list queries before the process becomes visible.
    #[serde(default)]
    pub appears_after: u32,
}

fn main_thread() -> u64 {
    1
}

/// One point of program execution.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TraceStep {
    #[serde(default = "main_thread")]
    pub thread: u64,
    pub pc: Address,
    /// Return addresses of caller frames, innermost first.
    #[serde(default)]
    pub callers: Vec<Address>,
    /// Memory modifications applied when this step executes.
    #[serde(default)]
    pub writes: Vec<MemoryWrite>,
    #[serde(default)]
    pub sp: Address,
    #[serde(default)]
    pub fp: Address,
    /// Unwinder can't get past the top frame at this step (e.g. after a jump to an invalid address).
    #[serde(default)]
    pub broken_unwind: bool,
    /// Process receive a signal at this step.
    #[serde(default)]
    pub signal: Option<String>,
    /// Other threads reported as stopped together with this one.
    #[serde(default)]
    pub also_stopped: Vec<u64>,
    /// Program output produced by this step.
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub exit: Option<i32>,
    /// Backend looses connection to the debugee at this step.
    #[serde(default)]
    pub connection_lost: bool,
}

impl TraceStep {
    pub fn at(pc: Address) -> Self {
        Self {
            thread: main_thread(),
            pc,
            ..Default::default()
        }
    }

    pub fn with_write(mut self, address: Address, bytes: impl Into<Vec<u8>>) -> Self {
        self.writes.push(MemoryWrite {
            address,
            bytes: bytes.into(),
        });
        self
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MemoryWrite {
    pub address: Address,
    pub bytes: Vec<u8>,
}

impl ModelTarget {
    pub fn new(program: impl ToString) -> Self {
        Self {
            program: program.to_string(),
            ..Default::default()
        }
    }

    /// Add a type into a type table, return its id.
    pub fn add_type(&mut self, r#type: NativeType) -> TypeId {
        self.types.push(r#type);
        TypeId(self.types.len() as u32 - 1)
    }

    /// Add a memory segment initialized with `bytes`.
    pub fn add_segment(&mut self, address: Address, bytes: impl Into<Vec<u8>>) {
        self.memory.push(Segment {
            address,
            bytes: bytes.into(),
            size: None,
            fill: 0,
        });
    }

    /// Add a code segment filled with one byte instructions.
    pub fn add_code(&mut self, address: Address, size: u64, opcode: u8) {
        self.memory.push(Segment {
            address,
            bytes: vec![],
            size: Some(size),
            fill: opcode,
        });
    }
}
