//! In-process backend driven by a declarative target description.
//!
//! A [`ModelTarget`] describes everything a native engine would extract from a binary
//! (types, line tables, symbols, memory image) together with a linear execution trace.
//! Resuming the process walks the trace until a step hits an installed breakpoint,
//! raises a signal or exits.

mod disasm;
pub mod target;

pub use target::*;

use crate::debugger::backend::{
    Address, Backend, BackendEvent, FrameId, FrameInfo, Instruction, LaunchRequest, LineInfo,
    LineLocation, Location, Module, NativeType, NativeValue, OutputCategory, ProcessInfo,
    Registers, SourceFile, StepKind, StopReason, Symbol, ThreadId, ThreadInfo, TypeId,
};
use crate::debugger::Error;
use bytes::Bytes;
use disasm::Disassembler;
use std::collections::HashSet;
use std::path::Path;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const LAUNCH_PID: u32 = 4000;
/// Longest x86-64 instruction.
const MAX_INSN_LEN: usize = 15;

#[derive(Default)]
struct State {
    memory: Vec<(Address, Vec<u8>)>,
    loaded: Vec<bool>,
    cursor: Option<usize>,
    breakpoints: HashSet<Address>,
    process: Option<ProcessInfo>,
    launch: Option<LaunchRequest>,
    commands: Vec<String>,
    exited: bool,
    connection_lost: bool,
    process_queries: u32,
}

pub struct ModelBackend {
    target: ModelTarget,
    types: Vec<Arc<NativeType>>,
    state: Mutex<State>,
    sink: Mutex<Option<Sender<BackendEvent>>>,
    disasm: Disassembler,
}

impl ModelBackend {
    pub fn new(target: ModelTarget) -> Self {
        let state = State {
            memory: target
                .memory
                .iter()
                .map(|seg| (seg.address, seg.materialize()))
                .collect(),
            loaded: target
                .modules
                .iter()
                .map(|m| m.load_at_step.is_none())
                .collect(),
            ..Default::default()
        };

        Self {
            types: target.types.iter().cloned().map(Arc::new).collect(),
            target,
            state: Mutex::new(state),
            sink: Mutex::new(None),
            disasm: Disassembler::new(),
        }
    }

    /// Load a target description from a TOML file.
    pub fn from_toml(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        use anyhow::Context;
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read model file {}", path.display()))?;
        let target: ModelTarget =
            toml::from_str(&content).with_context(|| format!("parse model {}", path.display()))?;
        Ok(Self::new(target))
    }

    pub fn target(&self) -> &ModelTarget {
        &self.target
    }

    /// Parameters of the last launch.
    pub fn launch_request(&self) -> Option<LaunchRequest> {
        self.state().launch.clone()
    }

    /// Console commands executed so far, in execution order.
    pub fn executed_commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    /// Currently installed breakpoint addresses, sorted.
    pub fn installed_breakpoints(&self) -> Vec<Address> {
        let mut addresses: Vec<_> = self.state().breakpoints.iter().copied().collect();
        addresses.sort_unstable();
        addresses
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, events: Vec<BackendEvent>) {
        let sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sink) = sink.as_ref() {
            for event in events {
                if sink.send(event).is_err() {
                    log::debug!(target: "backend", "event sink is closed");
                    break;
                }
            }
        }
    }

    fn ensure_alive(&self, state: &State) -> Result<(), Error> {
        if state.connection_lost {
            return Err(Error::ConnectionLost("debugee connection closed".to_string()));
        }
        if state.process.is_none() || state.exited {
            return Err(Error::NoProcess);
        }
        Ok(())
    }

    fn loaded_modules<'a>(&'a self, state: &'a State) -> impl Iterator<Item = &'a ModelModule> {
        self.target
            .modules
            .iter()
            .zip(state.loaded.iter())
            .filter_map(|(m, loaded)| loaded.then_some(m))
    }

    fn function_at<'a>(
        &'a self,
        state: &'a State,
        pc: Address,
    ) -> Option<(&'a ModelModule, &'a ModelFunction)> {
        self.loaded_modules(state).find_map(|m| {
            m.functions
                .iter()
                .find(|f| (f.start..f.end).contains(&pc))
                .map(|f| (m, f))
        })
    }

    fn thread_list(&self) -> Vec<ThreadInfo> {
        if self.target.threads.is_empty() {
            return vec![ThreadInfo {
                id: ThreadId(1),
                name: Some("main".to_string()),
            }];
        }
        self.target
            .threads
            .iter()
            .map(|t| ThreadInfo {
                id: ThreadId(t.id),
                name: t.name.clone(),
            })
            .collect()
    }

    /// Program counters of a thread stack (innermost first) and top frame sp/fp registers.
    fn stack(&self, state: &State, thread: ThreadId) -> Result<(Vec<Address>, Address, Address), Error> {
        let threads = self.thread_list();
        if !threads.iter().any(|t| t.id == thread) {
            return Err(Error::ThreadNotFound(thread.0));
        }

        let Some(cursor) = state.cursor else {
            if thread == threads[0].id && self.target.entry != 0 {
                return Ok((vec![self.target.entry], 0, 0));
            }
            return Ok((self.idle_stack(thread), 0, 0));
        };

        let last_step = self.target.trace[..=cursor]
            .iter()
            .rev()
            .find(|step| step.thread == thread.0);
        match last_step {
            Some(step) => {
                let mut pcs = vec![step.pc];
                if !step.broken_unwind {
                    pcs.extend(step.callers.iter().copied());
                }
                Ok((pcs, step.sp, step.fp))
            }
            None => Ok((self.idle_stack(thread), 0, 0)),
        }
    }

    fn idle_stack(&self, thread: ThreadId) -> Vec<Address> {
        self.target
            .threads
            .iter()
            .find(|t| t.id == thread.0 && t.idle_pc != 0)
            .map(|t| vec![t.idle_pc])
            .unwrap_or_default()
    }

    fn frame_pc(&self, state: &State, frame: FrameId) -> Result<Address, Error> {
        let (pcs, _, _) = self.stack(state, frame.thread)?;
        pcs.get(frame.depth as usize)
            .copied()
            .ok_or_else(|| Error::Backend(format!("no frame #{} in thread {}", frame.depth, frame.thread)))
    }

    fn exit_code(&self, state: &State, code: i32) -> i32 {
        let env_matches = state.launch.as_ref().map_or(true, |launch| {
            self.target
                .expect_env
                .iter()
                .all(|(k, v)| launch.env.get(k) == Some(v))
        });
        if env_matches {
            code
        } else {
            1
        }
    }

    fn write_bytes(&self, state: &mut State, address: Address, data: &[u8]) -> Result<(), Error> {
        let (base, segment) = state
            .memory
            .iter_mut()
            .find(|(base, bytes)| address >= *base && address + data.len() as u64 <= *base + bytes.len() as u64)
            .ok_or(Error::InvalidAddress(address))?;
        let offset = (address - *base) as usize;
        segment[offset..offset + data.len()].copy_from_slice(data);
        self.disasm.reset();
        Ok(())
    }

    /// Execute trace steps until a stop condition, return notifications produced by execution.
    fn run(&self, single_step: bool) -> Result<(), Error> {
        let mut events = vec![];
        {
            let mut state = self.state();
            self.ensure_alive(&state)?;

            loop {
                let next = state.cursor.map_or(0, |c| c + 1);
                let Some(step) = self.target.trace.get(next) else {
                    let code = self.exit_code(&state, self.target.exit_code);
                    state.exited = true;
                    events.push(BackendEvent::Exited { code: Some(code) });
                    break;
                };
                state.cursor = Some(next);

                for write in &step.writes {
                    self.write_bytes(&mut state, write.address, &write.bytes)?;
                }

                for (idx, module) in self.target.modules.iter().enumerate() {
                    if module.load_at_step == Some(next) && !state.loaded[idx] {
                        state.loaded[idx] = true;
                        events.push(BackendEvent::ModuleLoaded(Module {
                            name: module.name.clone(),
                            path: module.path.clone(),
                            base: module.base,
                        }));
                    }
                }

                if let Some(ref text) = step.output {
                    events.push(BackendEvent::Output {
                        category: OutputCategory::Stdout,
                        text: text.clone(),
                    });
                }

                if step.connection_lost {
                    state.connection_lost = true;
                    events.push(BackendEvent::ConnectionLost(
                        "debugee connection closed".to_string(),
                    ));
                    break;
                }

                if let Some(code) = step.exit {
                    let code = self.exit_code(&state, code);
                    state.exited = true;
                    events.push(BackendEvent::Exited { code: Some(code) });
                    break;
                }

                let reason = if let Some(ref signal) = step.signal {
                    Some(StopReason::Signal {
                        name: signal.clone(),
                    })
                } else if state.breakpoints.contains(&step.pc) {
                    Some(StopReason::Breakpoint { address: step.pc })
                } else if single_step {
                    Some(StopReason::Step)
                } else {
                    None
                };

                if let Some(reason) = reason {
                    events.push(BackendEvent::Stopped {
                        thread: ThreadId(step.thread),
                        reason,
                    });
                    events.extend(step.also_stopped.iter().map(|&tid| BackendEvent::Stopped {
                        thread: ThreadId(tid),
                        reason: StopReason::Pause,
                    }));
                    break;
                }
            }
        }

        self.emit(events);
        Ok(())
    }

    fn start_process(&self, state: &mut State, pid: u32, name: String) -> ProcessInfo {
        let process = ProcessInfo { pid, name };
        state.process = Some(process.clone());
        state.cursor = None;
        state.exited = false;
        process
    }
}

impl Backend for ModelBackend {
    fn subscribe(&self, sink: Sender<BackendEvent>) {
        *self.sink.lock().unwrap_or_else(|e| e.into_inner()) = Some(sink);
    }

    fn launch(&self, request: &LaunchRequest) -> Result<ProcessInfo, Error> {
        let file_name = request
            .program
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        if file_name != self.target.program {
            return Err(Error::Backend(format!(
                "unable to find executable for '{}'",
                request.program.display()
            )));
        }

        if self.target.launch_latency_ms > 0 {
            std::thread::sleep(Duration::from_millis(self.target.launch_latency_ms));
        }
        let mut state = self.state();
        if state.connection_lost {
            return Err(Error::ConnectionLost("debugee connection closed".to_string()));
        }
        state.launch = Some(request.clone());
        log::debug!(target: "backend", "launch {} with {} env vars", request.program.display(), request.env.len());
        Ok(self.start_process(&mut state, LAUNCH_PID, self.target.program.clone()))
    }

    fn attach(&self, pid: u32) -> Result<ProcessInfo, Error> {
        let process = self
            .target
            .processes
            .iter()
            .find(|p| p.pid == pid)
            .ok_or_else(|| Error::ProcessNotFound(pid.to_string()))?;
        let mut state = self.state();
        Ok(self.start_process(&mut state, process.pid, process.name.clone()))
    }

    fn process(&self) -> Option<ProcessInfo> {
        let state = self.state();
        if state.exited {
            return None;
        }
        state.process.clone()
    }

    fn resume(&self) -> Result<(), Error> {
        self.run(false)
    }

    fn step(&self, thread: ThreadId, kind: StepKind) -> Result<(), Error> {
        log::debug!(target: "backend", "step {kind:?} on thread {thread}");
        self.run(true)
    }

    fn pause(&self) -> Result<(), Error> {
        let thread = {
            let state = self.state();
            self.ensure_alive(&state)?;
            state
                .cursor
                .and_then(|c| self.target.trace.get(c))
                .map(|step| ThreadId(step.thread))
                .unwrap_or(self.thread_list()[0].id)
        };
        self.emit(vec![BackendEvent::Stopped {
            thread,
            reason: StopReason::Pause,
        }]);
        Ok(())
    }

    fn kill(&self) -> Result<(), Error> {
        let mut state = self.state();
        if state.process.take().is_some() && !state.exited {
            state.exited = true;
            drop(state);
            self.emit(vec![BackendEvent::Exited { code: None }]);
        }
        Ok(())
    }

    fn detach(&self) -> Result<(), Error> {
        let mut state = self.state();
        state.process = None;
        state.breakpoints.clear();
        Ok(())
    }

    fn processes(&self) -> Vec<(u32, String)> {
        let mut state = self.state();
        let queries = state.process_queries;
        state.process_queries += 1;
        self.target
            .processes
            .iter()
            .filter(|p| p.appears_after <= queries)
            .map(|p| (p.pid, p.name.clone()))
            .collect()
    }

    fn set_breakpoint(&self, address: Address) -> Result<(), Error> {
        self.state().breakpoints.insert(address);
        Ok(())
    }

    fn remove_breakpoint(&self, address: Address) -> Result<(), Error> {
        self.state().breakpoints.remove(&address);
        Ok(())
    }

    fn modules(&self) -> Vec<Module> {
        let state = self.state();
        self.loaded_modules(&state)
            .map(|m| Module {
                name: m.name.clone(),
                path: m.path.clone(),
                base: m.base,
            })
            .collect()
    }

    fn source_files(&self) -> Vec<SourceFile> {
        let state = self.state();
        self.loaded_modules(&state)
            .flat_map(|m| {
                m.files.iter().map(|f| SourceFile {
                    module: m.name.clone(),
                    path: f.path.clone(),
                })
            })
            .collect()
    }

    fn line_locations(&self, file: &SourceFile, line: u32) -> Vec<LineLocation> {
        let state = self.state();
        let Some(model_file) = self
            .loaded_modules(&state)
            .filter(|m| m.name == file.module)
            .flat_map(|m| m.files.iter())
            .find(|f| f.path == file.path)
        else {
            return vec![];
        };

        // move to the nearest following line with code
        let Some(actual) = model_file
            .lines
            .iter()
            .map(|row| row.line)
            .filter(|&l| l >= line)
            .min()
        else {
            return vec![];
        };

        let mut locations: Vec<LineLocation> = model_file
            .lines
            .iter()
            .filter(|row| row.line == actual)
            .map(|row| LineLocation {
                address: row.address,
                line: actual,
            })
            .collect();
        locations.dedup_by_key(|loc| loc.address);
        locations
    }

    fn symbols(&self) -> Vec<Symbol> {
        let state = self.state();
        self.loaded_modules(&state)
            .flat_map(|m| {
                m.functions.iter().map(|f| Symbol {
                    name: f.name.clone(),
                    start: f.start,
                    end: f.end,
                    module: m.name.clone(),
                })
            })
            .collect()
    }

    fn symbol_at(&self, address: Address) -> Option<Symbol> {
        let state = self.state();
        self.function_at(&state, address).map(|(m, f)| Symbol {
            name: f.name.clone(),
            start: f.start,
            end: f.end,
            module: m.name.clone(),
        })
    }

    fn line_at(&self, address: Address) -> Option<LineInfo> {
        let state = self.state();
        let (module, function) = self.function_at(&state, address)?;
        module
            .files
            .iter()
            .flat_map(|f| f.lines.iter().map(move |row| (f, row)))
            .filter(|(_, row)| row.address >= function.start && row.address <= address)
            .max_by_key(|(_, row)| row.address)
            .map(|(f, row)| LineInfo {
                path: f.path.clone(),
                line: row.line,
                column: row.column,
            })
    }

    fn threads(&self) -> Result<Vec<ThreadInfo>, Error> {
        let state = self.state();
        self.ensure_alive(&state)?;
        Ok(self.thread_list())
    }

    fn frames(&self, thread: ThreadId) -> Result<Vec<FrameInfo>, Error> {
        let pcs = {
            let state = self.state();
            self.ensure_alive(&state)?;
            self.stack(&state, thread)?.0
        };

        Ok(pcs
            .into_iter()
            .map(|pc| {
                let symbol = self.symbol_at(pc);
                FrameInfo {
                    pc,
                    function: symbol.as_ref().map(Symbol::display_name),
                    line: self.line_at(pc),
                    module: symbol.map(|s| s.module),
                }
            })
            .collect())
    }

    fn registers(&self, frame: FrameId) -> Result<Registers, Error> {
        let state = self.state();
        self.ensure_alive(&state)?;
        let (pcs, sp, fp) = self.stack(&state, frame.thread)?;
        let pc = pcs.get(frame.depth as usize).copied().unwrap_or_default();
        let (sp, fp) = if frame.depth == 0 { (sp, fp) } else { (0, 0) };
        Ok(Registers {
            pc,
            sp,
            fp,
            all: vec![
                ("rip".to_string(), pc),
                ("rsp".to_string(), sp),
                ("rbp".to_string(), fp),
            ],
        })
    }

    fn locals(&self, frame: FrameId) -> Result<Vec<NativeValue>, Error> {
        let state = self.state();
        self.ensure_alive(&state)?;
        let pc = self.frame_pc(&state, frame)?;
        Ok(self
            .function_at(&state, pc)
            .map(|(_, f)| {
                f.variables
                    .iter()
                    .map(|v| NativeValue::in_memory(&v.name, v.type_id, v.address))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn statics(&self, frame: FrameId) -> Result<Vec<NativeValue>, Error> {
        let state = self.state();
        self.ensure_alive(&state)?;
        let pc = self.frame_pc(&state, frame)?;
        let module = self.function_at(&state, pc).map(|(m, _)| m.name.clone());
        Ok(self
            .loaded_modules(&state)
            .filter(|m| module.as_ref().map_or(true, |name| &m.name == name))
            .flat_map(|m| m.statics.iter())
            .map(|v| NativeValue::in_memory(&v.name, v.type_id, v.address))
            .collect())
    }

    fn find_variable(&self, frame: FrameId, name: &str) -> Result<Option<NativeValue>, Error> {
        if let Some(local) = self.locals(frame)?.into_iter().find(|v| v.name == name) {
            return Ok(Some(local));
        }
        let state = self.state();
        let found = self
            .loaded_modules(&state)
            .flat_map(|m| m.statics.iter())
            .find(|v| v.name == name)
            .map(|v| NativeValue::in_memory(&v.name, v.type_id, v.address));
        Ok(found)
    }

    fn evaluate(&self, frame: Option<FrameId>, expression: &str) -> Result<NativeValue, Error> {
        if self.target.evaluate_latency_ms > 0 {
            std::thread::sleep(Duration::from_millis(self.target.evaluate_latency_ms));
        }

        let expression = expression.trim();
        if let Ok(literal) = expression.parse::<i32>() {
            let int = self
                .types
                .iter()
                .position(|t| t.name == "int")
                .ok_or(Error::Backend("type `int` is unknown".to_string()))?;
            return Ok(NativeValue {
                name: expression.to_string(),
                type_id: TypeId(int as u32),
                location: Location::Immediate(Bytes::copy_from_slice(&literal.to_le_bytes())),
            });
        }

        let frame = frame.ok_or_else(|| Error::Backend(format!(
            "can't evaluate `{expression}` without a frame"
        )))?;
        self.find_variable(frame, expression)?.ok_or_else(|| Error::Backend(format!(
            "use of undeclared identifier '{expression}'"
        )))
    }

    fn type_info(&self, id: TypeId) -> Result<Arc<NativeType>, Error> {
        self.types
            .get(id.0 as usize)
            .cloned()
            .ok_or(Error::UnknownType(id.0))
    }

    fn read_memory(&self, address: Address, len: usize) -> Result<Bytes, Error> {
        let state = self.state();
        if state.connection_lost {
            return Err(Error::ConnectionLost("debugee connection closed".to_string()));
        }
        state
            .memory
            .iter()
            .find(|(base, bytes)| {
                address >= *base && address + len as u64 <= *base + bytes.len() as u64
            })
            .map(|(base, bytes)| {
                let offset = (address - base) as usize;
                Bytes::copy_from_slice(&bytes[offset..offset + len])
            })
            .ok_or(Error::InvalidAddress(address))
    }

    fn write_memory(&self, address: Address, data: &[u8]) -> Result<(), Error> {
        let mut state = self.state();
        self.ensure_alive(&state)?;
        self.write_bytes(&mut state, address, data)
    }

    fn disassemble(&self, address: Address, count: usize) -> Result<Vec<Instruction>, Error> {
        let code = {
            let state = self.state();
            let (base, bytes) = state
                .memory
                .iter()
                .find(|(base, bytes)| address >= *base && address < *base + bytes.len() as u64)
                .ok_or(Error::InvalidAddress(address))?;
            let offset = (address - base) as usize;
            let end = bytes.len().min(offset + count * MAX_INSN_LEN);
            bytes[offset..end].to_vec()
        };
        self.disasm.disasm(&code, address, count)
    }

    fn execute_command(&self, command: &str) -> Result<String, Error> {
        let mut state = self.state();
        if state.connection_lost {
            return Err(Error::ConnectionLost("debugee connection closed".to_string()));
        }
        state.commands.push(command.to_string());

        let mut words = command.split_whitespace();
        match (words.next(), words.next()) {
            (Some("target"), Some("create")) => {
                Ok(format!("Current executable set to '{}'.", self.target.program))
            }
            (Some("process"), Some("launch")) | (Some("run"), None) => {
                let process = self.start_process(&mut state, LAUNCH_PID, self.target.program.clone());
                Ok(format!("Process {} launched", process.pid))
            }
            (Some("process"), Some("attach")) => {
                let pid = words
                    .skip_while(|w| *w != "--pid" && *w != "-p")
                    .nth(1)
                    .and_then(|pid| pid.parse::<u32>().ok())
                    .ok_or_else(|| Error::Backend(format!("invalid attach command: {command}")))?;
                let process = self
                    .target
                    .processes
                    .iter()
                    .find(|p| p.pid == pid)
                    .ok_or_else(|| Error::ProcessNotFound(pid.to_string()))?;
                let process = self.start_process(&mut state, process.pid, process.name.clone());
                Ok(format!("Process {} stopped", process.pid))
            }
            _ => self
                .target
                .commands
                .get(command)
                .cloned()
                .ok_or_else(|| Error::Backend(format!("'{command}' is not a valid command."))),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::debugger::backend::{Language, TypeKind};
    use std::sync::mpsc;

    fn int_type() -> NativeType {
        NativeType {
            name: "int".to_string(),
            size: 4,
            language: Language::C,
            kind: TypeKind::Int { signed: true },
            template_args: vec![],
        }
    }

    fn loop_target() -> ModelTarget {
        let mut target = ModelTarget::new("loop");
        let int = target.add_type(int_type());
        target.add_code(0x1000, 0x100, 0x90);
        target.add_segment(0x8000, 0i32.to_le_bytes());
        target.modules.push(ModelModule {
            name: "loop".to_string(),
            path: "/bin/loop".to_string(),
            files: vec![ModelFile {
                path: "src/main.c".to_string(),
                lines: vec![
                    LineRow { address: 0x1000, line: 3, column: 0 },
                    LineRow { address: 0x1004, line: 5, column: 0 },
                    LineRow { address: 0x1008, line: 6, column: 0 },
                ],
            }],
            functions: vec![ModelFunction {
                name: "main".to_string(),
                start: 0x1000,
                end: 0x1010,
                variables: vec![ModelVariable {
                    name: "i".to_string(),
                    type_id: int,
                    address: 0x8000,
                }],
            }],
            ..Default::default()
        });
        for i in 0..3i32 {
            target
                .trace
                .push(TraceStep::at(0x1004).with_write(0x8000, i.to_le_bytes()));
            target.trace.push(TraceStep::at(0x1008));
        }
        target
    }

    fn launched(target: ModelTarget) -> (ModelBackend, mpsc::Receiver<BackendEvent>) {
        let backend = ModelBackend::new(target);
        let (tx, rx) = mpsc::channel();
        backend.subscribe(tx);
        backend
            .launch(&LaunchRequest {
                program: "/bin/loop".into(),
                ..Default::default()
            })
            .unwrap();
        (backend, rx)
    }

    #[test]
    fn test_run_to_breakpoint() {
        let (backend, rx) = launched(loop_target());
        backend.set_breakpoint(0x1004).unwrap();

        for expected in 0..3i32 {
            backend.resume().unwrap();
            let event = rx.try_recv().unwrap();
            assert!(matches!(
                event,
                BackendEvent::Stopped { reason: StopReason::Breakpoint { address: 0x1004 }, .. }
            ));
            let i = backend.read_memory(0x8000, 4).unwrap();
            assert_eq!(i.as_ref(), expected.to_le_bytes());
        }

        backend.resume().unwrap();
        assert!(matches!(rx.try_recv().unwrap(), BackendEvent::Exited { code: Some(0) }));
        assert!(backend.process().is_none());
    }

    #[test]
    fn test_line_table() {
        struct TestCase {
            line: u32,
            expected: Vec<LineLocation>,
        }
        let test_cases = vec![
            TestCase {
                line: 5,
                expected: vec![LineLocation { address: 0x1004, line: 5 }],
            },
            TestCase {
                line: 4,
                expected: vec![LineLocation { address: 0x1004, line: 5 }],
            },
            TestCase {
                line: 7,
                expected: vec![],
            },
        ];

        let backend = ModelBackend::new(loop_target());
        let file = SourceFile {
            module: "loop".to_string(),
            path: "src/main.c".to_string(),
        };
        for tc in test_cases {
            assert_eq!(backend.line_locations(&file, tc.line), tc.expected);
        }

        let line = backend.line_at(0x1006).unwrap();
        assert_eq!(line.line, 5);
        assert!(backend.line_at(0x2000).is_none());
    }

    #[test]
    fn test_frames_and_locals() {
        let (backend, _rx) = launched(loop_target());
        backend.step(ThreadId(1), StepKind::Over).unwrap();

        let frames = backend.frames(ThreadId(1)).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].function.as_deref(), Some("main"));
        assert_eq!(frames[0].line.as_ref().map(|l| l.line), Some(5));

        let frame = FrameId { thread: ThreadId(1), depth: 0 };
        let locals = backend.locals(frame).unwrap();
        assert_eq!(locals.len(), 1);
        assert_eq!(locals[0].address(), Some(0x8000));
        assert!(backend.frames(ThreadId(7)).is_err());
    }

    #[test]
    fn test_find_variable() {
        let mut target = loop_target();
        let int = TypeId(0);
        target.add_segment(0x8100, 7i32.to_le_bytes());
        target.modules[0].statics.push(ModelVariable {
            name: "counter".to_string(),
            type_id: int,
            address: 0x8100,
        });
        let (backend, _rx) = launched(target);
        backend.step(ThreadId(1), StepKind::Over).unwrap();
        let frame = FrameId { thread: ThreadId(1), depth: 0 };

        let local = backend.find_variable(frame, "i").unwrap().unwrap();
        assert_eq!(local.address(), Some(0x8000));
        let global = backend.find_variable(frame, "counter").unwrap().unwrap();
        assert_eq!(global.address(), Some(0x8100));
        assert!(backend.find_variable(frame, "missing").unwrap().is_none());
    }

    #[test]
    fn test_expected_env() {
        let mut target = loop_target();
        target.expect_env.insert("FOO".to_string(), "foo".to_string());
        let (backend, rx) = launched(target);
        backend.resume().unwrap();
        assert!(matches!(rx.try_recv().unwrap(), BackendEvent::Exited { code: Some(1) }));
    }

    #[test]
    fn test_commands() {
        let mut target = loop_target();
        target
            .commands
            .insert("settings show".to_string(), "ok".to_string());
        let backend = ModelBackend::new(target);
        assert!(backend.process().is_none());
        backend.execute_command("target create /bin/loop").unwrap();
        backend.execute_command("process launch").unwrap();
        assert_eq!(backend.execute_command("settings show").unwrap(), "ok");
        assert!(backend.execute_command("frobnicate").is_err());
        assert_eq!(backend.process().map(|p| p.pid), Some(LAUNCH_PID));
        assert_eq!(backend.executed_commands().len(), 4);
    }
}
