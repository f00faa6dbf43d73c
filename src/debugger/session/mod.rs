//! Debug session engine.
//!
//! A [`Session`] is owned by a single control thread. Client requests, backend
//! notifications and log records reach that thread through one ordered channel
//! (see [`Incoming`]); the session answers a request synchronously and queues the events
//! it produces, the server writes the response first and the queued events after it.

mod breakpoints;
mod execution;
pub mod handles;
mod inspect;
pub mod launch;
pub mod state;

use crate::config::AdapterSettings;
use crate::debugger::backend::{
    Address, Backend, BackendEvent, FrameId, FrameInfo, OutputCategory, ProcessInfo, ThreadId,
};
use crate::debugger::breakpoint::{BreakpointManager, BreakpointMode};
use crate::debugger::disasm::Synthesizer;
use crate::debugger::expression::script::{NoScript, ScriptHost};
use crate::debugger::pathmap::PathMapper;
use crate::debugger::variable::Container;
use crate::debugger::webview::WebviewBridge;
use crate::debugger::Error;
use handles::{HandleArena, Lookup};
use indexmap::IndexMap;
use launch::{LaunchConfig, LaunchKind};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
pub use state::SessionState;
use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Client request, as received from the wire.
#[derive(Clone, Debug)]
pub struct Request {
    pub seq: i64,
    pub command: String,
    pub arguments: Value,
}

/// Message of the session control channel.
#[derive(Debug)]
pub enum Incoming {
    Request(Request),
    Backend(BackendEvent),
    /// Log record mirrored into the client console.
    Log(String),
    /// Client connection is closed.
    ClientGone,
}

/// Event queued for the client.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub event: &'static str,
    pub body: Option<Value>,
}

pub(crate) enum Waited {
    Message(Incoming),
    Timeout,
    Closed,
}

/// Receiving end of the control channel.
///
/// A request that must wait for the one in progress (a long attach) is deferred
/// and delivered again after it.
pub struct Inbox {
    rx: Receiver<Incoming>,
    deferred: VecDeque<Incoming>,
}

impl Inbox {
    pub fn new(rx: Receiver<Incoming>) -> Self {
        Self {
            rx,
            deferred: VecDeque::new(),
        }
    }

    /// Next message, deferred ones first, `None` if every sender is gone.
    pub fn next(&mut self) -> Option<Incoming> {
        if let Some(message) = self.deferred.pop_front() {
            return Some(message);
        }
        self.rx.recv().ok()
    }

    pub(crate) fn wait(&mut self, timeout: Duration) -> Waited {
        match self.rx.recv_timeout(timeout) {
            Ok(message) => Waited::Message(message),
            Err(RecvTimeoutError::Timeout) => Waited::Timeout,
            Err(RecvTimeoutError::Disconnected) => Waited::Closed,
        }
    }

    pub(crate) fn defer(&mut self, message: Incoming) {
        self.deferred.push_back(message);
    }
}

/// Stack frame behind a frame reference.
#[derive(Clone, Copy, Debug)]
struct FrameRef {
    frame: FrameId,
    /// Frame restored by the frame pointer unwinder, the backend knows nothing about it.
    unwound: bool,
}

/// Expandable set of values behind a variables reference.
#[derive(Clone, Debug)]
enum VarsRef {
    Locals(FrameId),
    Statics(FrameId),
    Registers(FrameId),
    Container(Container),
}

/// Stack of a stopped thread.
struct Stack {
    frames: Vec<FrameInfo>,
    /// Frames were restored by the frame pointer unwinder.
    unwound: bool,
}

pub struct Session {
    backend: Arc<dyn Backend>,
    settings: AdapterSettings,
    state: SessionState,
    kind: Option<LaunchKind>,
    config: LaunchConfig,
    configuration_done: bool,
    process: Option<ProcessInfo>,
    mapper: PathMapper,
    breakpoints: BreakpointManager,
    synthesizer: Synthesizer,
    frames: HandleArena<FrameRef>,
    variables: HandleArena<VarsRef>,
    stacks: HashMap<ThreadId, Stack>,
    stopped_thread: Option<ThreadId>,
    script: Arc<Mutex<Box<dyn ScriptHost>>>,
    webviews: WebviewBridge,
    /// Frame of an evaluation in progress, script callbacks read variables from it.
    eval_frame: Option<FrameId>,
    events: Vec<Event>,
    disconnected: bool,
}

impl Session {
    pub fn new(backend: Arc<dyn Backend>, settings: AdapterSettings) -> Self {
        Self {
            backend,
            settings,
            state: SessionState::Idle,
            kind: None,
            config: LaunchConfig::default(),
            configuration_done: false,
            process: None,
            mapper: PathMapper::new(&IndexMap::new(), None),
            breakpoints: BreakpointManager::new(BreakpointMode::default()),
            synthesizer: Synthesizer::default(),
            frames: HandleArena::default(),
            variables: HandleArena::default(),
            stacks: HashMap::new(),
            stopped_thread: None,
            script: Arc::new(Mutex::new(Box::new(NoScript))),
            webviews: WebviewBridge::default(),
            eval_frame: None,
            events: vec![],
            disconnected: false,
        }
    }

    pub fn with_script_host(mut self, host: Box<dyn ScriptHost>) -> Self {
        self.script = Arc::new(Mutex::new(host));
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// True after a `disconnect` request, the session must not be used anymore.
    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    /// Events produced since the last call.
    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    /// Handle a client request, return a response body.
    pub fn handle(&mut self, request: &Request, inbox: &mut Inbox) -> Result<Option<Value>, Error> {
        log::debug!(target: "session", "{}: {}", request.seq, request.command);
        let result = self.dispatch(request, inbox);
        match result {
            Err(ref e) if e.is_fatal() => {
                log::error!(target: "session", "{}: {e}", request.command);
                self.connection_lost(&e.to_string());
            }
            Err(ref e) => log::debug!(target: "session", "{} failed: {e}", request.command),
            Ok(_) => {}
        }
        result
    }

    fn dispatch(&mut self, request: &Request, inbox: &mut Inbox) -> Result<Option<Value>, Error> {
        let args = &request.arguments;
        match request.command.as_str() {
            "initialize" => self.initialize().map(Some),
            "launch" => self.launch(arguments(args)?).map(|_| None),
            "attach" => self.attach(arguments(args)?, inbox).map(|_| None),
            "configurationDone" => self.configuration_done().map(|_| None),
            "disconnect" => self.disconnect(arguments(args)?).map(|_| None),
            "terminate" => self.terminate().map(|_| None),

            "setBreakpoints" => self.set_breakpoints(arguments(args)?).map(Some),
            "setFunctionBreakpoints" => self.set_function_breakpoints(arguments(args)?).map(Some),
            "setExceptionBreakpoints" => {
                self.set_exception_breakpoints(arguments(args)?).map(Some)
            }
            "setInstructionBreakpoints" => {
                self.set_instruction_breakpoints(arguments(args)?).map(Some)
            }

            "threads" => self.threads().map(Some),
            "continue" => self.resume_request("continue").map(Some),
            "next" => self.step(arguments(args)?, StepRequest::Next).map(|_| None),
            "stepIn" => self.step(arguments(args)?, StepRequest::StepIn).map(|_| None),
            "stepOut" => self.step(arguments(args)?, StepRequest::StepOut).map(|_| None),
            "pause" => self.pause().map(|_| None),

            "stackTrace" => self.stack_trace(arguments(args)?).map(Some),
            "scopes" => self.scopes(arguments(args)?).map(Some),
            "variables" => self.variables(arguments(args)?).map(Some),
            "evaluate" => self.evaluate(arguments(args)?).map(Some),
            "setVariable" => self.set_variable(arguments(args)?).map(Some),
            "source" => self.source(arguments(args)?).map(Some),
            "readMemory" => self.read_memory(arguments(args)?).map(Some),
            "writeMemory" => self.write_memory(arguments(args)?).map(Some),

            "_command" => self.command(arguments(args)?).map(Some),
            "_webviewMessage" => self.webview_message(arguments(args)?).map(|_| None),
            "_adapterSettings" => self.adapter_settings(args).map(|_| None),

            other => Err(Error::UnsupportedRequest(other.to_string())),
        }
    }

    fn initialize(&mut self) -> Result<Value, Error> {
        let filters: Vec<Value> = crate::debugger::breakpoint::ExceptionFilter::ALL
            .iter()
            .map(|filter| {
                json!({
                    "filter": filter.to_string(),
                    "label": filter.label(),
                    "default": filter.default_enabled(),
                })
            })
            .collect();
        self.emit("initialized", None);
        Ok(json!({
            "supportsConfigurationDoneRequest": true,
            "supportsFunctionBreakpoints": true,
            "supportsConditionalBreakpoints": true,
            "supportsHitConditionalBreakpoints": true,
            "supportsLogPoints": true,
            "supportsInstructionBreakpoints": true,
            "supportsEvaluateForHovers": true,
            "supportsSetVariable": true,
            "supportsReadMemoryRequest": true,
            "supportsWriteMemoryRequest": true,
            "supportsTerminateRequest": true,
            "supportsDelayedStackTraceLoading": true,
            "exceptionBreakpointFilters": filters,
        }))
    }

    // --------------------------------- backend notifications -------------------------------------

    /// Handle an asynchronous backend notification.
    pub fn on_backend_event(&mut self, event: BackendEvent) {
        log::debug!(target: "session", "backend event: {event:?}");
        match event {
            BackendEvent::Stopped { thread, reason } => self.on_stop(thread, reason),
            BackendEvent::Exited { code } => self.on_exit(code),
            BackendEvent::ModuleLoaded(module) => {
                self.emit_module("new", &module);
                self.resolve_breakpoints();
            }
            BackendEvent::ModuleUnloaded(module) => {
                self.emit_module("removed", &module);
                self.resolve_breakpoints();
            }
            BackendEvent::Output { category, text } => self.output(category, text),
            BackendEvent::ConnectionLost(reason) => self.connection_lost(&reason),
        }
    }

    /// Mirror a log record into the client console.
    pub fn log_output(&mut self, text: String) {
        self.output(OutputCategory::Console, text);
    }

    fn on_exit(&mut self, code: Option<i32>) {
        if !self.state.has_process() {
            log::debug!(target: "session", "exit ignored in state {}", self.state);
            return;
        }
        log::info!(target: "session", "debugee exited with code {code:?}");
        self.invalidate_handles();
        self.process = None;
        self.state = SessionState::Exited;
        self.emit("exited", Some(json!({ "exitCode": code.unwrap_or(-1) })));
        self.emit("terminated", None);
    }

    fn connection_lost(&mut self, reason: &str) {
        if self.state == SessionState::Terminated {
            return;
        }
        log::error!(target: "session", "backend connection lost: {reason}");
        self.output(
            OutputCategory::Stderr,
            format!("Debugger connection lost: {reason}\n"),
        );
        self.invalidate_handles();
        self.process = None;
        self.state = SessionState::Terminated;
        self.emit("terminated", None);
    }

    fn emit_module(&mut self, reason: &'static str, module: &crate::debugger::backend::Module) {
        self.emit(
            "module",
            Some(json!({
                "reason": reason,
                "module": {
                    "id": module.name,
                    "name": module.name,
                    "path": module.path,
                    "addressRange": format!("{:#x}", module.base),
                },
            })),
        );
    }

    // --------------------------------- helpers ---------------------------------------------------

    fn emit(&mut self, event: &'static str, body: Option<Value>) {
        self.events.push(Event { event, body });
    }

    fn output(&mut self, category: OutputCategory, text: impl Into<String>) {
        self.emit(
            "output",
            Some(json!({
                "category": category.to_string(),
                "output": text.into(),
            })),
        );
    }

    fn expect_state(&self, request: &'static str, allowed: &[SessionState]) -> Result<(), Error> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::WrongState(request, self.state.into()))
        }
    }

    /// Forget everything minted during the current stop.
    fn invalidate_handles(&mut self) {
        self.frames.invalidate();
        self.variables.invalidate();
        self.stacks.clear();
        self.stopped_thread = None;
    }

    fn frame_ref(&self, handle: i64) -> Result<FrameRef, Error> {
        self.frames.get(handle).copied().map_err(|lookup| match lookup {
            Lookup::Stale => Error::StaleFrame(handle),
            Lookup::Unknown => Error::UnknownFrame(handle),
        })
    }

    fn vars_ref(&self, handle: i64) -> Result<VarsRef, Error> {
        self.variables.get(handle).cloned().map_err(|lookup| match lookup {
            Lookup::Stale => Error::StaleVariables(handle),
            Lookup::Unknown => Error::UnknownVariables(handle),
        })
    }
}

/// Stepping request kind.
#[derive(Clone, Copy, Debug, PartialEq)]
enum StepRequest {
    Next,
    StepIn,
    StepOut,
}

/// Deserialize request arguments, absent arguments are an empty object.
fn arguments<T: DeserializeOwned>(args: &Value) -> Result<T, Error> {
    let args = if args.is_null() {
        Value::Object(Default::default())
    } else {
        args.clone()
    };
    Ok(serde_json::from_value(args)?)
}

/// Parse a memory reference (`0x7ffc0010` or decimal).
fn parse_address(reference: &str) -> Result<Address, Error> {
    let reference = reference.trim();
    let parsed = match reference
        .strip_prefix("0x")
        .or_else(|| reference.strip_prefix("0X"))
    {
        Some(hex) => Address::from_str_radix(hex, 16),
        None => reference.parse::<Address>(),
    };
    parsed.map_err(|_| {
        Error::UnsupportedOperation(format!("invalid memory reference `{reference}`"))
    })
}
