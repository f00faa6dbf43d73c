//! Stack, scopes, variables and memory inspection of a stopped debugee.

use super::{parse_address, FrameRef, Session, SessionState, Stack, VarsRef};
use crate::config::ConsoleMode;
use crate::debugger::backend::{Address, Backend, FrameId, FrameInfo, OutputCategory, ThreadId};
use crate::debugger::disasm::ShowDisassembly;
use crate::debugger::expression::{EvalContext, Expression};
use crate::debugger::pathmap::file_name;
use crate::debugger::unwind;
use crate::debugger::variable::{Container, Formatter, TypedValue, ValueNode};
use crate::debugger::Error;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct StackTraceArguments {
    thread_id: u64,
    #[serde(default)]
    start_frame: Option<usize>,
    #[serde(default)]
    levels: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ScopesArguments {
    frame_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct VariablesArguments {
    variables_reference: i64,
    #[serde(default)]
    filter: Option<String>,
    #[serde(default)]
    start: Option<usize>,
    #[serde(default)]
    count: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct EvaluateArguments {
    expression: String,
    #[serde(default)]
    frame_id: Option<i64>,
    #[serde(default)]
    context: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct SetVariableArguments {
    variables_reference: i64,
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct SourceArguments {
    #[serde(default)]
    source_reference: Option<i64>,
    #[serde(default)]
    source: Option<SourceRef>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct SourceRef {
    #[serde(default)]
    source_reference: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ReadMemoryArguments {
    memory_reference: String,
    #[serde(default)]
    offset: i64,
    count: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct WriteMemoryArguments {
    memory_reference: String,
    #[serde(default)]
    offset: i64,
    data: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct CommandArguments {
    command: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct WebviewMessageArguments {
    id: String,
    #[serde(default)]
    message: Value,
}

/// Console input after console mode is applied.
#[derive(Debug, PartialEq)]
enum ConsoleInput<'a> {
    Expression(&'a str),
    Command(&'a str),
}

fn console_input(mode: ConsoleMode, text: &str) -> ConsoleInput<'_> {
    match mode {
        ConsoleMode::Commands => match text.strip_prefix('?') {
            Some(expr) => ConsoleInput::Expression(expr),
            None => ConsoleInput::Command(text),
        },
        ConsoleMode::Evaluate => match text.strip_prefix("/cmd ") {
            Some(command) => ConsoleInput::Command(command),
            None => ConsoleInput::Expression(text),
        },
    }
}

/// Longest readable prefix of `[address, address + count)`.
fn read_prefix(backend: &dyn Backend, address: Address, count: usize) -> Result<Bytes, Error> {
    match backend.read_memory(address, count) {
        Ok(bytes) => return Ok(bytes),
        Err(Error::InvalidAddress(_)) => {}
        Err(e) => return Err(e),
    }
    // `lo` bytes are readable, `hi` bytes are not
    let (mut lo, mut hi) = (0, count);
    while hi - lo > 1 {
        let mid = lo + (hi - lo) / 2;
        if backend.read_memory(address, mid).is_ok() {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    if lo == 0 {
        return Ok(Bytes::new());
    }
    backend.read_memory(address, lo)
}

impl Session {
    /// Stack of a thread, the frame pointer chain is used when the backend can't unwind.
    fn load_stack(&self, thread: ThreadId) -> Result<Stack, Error> {
        let backend = self.backend.as_ref();
        let frames = backend.frames(thread)?;
        if unwind::needs_fallback(backend, &frames) {
            match backend.registers(FrameId { thread, depth: 0 }) {
                Ok(regs) => {
                    let unwound = unwind::unwind(backend, &regs);
                    if unwound.len() > frames.len().max(1) {
                        log::debug!(
                            target: "session",
                            "thread {thread}: {} frame(s) restored by frame pointers",
                            unwound.len()
                        );
                        return Ok(Stack {
                            frames: unwound,
                            unwound: true,
                        });
                    }
                }
                Err(e) => log::debug!(target: "session", "thread {thread} registers: {e}"),
            }
        }
        Ok(Stack {
            frames,
            unwound: false,
        })
    }

    pub(super) fn stack_trace(&mut self, args: StackTraceArguments) -> Result<Value, Error> {
        self.expect_state("stackTrace", &[SessionState::Stopped])?;
        let thread = ThreadId(args.thread_id);
        if !self.stacks.contains_key(&thread) {
            let stack = self.load_stack(thread)?;
            self.stacks.insert(thread, stack);
        }
        let (frames, unwound) = match self.stacks.get(&thread) {
            Some(stack) => (stack.frames.clone(), stack.unwound),
            None => (vec![], false),
        };

        let levels = args.levels.filter(|l| *l > 0).unwrap_or(usize::MAX);
        let stack_frames: Vec<Value> = frames
            .iter()
            .enumerate()
            .skip(args.start_frame.unwrap_or(0))
            .take(levels)
            .map(|(depth, info)| self.frame_json(thread, depth as u32, info, unwound))
            .collect();

        Ok(json!({
            "stackFrames": stack_frames,
            "totalFrames": frames.len(),
        }))
    }

    fn frame_json(&mut self, thread: ThreadId, depth: u32, info: &FrameInfo, unwound: bool) -> Value {
        let id = self.frames.insert(FrameRef {
            frame: FrameId { thread, depth },
            // the top frame is a real one, callers come from the frame pointer chain
            unwound: unwound && depth > 0,
        });
        let mut frame = json!({
            "id": id,
            "name": info.function.clone().unwrap_or_else(|| format!("{:#x}", info.pc)),
            "line": 0,
            "column": 0,
            "instructionPointerReference": format!("{:#x}", info.pc),
        });
        if let Some(ref module) = info.module {
            frame["moduleId"] = json!(module);
        }

        let mode = self.settings.show_disassembly;
        let local_source = info
            .line
            .as_ref()
            .filter(|_| mode != ShowDisassembly::Always)
            .and_then(|line| self.mapper.to_local(&line.path).map(|path| (path, line)));

        if let Some((path, line)) = local_source {
            frame["source"] = json!({ "name": file_name(&path), "path": path });
            frame["line"] = json!(line.line);
            frame["column"] = json!(line.column);
            return frame;
        }

        if mode == ShowDisassembly::Never {
            frame["presentationHint"] = json!("subtle");
            return frame;
        }

        match self.synthesizer.locate(self.backend.as_ref(), info.pc) {
            Ok((reference, line)) => {
                let name = self
                    .synthesizer
                    .get(reference)
                    .map(|doc| doc.name.clone())
                    .unwrap_or_default();
                frame["source"] = json!({
                    "name": name,
                    "sourceReference": reference,
                    "presentationHint": "deemphasize",
                });
                frame["line"] = json!(line);
                frame["column"] = json!(1);
            }
            Err(e) => {
                log::debug!(target: "session", "no disassembly at {:#x}: {e}", info.pc);
                frame["presentationHint"] = json!("subtle");
            }
        }
        frame
    }

    pub(super) fn scopes(&mut self, args: ScopesArguments) -> Result<Value, Error> {
        let frame = self.frame_ref(args.frame_id)?;
        if frame.unwound {
            return Ok(json!({ "scopes": [] }));
        }

        let locals = self.variables.insert(VarsRef::Locals(frame.frame));
        let statics = self.variables.insert(VarsRef::Statics(frame.frame));
        let registers = self.variables.insert(VarsRef::Registers(frame.frame));
        Ok(json!({
            "scopes": [
                {
                    "name": "Local",
                    "presentationHint": "locals",
                    "variablesReference": locals,
                    "expensive": false,
                },
                {
                    "name": "Static",
                    "variablesReference": statics,
                    "expensive": false,
                },
                {
                    "name": "Registers",
                    "presentationHint": "registers",
                    "variablesReference": registers,
                    "expensive": true,
                },
            ]
        }))
    }

    /// Render a node, an expandable node gets a fresh variables reference.
    fn node_json(&mut self, node: ValueNode, value_key: &str) -> Value {
        let mut var = json!({
            "name": node.name,
            "variablesReference": 0,
        });
        var[value_key] = json!(node.summary);
        if let Some(type_name) = node.type_name {
            var["type"] = json!(type_name);
        }
        if let Some(address) = node.memory_reference {
            var["memoryReference"] = json!(format!("{address:#x}"));
        }
        if let Some(container) = node.children {
            let len = container.len();
            let count_key = if container.is_indexed() {
                "indexedVariables"
            } else {
                "namedVariables"
            };
            var["variablesReference"] = json!(self.variables.insert(VarsRef::Container(container)));
            var[count_key] = json!(len);
        }
        var
    }

    pub(super) fn variables(&mut self, args: VariablesArguments) -> Result<Value, Error> {
        let vars = self.vars_ref(args.variables_reference)?;
        let backend = self.backend.clone();
        let options = self.settings.format_options();
        let formatter = Formatter::new(backend.as_ref(), &options);

        let start = args.start.unwrap_or(0);
        let count = args.count.filter(|c| *c > 0).unwrap_or(usize::MAX);
        let page = |values: Vec<TypedValue>| -> Vec<ValueNode> {
            values
                .iter()
                .skip(start)
                .take(count)
                .map(|value| formatter.node(value))
                .collect()
        };

        let nodes = match vars {
            VarsRef::Locals(frame) => {
                page(backend.locals(frame)?.into_iter().map(Into::into).collect())
            }
            VarsRef::Statics(frame) => {
                page(backend.statics(frame)?.into_iter().map(Into::into).collect())
            }
            VarsRef::Registers(frame) => {
                let regs = backend.registers(frame)?;
                formatter.children(&Container::Registers(regs.all), start, args.count)?
            }
            VarsRef::Container(container) => {
                let indexed = container.is_indexed();
                match args.filter.as_deref() {
                    Some("named") if indexed => vec![],
                    Some("indexed") if !indexed => vec![],
                    _ => formatter.children(&container, start, args.count)?,
                }
            }
        };

        let variables: Vec<Value> = nodes
            .into_iter()
            .map(|node| self.node_json(node, "value"))
            .collect();
        Ok(json!({ "variables": variables }))
    }

    pub(super) fn evaluate(&mut self, args: EvaluateArguments) -> Result<Value, Error> {
        let frame = match args.frame_id {
            Some(handle) => Some(self.frame_ref(handle)?.frame),
            None => self.stopped_thread.map(|thread| FrameId { thread, depth: 0 }),
        };

        let context = EvalContext::from_dap(args.context.as_deref());
        let mut text = args.expression.as_str();
        if context == EvalContext::Repl {
            match console_input(self.settings.console_mode, text) {
                ConsoleInput::Command(command) => {
                    let output = self.backend.execute_command(command)?;
                    return Ok(json!({ "result": output, "variablesReference": 0 }));
                }
                ConsoleInput::Expression(expr) => text = expr,
            }
        }

        let expression = Expression::parse(text, self.settings.expressions)?;
        let evaluated = self.evaluate_expression(&expression, frame)?;

        let backend = self.backend.clone();
        let mut options = self.settings.format_options();
        if context == EvalContext::Clipboard {
            options = options.unabridged();
        }
        let formatter = Formatter::new(backend.as_ref(), &options);
        let node = evaluated.into_node(&formatter, text.trim(), expression.directive)?;
        Ok(self.node_json(node, "result"))
    }

    pub(super) fn set_variable(&mut self, args: SetVariableArguments) -> Result<Value, Error> {
        let vars = self.vars_ref(args.variables_reference)?;
        let backend = self.backend.clone();
        let options = self.settings.format_options();
        let formatter = Formatter::new(backend.as_ref(), &options);

        let by_name = |values: Vec<crate::debugger::backend::NativeValue>| {
            values
                .into_iter()
                .find(|v| v.name == args.name)
                .map(TypedValue::from)
        };
        let target = match vars {
            VarsRef::Locals(frame) => by_name(backend.locals(frame)?),
            VarsRef::Statics(frame) => by_name(backend.statics(frame)?),
            VarsRef::Registers(_) => return Err(Error::NotAssignable(args.name.clone())),
            VarsRef::Container(container) => formatter.child(&container, &args.name)?,
        }
        .ok_or_else(|| Error::VariableNotFound(args.name.clone()))?;

        formatter.assign(&target, &args.value)?;
        let node = formatter.node(&target);
        let mut body = self.node_json(node, "value");
        if let Some(body) = body.as_object_mut() {
            body.remove("name");
        }
        Ok(body)
    }

    pub(super) fn source(&mut self, args: SourceArguments) -> Result<Value, Error> {
        let reference = args
            .source
            .and_then(|source| source.source_reference)
            .or(args.source_reference)
            .filter(|r| *r > 0)
            .ok_or(Error::MissingArgument("sourceReference"))?;
        let content = self.synthesizer.text(reference)?;
        Ok(json!({ "content": content, "mimeType": "text/x-asm" }))
    }

    pub(super) fn read_memory(&mut self, args: ReadMemoryArguments) -> Result<Value, Error> {
        let address = parse_address(&args.memory_reference)?.wrapping_add_signed(args.offset);
        let bytes = read_prefix(self.backend.as_ref(), address, args.count)?;
        let mut body = json!({
            "address": format!("{address:#x}"),
            "data": BASE64.encode(&bytes),
        });
        if bytes.len() < args.count {
            body["unreadableBytes"] = json!(args.count - bytes.len());
        }
        Ok(body)
    }

    pub(super) fn write_memory(&mut self, args: WriteMemoryArguments) -> Result<Value, Error> {
        let address = parse_address(&args.memory_reference)?.wrapping_add_signed(args.offset);
        let data = BASE64
            .decode(args.data.trim())
            .map_err(|e| Error::UnsupportedOperation(format!("invalid base64 data: {e}")))?;
        self.backend.write_memory(address, &data)?;
        self.emit("invalidated", Some(json!({ "areas": ["variables"] })));
        Ok(json!({ "bytesWritten": data.len() }))
    }

    pub(super) fn command(&mut self, args: CommandArguments) -> Result<Value, Error> {
        let output = self.backend.execute_command(&args.command)?;
        Ok(json!({ "output": output }))
    }

    pub(super) fn webview_message(&mut self, args: WebviewMessageArguments) -> Result<(), Error> {
        self.webviews.deliver(&args.id, args.message)
    }

    /// Adjust session settings, a path map change resolves breakpoints again.
    pub(super) fn adapter_settings(&mut self, patch: &Value) -> Result<(), Error> {
        let mut patch = patch.clone();
        let (source_map, relative_base) = match patch.as_object_mut() {
            Some(map) => (map.remove("sourceMap"), map.remove("relativePathBase")),
            None => (None, None),
        };

        let mut settings = self.settings.clone();
        settings.merge_json(&patch)?;
        let source_map: Option<IndexMap<String, Option<String>>> =
            source_map.map(serde_json::from_value).transpose()?;
        let relative_base: Option<Option<String>> =
            relative_base.map(serde_json::from_value).transpose()?;

        self.settings = settings;
        if source_map.is_none() && relative_base.is_none() {
            return Ok(());
        }
        if let Some(source_map) = source_map {
            self.config.source_map = source_map;
        }
        if let Some(relative_base) = relative_base {
            self.config.relative_path_base = relative_base;
        }
        self.mapper = self.config.path_mapper();
        self.stacks.clear();
        log::info!(target: "session", "path map changed, resolve breakpoints");
        self.resolve_breakpoints();
        self.output(OutputCategory::Console, "Source map updated\n");
        Ok(())
    }
}
