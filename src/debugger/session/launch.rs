//! Launch and attach configuration, session startup and teardown.

use super::{Inbox, Incoming, Session, SessionState, Waited};
use crate::config::{AdapterSettings, ConsoleMode};
use crate::debugger::backend::{LaunchRequest, OutputCategory, ProcessInfo};
use crate::debugger::breakpoint::BreakpointMode;
use crate::debugger::disasm::ShowDisassembly;
use crate::debugger::expression::EvaluatorKind;
use crate::debugger::pathmap::{file_name, PathMapper};
use crate::debugger::Error;
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LaunchKind {
    Launch,
    Attach,
}

/// Arguments of `launch` and `attach` requests.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LaunchConfig {
    /// Program to launch, or a process name to attach to.
    pub program: Option<String>,
    pub args: Vec<String>,
    /// Environment overrides, win over `envFile` entries.
    pub env: IndexMap<String, String>,
    pub env_file: Option<String>,
    pub cwd: Option<String>,
    #[serde(deserialize_with = "deserialize_pid")]
    pub pid: Option<u32>,
    /// Wait for a process named `program` to appear.
    pub wait_for: bool,
    pub stop_on_entry: bool,
    /// Debug information path prefix to local path prefix, `null` suppresses a source.
    pub source_map: IndexMap<String, Option<String>>,
    pub relative_path_base: Option<String>,
    pub breakpoint_mode: BreakpointMode,
    pub expressions: Option<EvaluatorKind>,
    pub show_disassembly: Option<ShowDisassembly>,
    pub console_mode: Option<ConsoleMode>,
    pub terminate_debuggee: Option<bool>,
    pub init_commands: Vec<String>,
    pub pre_run_commands: Vec<String>,
    pub post_run_commands: Vec<String>,
    pub exit_commands: Vec<String>,
    /// Replace the default target creation.
    pub target_create_commands: Vec<String>,
    /// Replace the default process launch (or attach).
    pub process_create_commands: Vec<String>,
}

/// Pid as a number or as a numeric string (`"${command:pickProcess}"` expands to a string).
fn deserialize_pid<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u32>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Pid {
        Number(u32),
        Text(String),
    }

    match Option::<Pid>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Pid::Number(pid)) => Ok(Some(pid)),
        Some(Pid::Text(text)) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid pid `{text}`"))),
    }
}

/// Process an attach request targets.
#[derive(Clone, Debug, PartialEq)]
pub enum AttachTarget {
    Pid(u32),
    Name { name: String, wait_for: bool },
    /// `processCreateCommands` do the attach.
    Commands,
}

impl LaunchConfig {
    /// Program of a launch request, `None` if custom commands create the process.
    pub fn launch_program(&self) -> Result<Option<PathBuf>, Error> {
        if self.pid.is_some() {
            return Err(Error::InvalidConfig(
                "`pid` is an attach argument, use an attach request".to_string(),
            ));
        }
        match self.program {
            Some(ref program) => Ok(Some(resolve_program(program, self.cwd.as_deref()))),
            None if !self.process_create_commands.is_empty() => Ok(None),
            None => Err(Error::MissingArgument("program")),
        }
    }

    pub fn attach_target(&self) -> Result<AttachTarget, Error> {
        match (self.pid, self.program.as_ref()) {
            (Some(_), Some(_)) => Err(Error::InvalidConfig(
                "exactly one of `pid` and `program` expected".to_string(),
            )),
            (Some(pid), None) => Ok(AttachTarget::Pid(pid)),
            (None, Some(name)) => Ok(AttachTarget::Name {
                name: name.clone(),
                wait_for: self.wait_for,
            }),
            (None, None) if !self.process_create_commands.is_empty() => {
                Ok(AttachTarget::Commands)
            }
            (None, None) => Err(Error::MissingArgument("pid")),
        }
    }

    /// Debugee environment: `base` then `envFile` entries then `env` overrides.
    pub fn environment(
        &self,
        base: impl IntoIterator<Item = (String, String)>,
    ) -> Result<IndexMap<String, String>, Error> {
        let mut env: IndexMap<String, String> = base.into_iter().collect();

        if let Some(ref env_file) = self.env_file {
            let path = match self.cwd {
                Some(ref cwd) if Path::new(env_file).is_relative() => Path::new(cwd).join(env_file),
                _ => PathBuf::from(env_file),
            };
            let env_file_error = |reason: String| Error::EnvFile {
                path: path.display().to_string(),
                reason,
            };
            let entries =
                dotenv::from_path_iter(&path).map_err(|e| env_file_error(e.to_string()))?;
            for entry in entries {
                let (key, value) = entry.map_err(|e| env_file_error(e.to_string()))?;
                env.insert(key, value);
            }
        }

        for (key, value) in &self.env {
            env.insert(key.clone(), value.clone());
        }
        Ok(env)
    }

    pub fn path_mapper(&self) -> PathMapper {
        PathMapper::new(&self.source_map, self.relative_path_base.clone())
    }
}

/// Resolve a bare program name through `PATH`, relative paths against `cwd`.
fn resolve_program(program: &str, cwd: Option<&str>) -> PathBuf {
    let path = Path::new(program);
    if path.components().count() == 1 && !path.exists() {
        if let Ok(found) = which::which(program) {
            return found;
        }
    }
    match cwd {
        Some(cwd) if path.is_relative() => Path::new(cwd).join(path),
        _ => path.to_path_buf(),
    }
}

struct SavedConfiguration {
    settings: AdapterSettings,
    mapper: PathMapper,
    config: LaunchConfig,
    kind: Option<LaunchKind>,
    breakpoint_mode: BreakpointMode,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub(super) struct DisconnectArguments {
    terminate_debuggee: Option<bool>,
}

impl Session {
    /// Apply launch configuration to session settings.
    fn configure(&mut self, config: LaunchConfig, kind: LaunchKind) {
        if let Some(kind) = config.expressions {
            self.settings.expressions = kind;
        }
        if let Some(mode) = config.show_disassembly {
            self.settings.show_disassembly = mode;
        }
        if let Some(mode) = config.console_mode {
            self.settings.console_mode = mode;
        }
        self.mapper = config.path_mapper();
        self.breakpoints.set_mode(config.breakpoint_mode);
        self.kind = Some(kind);
        self.config = config;
    }

    /// Configuration a failed launch or attach must leave untouched.
    fn save_configuration(&self) -> SavedConfiguration {
        SavedConfiguration {
            settings: self.settings.clone(),
            mapper: self.mapper.clone(),
            config: self.config.clone(),
            kind: self.kind,
            breakpoint_mode: self.breakpoints.mode(),
        }
    }

    /// Undo a failed launch or attach: drop a process started on the way, restore configuration.
    fn abort_start(&mut self, saved: SavedConfiguration, error: &Error) {
        log::warn!(target: "session", "{} failed: {error}", self.state);
        self.drop_started_process();
        self.settings = saved.settings;
        self.mapper = saved.mapper;
        self.config = saved.config;
        self.kind = saved.kind;
        self.breakpoints.set_mode(saved.breakpoint_mode);
        self.state = SessionState::Idle;
    }

    fn drop_started_process(&mut self) {
        let Some(process) = self.backend.process() else {
            return;
        };
        let result = if self.kind == Some(LaunchKind::Attach) {
            log::info!(target: "session", "detach from {} after a failed attach", process.pid);
            self.backend.detach()
        } else {
            log::info!(target: "session", "kill {} after a failed launch", process.pid);
            self.backend.kill()
        };
        if let Err(e) = result {
            log::warn!(target: "session", "debugee teardown: {e}");
        }
    }

    pub(super) fn launch(&mut self, config: LaunchConfig) -> Result<(), Error> {
        self.expect_state("launch", &[SessionState::Idle])?;
        let program = config.launch_program()?;
        let env = config.environment(std::env::vars())?;
        let saved = self.save_configuration();
        self.configure(config, LaunchKind::Launch);
        self.state = SessionState::Launching;

        match self.create_process(program, env) {
            Ok(process) => self.process_created(process),
            Err(e) => {
                self.abort_start(saved, &e);
                Err(e)
            }
        }
    }

    fn create_process(
        &mut self,
        program: Option<PathBuf>,
        env: IndexMap<String, String>,
    ) -> Result<ProcessInfo, Error> {
        let config = self.config.clone();
        self.run_commands(&config.init_commands)?;
        self.run_commands(&config.target_create_commands)?;
        self.run_commands(&config.pre_run_commands)?;

        let process = match program {
            Some(program) if config.process_create_commands.is_empty() => {
                let request = LaunchRequest {
                    program,
                    args: config.args.clone(),
                    env,
                    cwd: config.cwd.as_ref().map(PathBuf::from),
                };
                log::info!(target: "session", "launch {}", request.program.display());
                let backend = self.backend.clone();
                let abandoned = Arc::new(Mutex::new(false));
                let late = abandoned.clone();
                let launched = self.bounded("launch", self.settings.launch_timeout(), move |_| {
                    let result = backend.launch(&request);
                    let abandoned = late.lock().unwrap_or_else(PoisonError::into_inner);
                    if *abandoned && result.is_ok() {
                        log::warn!(target: "session", "debugee started after the launch timed out");
                        if let Err(e) = backend.kill() {
                            log::warn!(target: "session", "debugee teardown: {e}");
                        }
                    }
                    result
                });
                if launched.is_err() {
                    let mut abandoned = abandoned.lock().unwrap_or_else(PoisonError::into_inner);
                    *abandoned = true;
                    self.drop_started_process();
                }
                launched?
            }
            _ => {
                self.run_commands(&config.process_create_commands)?;
                self.backend.process().ok_or(Error::NoProcess)?
            }
        };

        self.run_commands(&config.post_run_commands)?;
        Ok(process)
    }

    pub(super) fn attach(&mut self, config: LaunchConfig, inbox: &mut Inbox) -> Result<(), Error> {
        self.expect_state("attach", &[SessionState::Idle])?;
        let target = config.attach_target()?;
        let saved = self.save_configuration();
        self.configure(config, LaunchKind::Attach);
        self.state = SessionState::Attaching;

        match self.attach_process(target, inbox) {
            Ok(process) => self.process_created(process),
            Err(e) => {
                self.abort_start(saved, &e);
                Err(e)
            }
        }
    }

    fn attach_process(
        &mut self,
        target: AttachTarget,
        inbox: &mut Inbox,
    ) -> Result<ProcessInfo, Error> {
        let config = self.config.clone();
        self.run_commands(&config.init_commands)?;
        self.run_commands(&config.pre_run_commands)?;

        let process = match target {
            AttachTarget::Pid(pid) => self.backend.attach(pid)?,
            AttachTarget::Name { name, wait_for } => {
                let pid = self.find_process(&name, wait_for, inbox)?;
                self.backend.attach(pid)?
            }
            AttachTarget::Commands => {
                self.run_commands(&config.process_create_commands)?;
                self.backend.process().ok_or(Error::NoProcess)?
            }
        };

        self.run_commands(&config.post_run_commands)?;
        Ok(process)
    }

    /// Find a process by name, with `wait_for` poll until one appears.
    ///
    /// Waiting is cancelled by a `disconnect` or `terminate` request or a client disconnect,
    /// other requests wait until the attach is done.
    fn find_process(&mut self, name: &str, wait_for: bool, inbox: &mut Inbox) -> Result<u32, Error> {
        let timeout = self.settings.attach_wait_timeout();
        let deadline = Instant::now() + timeout;
        if wait_for {
            self.output(
                OutputCategory::Console,
                format!("Waiting for a process named `{name}`...\n"),
            );
        }

        loop {
            let pids: Vec<u32> = self
                .backend
                .processes()
                .into_iter()
                .filter(|(_, process)| process == name || file_name(process) == name)
                .map(|(pid, _)| pid)
                .collect();

            match pids.len() {
                0 => {}
                1 => return Ok(pids[0]),
                _ => {
                    return Err(Error::AmbiguousTarget {
                        name: name.to_string(),
                        pids,
                    })
                }
            }

            if !wait_for {
                return Err(Error::ProcessNotFound(name.to_string()));
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout("attach", timeout));
            }

            match inbox.wait(self.settings.attach_poll_interval()) {
                Waited::Timeout => {}
                Waited::Closed => return Err(Error::Cancelled("attach")),
                Waited::Message(Incoming::Request(request))
                    if request.command == "disconnect" || request.command == "terminate" =>
                {
                    log::info!(target: "session", "attach to `{name}` cancelled by {}", request.command);
                    inbox.defer(Incoming::Request(request));
                    return Err(Error::Cancelled("attach"));
                }
                Waited::Message(Incoming::ClientGone) => {
                    inbox.defer(Incoming::ClientGone);
                    return Err(Error::Cancelled("attach"));
                }
                Waited::Message(message) => inbox.defer(message),
            }
        }
    }

    fn process_created(&mut self, process: ProcessInfo) -> Result<(), Error> {
        log::info!(target: "session", "debugee process {} ({})", process.pid, process.name);
        self.process = Some(process);

        for module in self.backend.modules() {
            self.emit_module("new", &module);
        }
        self.resolve_breakpoints();

        if self.configuration_done {
            self.start_debugee()?;
        }
        Ok(())
    }

    pub(super) fn configuration_done(&mut self) -> Result<(), Error> {
        self.configuration_done = true;
        if matches!(self.state, SessionState::Launching | SessionState::Attaching) {
            self.start_debugee()?;
        }
        Ok(())
    }

    /// Report an entry stop or let the debugee run.
    fn start_debugee(&mut self) -> Result<(), Error> {
        if self.config.stop_on_entry {
            let thread = self
                .backend
                .threads()?
                .first()
                .map(|thread| thread.id)
                .ok_or(Error::NoProcess)?;
            self.state = SessionState::Stopped;
            self.stopped_thread = Some(thread);
            self.emit(
                "stopped",
                Some(json!({
                    "reason": "entry",
                    "threadId": thread.0,
                    "allThreadsStopped": true,
                })),
            );
            return Ok(());
        }

        self.emit("continued", Some(json!({ "threadId": 0, "allThreadsContinued": true })));
        self.resume()
    }

    /// Run console commands, echo them and their output to the client console.
    fn run_commands(&mut self, commands: &[String]) -> Result<(), Error> {
        for command in commands {
            let output = self.backend.execute_command(command)?;
            let mut text = format!("> {command}\n");
            if !output.is_empty() {
                text.push_str(&output);
                if !output.ends_with('\n') {
                    text.push('\n');
                }
            }
            self.output(OutputCategory::Console, text);
        }
        Ok(())
    }

    /// Kill or detach the debugee. Errors are logged, teardown never fails.
    fn teardown(&mut self, terminate: Option<bool>) {
        if !self.state.has_process() {
            return;
        }
        let commands = std::mem::take(&mut self.config.exit_commands);
        if let Err(e) = self.run_commands(&commands) {
            log::warn!(target: "session", "exit commands: {e}");
        }

        let terminate = terminate
            .or(self.config.terminate_debuggee)
            .unwrap_or(self.kind != Some(LaunchKind::Attach));
        let result = if terminate {
            self.backend.kill()
        } else {
            self.breakpoints.clear(self.backend.as_ref());
            self.backend.detach()
        };
        if let Err(e) = result {
            log::warn!(target: "session", "debugee teardown: {e}");
        }
        self.invalidate_handles();
        self.process = None;
    }

    pub(super) fn disconnect(&mut self, args: DisconnectArguments) -> Result<(), Error> {
        self.teardown(args.terminate_debuggee);
        self.state = SessionState::Terminated;
        self.disconnected = true;
        Ok(())
    }

    pub(super) fn terminate(&mut self) -> Result<(), Error> {
        self.teardown(Some(true));
        // `terminated` was already sent when the process exited
        if !self.state.is_over() {
            self.emit("terminated", None);
        }
        self.state = SessionState::Terminated;
        Ok(())
    }

    /// Client connection is gone, tear the debugee down as a disconnect would.
    pub fn client_gone(&mut self) {
        log::info!(target: "session", "client is gone");
        self.teardown(None);
        self.state = SessionState::Terminated;
        self.disconnected = true;
    }
}
