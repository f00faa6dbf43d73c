use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- request validation errors ---------------------------------
    #[error("invalid launch configuration: {0}")]
    InvalidConfig(String),
    #[error("missing argument `{0}`")]
    MissingArgument(&'static str),
    #[error("malformed request arguments: {0}")]
    MalformedArguments(#[from] serde_json::Error),
    #[error("no process named `{0}` found")]
    ProcessNotFound(String),
    #[error("ambiguous attach target `{name}`: {} matching processes {pids:?}", .pids.len())]
    AmbiguousTarget { name: String, pids: Vec<u32> },
    #[error("read env file {path}: {reason}")]
    EnvFile { path: String, reason: String },
    #[error("request `{0}` is not valid in the current session state ({1})")]
    WrongState(&'static str, &'static str),
    #[error("unsupported request `{0}`")]
    UnsupportedRequest(String),

    // --------------------------------- stale handle errors ---------------------------------------
    #[error("frame reference {0} is not valid anymore (the process has been resumed)")]
    StaleFrame(i64),
    #[error("variables reference {0} is not valid anymore (the process has been resumed)")]
    StaleVariables(i64),
    #[error("unknown frame reference {0}")]
    UnknownFrame(i64),
    #[error("unknown variables reference {0}")]
    UnknownVariables(i64),
    #[error("unknown source reference {0}")]
    UnknownSource(i64),
    #[error("thread {0} not found")]
    ThreadNotFound(u64),
    #[error("unknown webview `{0}`")]
    UnknownWebview(String),

    // --------------------------------- evaluation errors -----------------------------------------
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("no variable named `{0}` in this scope")]
    VariableNotFound(String),
    #[error("no field `{field}` in a value of type `{type_name}`")]
    FieldNotFound { field: String, type_name: String },
    #[error("index {index} out of bounds (length {len})")]
    IndexOutOfBounds { index: u64, len: u64 },
    #[error("a value of type `{0}` can't be dereferenced")]
    NotAPointer(String),
    #[error("a value of type `{0}` can't be indexed")]
    NotIndexable(String),
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
    #[error("invalid format directive `{0}`")]
    InvalidDirective(String),
    #[error("script error: {0}")]
    Script(String),
    #[error("scripting is not available in this session")]
    NoScripting,
    #[error("value `{0}` is not assignable")]
    NotAssignable(String),
    #[error("invalid hit condition `{0}`")]
    InvalidHitCondition(String),

    // --------------------------------- breakpoint errors -----------------------------------------
    #[error("line {line} has no code in {source_name}")]
    NoCodeAtLine { source_name: String, line: u32 },
    #[error("synthetic source {reference} has no line {line}")]
    NoInstructionAtLine { reference: i64, line: u32 },
    #[error("invalid regular expression: {0}")]
    RegEx(#[from] regex::Error),

    // --------------------------------- backend errors --------------------------------------------
    #[error("read memory at {0:#x}: address is not mapped")]
    InvalidAddress(u64),
    #[error("unknown type id {0}")]
    UnknownType(u32),
    #[error("backend: {0}")]
    Backend(String),
    #[error("backend connection lost: {0}")]
    ConnectionLost(String),
    #[error("no process is running")]
    NoProcess,
    #[error("install disassembler: {0}")]
    DisAsmInit(capstone::Error),
    #[error("instructions disassembly error: {0}")]
    DisAsm(capstone::Error),

    // --------------------------------- control flow errors ---------------------------------------
    #[error("{0} timed out after {} ms", .1.as_millis())]
    Timeout(&'static str, Duration),
    #[error("{0} was cancelled by the client")]
    Cancelled(&'static str),
    #[error(transparent)]
    IO(#[from] std::io::Error),
}

impl Error {
    /// Return a hint to the session: continue after an error or tear the session down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ConnectionLost(_))
    }
}
