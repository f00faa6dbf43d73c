//! Call-out interface of an embedded scripting engine.
//!
//! A script runs on an evaluation worker thread. Everything it asks from the session
//! (variables, webviews) goes through a [`ScriptContext`]: a proxy that forwards the
//! callback to the session control thread and blocks until the control thread answers.

use crate::debugger::backend::FrameId;
use crate::debugger::variable::TypedValue;
use crate::debugger::Error;
use serde_json::Value;
use std::sync::mpsc::{self, Sender};

/// Value produced by a script.
#[derive(Clone, Debug)]
pub enum ScriptValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Handle of a debugee value, rendered by the value formatter.
    Native(TypedValue),
}

/// Receives messages posted by a webview to a script.
pub type MessageListener = Box<dyn FnMut(Value) + Send>;

/// Session services available to a running script.
pub trait ScriptContext {
    /// Read a variable visible in the evaluation frame.
    fn read_variable(&mut self, name: &str) -> Result<Option<ScriptValue>, Error>;
    /// Create a webview in the client, return its id.
    fn create_webview(
        &mut self,
        html: String,
        title: Option<String>,
        options: Value,
    ) -> Result<String, Error>;
    fn post_message(&mut self, id: &str, message: Value) -> Result<(), Error>;
    /// Register a listener of messages from a webview.
    fn on_message(&mut self, id: &str, listener: MessageListener) -> Result<(), Error>;
    fn dispose_webview(&mut self, id: &str) -> Result<(), Error>;
}

/// Embedded scripting engine.
pub trait ScriptHost: Send {
    fn evaluate(
        &mut self,
        code: &str,
        frame: Option<FrameId>,
        ctx: &mut dyn ScriptContext,
    ) -> Result<ScriptValue, Error>;
}

/// Script host of sessions without a scripting engine.
pub struct NoScript;

impl ScriptHost for NoScript {
    fn evaluate(
        &mut self,
        _: &str,
        _: Option<FrameId>,
        _: &mut dyn ScriptContext,
    ) -> Result<ScriptValue, Error> {
        Err(Error::NoScripting)
    }
}

/// Script callback waiting for the control thread.
pub enum Callback {
    ReadVariable {
        name: String,
        reply: Sender<Result<Option<ScriptValue>, Error>>,
    },
    CreateWebview {
        html: String,
        title: Option<String>,
        options: Value,
        reply: Sender<Result<String, Error>>,
    },
    PostMessage {
        id: String,
        message: Value,
        reply: Sender<Result<(), Error>>,
    },
    OnMessage {
        id: String,
        listener: MessageListener,
        reply: Sender<Result<(), Error>>,
    },
    DisposeWebview {
        id: String,
        reply: Sender<Result<(), Error>>,
    },
}

/// [`ScriptContext`] of a worker thread, forwards callbacks through a channel.
pub struct ProxyContext<M> {
    sink: Sender<M>,
    wrap: fn(Callback) -> M,
}

impl<M> ProxyContext<M> {
    pub fn new(sink: Sender<M>, wrap: fn(Callback) -> M) -> Self {
        Self { sink, wrap }
    }

    fn call<T>(&self, make: impl FnOnce(Sender<Result<T, Error>>) -> Callback) -> Result<T, Error> {
        let (tx, rx) = mpsc::channel();
        self.sink
            .send((self.wrap)(make(tx)))
            .map_err(|_| Error::Cancelled("script callback"))?;
        rx.recv().map_err(|_| Error::Cancelled("script callback"))?
    }
}

impl<M> ScriptContext for ProxyContext<M> {
    fn read_variable(&mut self, name: &str) -> Result<Option<ScriptValue>, Error> {
        let name = name.to_string();
        self.call(|reply| Callback::ReadVariable { name, reply })
    }

    fn create_webview(
        &mut self,
        html: String,
        title: Option<String>,
        options: Value,
    ) -> Result<String, Error> {
        self.call(|reply| Callback::CreateWebview {
            html,
            title,
            options,
            reply,
        })
    }

    fn post_message(&mut self, id: &str, message: Value) -> Result<(), Error> {
        let id = id.to_string();
        self.call(|reply| Callback::PostMessage { id, message, reply })
    }

    fn on_message(&mut self, id: &str, listener: MessageListener) -> Result<(), Error> {
        let id = id.to_string();
        self.call(|reply| Callback::OnMessage {
            id,
            listener,
            reply,
        })
    }

    fn dispose_webview(&mut self, id: &str) -> Result<(), Error> {
        let id = id.to_string();
        self.call(|reply| Callback::DisposeWebview { id, reply })
    }
}
