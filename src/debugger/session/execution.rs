//! Execution control and time bounded work.

use super::{Session, SessionState, StepRequest};
use crate::debugger::backend::{FrameId, StepKind, ThreadId};
use crate::debugger::expression::script::{Callback, ProxyContext, ScriptValue};
use crate::debugger::expression::{EvalEnv, Evaluated, EvaluatorKind, Expression};
use crate::debugger::Error;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

/// Message from a worker thread to the control thread.
pub(super) enum WorkerMessage<T> {
    Done(Result<T, Error>),
    /// Script callback, served by the control thread while the worker waits.
    Callback(Callback),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct StepArguments {
    thread_id: u64,
    #[serde(default)]
    granularity: Option<String>,
}

impl Session {
    /// Run a job on a worker thread, wait for it at most `timeout`.
    ///
    /// Script callbacks of the job are served while waiting. A timed out worker is
    /// abandoned, its result is dropped whenever it arrives.
    pub(super) fn bounded<T, F>(
        &mut self,
        what: &'static str,
        timeout: Duration,
        job: F,
    ) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(Sender<WorkerMessage<T>>) -> Result<T, Error> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let sink = tx.clone();
        thread::Builder::new()
            .name(format!("yadap-{what}"))
            .spawn(move || {
                let result = job(sink);
                _ = tx.send(WorkerMessage::Done(result));
            })?;

        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(left) {
                Ok(WorkerMessage::Done(result)) => return result,
                Ok(WorkerMessage::Callback(callback)) => self.serve_callback(callback),
                Err(RecvTimeoutError::Timeout) => {
                    log::warn!(target: "session", "{what} timed out after {} ms", timeout.as_millis());
                    return Err(Error::Timeout(what, timeout));
                }
                Err(RecvTimeoutError::Disconnected) => return Err(Error::Cancelled(what)),
            }
        }
    }

    fn serve_callback(&mut self, callback: Callback) {
        match callback {
            Callback::ReadVariable { name, reply } => {
                let result = match self.eval_frame {
                    Some(frame) => self
                        .backend
                        .find_variable(frame, &name)
                        .map(|value| value.map(|v| ScriptValue::Native(v.into()))),
                    None => Ok(None),
                };
                _ = reply.send(result);
            }
            Callback::CreateWebview {
                html,
                title,
                options,
                reply,
            } => {
                let (id, body) = self.webviews.create(html, title, options);
                self.emit("_webviewCreate", Some(body));
                _ = reply.send(Ok(id));
            }
            Callback::PostMessage { id, message, reply } => {
                let result = self.webviews.post(&id, message).map(|body| {
                    self.emit("_webviewPostMessage", Some(body));
                });
                _ = reply.send(result);
            }
            Callback::OnMessage {
                id,
                listener,
                reply,
            } => {
                _ = reply.send(self.webviews.on_message(&id, listener));
            }
            Callback::DisposeWebview { id, reply } => {
                let result = self.webviews.dispose(&id).map(|body| {
                    self.emit("_webviewDispose", Some(body));
                });
                _ = reply.send(result);
            }
        }
    }

    /// Evaluate an expression on a worker thread, bounded by the evaluate timeout.
    pub(super) fn evaluate_expression(
        &mut self,
        expression: &Expression,
        frame: Option<FrameId>,
    ) -> Result<Evaluated, Error> {
        let backend = self.backend.clone();
        let script = self.script.clone();
        let options = self.settings.format_options();
        let kind = expression.kind;
        let code = expression.code.clone();

        self.eval_frame = frame;
        let result = self.bounded("evaluate", self.settings.evaluate_timeout(), move |sink| {
            if kind != EvaluatorKind::Python {
                let mut env = EvalEnv {
                    backend: backend.as_ref(),
                    options: &options,
                    frame,
                    script: None,
                };
                return kind.evaluate(&code, &mut env);
            }

            // an abandoned evaluation may still hold the engine
            let mut host = script
                .try_lock()
                .map_err(|_| Error::Script("script engine is busy".to_string()))?;
            let mut ctx = ProxyContext::new(sink, WorkerMessage::Callback);
            let mut env = EvalEnv {
                backend: backend.as_ref(),
                options: &options,
                frame,
                script: Some((&mut **host, &mut ctx)),
            };
            kind.evaluate(&code, &mut env)
        });
        self.eval_frame = None;
        result
    }

    pub(super) fn threads(&mut self) -> Result<Value, Error> {
        if self.process.is_none() || !self.state.has_process() {
            return Ok(json!({ "threads": [] }));
        }
        let threads: Vec<Value> = self
            .backend
            .threads()?
            .into_iter()
            .map(|thread| {
                let name = thread
                    .name
                    .unwrap_or_else(|| format!("Thread #{}", thread.id));
                json!({ "id": thread.id.0, "name": name })
            })
            .collect();
        Ok(json!({ "threads": threads }))
    }

    /// Let the debugee run, every handle of the current stop becomes stale.
    pub(super) fn resume(&mut self) -> Result<(), Error> {
        self.invalidate_handles();
        self.state = SessionState::Running;
        if let Err(e) = self.backend.resume() {
            self.state = SessionState::Stopped;
            return Err(e);
        }
        Ok(())
    }

    pub(super) fn resume_request(&mut self, request: &'static str) -> Result<Value, Error> {
        self.expect_state(request, &[SessionState::Stopped])?;
        self.resume()?;
        Ok(json!({ "allThreadsContinued": true }))
    }

    pub(super) fn step(&mut self, args: StepArguments, request: StepRequest) -> Result<(), Error> {
        let name = match request {
            StepRequest::Next => "next",
            StepRequest::StepIn => "stepIn",
            StepRequest::StepOut => "stepOut",
        };
        self.expect_state(name, &[SessionState::Stopped])?;

        let kind = match (request, args.granularity.as_deref()) {
            (StepRequest::Next | StepRequest::StepIn, Some("instruction")) => StepKind::Instruction,
            (StepRequest::Next, _) => StepKind::Over,
            (StepRequest::StepIn, _) => StepKind::Into,
            (StepRequest::StepOut, _) => StepKind::Out,
        };

        self.invalidate_handles();
        self.state = SessionState::Running;
        if let Err(e) = self.backend.step(ThreadId(args.thread_id), kind) {
            self.state = SessionState::Stopped;
            return Err(e);
        }
        Ok(())
    }

    pub(super) fn pause(&mut self) -> Result<(), Error> {
        match self.state {
            SessionState::Running => self.backend.pause(),
            SessionState::Stopped => Ok(()),
            _ => Err(Error::WrongState("pause", self.state.into())),
        }
    }
}
