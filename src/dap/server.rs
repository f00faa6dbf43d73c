//! DAP server: one debug session over one transport.
//!
//! Threads of a session:
//! - reader thread, decodes client messages and enqueues them,
//! - backend listener thread, enqueues backend notifications,
//! - control thread (the caller of [`DapServer::serve`]), the single consumer of the queue.

use crate::config::AdapterSettings;
use crate::dap::logger::DapLogger;
use crate::dap::protocol::{DapEvent, DapRequest, DapResponse};
use crate::dap::tracer::FileTracer;
use crate::dap::transport::{DapReader, DapTransport, DapWriter, TracedReader, TracedWriter};
use crate::debugger::backend::{Backend, BackendEvent};
use crate::debugger::expression::script::ScriptHost;
use crate::debugger::session::{Event, Inbox, Incoming, Request, Session};
use crate::debugger::Error;
use anyhow::Context;
use serde_json::Value;
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;

pub struct DapServer {
    backend: Arc<dyn Backend>,
    settings: AdapterSettings,
    script: Option<Box<dyn ScriptHost>>,
    tracer: Option<FileTracer>,
    console_logging: bool,
}

impl DapServer {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            settings: crate::config::current().clone(),
            script: None,
            tracer: None,
            console_logging: false,
        }
    }

    pub fn with_settings(mut self, settings: AdapterSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_script_host(mut self, host: Box<dyn ScriptHost>) -> Self {
        self.script = Some(host);
        self
    }

    pub fn with_tracer(mut self, tracer: FileTracer) -> Self {
        self.tracer = Some(tracer);
        self
    }

    /// Mirror adapter warnings and errors into the client console.
    pub fn with_console_logging(mut self, enabled: bool) -> Self {
        self.console_logging = enabled;
        self
    }

    /// Serve a session until the client disconnects or goes away.
    pub fn serve(self, transport: impl DapTransport) -> anyhow::Result<()> {
        let (mut reader, mut writer) = transport.split().context("split DAP transport")?;
        if let Some(tracer) = self.tracer.as_ref().filter(|t| t.traces_traffic()) {
            reader = Box::new(TracedReader {
                inner: reader,
                tracer: tracer.clone(),
            });
            writer = Box::new(TracedWriter {
                inner: writer,
                tracer: tracer.clone(),
            });
        }

        let (tx, rx) = mpsc::channel();
        spawn_reader(reader, tx.clone())?;
        spawn_backend_listener(self.backend.as_ref(), tx.clone())?;
        if self.console_logging {
            let logger = DapLogger::new(tx.clone());
            let filter = logger.filter();
            crate::log::LOGGER_SWITCHER.switch(logger, filter);
        }
        drop(tx);

        let mut session = Session::new(self.backend.clone(), self.settings.clone());
        if let Some(script) = self.script {
            session = session.with_script_host(script);
        }
        let mut outbox = Outbox { writer, seq: 0 };
        let result = control_loop(&mut session, &mut Inbox::new(rx), &mut outbox);

        if self.console_logging {
            let logger = env_logger::Logger::from_default_env();
            let filter = logger.filter();
            crate::log::LOGGER_SWITCHER.switch(logger, filter);
        }
        if let Some(tracer) = &self.tracer {
            match &result {
                Ok(()) => tracer.line("session finished OK"),
                Err(err) => tracer.line(&format!("session error: {err:#}")),
            }
        }
        result
    }
}

fn spawn_reader(mut reader: Box<dyn DapReader>, tx: Sender<Incoming>) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("yadap-reader".to_string())
        .spawn(move || loop {
            let message = match reader.read_message() {
                Ok(message) => message,
                Err(err) => {
                    log::debug!(target: "dap", "read: {err:#}");
                    _ = tx.send(Incoming::ClientGone);
                    return;
                }
            };
            let request = match serde_json::from_value::<DapRequest>(message) {
                Ok(request) if request.r#type == "request" => request,
                Ok(request) => {
                    log::debug!(target: "dap", "ignore client message of type {}", request.r#type);
                    continue;
                }
                Err(err) => {
                    log::warn!(target: "dap", "malformed client message: {err}");
                    continue;
                }
            };
            if tx.send(Incoming::Request(request.into())).is_err() {
                return;
            }
        })
        .context("spawn DAP reader thread")?;
    Ok(())
}

fn spawn_backend_listener(backend: &dyn Backend, tx: Sender<Incoming>) -> anyhow::Result<()> {
    let (events_tx, events_rx) = mpsc::channel::<BackendEvent>();
    backend.subscribe(events_tx);
    thread::Builder::new()
        .name("yadap-backend".to_string())
        .spawn(move || {
            for event in events_rx {
                if tx.send(Incoming::Backend(event)).is_err() {
                    return;
                }
            }
        })
        .context("spawn backend listener thread")?;
    Ok(())
}

/// Writing side of a session, numbers outgoing messages.
struct Outbox {
    writer: Box<dyn DapWriter>,
    seq: i64,
}

impl Outbox {
    fn next_seq(&mut self) -> i64 {
        self.seq += 1;
        self.seq
    }

    fn respond(&mut self, request: &Request, result: Result<Option<Value>, Error>) -> anyhow::Result<()> {
        let seq = self.next_seq();
        let response = match result {
            Ok(body) => DapResponse::success(seq, request, body),
            Err(err) => DapResponse::error(seq, request, err.to_string()),
        };
        self.write(&serde_json::to_value(response)?)
    }

    fn event(&mut self, event: Event) -> anyhow::Result<()> {
        let seq = self.next_seq();
        self.write(&serde_json::to_value(DapEvent::new(seq, event))?)
    }

    fn write(&mut self, message: &Value) -> anyhow::Result<()> {
        self.writer.write_message(message).context("write DAP message")
    }
}

fn control_loop(session: &mut Session, inbox: &mut Inbox, outbox: &mut Outbox) -> anyhow::Result<()> {
    while let Some(message) = inbox.next() {
        let written = match message {
            Incoming::Request(request) => {
                let result = session.handle(&request, inbox);
                outbox.respond(&request, result)
            }
            Incoming::Backend(event) => {
                session.on_backend_event(event);
                Ok(())
            }
            Incoming::Log(text) => {
                session.log_output(text);
                Ok(())
            }
            Incoming::ClientGone => {
                session.client_gone();
                return Ok(());
            }
        };
        let written = written.and_then(|_| {
            session
                .take_events()
                .into_iter()
                .try_for_each(|event| outbox.event(event))
        });
        if let Err(err) = written {
            session.client_gone();
            return Err(err);
        }
        if session.is_disconnected() {
            log::info!(target: "dap", "session is over");
            return Ok(());
        }
    }
    session.client_gone();
    Ok(())
}
