//! yadap - Debug Adapter Protocol (DAP) adapter.
//!
//! Serves debug sessions over TCP (one session per client, clients are served
//! sequentially) or a single session over stdio.

use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use yadap::config::AdapterSettings;
use yadap::dap::args::Args;
use yadap::dap::server::DapServer;
use yadap::dap::tracer::FileTracer;
use yadap::dap::transport::{StdioTransport, TcpTransport};
use yadap::debugger::backend::model::ModelBackend;

fn main() -> anyhow::Result<()> {
    let logger = env_logger::Logger::from_default_env();
    let filter = logger.filter();
    yadap::log::LOGGER_SWITCHER.switch(logger, filter);

    let args = Args::parse();

    let mut settings = AdapterSettings::load(args.config.as_deref())?;
    args.apply(&mut settings);
    yadap::config::set(settings);

    let tracer = match &args.log_file {
        Some(path) => Some(FileTracer::new(path, args.trace_dap)?),
        None => None,
    };
    if args.trace_dap && tracer.is_none() {
        warn!(target: "dap", "--trace-dap requires --log-file; tracing disabled");
    }

    let new_server = || -> anyhow::Result<DapServer> {
        let backend = ModelBackend::from_toml(&args.model)?;
        let mut server = DapServer::new(Arc::new(backend)).with_console_logging(!args.no_console_log);
        if let Some(t) = &tracer {
            server = server.with_tracer(t.clone());
        }
        Ok(server)
    };

    if args.stdio {
        info!(target: "dap", "yadap serves a session on stdio");
        return new_server()?.serve(StdioTransport);
    }

    let addr: SocketAddr = args.listen.parse().context("Invalid listen address")?;
    let listener = TcpListener::bind(addr).with_context(|| format!("bind {addr}"))?;
    info!(target: "dap", "yadap listening on {addr}");

    // Server mode: accept multiple clients sequentially. One client == one debug session.
    loop {
        let (stream, peer) = match listener.accept() {
            Ok(v) => v,
            Err(err) => {
                warn!(target: "dap", "accept failed: {err:#}");
                continue;
            }
        };
        info!(target: "dap", "DAP client connected: {peer}");
        if let Some(t) = &tracer {
            t.line(&format!("client connected: {peer}"));
        }

        let transport = match TcpTransport::new(stream) {
            Ok(v) => v,
            Err(err) => {
                warn!(target: "dap", "failed to init DAP I/O: {err:#}");
                continue;
            }
        };

        let res = new_server().and_then(|server| server.serve(transport));
        if let Err(err) = res {
            warn!(target: "dap", "session ended with error: {err:#}");
        }

        if args.oneshot {
            break;
        }
    }
    Ok(())
}
