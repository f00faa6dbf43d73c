//! Debug Adapter Protocol front end: wire format, transports and the session server.

pub mod args;
pub mod logger;
pub mod protocol;
pub mod server;
pub mod tracer;
pub mod transport;
