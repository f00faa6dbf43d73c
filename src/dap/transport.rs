//! DAP transport abstraction layer.
//! Supports stdio (embedded mode), TCP (server mode) and in-memory channels (tests).
//!
//! A transport is split into a reader, moved to a reader thread, and a writer, kept by
//! the session control thread.

use crate::dap::tracer::FileTracer;
use anyhow::{anyhow, Context};
use serde_json::Value;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::mpsc::{self, Receiver, Sender};

/// Reading half of a transport.
pub trait DapReader: Send {
    /// Read a single DAP message (with Content-Length framing).
    fn read_message(&mut self) -> anyhow::Result<Value>;
}

/// Writing half of a transport.
pub trait DapWriter: Send {
    /// Write a single DAP message (with Content-Length framing).
    fn write_message(&mut self, message: &Value) -> anyhow::Result<()>;
}

/// Trait for DAP message transport.
pub trait DapTransport {
    fn split(self) -> anyhow::Result<(Box<dyn DapReader>, Box<dyn DapWriter>)>;
}

/// Read one Content-Length framed message.
pub fn read_frame(reader: &mut impl BufRead) -> anyhow::Result<Value> {
    let mut content_length: Option<usize> = None;
    loop {
        let mut line = String::new();
        let read_n = reader.read_line(&mut line)?;
        if read_n == 0 {
            return Err(anyhow!("DAP connection closed"));
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        if let Some(v) = line.strip_prefix("Content-Length:") {
            content_length = Some(v.trim().parse().context("bad Content-Length")?);
        }
    }

    let len = content_length.ok_or_else(|| anyhow!("Missing Content-Length header"))?;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    let msg: Value = serde_json::from_slice(&buf)?;
    Ok(msg)
}

/// Write one Content-Length framed message.
pub fn write_frame(writer: &mut impl Write, message: &Value) -> anyhow::Result<()> {
    let payload = serde_json::to_vec(message)?;
    write!(writer, "Content-Length: {}\r\n\r\n", payload.len())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

struct FramedReader<R>(R);

impl<R: BufRead + Send> DapReader for FramedReader<R> {
    fn read_message(&mut self) -> anyhow::Result<Value> {
        read_frame(&mut self.0)
    }
}

struct FramedWriter<W>(W);

impl<W: Write + Send> DapWriter for FramedWriter<W> {
    fn write_message(&mut self, message: &Value) -> anyhow::Result<()> {
        write_frame(&mut self.0, message)
    }
}

/// Stdio-based DAP transport.
pub struct StdioTransport;

impl DapTransport for StdioTransport {
    fn split(self) -> anyhow::Result<(Box<dyn DapReader>, Box<dyn DapWriter>)> {
        Ok((
            Box::new(FramedReader(BufReader::new(std::io::stdin()))),
            Box::new(FramedWriter(std::io::stdout())),
        ))
    }
}

/// TCP-based DAP transport (for server mode).
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> anyhow::Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }
}

impl DapTransport for TcpTransport {
    fn split(self) -> anyhow::Result<(Box<dyn DapReader>, Box<dyn DapWriter>)> {
        let reader = BufReader::new(self.stream.try_clone()?);
        Ok((
            Box::new(FramedReader(reader)),
            Box::new(FramedWriter(self.stream)),
        ))
    }
}

/// In-memory transport, messages are passed as already decoded JSON values.
pub struct ChannelTransport {
    rx: Receiver<Value>,
    tx: Sender<Value>,
}

/// Client end of a [`ChannelTransport`].
pub struct ChannelPeer {
    pub tx: Sender<Value>,
    pub rx: Receiver<Value>,
}

impl ChannelTransport {
    pub fn pair() -> (ChannelTransport, ChannelPeer) {
        let (client_tx, adapter_rx) = mpsc::channel();
        let (adapter_tx, client_rx) = mpsc::channel();
        (
            ChannelTransport {
                rx: adapter_rx,
                tx: adapter_tx,
            },
            ChannelPeer {
                tx: client_tx,
                rx: client_rx,
            },
        )
    }
}

struct ChannelReader(Receiver<Value>);

impl DapReader for ChannelReader {
    fn read_message(&mut self) -> anyhow::Result<Value> {
        self.0.recv().map_err(|_| anyhow!("DAP connection closed"))
    }
}

struct ChannelWriter(Sender<Value>);

impl DapWriter for ChannelWriter {
    fn write_message(&mut self, message: &Value) -> anyhow::Result<()> {
        self.0
            .send(message.clone())
            .map_err(|_| anyhow!("DAP connection closed"))
    }
}

impl DapTransport for ChannelTransport {
    fn split(self) -> anyhow::Result<(Box<dyn DapReader>, Box<dyn DapWriter>)> {
        Ok((Box::new(ChannelReader(self.rx)), Box::new(ChannelWriter(self.tx))))
    }
}

/// Reader that records every inbound message as a `<- json` line.
pub struct TracedReader {
    pub inner: Box<dyn DapReader>,
    pub tracer: FileTracer,
}

impl DapReader for TracedReader {
    fn read_message(&mut self) -> anyhow::Result<Value> {
        let msg = self.inner.read_message()?;
        self.tracer.line(&format!("<- {msg}"));
        Ok(msg)
    }
}

/// Writer that records every outbound message as a `-> json` line.
pub struct TracedWriter {
    pub inner: Box<dyn DapWriter>,
    pub tracer: FileTracer,
}

impl DapWriter for TracedWriter {
    fn write_message(&mut self, message: &Value) -> anyhow::Result<()> {
        self.tracer.line(&format!("-> {message}"));
        self.inner.write_message(message)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    #[test]
    fn test_read_frame() {
        struct TestCase {
            raw: &'static str,
            expected: Option<Value>,
        }
        let test_cases = vec![
            TestCase {
                raw: "Content-Length: 13\r\n\r\n{\"seq\":1,\"a\":",
                expected: None,
            },
            TestCase {
                raw: "Content-Length: 9\r\n\r\n{\"seq\":1}",
                expected: Some(json!({"seq": 1})),
            },
            TestCase {
                raw: "Content-Type: json\r\nContent-Length: 2\r\n\r\n{}",
                expected: Some(json!({})),
            },
            TestCase {
                raw: "\r\n{}",
                expected: None,
            },
            TestCase {
                raw: "",
                expected: None,
            },
        ];

        for tc in test_cases {
            let result = read_frame(&mut Cursor::new(tc.raw.as_bytes()));
            assert_eq!(result.ok(), tc.expected, "frame {:?}", tc.raw);
        }
    }

    #[test]
    fn test_write_then_read_frames() {
        let mut buf = vec![];
        write_frame(&mut buf, &json!({"seq": 1})).unwrap();
        write_frame(&mut buf, &json!({"seq": 2, "body": "é"})).unwrap();

        let mut cursor = Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor).unwrap(), json!({"seq": 1}));
        assert_eq!(
            read_frame(&mut cursor).unwrap(),
            json!({"seq": 2, "body": "é"})
        );
        assert!(read_frame(&mut cursor).is_err());
    }

    #[test]
    fn test_channel_transport() {
        let (transport, peer) = ChannelTransport::pair();
        let (mut reader, mut writer) = transport.split().unwrap();

        peer.tx.send(json!({"seq": 1})).unwrap();
        assert_eq!(reader.read_message().unwrap(), json!({"seq": 1}));
        writer.write_message(&json!({"seq": 2})).unwrap();
        assert_eq!(peer.rx.recv().unwrap(), json!({"seq": 2}));

        drop(peer);
        assert!(reader.read_message().is_err());
        assert!(writer.write_message(&json!({})).is_err());
    }
}
