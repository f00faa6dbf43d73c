use anyhow::Context;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::{Arc, Mutex};

/// Simple file-based tracer for adapter diagnostics.
#[derive(Clone)]
pub struct FileTracer {
    file: Arc<Mutex<std::fs::File>>,
    /// Record protocol traffic, not only session milestones.
    traffic: bool,
}

impl FileTracer {
    pub fn new(path: &std::path::Path, traffic: bool) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log file {}", path.display()))?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            traffic,
        })
    }

    pub fn traces_traffic(&self) -> bool {
        self.traffic
    }

    pub fn line(&self, text: &str) {
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{text}");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_append_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.log");

        let tracer = FileTracer::new(&path, true).unwrap();
        tracer.line("client connected");
        tracer.clone().line("-> {}");
        assert!(tracer.traces_traffic());

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "client connected\n-> {}\n");
    }
}
