use crate::config::{AdapterSettings, ConsoleMode};
use crate::debugger::disasm::ShowDisassembly;
use crate::debugger::expression::EvaluatorKind;
use clap::Parser;
use serde::de::DeserializeOwned;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Address to listen on (default: 127.0.0.1:4711)
    #[clap(long, default_value = "127.0.0.1:4711")]
    pub listen: String,

    /// Serve a single session over stdin/stdout instead of TCP.
    #[clap(long, conflicts_with = "oneshot")]
    pub stdio: bool,

    /// Exit after the first debug session ends (single-client mode).
    #[clap(long)]
    pub oneshot: bool,

    /// Optional log file for adapter diagnostics (no output to stdout).
    #[clap(long)]
    pub log_file: Option<PathBuf>,

    /// Trace DAP traffic (requests/responses/events) into the log file.
    /// Requires --log-file.
    #[clap(long)]
    pub trace_dap: bool,

    /// Adapter settings file (default: $HOME/.config/yadap/config.toml)
    #[clap(long, env = "YADAP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Target description of the model backend
    #[clap(long, env = "YADAP_MODEL")]
    pub model: PathBuf,

    /// Do not mirror adapter warnings into the debug console
    #[clap(long)]
    pub no_console_log: bool,

    #[clap(long)]
    pub evaluate_timeout_ms: Option<u64>,

    #[clap(long)]
    pub launch_timeout_ms: Option<u64>,

    #[clap(long)]
    pub attach_wait_timeout_ms: Option<u64>,

    /// Default expression evaluator: simple, native or python
    #[clap(long, value_parser = lowercase_setting::<EvaluatorKind>)]
    pub expressions: Option<EvaluatorKind>,

    /// Evaluator of breakpoint conditions: simple, native or python
    #[clap(long, value_parser = lowercase_setting::<EvaluatorKind>)]
    pub condition_expressions: Option<EvaluatorKind>,

    /// Number of leading elements in a container summary
    #[clap(long)]
    pub container_preview: Option<usize>,

    /// Max length of a rendered string
    #[clap(long)]
    pub string_limit: Option<usize>,

    /// Show disassembly for stack frames: auto, always or never
    #[clap(long, value_parser = lowercase_setting::<ShowDisassembly>)]
    pub show_disassembly: Option<ShowDisassembly>,

    /// What the debug console does with input: commands or evaluate
    #[clap(long, value_parser = lowercase_setting::<ConsoleMode>)]
    pub console_mode: Option<ConsoleMode>,
}

impl Args {
    /// Override settings with the flags given on the command line.
    pub fn apply(&self, settings: &mut AdapterSettings) {
        macro_rules! set {
            ($($field:ident),*) => {
                $(if let Some(value) = self.$field.clone() {
                    settings.$field = value;
                })*
            };
        }
        set!(
            evaluate_timeout_ms,
            launch_timeout_ms,
            attach_wait_timeout_ms,
            expressions,
            condition_expressions,
            container_preview,
            string_limit,
            show_disassembly,
            console_mode
        );
    }
}

fn lowercase_setting<T: DeserializeOwned>(value: &str) -> Result<T, String> {
    serde_json::from_value(serde_json::Value::String(value.to_lowercase()))
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_flags_override_settings() {
        struct TestCase {
            args: Vec<&'static str>,
            check: fn(&AdapterSettings),
        }
        let test_cases = vec![
            TestCase {
                args: vec![],
                check: |s| assert_eq!(*s, AdapterSettings::default()),
            },
            TestCase {
                args: vec!["--evaluate-timeout-ms", "20", "--string-limit", "8"],
                check: |s| {
                    assert_eq!(s.evaluate_timeout_ms, 20);
                    assert_eq!(s.string_limit, 8);
                },
            },
            TestCase {
                args: vec![
                    "--expressions",
                    "Python",
                    "--show-disassembly",
                    "never",
                    "--console-mode",
                    "evaluate",
                ],
                check: |s| {
                    assert_eq!(s.expressions, EvaluatorKind::Python);
                    assert_eq!(s.show_disassembly, ShowDisassembly::Never);
                    assert_eq!(s.console_mode, ConsoleMode::Evaluate);
                },
            },
        ];

        for tc in test_cases {
            let args = Args::try_parse_from(
                ["yadap", "--model", "target.toml"]
                    .into_iter()
                    .chain(tc.args.iter().copied()),
            )
            .unwrap();
            let mut settings = AdapterSettings::default();
            args.apply(&mut settings);
            (tc.check)(&settings);
        }
    }

    #[test]
    fn test_bad_flags() {
        for args in [
            vec!["yadap", "--model", "t.toml", "--expressions", "lua"],
            vec!["yadap", "--model", "t.toml", "--stdio", "--oneshot"],
        ] {
            assert!(Args::try_parse_from(args).is_err());
        }
    }
}
