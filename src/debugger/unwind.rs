//! Frame pointer unwinder, a fallback for stacks the backend can't unwind.
//!
//! Typical case is a call through a garbage function pointer: the top frame pc is zero or
//! unmapped and unwind information for it doesn't exist. The return address pushed by the
//! call is still at `[sp]` and the caller chain is reachable through saved frame pointers.

use crate::debugger::backend::{Address, Backend, FrameInfo, Registers, Symbol};
use crate::debugger::Error;

/// Maximum number of caller frames restored by the frame pointer chain.
const MAX_DEPTH: usize = 256;

fn read_u64(backend: &dyn Backend, address: Address) -> Result<u64, Error> {
    let bytes = backend.read_memory(address, 8)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes);
    Ok(u64::from_le_bytes(buf))
}

fn is_code(backend: &dyn Backend, address: Address) -> bool {
    address != 0 && backend.read_memory(address, 1).is_ok()
}

/// True if frames returned by the backend unwinder need a frame pointer fallback.
pub fn needs_fallback(backend: &dyn Backend, frames: &[FrameInfo]) -> bool {
    match frames.first() {
        None => true,
        Some(top) => {
            frames.len() < 2
                && (!is_code(backend, top.pc) || backend.symbol_at(top.pc).is_none())
        }
    }
}

fn frame_at(backend: &dyn Backend, pc: Address) -> FrameInfo {
    let symbol = backend.symbol_at(pc);
    FrameInfo {
        pc,
        function: symbol.as_ref().map(Symbol::display_name),
        line: backend.line_at(pc),
        module: symbol.map(|s| s.module),
    }
}

/// Restore a stack from top frame registers, the first frame is always the top one.
pub fn unwind(backend: &dyn Backend, regs: &Registers) -> Vec<FrameInfo> {
    let mut frames = vec![frame_at(backend, regs.pc)];

    // a call to an invalid address: no prologue executed, return address is at [sp]
    if !is_code(backend, regs.pc) {
        match read_u64(backend, regs.sp) {
            Ok(ret) if is_code(backend, ret) => frames.push(frame_at(backend, ret)),
            Ok(_) | Err(_) => {
                log::debug!(target: "session", "no return address at sp {:#x}", regs.sp);
            }
        }
    }

    let mut fp = regs.fp;
    while fp != 0 && frames.len() < MAX_DEPTH {
        let (Ok(saved_fp), Ok(ret)) = (read_u64(backend, fp), read_u64(backend, fp + 8)) else {
            break;
        };
        if !is_code(backend, ret) {
            break;
        }
        frames.push(frame_at(backend, ret));
        // stack grows down, saved frame pointers must increase
        if saved_fp <= fp {
            break;
        }
        fp = saved_fp;
    }

    frames
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::debugger::backend::model::{
        ModelBackend, ModelFunction, ModelModule, ModelTarget, TraceStep,
    };
    use crate::debugger::backend::{FrameId, LaunchRequest, StepKind, ThreadId};

    fn le64(values: &[u64]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn function(name: &str, start: Address) -> ModelFunction {
        ModelFunction {
            name: name.to_string(),
            start,
            end: start + 0x100,
            variables: vec![],
        }
    }

    /// `main` calls `run` which calls a null function pointer.
    fn crashed() -> ModelBackend {
        let mut target = ModelTarget::new("crash");
        target.add_code(0x1000, 0x300, 0x90);
        // stack: [sp] = return into `run`, run frame: saved fp -> main frame, ret into main
        target.add_segment(0x7000, le64(&[0x1150, 0, 0x7020, 0x1050, 0x7040, 0x1010, 0, 0, 0, 0]));
        // corrupted frame, saved fp points down the stack
        target.add_segment(0x8000, le64(&[0x7ff0, 0x1020]));
        target.modules.push(ModelModule {
            name: "crash".to_string(),
            path: "/bin/crash".to_string(),
            functions: vec![function("main", 0x1000), function("run", 0x1100)],
            ..Default::default()
        });
        target.trace.push(TraceStep {
            pc: 0,
            sp: 0x7000,
            fp: 0x7010,
            broken_unwind: true,
            signal: Some("SIGSEGV".to_string()),
            ..TraceStep::at(0)
        });
        let backend = ModelBackend::new(target);
        backend
            .launch(&LaunchRequest {
                program: "crash".into(),
                ..Default::default()
            })
            .unwrap();
        backend.step(ThreadId(1), StepKind::Over).unwrap();
        backend
    }

    #[test]
    fn test_unwind_after_null_call() {
        let backend = crashed();
        let frames = backend.frames(ThreadId(1)).unwrap();
        assert!(needs_fallback(&backend, &frames));

        let regs = backend
            .registers(FrameId {
                thread: ThreadId(1),
                depth: 0,
            })
            .unwrap();
        let frames = unwind(&backend, &regs);
        let pcs: Vec<_> = frames.iter().map(|f| f.pc).collect();
        assert_eq!(pcs, vec![0, 0x1150, 0x1050, 0x1010]);
        let names: Vec<_> = frames.iter().map(|f| f.function.as_deref()).collect();
        assert_eq!(names, vec![None, Some("run"), Some("main"), Some("main")]);
    }

    #[test]
    fn test_no_fallback_for_healthy_stack() {
        let backend = crashed();
        let healthy = vec![
            FrameInfo {
                pc: 0x1150,
                function: Some("run".to_string()),
                line: None,
                module: None,
            },
            FrameInfo {
                pc: 0x1050,
                function: Some("main".to_string()),
                line: None,
                module: None,
            },
        ];
        assert!(!needs_fallback(&backend, &healthy));
        assert!(!needs_fallback(&backend, &healthy[..1]));
        assert!(needs_fallback(&backend, &[]));
    }

    #[test]
    fn test_unwind_stops_on_bad_chain() {
        let backend = crashed();
        struct TestCase {
            fp: Address,
            expected: Vec<Address>,
        }
        let test_cases = vec![
            // chain ends with a null return address
            TestCase {
                fp: 0x7020,
                expected: vec![0x1150, 0x1010],
            },
            // saved fp does not grow
            TestCase {
                fp: 0x8000,
                expected: vec![0x1150, 0x1020],
            },
            // unmapped frame
            TestCase {
                fp: 0x9000,
                expected: vec![0x1150],
            },
        ];

        for tc in test_cases {
            let regs = Registers {
                pc: 0x1150,
                sp: 0x7000,
                fp: tc.fp,
                all: vec![],
            };
            let pcs: Vec<_> = unwind(&backend, &regs).iter().map(|f| f.pc).collect();
            assert_eq!(pcs, tc.expected, "fp {:#x}", tc.fp);
        }
    }
}
