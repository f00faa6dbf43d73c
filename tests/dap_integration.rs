
use dap_client::{name_values, DapSession};
use serde_json::{json, Value};
use serial_test::serial;
use std::io::Write;
use std::sync::{Arc, Mutex};
use yadap::config::AdapterSettings;
use yadap::debugger::backend::model::{
    LineRow, ModelFile, ModelFunction, ModelModule, ModelProcess, ModelTarget, ModelVariable,
    TraceStep,
};
use yadap::debugger::backend::{Address, Field, FrameId, NativeType, TypeId, TypeKind};
use yadap::debugger::expression::script::{ScriptContext, ScriptHost, ScriptValue};
use yadap::debugger::Error;

fn le32(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn le64(values: &[u64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn int_type(target: &mut ModelTarget) -> TypeId {
    target.add_type(NativeType::new("int", 4, TypeKind::Int { signed: true }))
}

fn variable(name: &str, type_id: TypeId, address: Address) -> ModelVariable {
    ModelVariable {
        name: name.to_string(),
        type_id,
        address,
    }
}

fn line(address: Address, line: u32) -> LineRow {
    LineRow {
        address,
        line,
        column: 0,
    }
}

/// `for (i = 0; i < iterations; i++) { line 5; line 6 }` in `src/main.c`.
fn loop_target(iterations: i32) -> ModelTarget {
    let mut target = ModelTarget::new("loop");
    let int = int_type(&mut target);
    target.add_code(0x1000, 0x100, 0x90);
    target.add_segment(0x8000, le32(&[0]));
    target.modules.push(ModelModule {
        name: "loop".to_string(),
        path: "/bin/loop".to_string(),
        files: vec![ModelFile {
            path: "src/main.c".to_string(),
            lines: vec![line(0x1000, 3), line(0x1004, 5), line(0x1008, 6)],
        }],
        functions: vec![ModelFunction {
            name: "main".to_string(),
            start: 0x1000,
            end: 0x1010,
            variables: vec![variable("i", int, 0x8000)],
        }],
        ..Default::default()
    });
    for i in 0..iterations {
        target
            .trace
            .push(TraceStep::at(0x1004).with_write(0x8000, i.to_le_bytes()));
        target.trace.push(TraceStep::at(0x1008));
    }
    target
}

fn loop_config() -> Value {
    json!({ "program": "/bin/loop", "relativePathBase": "/work" })
}

const MAIN_C: &str = "/work/src/main.c";

/// A struct reachable through a pointer, a double pointer and a reference, plus arrays.
fn vars_target() -> ModelTarget {
    let mut target = ModelTarget::new("vars");
    let int = int_type(&mut target);
    let point = target.add_type(NativeType::new(
        "Point3",
        12,
        TypeKind::Struct {
            fields: vec![
                Field::named("x", int, 0),
                Field::named("y", int, 4),
                Field::named("z", int, 8),
            ],
        },
    ));
    let ptr = target.add_type(NativeType::new("Point3 *", 8, TypeKind::Pointer { pointee: point }));
    let pptr = target.add_type(NativeType::new("Point3 **", 8, TypeKind::Pointer { pointee: ptr }));
    let reference = target.add_type(NativeType::new(
        "Point3 &",
        8,
        TypeKind::Reference { pointee: point },
    ));
    let int_ptr = target.add_type(NativeType::new("int *", 8, TypeKind::Pointer { pointee: int }));
    let array = target.add_type(NativeType::new(
        "int[4]",
        16,
        TypeKind::Array {
            element: int,
            len: 4,
        },
    ));

    target.add_code(0x1000, 0x100, 0x90);
    target.add_segment(0x9000, le32(&[1, 2, 3]));
    target.add_segment(0x9100, le64(&[0x9000, 0x9100, 0x9000, 0xa000]));
    target.add_segment(0xa000, le32(&(0..10).map(|i| i * 3).collect::<Vec<_>>()));
    target.add_segment(0xa100, le32(&[4, 3, 2, 1]));

    target.modules.push(ModelModule {
        name: "vars".to_string(),
        path: "/bin/vars".to_string(),
        files: vec![ModelFile {
            path: "src/vars.c".to_string(),
            lines: vec![line(0x1000, 8), line(0x1004, 10)],
        }],
        functions: vec![ModelFunction {
            name: "main".to_string(),
            start: 0x1000,
            end: 0x1010,
            variables: vec![
                variable("point", point, 0x9000),
                variable("ptr", ptr, 0x9100),
                variable("pptr", pptr, 0x9108),
                variable("ref", reference, 0x9110),
                variable("array_ptr", int_ptr, 0x9118),
                variable("arr", array, 0xa100),
            ],
        }],
        ..Default::default()
    });
    target.trace.push(TraceStep::at(0x1000));
    target.trace.push(TraceStep::at(0x1004));
    target
}

/// Start a `vars` session stopped at line 10, return the session and the top frame id.
fn vars_session() -> anyhow::Result<(DapSession, i64)> {
    let mut session = DapSession::start(vars_target())?;
    session.launch(
        json!({ "program": "/bin/vars", "relativePathBase": "/work" }),
        "/work/src/vars.c",
        &[json!({ "line": 10 })],
    )?;
    let stop = session.stopped()?;
    let frame = session.top_frame(stop["threadId"].as_i64().unwrap_or(1))?;
    Ok((session, frame["id"].as_i64().unwrap_or_default()))
}

#[test]
#[serial]
fn test_shared_address_breakpoints() -> anyhow::Result<()> {
    let mut session = DapSession::start(loop_target(2))?;
    session.initialize()?;
    session.client.request("launch", loop_config())?;
    let source = session.client.request(
        "setBreakpoints",
        json!({ "source": { "path": MAIN_C }, "breakpoints": [{ "line": 5 }] }),
    )?;
    let instruction = session.client.request(
        "setInstructionBreakpoints",
        json!({ "breakpoints": [{ "instructionReference": "0x1000", "offset": 4 }] }),
    )?;
    let source_id = source["breakpoints"][0]["id"].clone();
    let instruction_id = instruction["breakpoints"][0]["id"].clone();
    assert_eq!(source["breakpoints"][0]["verified"], true);
    assert_eq!(instruction["breakpoints"][0]["verified"], true);
    assert_ne!(source_id, instruction_id);
    session.client.request("configurationDone", json!({}))?;

    // one stop reports both breakpoints
    let events = session.client.events_until("stopped")?;
    let stops: Vec<&Value> = events.iter().filter(|e| e["event"] == "stopped").collect();
    assert_eq!(stops.len(), 1);
    let mut hit: Vec<i64> = stops[0]["body"]["hitBreakpointIds"]
        .as_array()
        .map(|ids| ids.iter().filter_map(Value::as_i64).collect())
        .unwrap_or_default();
    hit.sort_unstable();
    let mut expected = vec![source_id.as_i64().unwrap(), instruction_id.as_i64().unwrap()];
    expected.sort_unstable();
    assert_eq!(hit, expected);

    session.disconnect()
}

#[test]
#[serial]
fn test_stale_handles_after_continue() -> anyhow::Result<()> {
    let mut session = DapSession::start(loop_target(3))?;
    session.launch(loop_config(), MAIN_C, &[json!({ "line": 5 })])?;
    session.stopped()?;

    let frame_id = session.top_frame(1)?["id"].as_i64().unwrap();
    let locals = session.scope(frame_id, "Local")?;
    assert_eq!(
        name_values(&session.variables(locals)?),
        vec![("i".to_string(), "0".to_string())]
    );

    session.client.request("continue", json!({ "threadId": 1 }))?;
    session.stopped()?;

    let message = session
        .client
        .request_err("variables", json!({ "variablesReference": locals }))?;
    assert!(message.contains("not valid anymore"), "{message}");
    let message = session
        .client
        .request_err("scopes", json!({ "frameId": frame_id }))?;
    assert!(message.contains("not valid anymore"), "{message}");

    // the adapter is still healthy
    let frame_id = session.top_frame(1)?["id"].as_i64().unwrap();
    assert_eq!(session.evaluate("i", frame_id)?["result"], "1");

    session.disconnect()
}

#[test]
#[serial]
fn test_conditional_breakpoint_stops_once() -> anyhow::Result<()> {
    let mut session = DapSession::start(loop_target(10))?;
    session.launch(
        loop_config(),
        MAIN_C,
        &[json!({ "line": 5, "condition": "i == 5" })],
    )?;

    let stop = session.stopped()?;
    assert_eq!(stop["reason"], "breakpoint");
    let frame_id = session.top_frame(1)?["id"].as_i64().unwrap();
    let locals = session.scope(frame_id, "Local")?;
    assert_eq!(
        name_values(&session.variables(locals)?),
        vec![("i".to_string(), "5".to_string())]
    );

    session.client.request("continue", json!({ "threadId": 1 }))?;
    let events = session.client.events_until("exited")?;
    assert!(events.iter().all(|e| e["event"] != "stopped"));
    assert_eq!(events.last().unwrap()["body"]["exitCode"], 0);
    session.client.wait_for_event("terminated")?;

    session.disconnect()
}

#[test]
#[serial]
fn test_array_expansion_is_deterministic() -> anyhow::Result<()> {
    let (mut session, frame_id) = vars_session()?;

    let arr = session.evaluate("arr", frame_id)?;
    assert_eq!(arr["result"], "[4, 3, 2, 1]");
    assert_eq!(arr["indexedVariables"], 4);
    let reference = arr["variablesReference"].as_i64().unwrap();

    let first = session.variables(reference)?;
    let second = session.variables(reference)?;
    assert_eq!(first, second);
    assert_eq!(
        name_values(&first),
        [("[0]", "4"), ("[1]", "3"), ("[2]", "2"), ("[3]", "1")]
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .to_vec()
    );

    session.disconnect()
}

#[test]
#[serial]
fn test_struct_through_pointers_and_reference() -> anyhow::Result<()> {
    let (mut session, frame_id) = vars_session()?;
    let expected: Vec<(String, String)> = [("x", "1"), ("y", "2"), ("z", "3")]
        .map(|(n, v)| (n.to_string(), v.to_string()))
        .to_vec();

    for expression in ["point", "ptr", "ref"] {
        let value = session.evaluate(expression, frame_id)?;
        let reference = value["variablesReference"].as_i64().unwrap();
        assert_ne!(reference, 0, "{expression}");
        assert_eq!(
            name_values(&session.variables(reference)?),
            expected,
            "{expression}"
        );
    }

    // a double pointer expands to the pointer first
    let pptr = session.evaluate("pptr", frame_id)?;
    let deref = session.variables(pptr["variablesReference"].as_i64().unwrap())?;
    assert_eq!(deref.len(), 1);
    assert_eq!(deref[0]["name"], "*pptr");
    let fields = session.variables(deref[0]["variablesReference"].as_i64().unwrap())?;
    assert_eq!(name_values(&fields), expected);

    session.disconnect()
}

#[test]
#[serial]
fn test_array_directive() -> anyhow::Result<()> {
    let (mut session, frame_id) = vars_session()?;

    let value = session.evaluate("array_ptr,[10]", frame_id)?;
    assert_eq!(value["indexedVariables"], 10);
    let elements = session.variables(value["variablesReference"].as_i64().unwrap())?;
    let names: Vec<String> = name_values(&elements).into_iter().map(|(n, _)| n).collect();
    let expected: Vec<String> = (0..10).map(|i| format!("[{i}]")).collect();
    assert_eq!(names, expected);
    assert_eq!(elements[9]["value"], "27");

    let value = session.evaluate("array_ptr,x[10]", frame_id)?;
    let elements = session.variables(value["variablesReference"].as_i64().unwrap())?;
    assert_eq!(elements.len(), 10);
    for (i, element) in elements.iter().enumerate() {
        let text = element["value"].as_str().unwrap();
        assert_eq!(text, format!("0x{:08x}", i * 3));
    }

    session.disconnect()
}

#[test]
#[serial]
fn test_environment_overrides() -> anyhow::Result<()> {
    let mut env_file = tempfile::NamedTempFile::new()?;
    writeln!(env_file, "FOO=XXX")?;
    writeln!(env_file, "BAZ=baz")?;

    let mut target = loop_target(1);
    target.expect_env.insert("FOO".to_string(), "foo".to_string());
    target.expect_env.insert("BAZ".to_string(), "baz".to_string());

    let mut session = DapSession::start(target)?;
    session.launch(
        json!({
            "program": "/bin/loop",
            "env": { "FOO": "foo" },
            "envFile": env_file.path(),
        }),
        MAIN_C,
        &[],
    )?;

    let exited = session.client.wait_for_event("exited")?;
    assert_eq!(exited["body"]["exitCode"], 0);
    let launch = session.backend.launch_request().unwrap();
    assert_eq!(launch.env.get("FOO").map(String::as_str), Some("foo"));
    assert_eq!(launch.env.get("BAZ").map(String::as_str), Some("baz"));

    session.disconnect()
}

/// `start` has no line information, the process stops at its entry.
fn entry_target() -> ModelTarget {
    let mut target = ModelTarget::new("entry");
    target.entry = 0x2000;
    target.add_code(0x2000, 0x10, 0x90);
    target.modules.push(ModelModule {
        name: "entry".to_string(),
        path: "/bin/entry".to_string(),
        functions: vec![ModelFunction {
            name: "start".to_string(),
            start: 0x2000,
            end: 0x2010,
            variables: vec![],
        }],
        ..Default::default()
    });
    for pc in [0x2002, 0x2004, 0x2006] {
        target.trace.push(TraceStep::at(pc));
    }
    target
}

#[test]
#[serial]
fn test_breakpoint_in_disassembly() -> anyhow::Result<()> {
    let mut session = DapSession::start(entry_target())?;
    session.initialize()?;
    session.client.request(
        "launch",
        json!({ "program": "/bin/entry", "stopOnEntry": true }),
    )?;
    session.client.request("configurationDone", json!({}))?;
    assert_eq!(session.stopped()?["reason"], "entry");

    let frame = session.top_frame(1)?;
    assert_eq!(frame["name"], "start");
    assert_eq!(frame["line"], 1);
    assert_eq!(frame["source"]["presentationHint"], "deemphasize");
    let reference = frame["source"]["sourceReference"].as_i64().unwrap();
    assert!(reference > 0);

    let source = session
        .client
        .request("source", json!({ "sourceReference": reference }))?;
    let content = source["content"].as_str().unwrap();
    assert!(content.lines().count() >= 5, "{content}");

    let body = session.client.request(
        "setBreakpoints",
        json!({
            "source": { "sourceReference": reference },
            "breakpoints": [{ "line": 5 }],
        }),
    )?;
    assert_eq!(body["breakpoints"][0]["verified"], true);
    assert_eq!(body["breakpoints"][0]["line"], 5);

    session.client.request("continue", json!({ "threadId": 1 }))?;
    assert_eq!(session.stopped()?["reason"], "breakpoint");
    let frame = session.top_frame(1)?;
    assert_eq!(frame["source"]["sourceReference"], reference);
    assert_eq!(frame["line"], 5);
    assert_eq!(frame["instructionPointerReference"], "0x2004");

    session.disconnect()
}

/// `main` calls `run` which calls a null function pointer.
fn crash_target() -> ModelTarget {
    let function = |name: &str, start: Address| ModelFunction {
        name: name.to_string(),
        start,
        end: start + 0x100,
        variables: vec![],
    };
    let mut target = ModelTarget::new("crash");
    target.add_code(0x1000, 0x300, 0x90);
    target.add_segment(0x7000, le64(&[0x1150, 0, 0x7020, 0x1050, 0x7040, 0x1010, 0, 0, 0, 0]));
    target.modules.push(ModelModule {
        name: "crash".to_string(),
        path: "/bin/crash".to_string(),
        functions: vec![function("main", 0x1000), function("run", 0x1100)],
        ..Default::default()
    });
    target.trace.push(TraceStep {
        sp: 0x7000,
        fp: 0x7010,
        broken_unwind: true,
        signal: Some("SIGSEGV".to_string()),
        ..TraceStep::at(0)
    });
    target
}

#[test]
#[serial]
fn test_stack_trace_after_fault() -> anyhow::Result<()> {
    let mut session = DapSession::start(crash_target())?;
    session.launch(json!({ "program": "/bin/crash" }), "/src/crash.c", &[])?;

    let stop = session.stopped()?;
    assert_eq!(stop["reason"], "signal");
    assert_eq!(stop["description"], "Signal: SIGSEGV");

    let trace = session
        .client
        .request("stackTrace", json!({ "threadId": 1 }))?;
    assert_eq!(trace["totalFrames"], 4);
    let frames = trace["stackFrames"].as_array().unwrap();
    assert_eq!(frames[0]["instructionPointerReference"], "0x0");
    let callers: Vec<&str> = frames[1..]
        .iter()
        .map(|f| f["name"].as_str().unwrap_or_default())
        .collect();
    assert_eq!(callers, ["run", "main", "main"]);

    // callers restored from frame pointers have no scopes
    let scopes = session
        .client
        .request("scopes", json!({ "frameId": frames[1]["id"] }))?;
    assert_eq!(scopes["scopes"], json!([]));

    session.disconnect()
}

#[test]
#[serial]
fn test_attach_ambiguous_name() -> anyhow::Result<()> {
    let mut target = loop_target(1);
    for (pid, name) in [(10, "server"), (11, "/usr/bin/server")] {
        target.processes.push(ModelProcess {
            pid,
            name: name.to_string(),
            appears_after: 0,
        });
    }
    let mut session = DapSession::start(target)?;
    session.initialize()?;

    let message = session
        .client
        .request_err("attach", json!({ "program": "server" }))?;
    assert!(message.contains("ambiguous"), "{message}");

    // a pid still works
    session.client.request("attach", json!({ "pid": 11 }))?;
    session.disconnect()
}

#[test]
#[serial]
fn test_attach_wait_cancelled_by_disconnect() -> anyhow::Result<()> {
    let mut target = loop_target(1);
    target.processes.push(ModelProcess {
        pid: 10,
        name: "server".to_string(),
        appears_after: u32::MAX,
    });
    let settings = AdapterSettings {
        attach_poll_interval_ms: 5,
        ..Default::default()
    };
    let mut session = DapSession::builder(target).settings(settings).start()?;
    session.initialize()?;

    let attach = session.client.send_request(
        "attach",
        json!({ "program": "server", "waitFor": true }),
    )?;
    let disconnect = session.client.send_request("disconnect", json!({}))?;

    let response = session.client.read_response(attach)?;
    assert_eq!(response["success"], false);
    assert!(
        response["message"].as_str().unwrap().contains("cancelled"),
        "{response}"
    );
    let response = session.client.read_response(disconnect)?;
    assert_eq!(response["success"], true);
    session.join()
}

#[test]
#[serial]
fn test_evaluate_timeout() -> anyhow::Result<()> {
    let mut target = loop_target(1);
    target.evaluate_latency_ms = 500;
    let settings = AdapterSettings {
        evaluate_timeout_ms: 50,
        ..Default::default()
    };
    let mut session = DapSession::builder(target).settings(settings).start()?;
    session.launch(loop_config(), MAIN_C, &[json!({ "line": 5 })])?;
    session.stopped()?;
    let frame_id = session.top_frame(1)?["id"].as_i64().unwrap();

    let message = session.client.request_err(
        "evaluate",
        json!({ "expression": "/nat i", "frameId": frame_id, "context": "watch" }),
    )?;
    assert_eq!(message, "evaluate timed out after 50 ms");

    // the session is not affected
    assert_eq!(session.evaluate("i + 1", frame_id)?["result"], "1");
    session.disconnect()
}

/// Script host with a tiny command language: `show` opens a webview, `close <id>` disposes it.
struct WebviewScript {
    received: Arc<Mutex<Vec<Value>>>,
}

impl ScriptHost for WebviewScript {
    fn evaluate(
        &mut self,
        code: &str,
        _: Option<FrameId>,
        ctx: &mut dyn ScriptContext,
    ) -> Result<ScriptValue, Error> {
        if let Some(id) = code.strip_prefix("close ") {
            ctx.dispose_webview(id)?;
            return Ok(ScriptValue::None);
        }
        if code != "show" {
            return Err(Error::Script(format!("NameError: {code}")));
        }

        let id = ctx.create_webview("<h1>loop</h1>".to_string(), Some("Loop".to_string()), json!({}))?;
        let received = self.received.clone();
        ctx.on_message(
            &id,
            Box::new(move |message| {
                if let Ok(mut received) = received.lock() {
                    received.push(message);
                }
            }),
        )?;
        ctx.post_message(&id, json!({ "hello": 1 }))?;
        Ok(ScriptValue::Str(id))
    }
}

#[test]
#[serial]
fn test_webview_round_trip() -> anyhow::Result<()> {
    let received = Arc::new(Mutex::new(vec![]));
    let script = WebviewScript {
        received: received.clone(),
    };
    let mut session = DapSession::builder(loop_target(1)).script(script).start()?;
    session.launch(loop_config(), MAIN_C, &[json!({ "line": 5 })])?;
    session.stopped()?;

    session.client.request(
        "evaluate",
        json!({ "expression": "/py show", "context": "watch" }),
    )?;
    let created = session.client.wait_for_event("_webviewCreate")?;
    assert_eq!(created["body"]["title"], "Loop");
    let id = created["body"]["id"].as_str().unwrap().to_string();
    let posted = session.client.wait_for_event("_webviewPostMessage")?;
    assert_eq!(posted["body"], json!({ "id": id, "message": { "hello": 1 } }));

    session.client.request(
        "_webviewMessage",
        json!({ "id": id, "message": { "clicked": true } }),
    )?;
    assert_eq!(*received.lock().unwrap(), vec![json!({ "clicked": true })]);

    session.client.request(
        "evaluate",
        json!({ "expression": format!("/py close {id}"), "context": "watch" }),
    )?;
    let disposed = session.client.wait_for_event("_webviewDispose")?;
    assert_eq!(disposed["body"]["id"], id.as_str());
    let message = session
        .client
        .request_err("_webviewMessage", json!({ "id": id, "message": {} }))?;
    assert!(message.contains("unknown webview"), "{message}");

    session.disconnect()
}

#[test]
#[serial]
fn test_connection_lost() -> anyhow::Result<()> {
    let mut target = loop_target(2);
    target.trace.insert(
        1,
        TraceStep {
            connection_lost: true,
            ..TraceStep::at(0x1008)
        },
    );
    let mut session = DapSession::builder(target).console_logging().start()?;
    session.launch(loop_config(), MAIN_C, &[])?;

    let events = session.client.events_until("terminated")?;
    let lost = events.iter().any(|e| {
        e["event"] == "output"
            && e["body"]["category"] == "stderr"
            && e["body"]["output"]
                .as_str()
                .is_some_and(|text| text.contains("connection lost"))
    });
    assert!(lost, "{events:?}");

    // the adapter error log is mirrored into the debug console
    let is_error_log = |event: &Value| {
        event["event"] == "output"
            && event["body"]["category"] == "console"
            && event["body"]["output"]
                .as_str()
                .is_some_and(|text| text.starts_with("[ERROR]"))
    };
    if !events.iter().any(is_error_log) {
        while !is_error_log(&session.client.wait_for_event("output")?) {}
    }

    let message = session
        .client
        .request_err("continue", json!({ "threadId": 1 }))?;
    assert!(!message.is_empty());
    session.disconnect()
}
