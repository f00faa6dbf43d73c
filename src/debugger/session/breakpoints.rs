//! Breakpoint requests and stop handling.

use super::{parse_address, Session, SessionState};
use crate::debugger::backend::{FrameId, OutputCategory, StopReason, ThreadId};
use crate::debugger::breakpoint::{
    parse_log_message, BreakpointId, BreakpointKind, BreakpointOptions, LogSegment,
};
use crate::debugger::expression::Expression;
use crate::debugger::pathmap::file_name;
use crate::debugger::variable::Formatter;
use crate::debugger::Error;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub(super) struct ConditionArguments {
    condition: Option<String>,
    hit_condition: Option<String>,
    log_message: Option<String>,
}

impl ConditionArguments {
    fn options(self) -> BreakpointOptions {
        let non_empty = |text: Option<String>| text.filter(|t| !t.trim().is_empty());
        BreakpointOptions {
            condition: non_empty(self.condition),
            hit_condition: non_empty(self.hit_condition),
            log_message: non_empty(self.log_message),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub(super) struct SourceArgument {
    path: Option<String>,
    source_reference: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub(super) struct SourceBreakpoint {
    line: u32,
    #[serde(flatten)]
    conditions: ConditionArguments,
}

#[derive(Debug, Deserialize)]
pub(super) struct SetBreakpointsArguments {
    source: SourceArgument,
    #[serde(default)]
    breakpoints: Vec<SourceBreakpoint>,
}

#[derive(Debug, Deserialize)]
pub(super) struct FunctionBreakpoint {
    name: String,
    #[serde(flatten)]
    conditions: ConditionArguments,
}

#[derive(Debug, Deserialize)]
pub(super) struct SetFunctionBreakpointsArguments {
    #[serde(default)]
    breakpoints: Vec<FunctionBreakpoint>,
}

#[derive(Debug, Deserialize)]
pub(super) struct SetExceptionBreakpointsArguments {
    #[serde(default)]
    filters: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct InstructionBreakpoint {
    instruction_reference: String,
    #[serde(default)]
    offset: i64,
    #[serde(flatten)]
    conditions: ConditionArguments,
}

#[derive(Debug, Deserialize)]
pub(super) struct SetInstructionBreakpointsArguments {
    #[serde(default)]
    breakpoints: Vec<InstructionBreakpoint>,
}

impl Session {
    pub(super) fn set_breakpoints(&mut self, args: SetBreakpointsArguments) -> Result<Value, Error> {
        let requested: Vec<(u32, BreakpointOptions)> = args
            .breakpoints
            .into_iter()
            .map(|bp| (bp.line, bp.conditions.options()))
            .collect();

        let ids = match args.source.source_reference.filter(|r| *r > 0) {
            Some(reference) => {
                let requested = requested
                    .into_iter()
                    .map(|(line, options)| {
                        let address = self.synthesizer.address_of(reference, line)?;
                        Ok((line, address, options))
                    })
                    .collect::<Result<Vec<_>, Error>>()?;
                self.breakpoints.set_synthetic_breakpoints(
                    self.backend.as_ref(),
                    &self.mapper,
                    reference,
                    requested,
                )
            }
            None => {
                let path = args.source.path.ok_or(Error::MissingArgument("source.path"))?;
                self.breakpoints.set_source_breakpoints(
                    self.backend.as_ref(),
                    &self.mapper,
                    &path,
                    requested,
                )
            }
        };
        Ok(self.breakpoints_body(&ids))
    }

    pub(super) fn set_function_breakpoints(
        &mut self,
        args: SetFunctionBreakpointsArguments,
    ) -> Result<Value, Error> {
        let requested = args
            .breakpoints
            .into_iter()
            .map(|bp| (bp.name, bp.conditions.options()))
            .collect();
        let ids = self.breakpoints.set_function_breakpoints(
            self.backend.as_ref(),
            &self.mapper,
            requested,
        );
        Ok(self.breakpoints_body(&ids))
    }

    pub(super) fn set_exception_breakpoints(
        &mut self,
        args: SetExceptionBreakpointsArguments,
    ) -> Result<Value, Error> {
        let ids = self.breakpoints.set_exception_breakpoints(
            self.backend.as_ref(),
            &self.mapper,
            &args.filters,
        );
        Ok(self.breakpoints_body(&ids))
    }

    pub(super) fn set_instruction_breakpoints(
        &mut self,
        args: SetInstructionBreakpointsArguments,
    ) -> Result<Value, Error> {
        let requested = args
            .breakpoints
            .into_iter()
            .map(|bp| {
                let address = parse_address(&bp.instruction_reference)?;
                Ok((address.wrapping_add_signed(bp.offset), bp.conditions.options()))
            })
            .collect::<Result<Vec<_>, Error>>()?;
        let ids = self.breakpoints.set_instruction_breakpoints(
            self.backend.as_ref(),
            &self.mapper,
            requested,
        );
        Ok(self.breakpoints_body(&ids))
    }

    fn breakpoints_body(&self, ids: &[BreakpointId]) -> Value {
        let breakpoints: Vec<Value> = ids.iter().map(|&id| self.breakpoint_json(id)).collect();
        json!({ "breakpoints": breakpoints })
    }

    fn breakpoint_json(&self, id: BreakpointId) -> Value {
        let Some(bp) = self.breakpoints.get(id) else {
            return json!({ "id": id, "verified": false });
        };
        let mut json = json!({ "id": id, "verified": bp.verified() });
        if let Some(line) = bp.line() {
            json["line"] = json!(line);
        }
        if let Some(ref message) = bp.message {
            json["message"] = json!(message);
        }
        if let Some(location) = bp.locations.first() {
            json["instructionReference"] = json!(format!("{:#x}", location.address));
        }
        match bp.kind {
            BreakpointKind::Source { ref path, .. } => {
                json["source"] = json!({ "name": file_name(path), "path": path });
            }
            BreakpointKind::Synthetic {
                reference, line, ..
            } => {
                let name = self.synthesizer.get(reference).map(|doc| doc.name.clone());
                json["source"] = json!({ "name": name, "sourceReference": reference });
                json["line"] = json!(line);
            }
            _ => {}
        }
        json
    }

    /// Resolve breakpoints again, report the changed ones.
    pub(super) fn resolve_breakpoints(&mut self) {
        let changed = self
            .breakpoints
            .resolve_all(self.backend.as_ref(), &self.mapper);
        for id in changed {
            let breakpoint = self.breakpoint_json(id);
            self.emit(
                "breakpoint",
                Some(json!({ "reason": "changed", "breakpoint": breakpoint })),
            );
        }
    }

    // --------------------------------- stops -----------------------------------------------------

    /// Handle a stop notification of one thread.
    pub(super) fn on_stop(&mut self, thread: ThreadId, reason: StopReason) {
        match self.state {
            SessionState::Running => {}
            SessionState::Stopped => {
                log::debug!(target: "session", "stop of thread {thread} joins the current stop");
                return;
            }
            state => {
                log::debug!(target: "session", "stop of thread {thread} ignored in state {state}");
                return;
            }
        }

        let mut hit = vec![];
        let mut errors = vec![];
        let (reason, description) = match reason {
            StopReason::Breakpoint { address } => {
                let ids = self.breakpoints.at(address).to_vec();
                for &id in &ids {
                    if self.check_breakpoint(id, thread, &mut errors) {
                        hit.push(id);
                    }
                }
                if hit.is_empty() && !ids.is_empty() {
                    self.output_errors(&errors);
                    log::debug!(target: "session", "resume after breakpoint at {address:#x}");
                    if let Err(e) = self.backend.resume() {
                        log::warn!(target: "session", "resume: {e}");
                    }
                    return;
                }
                self.breakpoint_reason(&hit)
            }
            StopReason::Signal { name } => ("signal", Some(format!("Signal: {name}"))),
            StopReason::Exception { description } => ("exception", Some(description)),
            StopReason::Step => ("step", None),
            StopReason::Pause => ("pause", None),
            StopReason::Entry => ("entry", None),
        };

        self.state = SessionState::Stopped;
        self.stopped_thread = Some(thread);
        log::info!(target: "session", "thread {thread} stopped: {reason}");

        let mut body = json!({
            "reason": reason,
            "threadId": thread.0,
            "allThreadsStopped": true,
        });
        if !hit.is_empty() {
            body["hitBreakpointIds"] = json!(hit);
        }
        let description = match (description, errors.is_empty()) {
            (description, true) => description,
            (Some(description), false) => Some(format!("{description}\n{}", errors.join("\n"))),
            (None, false) => Some(errors.join("\n")),
        };
        if let Some(description) = description {
            body["description"] = json!(description);
        }
        self.output_errors(&errors);
        self.emit("stopped", Some(body));
    }

    fn breakpoint_reason(&self, hit: &[BreakpointId]) -> (&'static str, Option<String>) {
        let kind = hit
            .first()
            .and_then(|&id| self.breakpoints.get(id))
            .map(|bp| &bp.kind);
        match kind {
            Some(BreakpointKind::Function { .. }) => ("function breakpoint", None),
            Some(BreakpointKind::Instruction { .. }) => ("instruction breakpoint", None),
            Some(BreakpointKind::Exception { filter }) => {
                ("exception", Some(filter.label().to_string()))
            }
            _ => ("breakpoint", None),
        }
    }

    fn output_errors(&mut self, errors: &[String]) {
        for error in errors {
            self.output(OutputCategory::Console, format!("{error}\n"));
        }
    }

    /// Return true if a breakpoint hit stops the debugee.
    ///
    /// A condition is checked first, its failure counts as true. Only hits with a holding
    /// condition count against the hit condition. Log points never stop.
    fn check_breakpoint(
        &mut self,
        id: BreakpointId,
        thread: ThreadId,
        errors: &mut Vec<String>,
    ) -> bool {
        let Some(bp) = self.breakpoints.get(id) else {
            return false;
        };
        let options = bp.options.clone();
        let frame = FrameId { thread, depth: 0 };

        if let Some(ref condition) = options.condition {
            match self.check_condition(condition, frame) {
                Ok(true) => {}
                Ok(false) => return false,
                Err(e) => {
                    log::debug!(target: "session", "breakpoint {id} condition: {e}");
                    errors.push(format!("Breakpoint {id} condition `{condition}` failed: {e}"));
                }
            }
        }

        if !self.breakpoints.register_hit(id) {
            return false;
        }

        if let Some(ref message) = options.log_message {
            let text = self.log_message(message, frame);
            self.output(OutputCategory::Console, format!("{text}\n"));
            return false;
        }
        true
    }

    fn check_condition(&mut self, condition: &str, frame: FrameId) -> Result<bool, Error> {
        let expression = Expression::parse(condition, self.settings.condition_expressions)?;
        let evaluated = self.evaluate_expression(&expression, Some(frame))?;
        let backend = self.backend.clone();
        let options = self.settings.format_options();
        evaluated.truthy(&Formatter::new(backend.as_ref(), &options))
    }

    /// Interpolate `{expr}` pieces of a log point message.
    fn log_message(&mut self, message: &str, frame: FrameId) -> String {
        let mut text = String::new();
        for segment in parse_log_message(message) {
            match segment {
                LogSegment::Text(part) => text.push_str(&part),
                LogSegment::Expr(expr) => match self.render_expression(&expr, frame) {
                    Ok(summary) => text.push_str(&summary),
                    Err(e) => text.push_str(&format!("<error: {e}>")),
                },
            }
        }
        text
    }

    fn render_expression(&mut self, text: &str, frame: FrameId) -> Result<String, Error> {
        let expression = Expression::parse(text, self.settings.expressions)?;
        let evaluated = self.evaluate_expression(&expression, Some(frame))?;
        let backend = self.backend.clone();
        let options = self.settings.format_options();
        let formatter = Formatter::new(backend.as_ref(), &options);
        Ok(evaluated.into_node(&formatter, text, expression.directive)?.summary)
    }
}
