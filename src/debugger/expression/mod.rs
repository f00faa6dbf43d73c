//! Expression dispatcher.
//!
//! An expression may start with an evaluator tag (`/se `, `/py `, `/nat `) and end with a
//! format directive (`,x`, `,[N]`). The tag selects one of the evaluators, without a tag the
//! evaluator depends on where the expression comes from (watch, hover, breakpoint condition).
//! Every evaluator result is normalized into [`Evaluated`] which the value formatter renders.

pub mod parser;
pub mod script;
pub mod simple;

use crate::debugger::backend::{Backend, FrameId};
use crate::debugger::expression::script::{ScriptContext, ScriptHost, ScriptValue};
use crate::debugger::expression::simple::{SimpleEvaluator, SimpleValue};
use crate::debugger::variable::directive::format_int;
use crate::debugger::variable::string::quote_utf8;
use crate::debugger::variable::{
    split_directive, Directive, FormatOptions, Formatter, Primitive, TypedValue, ValueNode,
};
use crate::debugger::Error;
use chumsky::Parser as _;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EvaluatorKind {
    #[default]
    Simple,
    Python,
    Native,
}

const TAGS: [(&str, EvaluatorKind); 3] = [
    ("/se ", EvaluatorKind::Simple),
    ("/py ", EvaluatorKind::Python),
    ("/nat ", EvaluatorKind::Native),
];

/// Origin of an `evaluate` request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvalContext {
    /// Watch panel or editor hover.
    Watch,
    /// Debug console, may carry backend commands.
    Repl,
    /// Value copied as text, summaries are not shortened.
    Clipboard,
}

impl EvalContext {
    /// Context of a DAP `evaluate` request.
    pub fn from_dap(context: Option<&str>) -> Self {
        match context {
            Some("watch") | Some("hover") => EvalContext::Watch,
            Some("clipboard") | Some("variables") => EvalContext::Clipboard,
            _ => EvalContext::Repl,
        }
    }
}

/// Tagged expression with the format directive split off.
#[derive(Clone, Debug, PartialEq)]
pub struct Expression {
    pub kind: EvaluatorKind,
    pub code: String,
    pub directive: Option<Directive>,
}

impl Expression {
    pub fn parse(text: &str, default: EvaluatorKind) -> Result<Self, Error> {
        let text = text.trim_start();
        let (kind, rest) = TAGS
            .iter()
            .find_map(|(tag, kind)| text.strip_prefix(tag).map(|rest| (*kind, rest)))
            .unwrap_or((default, text));
        let (code, directive) = split_directive(rest)?;

        Ok(Self {
            kind,
            code: code.trim().to_string(),
            directive,
        })
    }
}

/// Evaluation result, normalized across evaluators.
#[derive(Clone, Debug)]
pub enum Evaluated {
    Value(TypedValue),
    Int(i128),
    Float(f64),
    Bool(bool),
    Str(String),
    None,
}

impl From<SimpleValue> for Evaluated {
    fn from(value: SimpleValue) -> Self {
        match value {
            SimpleValue::Native(v) => Evaluated::Value(v),
            SimpleValue::Int(i) => Evaluated::Int(i),
            SimpleValue::Float(f) => Evaluated::Float(f),
            SimpleValue::Bool(b) => Evaluated::Bool(b),
            SimpleValue::Str(s) => Evaluated::Str(s),
        }
    }
}

impl From<ScriptValue> for Evaluated {
    fn from(value: ScriptValue) -> Self {
        match value {
            ScriptValue::None => Evaluated::None,
            ScriptValue::Bool(b) => Evaluated::Bool(b),
            ScriptValue::Int(i) => Evaluated::Int(i as i128),
            ScriptValue::Float(f) => Evaluated::Float(f),
            ScriptValue::Str(s) => Evaluated::Str(s),
            ScriptValue::Native(v) => Evaluated::Value(v),
        }
    }
}

impl Evaluated {
    /// Render a result, `name` is the display name of the node.
    pub fn into_node(
        self,
        formatter: &Formatter,
        name: &str,
        directive: Option<Directive>,
    ) -> Result<ValueNode, Error> {
        let radix = directive.and_then(|d| d.radix);
        let node = match self {
            Evaluated::Value(value) => {
                let value = value.renamed(name).with_radix(radix);
                match directive.and_then(|d| d.array_len) {
                    Some(len) => formatter.synthetic_array(&value, len)?,
                    None => formatter.node(&value),
                }
            }
            Evaluated::Int(i) => {
                let (size, type_name) = if i32::try_from(i).is_ok() {
                    (4, "int")
                } else {
                    (8, "long")
                };
                ValueNode::scalar(name, format_int(i as u64, true, size, radix), Some(type_name))
            }
            Evaluated::Float(f) => ValueNode::scalar(name, f, Some("double")),
            Evaluated::Bool(b) => ValueNode::scalar(name, b, Some("bool")),
            Evaluated::Str(s) => ValueNode::scalar(name, quote_utf8(s.as_bytes(), false), Some("string")),
            Evaluated::None => ValueNode::scalar(name, "None", None),
        };
        Ok(node)
    }

    /// Truthiness of a result as a breakpoint condition.
    pub fn truthy(&self, formatter: &Formatter) -> Result<bool, Error> {
        Ok(match self {
            Evaluated::Value(value) => match formatter.primitive(value)? {
                Some(Primitive::Bool(b)) => b,
                Some(Primitive::Int(i)) => i != 0,
                Some(Primitive::Float(f)) => f != 0.0,
                Some(Primitive::Char(c)) => c != '\0',
                Some(Primitive::Pointer(p)) => p != 0,
                None => formatter
                    .string(value)?
                    .map_or(true, |s| !s.is_empty()),
            },
            Evaluated::Int(i) => *i != 0,
            Evaluated::Float(f) => *f != 0.0,
            Evaluated::Bool(b) => *b,
            Evaluated::Str(s) => !s.is_empty(),
            Evaluated::None => false,
        })
    }
}

/// Everything an evaluator may need, usable from an evaluation worker thread.
pub struct EvalEnv<'a> {
    pub backend: &'a dyn Backend,
    pub options: &'a FormatOptions,
    pub frame: Option<FrameId>,
    pub script: Option<(&'a mut dyn ScriptHost, &'a mut dyn ScriptContext)>,
}

impl EvaluatorKind {
    pub fn evaluate(self, code: &str, env: &mut EvalEnv) -> Result<Evaluated, Error> {
        log::debug!(target: "eval", "{self} evaluator: `{code}`");
        match self {
            EvaluatorKind::Simple => evaluate_simple(code, env),
            EvaluatorKind::Python => evaluate_script(code, env),
            EvaluatorKind::Native => evaluate_native(code, env),
        }
    }
}

fn evaluate_simple(code: &str, env: &mut EvalEnv) -> Result<Evaluated, Error> {
    let expr = parser::parser()
        .parse(code)
        .into_result()
        .map_err(|errors| Error::Syntax(errors.iter().map(ToString::to_string).join("; ")))?;
    let formatter = Formatter::new(env.backend, env.options);
    let evaluator = SimpleEvaluator::new(env.backend, &formatter, env.frame);
    evaluator.evaluate(&expr).map(Evaluated::from)
}

fn evaluate_script(code: &str, env: &mut EvalEnv) -> Result<Evaluated, Error> {
    let Some((host, ctx)) = env.script.as_mut() else {
        return Err(Error::NoScripting);
    };
    host.evaluate(code, env.frame, &mut **ctx).map(Evaluated::from)
}

fn evaluate_native(code: &str, env: &mut EvalEnv) -> Result<Evaluated, Error> {
    env.backend
        .evaluate(env.frame, code)
        .map(|value| Evaluated::Value(value.into()))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::debugger::backend::model::{ModelFunction, ModelModule, ModelVariable};
    use crate::debugger::backend::{Field, NativeType, ThreadId, TypeKind};
    use crate::debugger::expression::script::{MessageListener, NoScript};
    use crate::debugger::variable::test::{le32, le64, Fixture};
    use crate::debugger::variable::Radix;
    use serde_json::Value;

    fn frame() -> Option<FrameId> {
        Some(FrameId {
            thread: ThreadId(1),
            depth: 0,
        })
    }

    /// Program stopped at entry with locals `i`, `point`, `ptr`, `arr`, `name`.
    fn fixture() -> Fixture {
        let mut f = Fixture::new();
        let int = f.int();
        let point = f.structure(
            "Point",
            8,
            vec![Field::named("x", int, 0), Field::named("y", int, 4)],
        );
        let ptr = f.pointer("Point *", point);
        let array = f.ty(NativeType::new("int[3]", 12, TypeKind::Array { element: int, len: 3 }));
        let chr = f.ty(NativeType::new("char", 1, TypeKind::Char { unicode: false }));
        let name = f.pointer("char *", chr);
        f.mem(0x2000, le32(&[5]));
        f.mem(0x2010, le32(&[3, -4]));
        f.mem(0x2020, le64(&[0x2010]));
        f.mem(0x2030, le32(&[7, 8, 9]));
        f.mem(0x2040, le64(&[0x2100]));
        f.mem(0x2100, *b"main\0");
        f.target.entry = 0x1000;
        f.target.add_code(0x1000, 0x100, 0x90);
        let variables = [
            ("i", int, 0x2000),
            ("point", point, 0x2010),
            ("ptr", ptr, 0x2020),
            ("arr", array, 0x2030),
            ("name", name, 0x2040),
        ]
        .into_iter()
        .map(|(name, type_id, address)| ModelVariable {
            name: name.to_string(),
            type_id,
            address,
        })
        .collect();
        f.target.modules.push(ModelModule {
            name: "fixture".to_string(),
            path: "/bin/fixture".to_string(),
            functions: vec![ModelFunction {
                name: "main".to_string(),
                start: 0x1000,
                end: 0x1100,
                variables,
            }],
            ..Default::default()
        });
        f
    }

    #[test]
    fn test_expression_parse() {
        struct TestCase {
            text: &'static str,
            kind: EvaluatorKind,
            code: &'static str,
            directive: Option<Directive>,
        }
        let test_cases = vec![
            TestCase {
                text: "a.b",
                kind: EvaluatorKind::Native,
                code: "a.b",
                directive: None,
            },
            TestCase {
                text: "/nat sizeof(int)",
                kind: EvaluatorKind::Native,
                code: "sizeof(int)",
                directive: None,
            },
            TestCase {
                text: "/py x + 1",
                kind: EvaluatorKind::Python,
                code: "x + 1",
                directive: None,
            },
            TestCase {
                text: "/se array_ptr,x[10]",
                kind: EvaluatorKind::Simple,
                code: "array_ptr",
                directive: Some(Directive {
                    radix: Some(Radix::Hex),
                    array_len: Some(10),
                }),
            },
            TestCase {
                text: "/natural",
                kind: EvaluatorKind::Native,
                code: "/natural",
                directive: None,
            },
        ];

        for tc in test_cases {
            let expr = Expression::parse(tc.text, EvaluatorKind::Native).unwrap();
            assert_eq!(expr.kind, tc.kind, "{}", tc.text);
            assert_eq!(expr.code, tc.code);
            assert_eq!(expr.directive, tc.directive);
        }
    }

    #[test]
    fn test_simple_evaluator() {
        struct TestCase {
            code: &'static str,
            expected: &'static str,
        }
        let test_cases = vec![
            TestCase {
                code: "i",
                expected: "5",
            },
            TestCase {
                code: "i == 5",
                expected: "true",
            },
            TestCase {
                code: "i * 2 + 1",
                expected: "11",
            },
            TestCase {
                code: "point.y",
                expected: "-4",
            },
            TestCase {
                code: "ptr.x + (*ptr).y",
                expected: "-1",
            },
            TestCase {
                code: "arr[2]",
                expected: "9",
            },
            TestCase {
                code: "arr[i - 4]",
                expected: "8",
            },
            TestCase {
                code: "name == \"main\"",
                expected: "true",
            },
            TestCase {
                code: "i > 3 && !(i >= 6)",
                expected: "true",
            },
            TestCase {
                code: "1.5 * 2",
                expected: "3",
            },
        ];

        let backend = fixture().backend();
        let options = FormatOptions::default();
        let formatter = Formatter::new(&backend, &options);
        for tc in test_cases {
            let mut env = EvalEnv {
                backend: &backend,
                options: &options,
                frame: frame(),
                script: None,
            };
            let result = EvaluatorKind::Simple
                .evaluate(tc.code, &mut env)
                .unwrap_or_else(|e| panic!("{}: {e}", tc.code));
            let node = result.into_node(&formatter, tc.code, None).unwrap();
            assert_eq!(node.summary, tc.expected, "{}", tc.code);
        }
    }

    #[test]
    fn test_simple_evaluator_errors() {
        let backend = fixture().backend();
        let options = FormatOptions::default();
        let mut env = EvalEnv {
            backend: &backend,
            options: &options,
            frame: frame(),
            script: None,
        };

        assert!(matches!(
            EvaluatorKind::Simple.evaluate("nope", &mut env),
            Err(Error::VariableNotFound(_))
        ));
        assert!(matches!(
            EvaluatorKind::Simple.evaluate("i +", &mut env),
            Err(Error::Syntax(_))
        ));
        assert!(matches!(
            EvaluatorKind::Simple.evaluate("point.z", &mut env),
            Err(Error::FieldNotFound { .. })
        ));
        assert!(matches!(
            EvaluatorKind::Simple.evaluate("i / 0", &mut env),
            Err(Error::UnsupportedOperation(_))
        ));
        assert!(matches!(
            EvaluatorKind::Simple.evaluate("arr[3]", &mut env),
            Err(Error::IndexOutOfBounds { index: 3, len: 3 })
        ));
        let min = "-(-170141183460469231731687303465884105727 - 1)";
        assert!(matches!(
            EvaluatorKind::Simple.evaluate(min, &mut env),
            Err(Error::UnsupportedOperation(_))
        ));
        assert!(matches!(
            EvaluatorKind::Simple.evaluate("ptr[2305843009213693952]", &mut env),
            Err(Error::IndexOutOfBounds { .. })
        ));
        assert!(matches!(
            EvaluatorKind::Simple.evaluate("ptr[36893488147419103232]", &mut env),
            Err(Error::UnsupportedOperation(_))
        ));
    }

    #[test]
    fn test_native_evaluator_and_directives() {
        let backend = fixture().backend();
        let options = FormatOptions::default();
        let formatter = Formatter::new(&backend, &options);
        let mut env = EvalEnv {
            backend: &backend,
            options: &options,
            frame: frame(),
            script: None,
        };

        let expr = Expression::parse("/nat i,x", EvaluatorKind::Simple).unwrap();
        let node = expr
            .kind
            .evaluate(&expr.code, &mut env)
            .unwrap()
            .into_node(&formatter, "i", expr.directive)
            .unwrap();
        assert_eq!(node.summary, "0x00000005");

        let expr = Expression::parse("arr,[2]", EvaluatorKind::Simple).unwrap();
        let node = expr
            .kind
            .evaluate(&expr.code, &mut env)
            .unwrap()
            .into_node(&formatter, "arr", expr.directive)
            .unwrap();
        let children = formatter
            .children(node.children.as_ref().unwrap(), 0, None)
            .unwrap();
        let summaries: Vec<_> = children.iter().map(|c| c.summary.as_str()).collect();
        assert_eq!(summaries, ["7", "8"]);
    }

    #[test]
    fn test_truthiness() {
        struct TestCase {
            code: &'static str,
            truthy: bool,
        }
        let test_cases = vec![
            TestCase { code: "i", truthy: true },
            TestCase { code: "i - 5", truthy: false },
            TestCase { code: "i == 4", truthy: false },
            TestCase { code: "\"\"", truthy: false },
            TestCase { code: "name", truthy: true },
            TestCase { code: "point", truthy: true },
            TestCase { code: "0.0", truthy: false },
        ];

        let backend = fixture().backend();
        let options = FormatOptions::default();
        let formatter = Formatter::new(&backend, &options);
        for tc in test_cases {
            let mut env = EvalEnv {
                backend: &backend,
                options: &options,
                frame: frame(),
                script: None,
            };
            let result = EvaluatorKind::Simple.evaluate(tc.code, &mut env).unwrap();
            assert_eq!(result.truthy(&formatter).unwrap(), tc.truthy, "{}", tc.code);
        }
    }

    struct EchoScript;

    impl ScriptHost for EchoScript {
        fn evaluate(
            &mut self,
            code: &str,
            _: Option<FrameId>,
            ctx: &mut dyn ScriptContext,
        ) -> Result<ScriptValue, Error> {
            match code {
                "none" => Ok(ScriptValue::None),
                name => ctx
                    .read_variable(name)?
                    .ok_or_else(|| Error::Script(format!("NameError: {name}"))),
            }
        }
    }

    struct Variables<'a> {
        backend: &'a dyn Backend,
    }

    impl ScriptContext for Variables<'_> {
        fn read_variable(&mut self, name: &str) -> Result<Option<ScriptValue>, Error> {
            Ok(self
                .backend
                .find_variable(frame().unwrap(), name)?
                .map(|v| ScriptValue::Native(v.into())))
        }

        fn create_webview(&mut self, _: String, _: Option<String>, _: Value) -> Result<String, Error> {
            Err(Error::NoScripting)
        }

        fn post_message(&mut self, _: &str, _: Value) -> Result<(), Error> {
            Err(Error::NoScripting)
        }

        fn on_message(&mut self, _: &str, _: MessageListener) -> Result<(), Error> {
            Err(Error::NoScripting)
        }

        fn dispose_webview(&mut self, _: &str) -> Result<(), Error> {
            Err(Error::NoScripting)
        }
    }

    #[test]
    fn test_script_evaluator() {
        let backend = fixture().backend();
        let options = FormatOptions::default();
        let formatter = Formatter::new(&backend, &options);

        let mut host = EchoScript;
        let mut ctx = Variables { backend: &backend };
        let mut env = EvalEnv {
            backend: &backend,
            options: &options,
            frame: frame(),
            script: Some((&mut host, &mut ctx)),
        };
        let node = EvaluatorKind::Python
            .evaluate("i", &mut env)
            .unwrap()
            .into_node(&formatter, "i", None)
            .unwrap();
        assert_eq!(node.summary, "5");
        let none = EvaluatorKind::Python.evaluate("none", &mut env).unwrap();
        assert!(!none.truthy(&formatter).unwrap());

        let mut no_script = NoScript;
        let mut ctx = Variables { backend: &backend };
        let mut env = EvalEnv {
            backend: &backend,
            options: &options,
            frame: frame(),
            script: Some((&mut no_script, &mut ctx)),
        };
        assert!(matches!(
            EvaluatorKind::Python.evaluate("i", &mut env),
            Err(Error::NoScripting)
        ));
    }
}
