//! Parser of the simple evaluator expression language.
use chumsky::prelude::*;
use chumsky::Parser;

type Err<'a> = extra::Err<Rich<'a, char>>;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum UnaryOp {
    Deref,
    Neg,
    Not,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BinaryOp {
    Mul,
    Div,
    Rem,
    Add,
    Sub,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Ident(String),
    Int(i128),
    Float(f64),
    Str(String),
    Bool(bool),
    Field(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn boxed(self) -> Box<Self> {
        Box::new(self)
    }
}

enum Postfix {
    Field(String),
    Index(Expr),
}

fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary(op, lhs.boxed(), rhs.boxed())
}

fn literal<'a>() -> impl Parser<'a, &'a str, Expr, Err<'a>> + Clone {
    let hex = just("0x")
        .or(just("0X"))
        .ignore_then(text::digits(16).at_least(1).to_slice())
        .try_map(|s: &str, span| {
            i128::from_str_radix(s, 16)
                .map(Expr::Int)
                .map_err(|e| Rich::custom(span, e))
        });

    let number = text::int(10)
        .then(just('.').then(text::digits(10)).or_not())
        .to_slice()
        .try_map(|s: &str, span| {
            if s.contains('.') {
                s.parse::<f64>()
                    .map(Expr::Float)
                    .map_err(|e| Rich::custom(span, e))
            } else {
                s.parse::<i128>()
                    .map(Expr::Int)
                    .map_err(|e| Rich::custom(span, e))
            }
        });

    let escape = just('\\').ignore_then(choice((
        just('n').to('\n'),
        just('t').to('\t'),
        just('r').to('\r'),
        just('0').to('\0'),
        just('\\'),
        just('"'),
    )));
    let string = none_of("\\\"")
        .or(escape)
        .repeated()
        .collect::<String>()
        .delimited_by(just('"'), just('"'))
        .map(Expr::Str);

    choice((hex, number, string)).labelled("literal")
}

/// Identifier, `$` prefix escapes keywords (`$true` is a variable named `true`).
fn identifier<'a>() -> impl Parser<'a, &'a str, Expr, Err<'a>> + Clone {
    just('$')
        .or_not()
        .then(text::ascii::ident())
        .map(|(escape, name): (Option<char>, &str)| match (escape, name) {
            (None, "true") => Expr::Bool(true),
            (None, "false") => Expr::Bool(false),
            (_, name) => Expr::Ident(name.to_string()),
        })
        .labelled("identifier")
}

pub fn parser<'a>() -> impl Parser<'a, &'a str, Expr, Err<'a>> {
    let expr = recursive(|expr| {
        let op = |c| just(c).padded();
        let sym = |s: &'static str| just(s).padded();

        let atom = literal()
            .or(identifier())
            .or(expr.clone().delimited_by(op('('), op(')')))
            .padded();

        let field = text::ascii::ident()
            .or(text::int(10))
            .map(|s: &str| Postfix::Field(s.to_string()))
            .labelled("field name or tuple index");
        let index = expr
            .clone()
            .delimited_by(op('['), op(']'))
            .map(Postfix::Index)
            .labelled("index");
        let postfix = atom
            .foldl(
                op('.').ignore_then(field).or(index).repeated(),
                |lhs, postfix| match postfix {
                    Postfix::Field(name) => Expr::Field(lhs.boxed(), name),
                    Postfix::Index(idx) => Expr::Index(lhs.boxed(), idx.boxed()),
                },
            )
            .boxed();

        let unary = choice((
            op('*').to(UnaryOp::Deref),
            op('-').to(UnaryOp::Neg),
            op('!').to(UnaryOp::Not),
        ))
        .repeated()
        .foldr(postfix, |op, rhs| Expr::Unary(op, rhs.boxed()))
        .boxed();

        let product = unary
            .clone()
            .foldl(
                choice((
                    op('*').to(BinaryOp::Mul),
                    op('/').to(BinaryOp::Div),
                    op('%').to(BinaryOp::Rem),
                ))
                .then(unary)
                .repeated(),
                |lhs, (op, rhs)| binary(op, lhs, rhs),
            )
            .boxed();

        let sum = product
            .clone()
            .foldl(
                choice((op('+').to(BinaryOp::Add), op('-').to(BinaryOp::Sub)))
                    .then(product)
                    .repeated(),
                |lhs, (op, rhs)| binary(op, lhs, rhs),
            )
            .boxed();

        let comparison = sum
            .clone()
            .foldl(
                choice((
                    sym("==").to(BinaryOp::Eq),
                    sym("!=").to(BinaryOp::Ne),
                    sym("<=").to(BinaryOp::Le),
                    sym(">=").to(BinaryOp::Ge),
                    sym("<").to(BinaryOp::Lt),
                    sym(">").to(BinaryOp::Gt),
                ))
                .then(sum)
                .repeated(),
                |lhs, (op, rhs)| binary(op, lhs, rhs),
            )
            .boxed();

        let and = comparison
            .clone()
            .foldl(
                sym("&&").to(BinaryOp::And).then(comparison).repeated(),
                |lhs, (op, rhs)| binary(op, lhs, rhs),
            )
            .boxed();

        and.clone().foldl(
            sym("||").to(BinaryOp::Or).then(and).repeated(),
            |lhs, (op, rhs)| binary(op, lhs, rhs),
        )
    });

    expr.then_ignore(end())
}

#[cfg(test)]
mod test {
    use super::*;

    fn ident(name: &str) -> Expr {
        Expr::Ident(name.to_string())
    }

    #[test]
    fn test_expr_parsing() {
        struct TestCase {
            string: &'static str,
            expr: Expr,
        }
        let test_cases = vec![
            TestCase {
                string: "var1",
                expr: ident("var1"),
            },
            TestCase {
                string: " 42 ",
                expr: Expr::Int(42),
            },
            TestCase {
                string: "0x1F",
                expr: Expr::Int(31),
            },
            TestCase {
                string: "1.25",
                expr: Expr::Float(1.25),
            },
            TestCase {
                string: r#""a\"b""#,
                expr: Expr::Str("a\"b".to_string()),
            },
            TestCase {
                string: "true",
                expr: Expr::Bool(true),
            },
            TestCase {
                string: "$true",
                expr: ident("true"),
            },
            TestCase {
                string: "**var1",
                expr: Expr::Unary(
                    UnaryOp::Deref,
                    Expr::Unary(UnaryOp::Deref, ident("var1").boxed()).boxed(),
                ),
            },
            TestCase {
                string: "s.field.0",
                expr: Expr::Field(
                    Expr::Field(ident("s").boxed(), "field".to_string()).boxed(),
                    "0".to_string(),
                ),
            },
            TestCase {
                string: "arr[i + 1]",
                expr: Expr::Index(
                    ident("arr").boxed(),
                    binary(BinaryOp::Add, ident("i"), Expr::Int(1)).boxed(),
                ),
            },
            TestCase {
                string: "(*p).x",
                expr: Expr::Field(
                    Expr::Unary(UnaryOp::Deref, ident("p").boxed()).boxed(),
                    "x".to_string(),
                ),
            },
            TestCase {
                string: "a + b * c",
                expr: binary(
                    BinaryOp::Add,
                    ident("a"),
                    binary(BinaryOp::Mul, ident("b"), ident("c")),
                ),
            },
            TestCase {
                string: "a * *p",
                expr: binary(
                    BinaryOp::Mul,
                    ident("a"),
                    Expr::Unary(UnaryOp::Deref, ident("p").boxed()),
                ),
            },
            TestCase {
                string: "i == 5",
                expr: binary(BinaryOp::Eq, ident("i"), Expr::Int(5)),
            },
            TestCase {
                string: "i-1 >= 0 && !done || x != -2",
                expr: binary(
                    BinaryOp::Or,
                    binary(
                        BinaryOp::And,
                        binary(
                            BinaryOp::Ge,
                            binary(BinaryOp::Sub, ident("i"), Expr::Int(1)),
                            Expr::Int(0),
                        ),
                        Expr::Unary(UnaryOp::Not, ident("done").boxed()),
                    ),
                    binary(
                        BinaryOp::Ne,
                        ident("x"),
                        Expr::Unary(UnaryOp::Neg, Expr::Int(2).boxed()),
                    ),
                ),
            },
        ];

        for tc in test_cases {
            let expr = parser().parse(tc.string).into_result().unwrap();
            assert_eq!(expr, tc.expr, "{}", tc.string);
        }
    }

    #[test]
    fn test_expr_parsing_error() {
        for string in ["var1 var2", "var1..", "a[]", "(a", "a +", "*", "\"open"] {
            assert!(
                parser().parse(string).into_result().is_err(),
                "`{string}` should not parse"
            );
        }
    }
}
