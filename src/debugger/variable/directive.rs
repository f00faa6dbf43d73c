//! Format directives: `expr,x`, `expr,[N]`, `expr,x[N]`.

use crate::debugger::Error;
use regex::Regex;
use std::sync::OnceLock;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Radix {
    Hex,
    Octal,
    Binary,
    Decimal,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Directive {
    pub radix: Option<Radix>,
    /// Interpret value as an array of this many elements.
    pub array_len: Option<u64>,
}

fn directive_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<radix>[xhobd])?(?:\[(?P<len>[^\]]*)\])?$").expect("valid regex")
    })
}

/// Position of the last top-level comma (outside brackets and string literals).
fn last_top_level_comma(expr: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut last = None;

    for (idx, c) in expr.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            ',' if depth == 0 => last = Some(idx),
            _ => {}
        }
    }
    last
}

/// Split an expression into the expression itself and an optional format directive.
///
/// A trailing `,suffix` which does not look like a directive is left in the expression.
pub fn split_directive(expr: &str) -> Result<(&str, Option<Directive>), Error> {
    let Some(comma) = last_top_level_comma(expr) else {
        return Ok((expr, None));
    };
    let suffix = expr[comma + 1..].trim();
    let Some(caps) = directive_re().captures(suffix) else {
        return Ok((expr, None));
    };
    if suffix.is_empty() {
        return Ok((expr, None));
    }

    let radix = caps.name("radix").map(|m| match m.as_str() {
        "x" | "h" => Radix::Hex,
        "o" => Radix::Octal,
        "b" => Radix::Binary,
        _ => Radix::Decimal,
    });
    let array_len = caps
        .name("len")
        .map(|m| {
            m.as_str()
                .trim()
                .parse::<u64>()
                .map_err(|_| Error::InvalidDirective(suffix.to_string()))
        })
        .transpose()?;

    Ok((
        expr[..comma].trim_end(),
        Some(Directive { radix, array_len }),
    ))
}

/// Render an integer in the requested radix, `size` is the value size in bytes.
pub fn format_int(value: u64, signed: bool, size: u64, radix: Option<Radix>) -> String {
    let bits = (size.clamp(1, 8) * 8) as u32;
    let mask = if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 };
    let raw = value & mask;

    match radix {
        Some(Radix::Hex) => format!("0x{:0width$x}", raw, width = (size * 2) as usize),
        Some(Radix::Octal) => format!("0o{raw:o}"),
        Some(Radix::Binary) => format!("0b{:0width$b}", raw, width = bits as usize),
        Some(Radix::Decimal) | None if signed => {
            let shift = 64 - bits;
            (((raw << shift) as i64) >> shift).to_string()
        }
        Some(Radix::Decimal) | None => raw.to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_split_directive() {
        struct TestCase {
            expr: &'static str,
            expected_expr: &'static str,
            expected: Option<Directive>,
        }
        let test_cases = vec![
            TestCase {
                expr: "a",
                expected_expr: "a",
                expected: None,
            },
            TestCase {
                expr: "a,x",
                expected_expr: "a",
                expected: Some(Directive {
                    radix: Some(Radix::Hex),
                    array_len: None,
                }),
            },
            TestCase {
                expr: "array_ptr,[10]",
                expected_expr: "array_ptr",
                expected: Some(Directive {
                    radix: None,
                    array_len: Some(10),
                }),
            },
            TestCase {
                expr: "array_ptr, h[4]",
                expected_expr: "array_ptr",
                expected: Some(Directive {
                    radix: Some(Radix::Hex),
                    array_len: Some(4),
                }),
            },
            TestCase {
                expr: "f(a, b)",
                expected_expr: "f(a, b)",
                expected: None,
            },
            TestCase {
                expr: "s == \"a,b\"",
                expected_expr: "s == \"a,b\"",
                expected: None,
            },
            TestCase {
                expr: "pair, second",
                expected_expr: "pair, second",
                expected: None,
            },
            TestCase {
                expr: "v,b",
                expected_expr: "v",
                expected: Some(Directive {
                    radix: Some(Radix::Binary),
                    array_len: None,
                }),
            },
        ];

        for tc in test_cases {
            let (expr, directive) = split_directive(tc.expr).unwrap();
            assert_eq!(expr, tc.expected_expr);
            assert_eq!(directive, tc.expected);
        }
    }

    #[test]
    fn test_invalid_directive() {
        assert!(matches!(
            split_directive("p,[ten]"),
            Err(Error::InvalidDirective(_))
        ));
    }

    #[test]
    fn test_format_int() {
        struct TestCase {
            value: u64,
            signed: bool,
            size: u64,
            radix: Option<Radix>,
            expected: &'static str,
        }
        let test_cases = vec![
            TestCase { value: 5, signed: true, size: 4, radix: None, expected: "5" },
            TestCase { value: 5, signed: true, size: 4, radix: Some(Radix::Hex), expected: "0x00000005" },
            TestCase { value: (-1i32) as u32 as u64, signed: true, size: 4, radix: None, expected: "-1" },
            TestCase { value: (-1i32) as u32 as u64, signed: true, size: 4, radix: Some(Radix::Hex), expected: "0xffffffff" },
            TestCase { value: 255, signed: false, size: 1, radix: Some(Radix::Binary), expected: "0b11111111" },
            TestCase { value: 8, signed: false, size: 2, radix: Some(Radix::Octal), expected: "0o10" },
            TestCase { value: u64::MAX, signed: false, size: 8, radix: Some(Radix::Decimal), expected: "18446744073709551615" },
            TestCase { value: u64::MAX, signed: true, size: 8, radix: None, expected: "-1" },
        ];
        for tc in test_cases {
            assert_eq!(format_int(tc.value, tc.signed, tc.size, tc.radix), tc.expected);
        }
    }
}
