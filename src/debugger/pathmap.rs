//! Rewrites paths found in debug information to client filesystem paths and back.

use indexmap::IndexMap;

#[derive(Debug, Clone)]
struct Rule {
    debug_raw: String,
    /// `None` if sources under this prefix are suppressed.
    local_raw: Option<String>,
    /// Matching keys of both prefixes, see [`PathMapper::key`]. Always end with `/`.
    debug_key: String,
    local_key: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct PathMapper {
    /// Rules ordered by debug prefix length, longest first.
    rules: Vec<Rule>,
    relative_base: Option<String>,
    /// Drive assumed for absolute paths without one.
    assumed_drive: Option<char>,
}

impl PathMapper {
    /// Create a mapper from (debug prefix, local prefix) rules.
    /// A rule without local prefix hides all sources under its debug prefix.
    pub fn new(rules: &IndexMap<String, Option<String>>, relative_base: Option<String>) -> Self {
        let rules = rules
            .iter()
            .map(|(debug, local)| Rule {
                debug_raw: debug.clone(),
                local_raw: local.clone(),
                debug_key: String::new(),
                local_key: None,
            })
            .collect();

        let mut mapper = Self {
            rules,
            relative_base,
            assumed_drive: cfg!(windows).then_some('C'),
        };
        mapper.rebuild_keys();
        mapper
    }

    pub fn with_assumed_drive(mut self, drive: Option<char>) -> Self {
        self.assumed_drive = drive;
        self.rebuild_keys();
        self
    }

    fn rebuild_keys(&mut self) {
        let mut rules = std::mem::take(&mut self.rules);
        for rule in rules.iter_mut() {
            rule.debug_key = with_slash(self.key(&rule.debug_raw));
            rule.local_key = rule.local_raw.as_deref().map(|l| with_slash(self.key(l)));
        }
        // longest prefix wins
        rules.sort_by(|a, b| b.debug_key.len().cmp(&a.debug_key.len()));
        self.rules = rules;
    }

    /// Matching form of a path: `/` separators, the assumed drive added to a driveless
    /// absolute path, lowercase drive letter.
    fn key(&self, path: &str) -> String {
        let mut key = norm_path(path);
        let driveless = key.starts_with('/') && !key.starts_with("//");
        if let (Some(drive), true) = (self.assumed_drive, driveless) {
            key = format!("{drive}:{key}");
        }
        if has_drive(&key) {
            key[..1].make_ascii_lowercase();
        }
        key
    }

    /// Map a debug information path to a local one.
    /// Return `None` if source is suppressed by a rule.
    pub fn to_local(&self, debug_path: &str) -> Option<String> {
        let key = self.key(debug_path);
        let rule = self
            .rules
            .iter()
            .find(|r| matches_prefix(&key, &r.debug_key));

        if let Some(rule) = rule {
            let local = rule.local_raw.as_deref()?;
            return Some(join_with_style(local, strip_prefix(&key, &rule.debug_key)));
        }

        if !is_rooted(&key) {
            if let Some(ref base) = self.relative_base {
                return Some(join_with_style(base, &key));
            }
        }

        Some(self.with_drive(debug_path.to_string()))
    }

    /// Map a local path back into debug information form.
    pub fn to_debug(&self, local_path: &str) -> String {
        let key = self.key(local_path);
        let rule = self
            .rules
            .iter()
            .filter_map(|r| r.local_key.as_deref().map(|local| (r, local)))
            .filter(|(_, local)| matches_prefix(&key, local))
            .max_by_key(|(_, local)| local.len());

        if let Some((rule, local)) = rule {
            return join_with_style(&rule.debug_raw, strip_prefix(&key, local));
        }

        if let Some(ref base) = self.relative_base {
            let base = with_slash(self.key(base));
            if matches_prefix(&key, &base) {
                return strip_prefix(&key, &base).to_string();
            }
        }

        local_path.to_string()
    }

    /// True if local path (a client path) designates a debug information path.
    /// Paths match if either one maps onto the other.
    pub fn matches(&self, debug_path: &str, local_path: &str) -> bool {
        self.to_local(debug_path).is_some_and(|mapped| {
            self.same(&mapped, local_path) || self.same(debug_path, &self.to_debug(local_path))
        })
    }

    fn same(&self, a: &str, b: &str) -> bool {
        same_path(&self.key(a), &self.key(b))
    }

    fn with_drive(&self, path: String) -> String {
        let driveless = (path.starts_with('/') || path.starts_with('\\'))
            && !(path.starts_with("//") || path.starts_with("\\\\"));
        match self.assumed_drive {
            Some(drive) if driveless => format!("{drive}:{}", path.replace('/', "\\")),
            _ => path,
        }
    }
}

/// Compare two paths ignoring separator style and drive letter case.
pub fn same_path(a: &str, b: &str) -> bool {
    canonical_form(a) == canonical_form(b)
}

/// Last component of a path in any separator style.
pub fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

fn canonical_form(path: &str) -> String {
    let normalized = norm_path(path);
    let mut parts: Vec<&str> = vec![];
    for part in normalized.split('/') {
        match part {
            "." => {}
            ".." if parts.last().is_some_and(|p| !p.is_empty() && *p != "..") => {
                parts.pop();
            }
            "" if !parts.is_empty() => {}
            _ => parts.push(part),
        }
    }
    let mut out = parts.join("/");
    if has_drive(&out) {
        out[..1].make_ascii_lowercase();
    }
    out
}

fn is_rooted(normalized: &str) -> bool {
    normalized.starts_with('/') || has_drive(normalized)
}

fn has_drive(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn matches_prefix(normalized: &str, prefix_norm: &str) -> bool {
    normalized.starts_with(prefix_norm) || format!("{normalized}/") == prefix_norm
}

fn strip_prefix<'a>(normalized: &'a str, prefix_norm: &str) -> &'a str {
    normalized.get(prefix_norm.len()..).unwrap_or_default()
}

fn join_with_style(prefix: &str, suffix_norm: &str) -> String {
    if suffix_norm.is_empty() {
        return prefix.to_string();
    }
    let mut out = prefix.to_string();
    let backslash = out.contains('\\');
    if !out.ends_with('/') && !out.ends_with('\\') {
        out.push(if backslash { '\\' } else { '/' });
    }
    if backslash {
        out.push_str(&suffix_norm.replace('/', "\\"));
    } else {
        out.push_str(suffix_norm);
    }
    out
}

fn with_slash(mut key: String) -> String {
    if !key.ends_with('/') {
        key.push('/');
    }
    key
}

pub(crate) fn norm_path(s: &str) -> String {
    s.replace('\\', "/")
}

#[cfg(test)]
mod test {
    use super::*;

    fn mapper(rules: &[(&str, Option<&str>)], base: Option<&str>) -> PathMapper {
        let rules: IndexMap<String, Option<String>> = rules
            .iter()
            .map(|(k, v)| (k.to_string(), v.map(ToString::to_string)))
            .collect();
        PathMapper::new(&rules, base.map(ToString::to_string)).with_assumed_drive(None)
    }

    #[test]
    fn test_to_local() {
        struct TestCase {
            debug_path: &'static str,
            expected: Option<&'static str>,
        }

        let mapper = mapper(
            &[
                ("/build", Some("/home/user/project")),
                ("/build/vendor", Some("/opt/vendor")),
                ("/rustc/abc", None),
                ("C:\\ci", Some("/mnt/ci")),
            ],
            Some("/home/user/project"),
        );
        let test_cases = vec![
            TestCase {
                debug_path: "/build/src/main.rs",
                expected: Some("/home/user/project/src/main.rs"),
            },
            TestCase {
                debug_path: "/build/vendor/lib/a.c",
                expected: Some("/opt/vendor/lib/a.c"),
            },
            TestCase {
                debug_path: "/buildx/main.c",
                expected: Some("/buildx/main.c"),
            },
            TestCase {
                debug_path: "/rustc/abc/library/core/src/panic.rs",
                expected: None,
            },
            TestCase {
                debug_path: "C:\\ci\\src\\lib.c",
                expected: Some("/mnt/ci/src/lib.c"),
            },
            TestCase {
                debug_path: "src/util.c",
                expected: Some("/home/user/project/src/util.c"),
            },
            TestCase {
                debug_path: "/build",
                expected: Some("/home/user/project"),
            },
        ];

        for tc in test_cases {
            assert_eq!(
                mapper.to_local(tc.debug_path).as_deref(),
                tc.expected,
                "{}",
                tc.debug_path
            );
        }
    }

    #[test]
    fn test_round_trip() {
        let mapper = mapper(
            &[
                ("/build", Some("C:\\work\\project")),
                ("/usr/src/lib", Some("/home/user/lib")),
            ],
            None,
        );

        for path in [
            "/build/src/main.rs",
            "/build/a/b/c.h",
            "/usr/src/lib/x.c",
            "/other/file.c",
        ] {
            let local = mapper.to_local(path).unwrap();
            assert_eq!(mapper.to_debug(&local), path);
        }
        assert_eq!(
            mapper.to_local("/build/src/main.rs").unwrap(),
            "C:\\work\\project\\src\\main.rs"
        );
    }

    #[test]
    fn test_relative_base_round_trip() {
        let mapper = mapper(&[], Some("/home/user/project"));
        let local = mapper.to_local("src/main.c").unwrap();
        assert_eq!(local, "/home/user/project/src/main.c");
        assert_eq!(mapper.to_debug(&local), "src/main.c");
    }

    #[test]
    fn test_assumed_drive() {
        let mapper = mapper(&[], None).with_assumed_drive(Some('D'));
        assert_eq!(mapper.to_local("/src/main.c").unwrap(), "D:\\src\\main.c");
        assert_eq!(mapper.to_local("E:\\src\\main.c").unwrap(), "E:\\src\\main.c");
    }

    #[test]
    fn test_assumed_drive_before_matching() {
        struct TestCase {
            rule: (&'static str, &'static str),
            debug_path: &'static str,
            local_path: &'static str,
            back: &'static str,
        }
        let test_cases = vec![
            TestCase {
                rule: ("/build", "/home/p"),
                debug_path: "/build/a.c",
                local_path: "/home/p/a.c",
                back: "/build/a.c",
            },
            TestCase {
                rule: ("C:\\build", "/src"),
                debug_path: "\\build\\a.c",
                local_path: "/src/a.c",
                back: "C:\\build\\a.c",
            },
            TestCase {
                rule: ("/build", "c:\\work"),
                debug_path: "C:\\build\\a.c",
                local_path: "c:\\work\\a.c",
                back: "/build/a.c",
            },
        ];

        for tc in test_cases {
            let mapper =
                mapper(&[(tc.rule.0, Some(tc.rule.1))], None).with_assumed_drive(Some('C'));
            assert_eq!(
                mapper.to_local(tc.debug_path).as_deref(),
                Some(tc.local_path),
                "{}",
                tc.debug_path
            );
            assert_eq!(mapper.to_debug(tc.local_path), tc.back);
            assert!(mapper.matches(tc.debug_path, tc.local_path));
        }

        // a drive qualified client path designates a driveless one
        let mapper = mapper(&[("/build", Some("/home/p"))], None).with_assumed_drive(Some('C'));
        assert_eq!(mapper.to_debug("C:\\home\\p\\a.c"), "/build/a.c");
        assert!(mapper.matches("/build/a.c", "C:\\home\\p\\a.c"));
        assert!(!mapper.matches("/build/a.c", "D:\\home\\p\\a.c"));
    }

    #[test]
    fn test_same_path() {
        struct TestCase {
            a: &'static str,
            b: &'static str,
            same: bool,
        }
        let test_cases = vec![
            TestCase { a: "/a/b/c.rs", b: "/a/b/c.rs", same: true },
            TestCase { a: "/a/./b/c.rs", b: "/a/b//c.rs", same: true },
            TestCase { a: "/a/x/../b/c.rs", b: "/a/b/c.rs", same: true },
            TestCase { a: "C:\\a\\b.c", b: "c:/a/b.c", same: true },
            TestCase { a: "/a/b/c.rs", b: "/a/b/d.rs", same: false },
        ];
        for tc in test_cases {
            assert_eq!(same_path(tc.a, tc.b), tc.same, "{} vs {}", tc.a, tc.b);
        }
    }

    #[test]
    fn test_file_name() {
        assert_eq!(file_name("/a/b/main.rs"), "main.rs");
        assert_eq!(file_name("C:\\a\\main.rs"), "main.rs");
        assert_eq!(file_name("main.rs"), "main.rs");
    }
}
