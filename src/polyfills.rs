//! Polyfill scripts baked into the startup snapshot.
//!
//! Shared with `build.rs`. Sources are evaluated in the order listed. Each one
//! declares its classes at script scope; statements that assign them onto the
//! global object are stripped before evaluation and the bindings are
//! installed per sandbox instead.

use regex::Regex;
use std::sync::LazyLock;

pub struct Polyfill {
    pub name: &'static str,
    pub specifier: &'static str,
    pub source: &'static str,
    /// Script-scope bindings the polyfill must leave behind.
    pub globals: &'static [&'static str],
}

pub const POLYFILLS: &[Polyfill] = &[
    Polyfill {
        name: "headers",
        specifier: "ext:edge_polyfills/headers.js",
        source: include_str!("js/headers.js"),
        globals: &["Headers"],
    },
    Polyfill {
        name: "body",
        specifier: "ext:edge_polyfills/body.js",
        source: include_str!("js/body.js"),
        globals: &["__edgeBody"],
    },
    Polyfill {
        name: "response",
        specifier: "ext:edge_polyfills/response.js",
        source: include_str!("js/response.js"),
        globals: &["Response"],
    },
    Polyfill {
        name: "request",
        specifier: "ext:edge_polyfills/request.js",
        source: include_str!("js/request.js"),
        globals: &["Request"],
    },
    Polyfill {
        name: "multipart",
        specifier: "ext:edge_polyfills/multipart.js",
        source: include_str!("js/multipart.js"),
        globals: &["parseMultipart"],
    },
];

static GLOBAL_ASSIGNMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*(?:globalThis|global)\.[A-Za-z_$][\w$]*[ \t]*=[^=].*$").unwrap()
});

/// Blanks every line that assigns a property directly onto the global object.
/// Line numbers are preserved so errors still point at the right place.
pub fn strip_global_assignments(source: &str) -> String {
    GLOBAL_ASSIGNMENT_RE.replace_all(source, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_global_assignments() {
        let source = "class A {}\nglobalThis.A = A;\n  global.B = 1;\nconst c = 2;\n";
        let stripped = strip_global_assignments(source);
        assert_eq!(stripped, "class A {}\n\n\nconst c = 2;\n");
    }

    #[test]
    fn test_keeps_other_statements() {
        let source = "globalThis.a.b = 1;\nif (globalThis.x === y) {}\nglobalThis.x == y;\nconst g = globalThis;\n";
        assert_eq!(strip_global_assignments(source), source);
    }

    #[test]
    fn test_polyfills_have_no_global_assignments_after_stripping() {
        for polyfill in POLYFILLS {
            let stripped = strip_global_assignments(polyfill.source);
            assert!(
                !GLOBAL_ASSIGNMENT_RE.is_match(&stripped),
                "{} still assigns onto the global object",
                polyfill.name
            );
            assert_eq!(
                stripped.lines().count(),
                polyfill.source.lines().count(),
                "{} changed line count",
                polyfill.name
            );
        }
    }

    #[test]
    fn test_polyfills_ship_their_globals() {
        for polyfill in POLYFILLS {
            for global in polyfill.globals {
                assert!(
                    polyfill.source.contains(global),
                    "{} does not declare {}",
                    polyfill.name,
                    global
                );
            }
        }
    }

    #[test]
    fn test_body_before_its_users() {
        let position = |name: &str| POLYFILLS.iter().position(|p| p.name == name).unwrap();
        assert!(position("headers") < position("body"));
        assert!(position("body") < position("response"));
        assert!(position("body") < position("request"));
    }
}
