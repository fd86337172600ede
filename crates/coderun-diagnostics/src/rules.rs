//! Line patterns for each supported toolchain.
//!
//! Every pattern is anchored and matched against a single output line with the
//! trailing newline removed. Lines that match nothing are simply not
//! diagnostics.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    // gcc / clang / eslint-unix style, shared by every language
    pub static ref GCC_STYLE: Regex = Regex::new(
        r"^(?P<file>[^:\s][^:]*):(?P<line>\d+):(?P<col>\d+):\s*(?:fatal\s+)?(?P<sev>error|warning):\s*(?P<msg>.+)$"
    ).unwrap();

    // tsc style: src/index.ts(2,30): error TS2307: Cannot find module './routes/auth'
    pub static ref TSC_STYLE: Regex = Regex::new(
        r"^(?P<file>[^(\s][^(]*)\((?P<line>\d+),(?P<col>\d+)\):\s*(?P<sev>error|warning)\s+(?P<code>TS\d+):\s*(?P<msg>.+)$"
    ).unwrap();

    pub static ref NODE_ERROR: Regex = Regex::new(
        r"^(?:Uncaught\s+)?(?P<kind>(?:[A-Z][A-Za-z]*)?(?:Error|Exception))(?:\s+\[[A-Z_]+\])?:\s*(?P<msg>.*)$"
    ).unwrap();

    pub static ref TRAILING_LINE: Regex = Regex::new(
        r"^(?P<msg>.*?)\s+(?:at|on)\s+line\s+(?P<line>\d+)(?:(?::|,\s*col(?:umn)?\s+)(?P<col>\d+))?\.?$"
    ).unwrap();

    pub static ref NODE_HEADER: Regex = Regex::new(
        r"^(?P<file>(?:file://)?[^\s:]+\.(?:js|mjs|cjs|ts)):(?P<line>\d+)$"
    ).unwrap();

    pub static ref NODE_FRAME: Regex = Regex::new(
        r"^\s+at\s+(?:.*?\()?(?P<file>(?:file://)?[^\s()]+?):(?P<line>\d+):(?P<col>\d+)\)?$"
    ).unwrap();

    pub static ref NODE_WARNING: Regex = Regex::new(
        r"^\(node:\d+\)\s+(?:\[[^\]]+\]\s+)?(?P<kind>[A-Za-z]*Warning):\s*(?P<msg>.+)$"
    ).unwrap();

    pub static ref PY_FRAME: Regex = Regex::new(
        r#"^\s*File "(?P<file>[^"]+)", line (?P<line>\d+)"#
    ).unwrap();

    pub static ref PY_EXCEPTION: Regex = Regex::new(
        r"^(?P<kind>(?:[A-Za-z_][\w.]*)?(?:Error|Exception|Warning))(?::\s*(?P<msg>.*))?$"
    ).unwrap();

    pub static ref PY_WARNING: Regex = Regex::new(
        r"^(?P<file>[^:\s][^:]*\.py):(?P<line>\d+):\s*(?P<kind>\w*Warning):\s*(?P<msg>.+)$"
    ).unwrap();

    pub static ref BASH_ERROR: Regex = Regex::new(
        r"^(?P<file>[^:\s][^:]*): line (?P<line>\d+): (?P<msg>.+)$"
    ).unwrap();

    pub static ref DASH_ERROR: Regex = Regex::new(
        r"^(?P<file>[^:\s][^:]*): (?P<line>\d+): (?P<msg>.+)$"
    ).unwrap();

    pub static ref RUST_HEADLINE: Regex = Regex::new(
        r"^(?P<sev>error|warning)(?:\[(?P<code>E\d+)\])?: (?P<msg>.+)$"
    ).unwrap();

    pub static ref RUST_LOCATION: Regex = Regex::new(
        r"^\s*--> (?P<file>[^:]+):(?P<line>\d+):(?P<col>\d+)$"
    ).unwrap();

    pub static ref RUST_SUMMARY: Regex = Regex::new(
        r"^(?:aborting due to|could not compile|\d+ warnings? emitted|For more information about)"
    ).unwrap();

    // thread 'main' panicked at src/main.rs:3:5:   (message on the next line)
    pub static ref RUST_PANIC: Regex = Regex::new(
        r"^thread '[^']*' panicked at (?P<file>[^:\s]+):(?P<line>\d+):(?P<col>\d+):$"
    ).unwrap();

    // thread 'main' panicked at 'boom', src/main.rs:3:5
    pub static ref RUST_PANIC_LEGACY: Regex = Regex::new(
        r"^thread '[^']*' panicked at '(?P<msg>.*)', (?P<file>[^:\s]+):(?P<line>\d+):(?P<col>\d+)$"
    ).unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gcc_style() {
        let caps = GCC_STYLE
            .captures("main.c:4:9: error: expected ';' before 'return'")
            .unwrap();
        assert_eq!(&caps["file"], "main.c");
        assert_eq!(&caps["line"], "4");
        assert_eq!(&caps["sev"], "error");
    }

    #[test]
    fn test_trailing_line() {
        let caps = TRAILING_LINE.captures("x is not defined at line 3").unwrap();
        assert_eq!(&caps["msg"], "x is not defined");
        assert_eq!(&caps["line"], "3");
        assert!(caps.name("col").is_none());
    }

    #[test]
    fn test_node_frame_with_function() {
        let caps = NODE_FRAME
            .captures("    at Object.<anonymous> (/tmp/run/main.js:3:13)")
            .unwrap();
        assert_eq!(&caps["file"], "/tmp/run/main.js");
        assert_eq!(&caps["col"], "13");
    }

    #[test]
    fn test_python_exception_without_message() {
        let caps = PY_EXCEPTION.captures("ZeroDivisionError").unwrap();
        assert_eq!(&caps["kind"], "ZeroDivisionError");
        assert!(caps.name("msg").is_none());
    }
}
