//! Diagnostic reporting utilities for the Candor compiler.
//!
//! Lightweight, rustc-style error reporting to stderr: a red "error:"
//! prefix, optional file location, and a few lines of source context.
//! The compiler's machine-readable errors are the `CompileError` enum
//! in the crate root; this module only handles presentation.

use std::sync::atomic::{AtomicUsize, Ordering};

static SUPPRESSED: AtomicUsize = AtomicUsize::new(0);

/// Suppress diagnostic output for the lifetime of the returned guard.
/// Used by tests that intentionally provoke errors.
pub fn suppress() -> SuppressGuard {
    SUPPRESSED.fetch_add(1, Ordering::SeqCst);
    SuppressGuard(())
}

pub struct SuppressGuard(());

impl Drop for SuppressGuard {
    fn drop(&mut self) {
        SUPPRESSED.fetch_sub(1, Ordering::SeqCst);
    }
}

fn is_suppressed() -> bool {
    SUPPRESSED.load(Ordering::SeqCst) > 0
}

/// Prints a compact diagnostic message to stderr.
///
/// When `source` and `offset` are given, the offending line is shown
/// with a caret under the column.
pub fn report_error(file: Option<&str>, source: Option<&str>, offset: Option<usize>, message: &str) {
    if is_suppressed() {
        return;
    }

    let red = "\x1b[31m";
    let reset = "\x1b[0m";

    eprintln!("{}error{}: {}", red, reset, message);

    let (line_no, col, line_text) = match (source, offset) {
        (Some(src), Some(offset)) => locate(src, offset),
        _ => {
            if let Some(path) = file {
                eprintln!("  --> {}", path);
            }
            return;
        }
    };

    match file {
        Some(path) => eprintln!("  --> {}:{}:{}", path, line_no, col + 1),
        None => eprintln!("  --> <source>:{}:{}", line_no, col + 1),
    }
    eprintln!("{:4} | {}", line_no, line_text);
    eprintln!("     | {}^", " ".repeat(col));
}

fn locate(source: &str, offset: usize) -> (usize, usize, &str) {
    let offset = offset.min(source.len());
    let mut line_start = 0;
    let mut line_no = 1;
    for (i, b) in source.bytes().enumerate() {
        if i >= offset {
            break;
        }
        if b == b'\n' {
            line_start = i + 1;
            line_no += 1;
        }
    }
    let line_end = source[line_start..]
        .find('\n')
        .map(|i| line_start + i)
        .unwrap_or(source.len());
    (line_no, offset - line_start, &source[line_start..line_end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locate_finds_line_and_column() {
        let src = "a = 1\nb = 2\nreturn a";
        assert_eq!(locate(src, 0), (1, 0, "a = 1"));
        assert_eq!(locate(src, 8), (2, 2, "b = 2"));
        assert_eq!(locate(src, 12), (3, 0, "return a"));
    }
}
