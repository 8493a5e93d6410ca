//! Process-wide, hierarchical, coloured activity log (spec §4.1).
//!
//! Separate from `tracing`: this is user-facing task narration (what ran,
//! against which context, how long it took), not operator diagnostics. The
//! scope stack is shared across concurrent workers, matching the source's
//! actual (if debatable) behaviour — see the Open Question note in
//! DESIGN.md rather than silently giving every worker its own stack.

use std::{
    fmt::Write as _,
    sync::{Mutex, OnceLock},
    time::Instant,
};

use owo_colors::{AnsiColors, OwoColorize};

use crate::argument::Parameters;

const TRUNCATE_AT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeKind {
    Task,
    Copy,
    Test,
}

struct Scope {
    kind: ScopeKind,
    label: String,
    start: Instant,
}

struct LoggerState {
    stack: Vec<Scope>,
}

static LOGGER: OnceLock<Mutex<LoggerState>> = OnceLock::new();

fn state() -> &'static Mutex<LoggerState> {
    LOGGER.get_or_init(|| Mutex::new(LoggerState { stack: Vec::new() }))
}

fn truncate(s: &str) -> String {
    if s.chars().count() <= TRUNCATE_AT {
        s.to_owned()
    } else {
        let head: String = s.chars().take(TRUNCATE_AT).collect();
        format!("{head}…")
    }
}

fn depth_color(depth: usize) -> AnsiColors {
    const PALETTE: &[AnsiColors] = &[
        AnsiColors::Cyan,
        AnsiColors::Magenta,
        AnsiColors::Yellow,
        AnsiColors::Green,
    ];
    PALETTE[depth % PALETTE.len()]
}

fn indent(depth: usize) -> String {
    "  ".repeat(depth)
}

fn emit(line: &str) {
    eprintln!("{line}");
}

/// RAII handle for an open scope. Marks itself successful with
/// [`ScopeGuard::succeed`]; if dropped without that call (propagating error
/// or panic), the finish line reports failure. Closing happens exactly once,
/// on every exit path, matching spec §4.1's "no scope may be closed out of
/// order" rule — scopes must be dropped in LIFO order, which a guard-based
/// RAII stack structure enforces naturally.
pub struct ScopeGuard {
    ok: bool,
    closed: bool,
}

impl ScopeGuard {
    pub fn succeed(&mut self) {
        self.ok = true;
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut guard = state().lock().unwrap();
        let Some(scope) = guard.stack.pop() else { return };
        let depth = guard.stack.len();
        drop(guard);
        let glyph = if self.ok { "✓".green().to_string() } else { "✗".red().to_string() };
        let elapsed = scope.start.elapsed();
        emit(&format!(
            "{}{} {} ({:.3}s)",
            indent(depth),
            glyph,
            scope.label.color(depth_color(depth)),
            elapsed.as_secs_f64()
        ));
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.close();
    }
}

fn open(kind: ScopeKind, label: String) -> ScopeGuard {
    let mut guard = state().lock().unwrap();
    let depth = guard.stack.len();
    emit(&format!("{}→ {}", indent(depth), label.color(depth_color(depth))));
    guard.stack.push(Scope { kind, label, start: Instant::now() });
    ScopeGuard { ok: false, closed: false }
}

/// Opens a task scope, recording the descriptor and parameter bindings
/// (long values truncated to 100 characters).
pub fn open_task_scope(descriptor: &str, task_name: &str, params: &Parameters) -> ScopeGuard {
    let mut label = format!("task {task_name} @ {descriptor}(");
    let mut first = true;
    for (name, value) in params.iter() {
        if !first {
            label.push_str(", ");
        }
        first = false;
        let _ = write!(label, "{name}={}", truncate(&format!("{value:?}")));
    }
    label.push(')');
    open(ScopeKind::Task, label)
}

pub fn open_copy_scope(source: &str, dest: &str) -> ScopeGuard {
    open(ScopeKind::Copy, format!("copy {source} -> {dest}"))
}

pub fn open_test_scope(task_name: &str, test_name: &str, descriptor: &str) -> ScopeGuard {
    open(ScopeKind::Test, format!("test {task_name}::{test_name} @ {descriptor}"))
}

/// Records a shell-command start line at the current stack depth (without
/// pushing a new scope — the command itself is not independently closeable).
pub fn record_shell_start(descriptor: &str, command: &str) {
    let depth = state().lock().unwrap().stack.len();
    emit(&format!("{}$ [{descriptor}] {}", indent(depth), truncate(command)));
}

pub fn record_shell_finish(code: Option<i32>, stdout: &str, stderr: &str) {
    let depth = state().lock().unwrap().stack.len();
    emit(&format!(
        "{}= exit {:?} stdout={:?} stderr={:?}",
        indent(depth),
        code,
        truncate(stdout),
        truncate(stderr)
    ));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_must_nest_lifo() {
        let outer = open(ScopeKind::Task, "outer".into());
        let mut inner = open(ScopeKind::Task, "inner".into());
        inner.succeed();
        drop(inner);
        drop(outer);
    }

    #[test]
    fn truncates_long_values() {
        let long = "x".repeat(200);
        let t = truncate(&long);
        assert_eq!(t.chars().count(), TRUNCATE_AT + 1);
    }
}
