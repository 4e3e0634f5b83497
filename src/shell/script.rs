//! Deterministic shell transport for tests and dry runs.
//!
//! `ScriptedShell` answers commands from a table of substring rules and
//! records everything it is asked to run, so protocol tests can assert
//! both the results a caller saw and the exact commands that reached the
//! "device".

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use futures::future::BoxFuture;

use super::{ElevationState, ExecResult, ShellTransport};

enum Rule {
    /// Commands containing the pattern answer with this result.
    Respond(String, ExecResult),
    /// Like `Respond`, but successive matches consume the list in order;
    /// the final entry then repeats.
    RespondSeq(String, Vec<ExecResult>),
    /// Commands containing the pattern fail at dispatch (io::Error).
    FailDispatch(String),
}

/// Scripted [`ShellTransport`]: substring-matched canned responses plus a
/// full command history. Commands with no matching rule succeed with empty
/// output, which conveniently models `|| true`-style best-effort commands.
pub struct ScriptedShell {
    rules: Mutex<Vec<Rule>>,
    history: Mutex<Vec<String>>,
    elevation_queue: Mutex<Vec<ElevationState>>,
    default_elevation: ElevationState,
    elevation_queries: AtomicUsize,
}

impl ScriptedShell {
    /// Transport whose grant query always answers `Granted`.
    pub fn new() -> Self {
        Self::with_default_elevation(ElevationState::Granted)
    }

    /// Transport whose grant query always answers `Denied`.
    pub fn deny() -> Self {
        Self::with_default_elevation(ElevationState::Denied)
    }

    fn with_default_elevation(state: ElevationState) -> Self {
        ScriptedShell {
            rules: Mutex::new(Vec::new()),
            history: Mutex::new(Vec::new()),
            elevation_queue: Mutex::new(Vec::new()),
            default_elevation: state,
            elevation_queries: AtomicUsize::new(0),
        }
    }

    /// Respond to commands containing `pattern` with `result`. Earlier
    /// rules win when several match.
    pub fn on(&self, pattern: impl Into<String>, result: ExecResult) {
        self.rules
            .lock()
            .unwrap()
            .push(Rule::Respond(pattern.into(), result));
    }

    /// Respond to successive commands containing `pattern` with the given
    /// results in order; after the list runs out the last result repeats.
    pub fn on_seq(&self, pattern: impl Into<String>, results: Vec<ExecResult>) {
        assert!(!results.is_empty(), "on_seq needs at least one result");
        self.rules
            .lock()
            .unwrap()
            .push(Rule::RespondSeq(pattern.into(), results));
    }

    /// Make dispatch itself fail for commands containing `pattern`.
    pub fn fail_dispatch(&self, pattern: impl Into<String>) {
        self.rules
            .lock()
            .unwrap()
            .push(Rule::FailDispatch(pattern.into()));
    }

    /// Queue grant-query answers consumed in order; afterwards the default
    /// answer applies.
    pub fn queue_elevation(&self, states: &[ElevationState]) {
        let mut queue = self.elevation_queue.lock().unwrap();
        // Consumed from the front.
        queue.extend(states.iter().copied());
    }

    /// Every command run so far, in order.
    pub fn executed(&self) -> Vec<String> {
        self.history.lock().unwrap().clone()
    }

    /// Whether any executed command contains `pattern`.
    pub fn ran(&self, pattern: &str) -> bool {
        self.history
            .lock()
            .unwrap()
            .iter()
            .any(|cmd| cmd.contains(pattern))
    }

    /// How many commands containing `pattern` were run.
    pub fn count_ran(&self, pattern: &str) -> usize {
        self.history
            .lock()
            .unwrap()
            .iter()
            .filter(|cmd| cmd.contains(pattern))
            .count()
    }

    /// How many times the grant query was consulted.
    pub fn elevation_queries(&self) -> usize {
        self.elevation_queries.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedShell {
    fn default() -> Self {
        ScriptedShell::new()
    }
}

impl ShellTransport for ScriptedShell {
    fn elevation_state(&self) -> BoxFuture<'_, ElevationState> {
        Box::pin(async move {
            self.elevation_queries.fetch_add(1, Ordering::SeqCst);
            let mut queue = self.elevation_queue.lock().unwrap();
            if queue.is_empty() {
                self.default_elevation
            } else {
                queue.remove(0)
            }
        })
    }

    fn run<'a>(&'a self, cmd: &'a str) -> BoxFuture<'a, io::Result<ExecResult>> {
        Box::pin(async move {
            self.history.lock().unwrap().push(cmd.to_string());
            let mut rules = self.rules.lock().unwrap();
            for rule in rules.iter_mut() {
                match rule {
                    Rule::Respond(pattern, result) if cmd.contains(pattern.as_str()) => {
                        return Ok(result.clone());
                    }
                    Rule::RespondSeq(pattern, results) if cmd.contains(pattern.as_str()) => {
                        let result = if results.len() > 1 {
                            results.remove(0)
                        } else {
                            results[0].clone()
                        };
                        return Ok(result);
                    }
                    Rule::FailDispatch(pattern) if cmd.contains(pattern.as_str()) => {
                        return Err(io::Error::new(
                            io::ErrorKind::BrokenPipe,
                            format!("scripted dispatch failure for: {}", cmd),
                        ));
                    }
                    _ => {}
                }
            }
            Ok(ExecResult::new(0, "", ""))
        })
    }
}
