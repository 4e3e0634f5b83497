//! Pre-install compatibility testing for kernel modules.
//!
//! Drives a load -> wait -> log-scan -> unload protocol against a candidate
//! artifact so incompatibilities surface before the module is persisted
//! into the boot-time load path. The kernel log buffer is cleared before
//! the insert so the scan only reflects this test; callers must not run
//! two tests concurrently, since the clear-then-read protocol assumes
//! exclusive use of the ring buffer for the test window.
//!
//! The test module is never left resident: `quick_test` issues an unload
//! after the protocol body regardless of its outcome, and a scoped guard
//! issues the same unload from a spawned task when the caller stops
//! awaiting mid-protocol.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use crate::module::{build_insmod_command, ModuleManager};
use crate::shell::{shell_arg, RootShell, ShellTransport};

/// Kernel-log keywords that mark a module-related failure line.
const ERROR_KEYWORDS: [&str; 3] = ["error", "failed", "panic"];

/// How many kernel-log lines the scan reads. Kept short: the test only
/// needs the window since the buffer was cleared.
const DMESG_TAIL_LINES: usize = 40;

/// Outcome of one compatibility test. Produced once, never persisted.
#[derive(Debug, Clone)]
pub struct TestResult {
    pub passed: bool,
    pub message: String,
    pub kernel_log_tail: Option<String>,
}

impl TestResult {
    fn failed(message: impl Into<String>, tail: Option<String>) -> Self {
        TestResult {
            passed: false,
            message: message.into(),
            kernel_log_tail: tail,
        }
    }
}

/// Settle delays for the asynchronous parts of the protocol. Module init
/// may complete after the insert syscall returns, so the probe waits.
#[derive(Debug, Clone)]
pub struct TesterTiming {
    /// Wait after insert before re-probing load state.
    pub settle: Duration,
    /// Wait after a pre-test unload of a stale instance.
    pub unload_settle: Duration,
}

impl Default for TesterTiming {
    fn default() -> Self {
        TesterTiming {
            settle: Duration::from_millis(2000),
            unload_settle: Duration::from_millis(1000),
        }
    }
}

impl TesterTiming {
    /// No waiting, for deterministic tests.
    pub fn immediate() -> Self {
        TesterTiming {
            settle: Duration::ZERO,
            unload_settle: Duration::ZERO,
        }
    }
}

/// Issues the cleanup unload from a spawned task when the test future is
/// dropped mid-protocol. Disarmed on the normal exit path, where the
/// unload is awaited inline instead.
struct UnloadGuard<T: ShellTransport + 'static> {
    shell: Arc<RootShell<T>>,
    module_name: String,
    armed: bool,
}

impl<T: ShellTransport + 'static> UnloadGuard<T> {
    fn new(shell: Arc<RootShell<T>>, module_name: &str) -> Self {
        UnloadGuard {
            shell,
            module_name: module_name.to_string(),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<T: ShellTransport + 'static> Drop for UnloadGuard<T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        log::warn!(
            "module test for {} abandoned; scheduling cleanup unload",
            self.module_name
        );
        let shell = self.shell.clone();
        let cmd = format!("rmmod {}", self.module_name);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = shell.exec(&cmd).await;
                });
            }
            Err(_) => log::warn!("no runtime available for the cleanup unload"),
        }
    }
}

/// Safe install tester over a root shell.
pub struct ModuleTester<T: ShellTransport> {
    shell: Arc<RootShell<T>>,
    timing: TesterTiming,
}

impl<T: ShellTransport> ModuleTester<T> {
    pub fn new(shell: Arc<RootShell<T>>) -> Self {
        Self::with_timing(shell, TesterTiming::default())
    }

    pub fn with_timing(shell: Arc<RootShell<T>>, timing: TesterTiming) -> Self {
        ModuleTester { shell, timing }
    }

    /// Transport underneath the tester's shell (test fixtures).
    pub fn shell_transport(&self) -> &T {
        self.shell.transport()
    }

    /// Quick compatibility test of a module artifact, without installing.
    ///
    /// Every failing step short-circuits with a descriptive result; the
    /// artifact is unloaded afterwards no matter what the protocol body
    /// returned, including when the caller drops this future mid-way.
    pub async fn quick_test(
        &self,
        module_name: &str,
        ko_path: &str,
        initial_params: &[(String, Option<String>)],
    ) -> TestResult
    where
        T: 'static,
    {
        log::info!("starting quick compatibility test for {}", module_name);
        let mut guard = UnloadGuard::new(self.shell.clone(), module_name);
        let result = self.run_protocol(module_name, ko_path, initial_params).await;
        guard.disarm();

        // Unconditional cleanup: the test artifact must never stay
        // resident, and rmmod on an absent module is harmless. Awaited
        // here so callers observe a settled device state.
        let unload = self.shell.exec(&format!("rmmod {}", module_name)).await;
        if unload.code != 0 {
            log::debug!("post-test rmmod reported: {}", unload.err);
        }

        result
    }

    async fn run_protocol(
        &self,
        module_name: &str,
        ko_path: &str,
        initial_params: &[(String, Option<String>)],
    ) -> TestResult {
        let manager = ModuleManager::for_module(self.shell.clone(), module_name, &[]);

        if !self.artifact_exists(ko_path).await {
            return TestResult::failed("module file not found", None);
        }

        let modinfo = self
            .shell
            .exec(&format!(
                "modinfo {} 2>/dev/null || echo 'modinfo_failed'",
                shell_arg(ko_path)
            ))
            .await;
        if modinfo.out.contains("modinfo_failed") {
            return TestResult::failed("module file format is invalid", None);
        }

        // The load must start from a clean state.
        if manager.is_loaded().await {
            log::warn!("{} already loaded before test; unloading", module_name);
            let _ = manager.unload().await;
            sleep(self.timing.unload_settle).await;
        }

        // Clear the ring buffer so the scan only sees this test.
        let _ = self.shell.exec("dmesg -c > /dev/null 2>&1 || true").await;

        let insmod = self
            .shell
            .exec(&build_insmod_command(ko_path, initial_params))
            .await;
        if insmod.code != 0 {
            return TestResult::failed(
                format!("insmod failed: {}", insmod.err),
                Some(self.kernel_log_tail().await),
            );
        }

        // Module init may be asynchronous to the insert returning.
        sleep(self.timing.settle).await;

        if !manager.is_loaded().await {
            return TestResult::failed(
                "module not present in the system after load",
                Some(self.kernel_log_tail().await),
            );
        }

        let tail = self.kernel_log_tail().await;
        let name_lower = module_name.to_lowercase();
        let hits: Vec<&str> = tail
            .lines()
            .filter(|line| {
                let lower = line.to_lowercase();
                lower.contains(&name_lower)
                    && ERROR_KEYWORDS.iter().any(|kw| lower.contains(kw))
            })
            .collect();
        if !hits.is_empty() {
            let mut evidence = hits.join("\n");
            evidence.push_str("\n---- FULL TAIL ----\n");
            evidence.push_str(&tail);
            return TestResult::failed(
                "kernel log contains module-related failure lines",
                Some(evidence),
            );
        }

        log::info!("module test passed for {}", module_name);
        TestResult {
            passed: true,
            message: "module test passed".to_string(),
            kernel_log_tail: Some(tail),
        }
    }

    /// Artifact presence check: local filesystem first, root shell as the
    /// fallback for directories the process cannot traverse directly.
    async fn artifact_exists(&self, ko_path: &str) -> bool {
        if Path::new(ko_path).is_file() {
            return true;
        }
        let res = self
            .shell
            .exec(&format!(
                "[ -f {} ] && echo 'found' || echo 'not_found'",
                shell_arg(ko_path)
            ))
            .await;
        res.code == 0 && res.out.trim() == "found"
    }

    async fn kernel_log_tail(&self) -> String {
        let res = self
            .shell
            .exec(&format!("dmesg | tail -{}", DMESG_TAIL_LINES))
            .await;
        if res.code == 0 {
            res.out
        } else {
            "unable to read kernel log".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::script::ScriptedShell;
    use crate::shell::{ExecResult, ShellTiming};

    fn tester(script: ScriptedShell) -> ModuleTester<ScriptedShell> {
        let shell = Arc::new(RootShell::with_timing(script, ShellTiming::immediate()));
        ModuleTester::with_timing(shell, TesterTiming::immediate())
    }

    fn not_loaded_rules(script: &ScriptedShell) {
        script.on("initstate", ExecResult::new(1, "", "no such file"));
        script.on("wc -l", ExecResult::new(0, "0", ""));
        script.on("parameters' ]", ExecResult::new(0, "not", ""));
    }

    #[tokio::test]
    async fn test_missing_file_fails_fast() {
        let script = ScriptedShell::new();
        script.on("[ -f", ExecResult::new(0, "not_found", ""));
        let t = tester(script);
        let res = t.quick_test("demo_mod", "/data/local/tmp/demo.ko", &[]).await;
        assert!(!res.passed);
        assert!(res.message.contains("not found"));
        assert!(
            !t.shell.transport().ran("insmod"),
            "no insert may run for a missing artifact"
        );
        // Cleanup unload still runs.
        assert!(t.shell.transport().ran("rmmod demo_mod"));
    }

    #[tokio::test]
    async fn test_invalid_modinfo_fails_fast() {
        let script = ScriptedShell::new();
        script.on("[ -f", ExecResult::new(0, "found", ""));
        script.on("modinfo", ExecResult::new(0, "modinfo_failed", ""));
        let t = tester(script);
        let res = t.quick_test("demo_mod", "/tmp/demo.ko", &[]).await;
        assert!(!res.passed);
        assert!(res.message.contains("invalid"));
        assert!(!t.shell.transport().ran("insmod"));
    }

    #[tokio::test]
    async fn test_insmod_failure_carries_log_tail() {
        let script = ScriptedShell::new();
        script.on("[ -f", ExecResult::new(0, "found", ""));
        script.on("modinfo", ExecResult::new(0, "filename: demo.ko", ""));
        not_loaded_rules(&script);
        script.on("insmod", ExecResult::new(1, "", "insmod: invalid module format"));
        script.on("dmesg | tail", ExecResult::new(0, "demo_mod: disagrees about vermagic", ""));
        let t = tester(script);
        let res = t.quick_test("demo_mod", "/tmp/demo.ko", &[]).await;
        assert!(!res.passed);
        assert!(res.message.contains("insmod failed"));
        assert!(res
            .kernel_log_tail
            .as_deref()
            .unwrap()
            .contains("vermagic"));
    }

    #[tokio::test]
    async fn test_keyword_hit_fails_and_module_is_unloaded() {
        let script = ScriptedShell::new();
        script.on("[ -f", ExecResult::new(0, "found", ""));
        script.on("modinfo", ExecResult::new(0, "filename: demo.ko", ""));
        // Not loaded at the first probe, loaded after the insert.
        script.on("initstate", ExecResult::new(1, "", "no such file"));
        script.on_seq(
            "wc -l",
            vec![ExecResult::new(0, "0", ""), ExecResult::new(0, "1", "")],
        );
        script.on("parameters' ]", ExecResult::new(0, "not", ""));
        script.on("insmod", ExecResult::new(0, "", ""));
        script.on(
            "dmesg | tail",
            ExecResult::new(
                0,
                "[  12.1] demo_mod: probe failed with -22\n[  12.2] unrelated line",
                "",
            ),
        );
        let t = tester(script);
        let res = t.quick_test("demo_mod", "/tmp/demo.ko", &[]).await;
        assert!(!res.passed);
        let tail = res.kernel_log_tail.unwrap();
        assert!(tail.contains("probe failed with -22"));
        assert!(tail.contains("---- FULL TAIL ----"));
        assert!(t.shell.transport().ran("rmmod demo_mod"));
    }

    #[tokio::test]
    async fn test_clean_log_passes_and_still_unloads() {
        let script = ScriptedShell::new();
        script.on("[ -f", ExecResult::new(0, "found", ""));
        script.on("modinfo", ExecResult::new(0, "filename: demo.ko", ""));
        script.on("initstate", ExecResult::new(1, "", "no such file"));
        script.on_seq(
            "wc -l",
            vec![ExecResult::new(0, "0", ""), ExecResult::new(0, "1", "")],
        );
        script.on("parameters' ]", ExecResult::new(0, "not", ""));
        script.on("insmod", ExecResult::new(0, "", ""));
        script.on(
            "dmesg | tail",
            ExecResult::new(0, "[  12.1] demo_mod: loaded ok", ""),
        );
        let t = tester(script);
        let res = t.quick_test("demo_mod", "/tmp/demo.ko", &[]).await;
        assert!(res.passed, "unexpected failure: {}", res.message);
        assert!(res.kernel_log_tail.unwrap().contains("loaded ok"));
        assert!(t.shell.transport().ran("dmesg -c"));
        assert!(t.shell.transport().ran("rmmod demo_mod"));
    }

    #[tokio::test]
    async fn test_abandoned_test_still_unloads() {
        let script = ScriptedShell::new();
        script.on("[ -f", ExecResult::new(0, "found", ""));
        script.on("modinfo", ExecResult::new(0, "filename: demo.ko", ""));
        not_loaded_rules(&script);
        script.on("insmod", ExecResult::new(0, "", ""));
        let shell = Arc::new(RootShell::with_timing(script, ShellTiming::immediate()));
        let timing = TesterTiming {
            settle: Duration::from_millis(200),
            unload_settle: Duration::ZERO,
        };
        let t = ModuleTester::with_timing(shell.clone(), timing);

        // The caller gives up during the post-insert settle window.
        let outcome = tokio::time::timeout(
            Duration::from_millis(50),
            t.quick_test("demo_mod", "/tmp/demo.ko", &[]),
        )
        .await;
        assert!(outcome.is_err(), "the test must still be inside the settle");
        assert!(shell.transport().ran("insmod"));

        // The guard schedules the unload on the runtime.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(
            shell.transport().ran("rmmod demo_mod"),
            "unload must run even when the test is dropped mid-way"
        );
    }

    #[tokio::test]
    async fn test_not_loaded_after_insert_fails() {
        let script = ScriptedShell::new();
        script.on("[ -f", ExecResult::new(0, "found", ""));
        script.on("modinfo", ExecResult::new(0, "filename: demo.ko", ""));
        not_loaded_rules(&script);
        script.on("insmod", ExecResult::new(0, "", ""));
        let t = tester(script);
        let res = t.quick_test("demo_mod", "/tmp/demo.ko", &[]).await;
        assert!(!res.passed);
        assert!(res.message.contains("not present"));
    }
}
