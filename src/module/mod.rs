//! Kernel module lifecycle control.
//!
//! [`ModuleManager`] drives the sysfs-parameter module family
//! (batt-style): one pseudo-file per parameter under
//! `/sys/module/<name>/parameters/`. The proc-file multi-field family
//! (chg-style) lives in [`chg`]; compatibility testing in [`tester`].
//!
//! State machine per module: `NotPresent -> load -> Loaded -> unload ->
//! NotPresent`. Loading an already-loaded module is rejected with a
//! synthetic failure before any command runs; unloading a module that is
//! not present is attempted anyway and the rmmod result surfaced as-is.

pub mod chg;
pub mod tester;

use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::kernel::locator;
use crate::kernel::version::KernelVersion;
use crate::shell::{quote_if_needed, shell_arg, ExecResult, RootShell, ShellTransport};

pub use chg::ChgParamManager;
pub use tester::{ModuleTester, TestResult, TesterTiming};

/// Ordered parameter list for load commands. Entries with `None` or blank
/// values are skipped.
pub type ParamList = Vec<(String, Option<String>)>;

/// Build `insmod <path> [k=v ...]` from the non-blank parameters.
pub(crate) fn build_insmod_command(ko_path: &str, initial: &[(String, Option<String>)]) -> String {
    let mut cmd = format!("insmod {}", quote_if_needed(ko_path));
    for (key, value) in initial {
        if let Some(v) = value {
            if !v.trim().is_empty() {
                cmd.push(' ');
                cmd.push_str(key);
                cmd.push('=');
                cmd.push_str(&quote_if_needed(v));
            }
        }
    }
    cmd
}

/// High-level operations around the batt_design_override kernel module
/// and its siblings with per-parameter sysfs files.
pub struct ModuleManager<T: ShellTransport> {
    shell: Arc<RootShell<T>>,
    module_name: String,
    sys_module_base: String,
    param_names: Vec<String>,
}

impl<T: ShellTransport> ModuleManager<T> {
    /// Manager for the default battery-design override module.
    pub fn new(shell: Arc<RootShell<T>>) -> Self {
        Self::for_module(
            shell,
            "batt_design_override",
            &[
                "batt_name",
                "override_any",
                "verbose",
                "design_uah",
                "design_uwh",
                "model_name",
            ],
        )
    }

    /// Manager for an arbitrary module with the given known parameters.
    pub fn for_module(shell: Arc<RootShell<T>>, module_name: &str, param_names: &[&str]) -> Self {
        ModuleManager {
            shell,
            module_name: module_name.to_string(),
            sys_module_base: "/sys/module".to_string(),
            param_names: param_names.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Redirect sysfs access to another base directory (test fixtures).
    pub fn with_sys_base(mut self, base: impl Into<String>) -> Self {
        self.sys_module_base = base.into();
        self
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    /// Sysfs path of one parameter pseudo-file.
    pub fn param_path(&self, param: &str) -> String {
        format!(
            "{}/{}/parameters/{}",
            self.sys_module_base, self.module_name, param
        )
    }

    /// Three-tier load-state probe, short-circuiting on the first hit.
    ///
    /// 1. `initstate` pseudo-file equals `live` (direct read, then root cat).
    /// 2. `/proc/modules` has an entry whose first field is the module name.
    /// 3. Both the module sysfs directory and its `parameters` subdirectory
    ///    exist (the pair requirement cuts false positives from stale
    ///    entries).
    ///
    /// Failures at any tier are swallowed; only exhausting all three yields
    /// `false`.
    pub async fn is_loaded(&self) -> bool {
        let initstate_path = format!(
            "{}/{}/initstate",
            self.sys_module_base, self.module_name
        );
        if let Ok(content) = fs::read_to_string(&initstate_path) {
            if content.trim() == "live" {
                return true;
            }
        }
        let res = self
            .shell
            .exec(&format!(
                "cat {} 2>/dev/null || true",
                quote_if_needed(&initstate_path)
            ))
            .await;
        if res.code == 0 && res.out.trim() == "live" {
            return true;
        }

        let res = self
            .shell
            .exec(&format!(
                "cat /proc/modules | grep -E '^{}\\s' | wc -l",
                self.module_name
            ))
            .await;
        if res.code == 0 {
            let count: i64 = res.out.trim().parse().unwrap_or(0);
            if count > 0 {
                return true;
            }
        }

        let module_dir = format!("{}/{}", self.sys_module_base, self.module_name);
        let params_dir = format!("{}/parameters", module_dir);
        let res = self
            .shell
            .exec(&format!(
                "[ -d {} ] && [ -d {} ] && echo live || echo not",
                shell_arg(&module_dir),
                shell_arg(&params_dir)
            ))
            .await;
        res.code == 0 && res.out.trim() == "live"
    }

    /// Read one parameter: direct file read first, root cat as fallback.
    /// `None` when both fail or the output is blank.
    pub async fn read_param(&self, param: &str) -> Option<String> {
        let path = self.param_path(param);
        if let Ok(content) = fs::read_to_string(&path) {
            let trimmed = content.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
        let res = self
            .shell
            .exec(&format!("cat {} 2>/dev/null || true", quote_if_needed(&path)))
            .await;
        if res.code == 0 && !res.out.trim().is_empty() {
            Some(res.out.trim().to_string())
        } else {
            None
        }
    }

    /// Read every known parameter into a map.
    pub async fn read_all(&self) -> Vec<(String, Option<String>)> {
        let mut all = Vec::with_capacity(self.param_names.len());
        for name in &self.param_names {
            let value = self.read_param(name).await;
            all.push((name.clone(), value));
        }
        all
    }

    /// Write one parameter value.
    ///
    /// Verifies the parameter path exists, then tries a plain redirect and
    /// falls back to the pipe-to-tee idiom; the two write mechanisms fail
    /// differently depending on execution context.
    pub async fn write_param(&self, param: &str, value: &str) -> bool {
        let path = self.param_path(param);
        if !Path::new(&path).exists() {
            let probe = self
                .shell
                .exec(&format!("[ -e {} ] && echo yes || echo no", shell_arg(&path)))
                .await;
            if !(probe.code == 0 && probe.out.trim() == "yes") {
                log::warn!("parameter path missing: {}", path);
                return false;
            }
        }
        let cmd = format!(
            "printf %s {val} > {p} 2>/dev/null || (echo {val} | tee {p} >/dev/null)",
            val = shell_arg(value),
            p = quote_if_needed(&path)
        );
        self.shell.exec(&cmd).await.code == 0
    }

    /// Load the module with the given initial parameters.
    ///
    /// Short-circuits with a synthetic failure when the module is already
    /// loaded; no insert command reaches the device in that case.
    pub async fn load(&self, ko_path: &str, initial: &[(String, Option<String>)]) -> ExecResult {
        if self.is_loaded().await {
            return ExecResult::new(
                1,
                "",
                format!(
                    "module {} is already loaded; unload it first",
                    self.module_name
                ),
            );
        }
        let cmd = build_insmod_command(ko_path, initial);
        log::info!("loading module: {}", cmd);
        self.shell.exec(&cmd).await
    }

    /// Locate the best artifact for the running kernel, then load it.
    /// On a miss the failure result carries the full search debug report.
    pub async fn load_with_discovery(
        &self,
        kv: &KernelVersion,
        search_paths: &[String],
        initial: &[(String, Option<String>)],
    ) -> ExecResult {
        match locator::find_module(&self.shell, &self.module_name, kv, search_paths).await {
            Some(ko_path) => self.load(&ko_path, initial).await,
            None => {
                let report =
                    locator::search_debug_report(&self.shell, &self.module_name, kv, search_paths)
                        .await;
                ExecResult::new(
                    1,
                    "",
                    format!(
                        "no module artifact found for {}\n\nsearch report:\n{}",
                        self.module_name, report
                    ),
                )
            }
        }
    }

    /// Remove the module. Attempted even when not loaded; the rmmod result
    /// is surfaced as-is.
    pub async fn unload(&self) -> ExecResult {
        self.shell.exec(&format!("rmmod {}", self.module_name)).await
    }
}
