//! Charging-parameter override module (proc-file family).
//!
//! Unlike the sysfs family, chg_param_override exposes every parameter
//! through one proc node, `/proc/chg_param_override`, whose content is
//! `key=value` lines with one legacy combined-record form
//! (`batt=<v> ... usb=<v> ...`). Reads must tolerate malformed output
//! where the driver concatenates two records without a newline; writes go
//! through the node as one atomic batch because the driver parses the
//! whole buffer per write.

use std::path::Path;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

use crate::shell::{quote_if_needed, shell_arg, ExecResult, RootShell, ShellTransport};

/// Field names the proc node is known to emit. Used both for display
/// ordering and for the embedded-second-key repair heuristic.
pub const KNOWN_FIELDS: [&str; 6] = [
    "voltage_max",
    "ccc",
    "term",
    "icl",
    "charge_limit",
    "auto_reapply",
];

static EMBEDDED_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(voltage_max|ccc|term|icl|charge_limit|auto_reapply)=")
        .expect("known-field pattern")
});

static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace run"));

/// Maximum accepted value length; kernel output beyond this is malformed.
const MAX_VALUE_LEN: usize = 120;

/// Cleanup of a value extracted from kernel output: strip
/// carriage returns and NUL bytes, collapse whitespace runs, trim, cap
/// the length.
pub fn sanitize_value(raw: &str) -> String {
    let cleaned = raw
        .replace('\r', " ")
        .replace('\n', " ")
        .replace("\\n", " ")
        .replace('\0', " ");
    let collapsed = WHITESPACE_RUN.replace_all(&cleaned, " ");
    collapsed.trim().chars().take(MAX_VALUE_LEN).collect()
}

/// Parse the proc node content into a field map.
///
/// Handles three shapes: the legacy space-joined `batt=... usb=...`
/// record, plain `key=value` lines, and the malformed case where a second
/// record is glued onto a value without a newline. In the malformed case
/// the first value is truncated at the embedded key and the remainder is
/// parsed as further pairs, so no field is lost.
pub fn parse_param_text(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for raw_line in text.split('\n') {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with("batt=") && line.contains(" usb=") {
            for token in line.split_whitespace() {
                if let Some(idx) = token.find('=') {
                    if idx > 0 {
                        map.insert(token[..idx].to_string(), token[idx + 1..].to_string());
                    }
                }
            }
            continue;
        }
        parse_pair_chain(line, &mut map);
    }
    map
}

/// Parse `key=value`, splitting off glued-on records at each embedded
/// known-field key.
fn parse_pair_chain(segment: &str, map: &mut HashMap<String, String>) {
    let mut rest = segment;
    loop {
        let Some(idx) = rest.find('=') else { return };
        if idx == 0 {
            return;
        }
        let key = rest[..idx].trim().to_string();
        let value = &rest[idx + 1..];

        match EMBEDDED_KEY.find(value) {
            Some(m) => {
                let truncated = sanitize_value(&value[..m.start()]);
                log::warn!(
                    "proc output for '{}' contained embedded key '{}'; value truncated",
                    key,
                    &value[m.start()..m.end()]
                );
                map.insert(key, truncated);
                rest = &value[m.start()..];
            }
            _ => {
                map.insert(key, sanitize_value(value));
                return;
            }
        }
    }
}

/// Operations for the chg_param_override kernel module.
pub struct ChgParamManager<T: ShellTransport> {
    shell: Arc<RootShell<T>>,
    module_name: String,
    proc_path: String,
}

impl<T: ShellTransport> ChgParamManager<T> {
    pub fn new(shell: Arc<RootShell<T>>) -> Self {
        ChgParamManager {
            shell,
            module_name: "chg_param_override".to_string(),
            proc_path: "/proc/chg_param_override".to_string(),
        }
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    /// Load-state probe: proc node present (direct, then via root shell),
    /// with an lsmod entry count as the final fallback.
    pub async fn is_loaded(&self) -> bool {
        if Path::new(&self.proc_path).exists() {
            return true;
        }
        let res = self
            .shell
            .exec(&format!(
                "[ -e {} ] && echo 'exists' || echo 'not_exists'",
                shell_arg(&self.proc_path)
            ))
            .await;
        if res.code == 0 && res.out.trim() == "exists" {
            return true;
        }

        let res = self
            .shell
            .exec(&format!(
                "lsmod | grep '^{} ' | wc -l",
                self.module_name
            ))
            .await;
        res.code == 0 && res.out.trim().parse::<i64>().unwrap_or(0) > 0
    }

    /// Read current values from the proc node. Empty map when the module
    /// is not loaded or the node yields nothing.
    pub async fn read_current(&self) -> HashMap<String, String> {
        if !self.is_loaded().await {
            return HashMap::new();
        }
        let res = self
            .shell
            .exec(&format!("cat {} 2>/dev/null || true", self.proc_path))
            .await;
        if res.code != 0 || res.out.trim().is_empty() {
            return HashMap::new();
        }
        parse_param_text(&res.out)
    }

    /// Batch-write `key=value` lines to the proc node in one shot.
    ///
    /// Blank entries are skipped and values sanitized. The driver parses
    /// the whole buffer atomically per write, so fields are never written
    /// individually.
    pub async fn apply_batch(&self, params: &[(String, Option<String>)]) -> ExecResult {
        let mut payload = String::new();
        for (key, value) in params {
            if let Some(v) = value {
                let clean = sanitize_value(v);
                if !clean.is_empty() {
                    payload.push_str(key);
                    payload.push('=');
                    payload.push_str(&clean);
                    payload.push('\n');
                }
            }
        }
        if payload.is_empty() {
            return self.shell.exec(":").await;
        }
        let cmd = format!(
            "printf %s {} | tee {}",
            shell_arg(&payload),
            self.proc_path
        );
        log::debug!("applying {} chg parameter(s)", payload.lines().count());
        self.shell.exec(&cmd).await
    }

    /// Load the module with its insert-time parameters. Rejected with a
    /// synthetic failure when already loaded.
    pub async fn load(
        &self,
        ko_path: &str,
        target_batt: Option<&str>,
        target_usb: Option<&str>,
        verbose: bool,
    ) -> ExecResult {
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
        let mut cmd = format!("insmod {}", quote_if_needed(ko_path));
        if let Some(batt) = target_batt.filter(|s| !s.trim().is_empty()) {
            cmd.push_str(&format!(" target_batt={}", quote_if_needed(batt)));
        }
        if let Some(usb) = target_usb.filter(|s| !s.trim().is_empty()) {
            cmd.push_str(&format!(" target_usb={}", quote_if_needed(usb)));
        }
        if verbose {
            cmd.push_str(" verbose=1");
        }
        log::info!("loading module: {}", cmd);
        self.shell.exec(&cmd).await
    }

    pub async fn unload(&self) -> ExecResult {
        self.shell.exec(&format!("rmmod {}", self.module_name)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::script::ScriptedShell;
    use crate::shell::ShellTiming;

    fn scripted(script: ScriptedShell) -> ChgParamManager<ScriptedShell> {
        let shell = Arc::new(RootShell::with_timing(script, ShellTiming::immediate()));
        ChgParamManager::new(shell)
    }

    #[test]
    fn test_combined_record_decomposes() {
        let map = parse_param_text("batt=battery usb=usb voltage_max=4460000");
        assert_eq!(map.get("batt").map(String::as_str), Some("battery"));
        assert_eq!(map.get("usb").map(String::as_str), Some("usb"));
        assert_eq!(map.get("voltage_max").map(String::as_str), Some("4460000"));
    }

    #[test]
    fn test_plain_lines_parse() {
        let map = parse_param_text("voltage_max=4460000\nccc=6000000\nterm=\n");
        assert_eq!(map.get("voltage_max").map(String::as_str), Some("4460000"));
        assert_eq!(map.get("ccc").map(String::as_str), Some("6000000"));
        assert_eq!(map.get("term").map(String::as_str), Some(""));
    }

    #[test]
    fn test_embedded_second_key_truncates_and_recovers() {
        let map = parse_param_text("voltage_max=4460000extra ccc=6000000");
        assert_eq!(
            map.get("voltage_max").map(String::as_str),
            Some("4460000extra")
        );
        assert_eq!(map.get("ccc").map(String::as_str), Some("6000000"));
    }

    #[test]
    fn test_triple_glued_records_all_recovered() {
        let map = parse_param_text("voltage_max=4460000 icl=3000000 term=250000");
        assert_eq!(map.get("voltage_max").map(String::as_str), Some("4460000"));
        assert_eq!(map.get("icl").map(String::as_str), Some("3000000"));
        assert_eq!(map.get("term").map(String::as_str), Some("250000"));
    }

    #[test]
    fn test_sanitize_strips_control_bytes_and_caps_length() {
        assert_eq!(sanitize_value(" a\r\nb\0c  d "), "a b c d");
        assert_eq!(sanitize_value("x\\ny"), "x y");
        let long = "v".repeat(400);
        assert_eq!(sanitize_value(&long).len(), 120);
    }

    #[test]
    fn test_unknown_embedded_keys_left_alone() {
        // Only the fixed known-field set triggers truncation.
        let map = parse_param_text("batt_name=some value with spaces=inside");
        assert_eq!(
            map.get("batt_name").map(String::as_str),
            Some("some value with spaces=inside")
        );
    }

    #[tokio::test]
    async fn test_read_current_when_not_loaded_is_empty() {
        let script = ScriptedShell::new();
        script.on("[ -e", ExecResult::new(0, "not_exists", ""));
        script.on("lsmod", ExecResult::new(0, "0", ""));
        let mgr = scripted(script);
        assert!(mgr.read_current().await.is_empty());
        assert!(!mgr.shell.transport().ran("cat /proc/chg_param_override"));
    }

    #[tokio::test]
    async fn test_read_current_parses_node() {
        let script = ScriptedShell::new();
        script.on("[ -e", ExecResult::new(0, "exists", ""));
        script.on(
            "cat /proc/chg_param_override",
            ExecResult::new(0, "batt=battery usb=usb\nvoltage_max=4460000", ""),
        );
        let mgr = scripted(script);
        let map = mgr.read_current().await;
        assert_eq!(map.get("voltage_max").map(String::as_str), Some("4460000"));
        assert_eq!(map.get("batt").map(String::as_str), Some("battery"));
    }

    #[tokio::test]
    async fn test_apply_batch_builds_single_payload() {
        let script = ScriptedShell::new();
        script.on("tee /proc/chg_param_override", ExecResult::new(0, "", ""));
        let mgr = scripted(script);
        let params = vec![
            ("voltage_max".to_string(), Some("4460000".to_string())),
            ("ccc".to_string(), None),
            ("term".to_string(), Some("  ".to_string())),
            ("icl".to_string(), Some("3000000".to_string())),
        ];
        let res = mgr.apply_batch(&params).await;
        assert!(res.ok());
        assert!(mgr
            .shell
            .transport()
            .ran("printf %s 'voltage_max=4460000\nicl=3000000\n' | tee /proc/chg_param_override"));
        // One shot, not per-field writes.
        assert_eq!(mgr.shell.transport().count_ran("tee"), 1);
    }

    #[tokio::test]
    async fn test_apply_batch_all_blank_is_noop_command() {
        let script = ScriptedShell::new();
        let mgr = scripted(script);
        let params = vec![("voltage_max".to_string(), None)];
        let res = mgr.apply_batch(&params).await;
        assert!(res.ok());
        assert!(mgr.shell.transport().ran(":"));
        assert!(!mgr.shell.transport().ran("tee"));
    }

    #[tokio::test]
    async fn test_load_rejected_when_proc_node_present() {
        let script = ScriptedShell::new();
        script.on("[ -e", ExecResult::new(0, "exists", ""));
        let mgr = scripted(script);
        let res = mgr.load("/data/local/tmp/chg.ko", Some("battery"), None, true).await;
        assert_eq!(res.code, 1);
        assert!(res.err.contains("already loaded"));
        assert!(!mgr.shell.transport().ran("insmod"));
    }

    #[tokio::test]
    async fn test_load_appends_only_present_params() {
        let script = ScriptedShell::new();
        script.on("[ -e", ExecResult::new(0, "not_exists", ""));
        script.on("lsmod", ExecResult::new(0, "0", ""));
        script.on("insmod", ExecResult::new(0, "", ""));
        let mgr = scripted(script);
        let res = mgr
            .load("/data/local/tmp/chg.ko", Some("battery"), None, true)
            .await;
        assert!(res.ok());
        assert!(mgr
            .shell
            .transport()
            .ran("insmod /data/local/tmp/chg.ko target_batt=battery verbose=1"));
    }
}
