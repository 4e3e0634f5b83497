//! End-to-end lifecycle flow over a scripted shell.
//!
//! Exercises the whole chain the way the binary drives it: resolve the
//! kernel version, search the known paths for an artifact, load it with
//! parameters, round-trip a parameter value, and unload, asserting both
//! the results each stage returned and the exact commands that reached
//! the shell.

use std::sync::Arc;

use kmodctl::kernel::{self, KernelVersion, SysInfoSource};
use kmodctl::module::{ChgParamManager, ModuleManager};
use kmodctl::shell::script::ScriptedShell;
use kmodctl::shell::{ExecResult, RootShell, ShellTiming};

struct FixtureSysInfo {
    release: Option<String>,
    banner: Option<String>,
}

impl SysInfoSource for FixtureSysInfo {
    fn kernel_release(&self) -> Option<String> {
        self.release.clone()
    }
    fn version_banner(&self) -> Option<String> {
        self.banner.clone()
    }
}

fn scripted() -> Arc<RootShell<ScriptedShell>> {
    Arc::new(RootShell::with_timing(
        ScriptedShell::new(),
        ShellTiming::immediate(),
    ))
}

#[tokio::test]
async fn test_resolve_then_find_prefers_android_tagged_candidate() {
    let shell = scripted();
    let sys = FixtureSysInfo {
        release: Some("5.15.123-g1234567".to_string()),
        banner: None,
    };
    let kv = kernel::resolve(&sys, &shell).await;
    assert_eq!(kv.base, "5.15.123");
    assert_eq!(kv.major_minor, "5.15");

    // Only the android13-tagged candidate exists on the device.
    shell.transport().on(
        "batt_design_override-android13-5.15.ko",
        ExecResult::new(0, "found", ""),
    );

    let paths = kernel::default_search_paths();
    let hit = kernel::find_module(&shell, "batt_design_override", &kv, &paths)
        .await
        .expect("artifact should be found");
    assert_eq!(
        hit,
        "/data/adb/modules/batt-design-override-dynamic/common/batt_design_override-android13-5.15.ko"
    );

    // The most specific candidate is probed before the bare fallback.
    let history = shell.transport().executed();
    let specific = history
        .iter()
        .position(|c| c.contains("android13-5.15.ko"))
        .unwrap();
    assert!(!history[..specific]
        .iter()
        .any(|c| c.contains("batt_design_override.ko")));
}

#[tokio::test]
async fn test_load_param_roundtrip_unload_sequence() {
    let shell = scripted();
    let script = shell.transport();

    // Not loaded at first, loaded after the insert.
    script.on("initstate", ExecResult::new(1, "", "no such file"));
    script.on_seq(
        "wc -l",
        vec![ExecResult::new(0, "0", ""), ExecResult::new(0, "1", "")],
    );
    script.on("parameters' ]", ExecResult::new(0, "not", ""));
    script.on("insmod", ExecResult::new(0, "", ""));
    script.on("[ -e", ExecResult::new(0, "yes", ""));
    script.on("cat /sys/module/batt_design_override/parameters/verbose", ExecResult::new(0, "1\n", ""));

    let manager = ModuleManager::new(shell.clone());
    let params = vec![("verbose".to_string(), Some("1".to_string()))];
    let res = manager.load("/data/local/tmp/batt_design_override.ko", &params).await;
    assert_eq!(res.code, 0);
    assert!(script.ran("insmod /data/local/tmp/batt_design_override.ko verbose=1"));

    assert!(manager.is_loaded().await);

    assert!(manager.write_param("verbose", "1").await);
    assert_eq!(manager.read_param("verbose").await.as_deref(), Some("1"));

    let res = manager.unload().await;
    assert_eq!(res.code, 0);
    assert!(script.ran("rmmod batt_design_override"));

    // Strict ordering: insert before parameter write before removal.
    let history = script.executed();
    let insmod_at = history.iter().position(|c| c.starts_with("insmod")).unwrap();
    let write_at = history.iter().position(|c| c.contains("printf %s")).unwrap();
    let rmmod_at = history.iter().position(|c| c.starts_with("rmmod")).unwrap();
    assert!(insmod_at < write_at && write_at < rmmod_at);
}

#[tokio::test]
async fn test_load_with_discovery_miss_carries_search_report() {
    let shell = scripted();
    // Every existence probe misses, every directory listing is empty.
    shell
        .transport()
        .on("[ -f", ExecResult::new(0, "not_found", ""));
    shell
        .transport()
        .on("[ -d", ExecResult::new(0, "not_exists", ""));

    let kv = KernelVersion::parse("5.15.123-g1234567");
    let manager = ModuleManager::new(shell.clone());
    let res = manager
        .load_with_discovery(&kv, &kernel::default_search_paths(), &[])
        .await;

    assert_ne!(res.code, 0);
    assert!(res.err.contains("no module artifact found"));
    assert!(res.err.contains("candidate names"));
    assert!(res.err.contains("/data/local/tmp"));
    assert!(
        !shell.transport().ran("insmod"),
        "a failed search must not reach insmod"
    );
}

#[tokio::test]
async fn test_chg_apply_batch_is_one_privileged_write() {
    let shell = scripted();
    let script = shell.transport();
    script.on("tee /proc/chg_param_override", ExecResult::new(0, "", ""));

    let manager = ChgParamManager::new(shell.clone());
    let params = vec![
        ("voltage_max".to_string(), Some("4460000".to_string())),
        ("ccc".to_string(), Some("6000000".to_string())),
        ("term".to_string(), None),
    ];
    let res = manager.apply_batch(&params).await;
    assert_eq!(res.code, 0);

    // One shot for the whole batch, blanks skipped.
    assert_eq!(script.count_ran("tee /proc/chg_param_override"), 1);
    assert!(script.ran("voltage_max=4460000\nccc=6000000"));
    assert!(!script.ran("term="));
}

#[tokio::test]
async fn test_version_resolution_falls_back_to_uname() {
    let shell = scripted();
    shell
        .transport()
        .on("uname -r", ExecResult::new(0, "6.1.57-android14-g77aa\n", ""));

    let sys = FixtureSysInfo {
        release: None,
        banner: None,
    };
    let kv = kernel::resolve(&sys, &shell).await;
    assert_eq!(kv.full, "6.1.57-android14-g77aa");
    assert_eq!(kv.base, "6.1.57");
    assert_eq!(kv.major_minor, "6.1");
    assert_eq!(kernel::android_release_tag(&kv.major_minor), Some("android14"));
}
