//! On-device module artifact search.
//!
//! Builds an ordered candidate-filename list (most specific first) for a
//! module name and kernel version, then probes a prioritized list of
//! directories through the root shell. The first directory holding any
//! candidate wins; within a directory, the most specific name wins.

use crate::kernel::version::{android_release_tag, KernelVersion};
use crate::shell::{shell_arg, RootShell, ShellTransport};

/// Literal release tags historically used in artifact names, tried after
/// the kernel-version-derived candidates.
const LITERAL_TAGS: [&str; 5] = ["v1.2.1", "1.2.1", "v1.2", "1.2", "latest"];

/// Default on-device search locations, highest priority first.
pub fn default_search_paths() -> Vec<String> {
    [
        "/data/adb/modules/batt-design-override-dynamic/common",
        "/data/adb/modules/batt-design-override/common",
        "/data/local/tmp",
        "/data/local/tmp/modules",
        "/system/lib/modules",
        "/vendor/lib/modules",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn push_unique(names: &mut Vec<String>, candidate: String) {
    if !names.contains(&candidate) {
        names.push(candidate);
    }
}

/// Ordered candidate filenames for `module`, most specific first.
///
/// Priority: android-tagged exact matches, kernel-version matches,
/// major-only match, literal-tag combinations, then the bare
/// `<module>.ko` universal fallback.
pub fn candidate_names(module: &str, kv: &KernelVersion) -> Vec<String> {
    let mut names = Vec::new();
    let android = android_release_tag(&kv.major_minor);

    if let Some(tag) = android {
        push_unique(&mut names, format!("{}-{}-{}.ko", module, tag, kv.major_minor));
        push_unique(&mut names, format!("{}-{}-{}.ko", module, tag, kv.base));
    }

    push_unique(&mut names, format!("{}-{}.ko", module, kv.major_minor));
    push_unique(&mut names, format!("{}-{}.ko", module, kv.base));

    if let Some(major) = kv.major() {
        push_unique(&mut names, format!("{}-{}.ko", module, major));
    }

    for tag in LITERAL_TAGS {
        push_unique(&mut names, format!("{}-{}-{}.ko", module, tag, kv.major_minor));
        if let Some(android) = android {
            push_unique(
                &mut names,
                format!("{}-{}-{}-{}.ko", module, tag, android, kv.major_minor),
            );
        }
    }

    push_unique(&mut names, format!("{}.ko", module));
    names
}

/// Probe one path for existence and non-zero size through the root shell.
async fn artifact_present<T: ShellTransport>(shell: &RootShell<T>, path: &str) -> bool {
    let probe = format!(
        "[ -f {p} ] && [ -s {p} ] && echo 'found' || echo 'not_found'",
        p = shell_arg(path)
    );
    let res = shell.exec(&probe).await;
    res.code == 0 && res.out.trim() == "found"
}

/// Search `paths` (caller priority order) for the first existing,
/// non-empty candidate artifact. Returns the full path, or `None` when the
/// whole cross-product is exhausted.
pub async fn find_module<T: ShellTransport>(
    shell: &RootShell<T>,
    module: &str,
    kv: &KernelVersion,
    paths: &[String],
) -> Option<String> {
    let names = candidate_names(module, kv);
    log::debug!(
        "searching for {} across {} paths, {} candidate names",
        module,
        paths.len(),
        names.len()
    );

    for dir in paths {
        for name in &names {
            let path = format!("{}/{}", dir, name);
            if artifact_present(shell, &path).await {
                log::info!("found module artifact: {}", path);
                return Some(path);
            }
        }
    }

    log::warn!("no suitable module artifact found for {}", module);
    None
}

/// Diagnostic report of the search space: resolved version, candidate
/// names, per-path existence and the `.ko` files each path holds.
pub async fn search_debug_report<T: ShellTransport>(
    shell: &RootShell<T>,
    module: &str,
    kv: &KernelVersion,
    paths: &[String],
) -> String {
    let mut report = String::new();
    report.push_str(&format!("kernel version: {}\n", kv.full));
    report.push_str(&format!("major.minor: {}\n", kv.major_minor));
    report.push_str(&format!(
        "candidate names: {}\n\n",
        candidate_names(module, kv).join(", ")
    ));

    for dir in paths {
        report.push_str(&format!("search path: {}\n", dir));
        let probe = shell
            .exec(&format!(
                "[ -d {} ] && echo 'exists' || echo 'not_exists'",
                shell_arg(dir)
            ))
            .await;
        report.push_str(&format!("  path state: {}\n", probe.out.trim()));

        if probe.code == 0 && probe.out.trim() == "exists" {
            let listing = shell
                .exec(&format!(
                    "ls -la {}/*.ko 2>/dev/null || echo 'no_ko_files'",
                    shell_arg(dir)
                ))
                .await;
            if listing.out.trim() == "no_ko_files" {
                report.push_str("  no .ko files\n");
            } else {
                report.push_str("  available .ko files:\n");
                for line in listing.out.lines() {
                    if !line.trim().is_empty() && line.contains(".ko") {
                        report.push_str(&format!("    {}\n", line));
                    }
                }
            }
        }
        report.push('\n');
    }
    report
}
