use std::env;
use std::sync::Arc;

use kmodctl::kernel::{self, ProcSysInfo};
use kmodctl::log_collector::get_global_logs_path;
use kmodctl::module::{ChgParamManager, ModuleManager, ModuleTester};
use kmodctl::remote::{self, GitHubReleaseClient, DEFAULT_KO_ASSET_LIMIT};
use kmodctl::shell::{RootShell, SuShell};
use kmodctl::{AppError, ExecResult, LogCollector, ParamList};

const DEFAULT_MODULE: &str = "batt_design_override";
const RELEASE_OWNER: &str = "serein-213";
const RELEASE_REPO: &str = "batt-design-override-module";

fn print_usage() {
    eprintln!("kmodctl {} - kernel module lifecycle control", kmodctl::VERSION);
    eprintln!();
    eprintln!("Usage: kmodctl <command> [args]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  status                         root access and identity summary");
    eprintln!("  kernel                         resolved kernel version");
    eprintln!("  find [module]                  search the known paths for an artifact");
    eprintln!("  test <ko-path> [module]        compatibility-test an artifact (load, scan, unload)");
    eprintln!("  load <ko-path> [key=value...]  insert the module with initial parameters");
    eprintln!("  unload [module]                remove the module");
    eprintln!("  params [module]                read the module's current parameters");
    eprintln!("  apply <key=value...>           batch-apply values to the chg proc interface");
    eprintln!("  remote                         list .ko assets and the best match for this kernel");
}

/// Parse trailing `key=value` arguments into an ordered parameter list.
/// A bare `key` yields an absent value and is skipped downstream.
fn parse_kv_args(args: &[String]) -> ParamList {
    args.iter()
        .map(|arg| match arg.split_once('=') {
            Some((k, v)) => (k.to_string(), Some(v.to_string())),
            None => (arg.clone(), None),
        })
        .collect()
}

fn report(res: &ExecResult) -> kmodctl::Result<()> {
    if !res.out.is_empty() {
        println!("{}", res.out);
    }
    if res.code == 0 {
        Ok(())
    } else {
        Err(AppError::OsCommand {
            cmd: "module operation".to_string(),
            reason: if res.err.is_empty() {
                format!("exit code {}", res.code)
            } else {
                res.err.clone()
            },
        }
        .into())
    }
}

#[tokio::main]
async fn main() -> kmodctl::Result<()> {
    // =========================================================================
    // LOGGING INITIALIZATION - MUST BE FIRST
    // =========================================================================
    let log_dir = get_global_logs_path()?;
    let log_collector = LogCollector::new(log_dir)?;
    if log::set_boxed_logger(Box::new(log_collector.clone()))
        .map(|()| log::set_max_level(log::LevelFilter::Info))
        .is_err()
    {
        eprintln!("[Main] WARNING: failed to register the global logger");
    }
    log::info!("kmodctl {} starting", kmodctl::VERSION);

    let args: Vec<String> = env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        print_usage();
        return Ok(());
    };

    let shell = Arc::new(RootShell::new(SuShell::new()));
    let outcome = run_command(command, &args[1..], &shell).await;

    // Flush pending log lines before the process exits.
    if let Err(e) = log_collector.wait_for_empty().await {
        eprintln!("[Main] WARNING: log flush failed: {}", e);
    }

    outcome
}

async fn run_command(
    command: &str,
    rest: &[String],
    shell: &Arc<RootShell<SuShell>>,
) -> kmodctl::Result<()> {
    match command {
        "status" => {
            let status = shell.status(true).await;
            println!("{}", status.message);
            if !status.available {
                return Err(AppError::RootUnavailable("status check failed".into()).into());
            }
            Ok(())
        }
        "kernel" => {
            let kv = kernel::resolve(&ProcSysInfo, shell).await;
            println!("full:        {}", kv.full);
            println!("base:        {}", kv.base);
            println!("major.minor: {}", kv.major_minor);
            if let Some(android) = kernel::android_release_tag(&kv.major_minor) {
                println!("android tag: {}", android);
            }
            Ok(())
        }
        "find" => {
            let module = rest.first().map(String::as_str).unwrap_or(DEFAULT_MODULE);
            let kv = kernel::resolve(&ProcSysInfo, shell).await;
            let paths = kernel::default_search_paths();
            match kernel::find_module(shell, module, &kv, &paths).await {
                Some(path) => {
                    println!("{}", path);
                    Ok(())
                }
                None => {
                    let report = kernel::search_debug_report(shell, module, &kv, &paths).await;
                    eprintln!("{}", report);
                    Err(AppError::ArtifactMissing(module.to_string()).into())
                }
            }
        }
        "test" => {
            let Some(ko_path) = rest.first() else {
                print_usage();
                return Err(AppError::InvalidInput("test requires a .ko path".into()).into());
            };
            let module = rest.get(1).map(String::as_str).unwrap_or(DEFAULT_MODULE);
            let tester = ModuleTester::new(shell.clone());
            let result = tester.quick_test(module, ko_path, &[]).await;
            println!("{}", result.message);
            if let Some(tail) = &result.kernel_log_tail {
                println!("\nkernel log:\n{}", tail);
            }
            if result.passed {
                Ok(())
            } else {
                Err(AppError::ModuleRejected(result.message).into())
            }
        }
        "load" => {
            let Some(ko_path) = rest.first() else {
                print_usage();
                return Err(AppError::InvalidInput("load requires a .ko path".into()).into());
            };
            let params = parse_kv_args(&rest[1..]);
            let manager = ModuleManager::new(shell.clone());
            report(&manager.load(ko_path, &params).await)
        }
        "unload" => {
            let module = rest.first().map(String::as_str).unwrap_or(DEFAULT_MODULE);
            let manager = ModuleManager::for_module(shell.clone(), module, &[]);
            report(&manager.unload().await)
        }
        "params" => {
            let module = rest.first().map(String::as_str).unwrap_or(DEFAULT_MODULE);
            if module == "chg_param_override" {
                let manager = ChgParamManager::new(shell.clone());
                let mut current: Vec<_> = manager.read_current().await.into_iter().collect();
                current.sort();
                for (key, value) in current {
                    println!("{}={}", key, value);
                }
            } else {
                let manager = ModuleManager::new(shell.clone());
                for (key, value) in manager.read_all().await {
                    match value {
                        Some(v) => println!("{}={}", key, v),
                        None => println!("{}=<unset>", key),
                    }
                }
            }
            Ok(())
        }
        "apply" => {
            if rest.is_empty() {
                print_usage();
                return Err(AppError::InvalidInput("apply requires key=value pairs".into()).into());
            }
            let params = parse_kv_args(rest);
            let manager = ChgParamManager::new(shell.clone());
            report(&manager.apply_batch(&params).await)
        }
        "remote" => {
            let kv = kernel::resolve(&ProcSysInfo, shell).await;
            let client = GitHubReleaseClient::new(RELEASE_OWNER, RELEASE_REPO);

            let assets = remote::list_ko_assets(&client, DEFAULT_KO_ASSET_LIMIT)
                .await
                .map_err(AppError::from)?;
            println!("available .ko assets:");
            for asset in &assets {
                println!("  {}  ({}, {} bytes)", asset.name, asset.tag, asset.size);
            }

            match remote::find_asset(&client, DEFAULT_MODULE, &kv)
                .await
                .map_err(AppError::from)?
            {
                Some(artifact) => {
                    println!();
                    println!("best match for kernel {}:", kv.major_minor);
                    println!("  {} ({})", artifact.download_url, artifact.version);
                    Ok(())
                }
                None => Err(AppError::ArtifactMissing(format!(
                    "{} for kernel {}",
                    DEFAULT_MODULE, kv.major_minor
                ))
                .into()),
            }
        }
        other => {
            print_usage();
            Err(AppError::InvalidInput(format!("unknown command: {}", other)).into())
        }
    }
}
