//! kmodctl - kernel module lifecycle control for locked-down devices
//!
//! This crate drives out-of-tree kernel modules on devices where the only
//! privileged channel is a root shell: it resolves the running kernel
//! version, locates the matching `.ko` artifact locally or in hosted
//! release manifests, loads and unloads modules, reads and writes their
//! parameters through sysfs/procfs pseudo-files, and compatibility-tests
//! candidate artifacts before they are installed.
//!
//! The system is organized into functional modules:
//! - **error**: Unified error type hierarchy
//! - **shell**: Privileged executor (root shell with elevation cache)
//! - **kernel**: Kernel version resolution and local artifact search
//! - **module**: Module lifecycle control, parameter access, install testing
//! - **remote**: Release-manifest lookup for hosted artifacts
//! - **log_collector**: Decoupled logging pipeline

#![allow(dead_code)]

// Core foundational modules
pub mod error;

// Privileged executor: root shell, elevation cache, command quoting
pub mod shell;

// Kernel version resolver and local module-artifact locator
pub mod kernel;

// Module lifecycle controller, chg-family manager, safe install tester
pub mod module;

// Remote artifact locator over hosted release manifests
pub mod remote;

// Robust, decoupled logging system
pub mod log_collector;

// Re-export the log crate for macro usage
pub use log;

// Re-export log collector for use throughout the system
pub use log_collector::{LogCollector, LogLine};

// ============================================================================
// PUBLIC RE-EXPORTS FOR CONVENIENCE
// ============================================================================

// Re-export error types for easy access
pub use error::{AppError, RemoteError, Result};

// Re-export the privileged executor surface
pub use shell::{ElevationState, ExecResult, RootShell, ShellTiming, ShellTransport, SuShell};

// Re-export kernel version and locator types
pub use kernel::{KernelVersion, ProcSysInfo, SysInfoSource};

// Re-export module lifecycle types
pub use module::{ChgParamManager, ModuleManager, ModuleTester, ParamList, TestResult};

// Re-export remote locator types
pub use remote::{GitHubReleaseClient, ModuleArtifact, Release, ReleaseAsset, ReleaseSource};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
