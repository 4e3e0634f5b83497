//! Kernel introspection: version resolution and module artifact search.

pub mod locator;
pub mod version;

pub use locator::{candidate_names, default_search_paths, find_module, search_debug_report};
pub use version::{android_release_tag, resolve, KernelVersion, ProcSysInfo, SysInfoSource};
