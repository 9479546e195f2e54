//! Host-facing primitives: process discovery, signal handling and capability checks.

mod process;
mod requirements;
mod signal;

pub use process::{
    BLOCKING_WAIT_ARG, HELPER_BINARY_NAME, HelperProcessHandle, HelperProcessLocator,
    PREFIX_VARIABLE, PeerEnvironmentReader, ProcfsReader, is_blocking_wait,
};
pub use requirements::{
    FLATPAK_BWRAP_COMPATIBLE_VERSION, FLATPAK_INFO_PATH, HostRequirements, check_all,
    check_with_info_path, running_flatpak_version,
};
pub use signal::{ShutdownSignals, TEARDOWN_SIGNALS};
