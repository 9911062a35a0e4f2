use std::fs;
use std::path::Path;

use crate::config::PatcherConfig;
use crate::error::{IoContext, PatchResult};
use crate::files::mark_executable;

const WINDOWS_BINARY: &str = "xdelta3.exe";
const WINDOWS_64BIT_BINARY: &str = "xdelta3.x86_64.exe";
const LINUX_BINARY: &str = "xdelta3";
const LINUX_64BIT_BINARY: &str = "xdelta3.x86_64";
const MAC_BINARY: &str = "xdelta3_mac";

/// `(file in the resource dir, name in the output dir)` for every bundled
/// tool build. The 64-bit Windows build ships under the plain name so the
/// scripts need not care which one they got.
pub fn bundled_binaries(config: &PatcherConfig) -> [(&'static str, &'static str); 4] {
    let windows = if config.dist_64bit_tool {
        WINDOWS_64BIT_BINARY
    } else {
        WINDOWS_BINARY
    };
    [
        (windows, WINDOWS_BINARY),
        (LINUX_BINARY, LINUX_BINARY),
        (LINUX_64BIT_BINARY, LINUX_64BIT_BINARY),
        (MAC_BINARY, MAC_BINARY),
    ]
}

/// Copies the tool builds next to the apply scripts, overwriting older
/// copies.
pub fn copy_binaries(config: &PatcherConfig, output_dir: &Path) -> PatchResult<()> {
    for (from_name, to_name) in bundled_binaries(config) {
        let from = config.resource_dir.join(from_name);
        let to = output_dir.join(to_name);
        fs::copy(&from, &to)
            .io_context(|| format!("copying {} to {}", from.display(), to.display()))?;
        if to_name != WINDOWS_BINARY {
            mark_executable(&to)?;
        }
    }
    Ok(())
}
