// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::env;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use serde::Deserialize;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    generate_consts()?;

    Ok(())
}

fn generate_consts() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-env-changed=VFW_KCONFIG");
    let path = match env::var_os("VFW_KCONFIG") {
        Some(p) => PathBuf::from(p),
        None => {
            PathBuf::from(env::var_os("CARGO_MANIFEST_DIR").ok_or(
                "CARGO_MANIFEST_DIR not set; is this running under cargo?",
            )?)
            .join("kconfig.toml")
        }
    };
    println!("cargo:rerun-if-changed={}", path.display());

    let text = std::fs::read_to_string(&path)
        .map_err(|e| format!("reading {}: {e}", path.display()))?;
    let kconfig: KernelConfig = toml::from_str(&text)?;
    kconfig.check()?;

    let out = &PathBuf::from(
        env::var_os("OUT_DIR").ok_or("OUT_DIR not set")?,
    );
    let mut file = File::create(out.join("kconfig.rs"))?;

    writeln!(file, "// Generated by build.rs from {}", path.display())?;
    writeln!(
        file,
        "pub const MAX_USER_APPS: usize = {};",
        kconfig.max_user_apps
    )?;
    writeln!(
        file,
        "pub const MAX_USER_TASKS: usize = {};",
        kconfig.max_user_tasks
    )?;
    writeln!(
        file,
        "pub const KERNEL_HEAP_SIZE: usize = {};",
        kconfig.kernel_heap_size
    )?;
    writeln!(
        file,
        "pub const USER_RAM_END: usize = {:#x};",
        kconfig.user_ram_end
    )?;
    writeln!(
        file,
        "pub const USER_HEAP_GUARD: usize = {};",
        kconfig.user_heap_guard
    )?;
    writeln!(
        file,
        "pub const BYTE_ALIGNMENT: usize = {};",
        kconfig.byte_alignment
    )?;
    writeln!(
        file,
        "pub const MAX_PRIORITIES: u8 = {};",
        kconfig.max_priorities
    )?;
    writeln!(
        file,
        "pub const APP_STACK_DEPTH: usize = {};",
        kconfig.app_stack_depth
    )?;
    writeln!(
        file,
        "pub const APP_PRIORITY: u8 = {};",
        kconfig.app_priority
    )?;
    writeln!(
        file,
        "pub const DELETE_TIMEOUT_TICKS: u32 = {};",
        kconfig.delete_timeout_ticks
    )?;

    Ok(())
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct KernelConfig {
    max_user_apps: usize,
    max_user_tasks: usize,
    kernel_heap_size: usize,
    user_ram_end: usize,
    user_heap_guard: usize,
    byte_alignment: usize,
    max_priorities: u8,
    app_stack_depth: usize,
    app_priority: u8,
    delete_timeout_ticks: u32,
}

impl KernelConfig {
    /// Catches values that would only otherwise show up as a confusing
    /// const-assertion failure in the kernel crate.
    fn check(&self) -> Result<(), String> {
        if !self.byte_alignment.is_power_of_two() {
            return Err(format!(
                "byte-alignment {} is not a power of two",
                self.byte_alignment
            ));
        }
        if self.max_user_tasks >= 100 {
            return Err(format!(
                "max-user-tasks {} does not fit a 100-wide task number band",
                self.max_user_tasks
            ));
        }
        if self.max_user_apps == 0 || self.max_user_apps > 255 {
            return Err(format!(
                "max-user-apps {} must be between 1 and 255",
                self.max_user_apps
            ));
        }
        Ok(())
    }
}
