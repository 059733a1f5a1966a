//! Host-side wrappers for container desktop files and executables.
//!
//! After a successful install the package's file listing is scanned: desktop
//! files get a copy in the host applications directory with their Exec lines
//! rewritten to go through the container engine, executables get a small shell
//! shim in the host bin directory. Per-file failures are warnings, never fatal
//! to the install.

pub mod desktop;

use std::path::PathBuf;

use anyhow::{Context, Result};
use dialoguer::Confirm;

use crate::cmd::ContainerRunner;
use crate::config::{CONTAINER_DESKTOP_DIRS, CONTAINER_EXECUTABLE_DIRS, IniDoc};
use crate::state::RuntimeConfiguration;
use crate::ui::prelude::*;

/// Produces host wrapper files for an installed package. The install
/// orchestrator only sees the returned paths.
pub trait WrapperGenerator {
    fn wrap_package(&self, package: &str, runtime: &RuntimeConfiguration) -> Vec<String>;
}

/// [`WrapperGenerator`] backed by the container's file listing command.
pub struct ContainerWrapper<'a> {
    pub runner: &'a dyn ContainerRunner,
    /// Engine executable, used verbatim inside generated wrappers.
    pub engine: String,
    /// File listing command template from the distro configuration.
    pub list_files_cmd: String,
    pub applications_dir: PathBuf,
    pub executables_dir: PathBuf,
    pub skip_desktop_files: bool,
    pub skip_executables: bool,
    /// Ask before overwriting an existing host executable. Disabled in quiet
    /// mode, where existing files are replaced.
    pub prompt_overwrite: bool,
}

impl WrapperGenerator for ContainerWrapper<'_> {
    fn wrap_package(&self, package: &str, runtime: &RuntimeConfiguration) -> Vec<String> {
        if self.skip_desktop_files && self.skip_executables {
            return Vec::new();
        }
        let listing = match self
            .runner
            .run_output(&runtime.name, &format!("{} {package}", self.list_files_cmd))
        {
            Ok(listing) => listing,
            Err(err) => {
                emit(
                    Level::Warn,
                    "wrapper.list",
                    &format!("Skipping wrappers for '{package}': {err:#}"),
                    None,
                );
                return Vec::new();
            }
        };
        let box_config = runtime.config.parsed();
        let exec_prefix = format!("{} exec -it {}", self.engine, runtime.name);
        let mut wrapper_files = Vec::new();
        for file in listing.lines() {
            let file = file.trim_end();
            let Some((dir, filename)) = file.rsplit_once('/') else {
                continue;
            };
            let filename = filename.trim();
            if filename.is_empty() {
                // directory entries in the listing
                continue;
            }
            let result = if !self.skip_desktop_files && CONTAINER_DESKTOP_DIRS.contains(&dir) {
                self.wrap_desktop_file(
                    file,
                    filename,
                    runtime,
                    &exec_prefix,
                    &box_config,
                    &mut wrapper_files,
                )
            } else if !self.skip_executables && CONTAINER_EXECUTABLE_DIRS.contains(&dir) {
                self.wrap_executable(file, filename, &exec_prefix, &box_config, &mut wrapper_files)
            } else {
                Ok(())
            };
            if let Err(err) = result {
                emit(
                    Level::Warn,
                    "wrapper.file",
                    &format!("Skipping wrapper for {file}: {err:#}"),
                    None,
                );
            }
        }
        wrapper_files
    }
}

impl ContainerWrapper<'_> {
    fn app_flags<'c>(&self, box_config: &'c IniDoc, app: &str) -> &'c str {
        box_config.get("app_flags", app).unwrap_or("")
    }

    fn wrap_desktop_file(
        &self,
        file: &str,
        filename: &str,
        runtime: &RuntimeConfiguration,
        exec_prefix: &str,
        box_config: &IniDoc,
        wrapper_files: &mut Vec<String>,
    ) -> Result<()> {
        let content = self
            .runner
            .run_output(&runtime.name, &format!("cat '{file}'"))?;
        let flags = self.app_flags(box_config, filename.trim_end_matches(".desktop"));
        // container name makes the host copy unique across containers
        let wrapper_path = self
            .applications_dir
            .join(format!("pkgbox.{}.{filename}", runtime.name));
        emit(
            Level::Info,
            "wrapper.desktop",
            &format!("Linking container desktop file {file} to {}", wrapper_path.display()),
            None,
        );
        let rewritten: String = content
            .lines()
            .map(|line| desktop::rewrite_exec_line(line, exec_prefix, flags) + "\n")
            .collect();
        std::fs::create_dir_all(&self.applications_dir)?;
        std::fs::write(&wrapper_path, rewritten)
            .with_context(|| format!("Failed to write {}", wrapper_path.display()))?;
        wrapper_files.push(wrapper_path.to_string_lossy().into_owned());
        Ok(())
    }

    fn wrap_executable(
        &self,
        file: &str,
        filename: &str,
        exec_prefix: &str,
        box_config: &IniDoc,
        wrapper_files: &mut Vec<String>,
    ) -> Result<()> {
        let wrapper_path = self.executables_dir.join(filename);
        if wrapper_path.exists() && self.prompt_overwrite {
            let overwrite = Confirm::new()
                .with_prompt(format!(
                    "Target file {} already exists. Overwrite?",
                    wrapper_path.display()
                ))
                .default(false)
                .interact()?;
            if !overwrite {
                emit(
                    Level::Warn,
                    "wrapper.exec",
                    &format!("Skipping local wrapper for {file}"),
                    None,
                );
                return Ok(());
            }
        }
        emit(
            Level::Info,
            "wrapper.exec",
            &format!("Linking container executable {file} to {}", wrapper_path.display()),
            None,
        );
        let flags = self.app_flags(box_config, filename);
        let invocation = if flags.is_empty() {
            format!("exec {exec_prefix} \"{file}\" \"$@\"")
        } else {
            format!("exec {exec_prefix} \"{file}\" {flags} \"$@\"")
        };
        std::fs::create_dir_all(&self.executables_dir)?;
        std::fs::write(&wrapper_path, format!("#!/bin/sh\n{invocation}\n"))
            .with_context(|| format!("Failed to write {}", wrapper_path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&wrapper_path, std::fs::Permissions::from_mode(0o755))?;
        }
        wrapper_files.push(wrapper_path.to_string_lossy().into_owned());
        Ok(())
    }
}
