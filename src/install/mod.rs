//! Orchestration of a package install on a running container.
//!
//! A single entry point drives the whole flow: optional-dependency discovery
//! (before the install, while the distro search can still see not-yet-installed
//! dependencies), an optional already-installed check, the interactive install
//! command, state registration with wrapper generation, and a user selection of
//! optional dependencies that are then installed through the same path.
//!
//! Dependency installs go through an explicit worklist instead of call
//! recursion; queued requests have discovery disabled, so the recursion depth
//! is exactly one level no matter how many levels the distro-side search
//! reported.

pub mod discovery;
pub mod select;

use std::collections::VecDeque;

use anyhow::Result;

use crate::cmd::ContainerRunner;
use crate::config::PkgMgr;
use crate::state::{RuntimeConfiguration, StateStore};
use crate::ui::prelude::*;
use crate::wrapper::WrapperGenerator;
use self::discovery::OptionalDep;
use self::select::SelectionUi;

/// Caller-supplied switches for one install invocation.
#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    /// Pass the distro's no-confirm flag and suppress notices.
    pub quiet: bool,
    /// Skip optional-dependency handling entirely.
    pub skip_opt_deps: bool,
    /// Explicit dependency list, used verbatim instead of discovery+selection.
    pub with_opt_deps: Option<Vec<String>>,
    /// Query the package before installing and skip the install if present.
    pub check_package: bool,
    pub skip_desktop_files: bool,
    pub skip_executables: bool,
    /// Also create wrappers for files of installed optional dependencies.
    pub add_dep_wrappers: bool,
}

struct InstallRequest {
    package: String,
    opt_dep_install: bool,
}

/// Drives package installs against one container.
pub struct Installer<'a> {
    pkgmgr: &'a PkgMgr,
    runner: &'a dyn ContainerRunner,
    selection: &'a dyn SelectionUi,
    wrappers: &'a dyn WrapperGenerator,
    state: &'a mut StateStore,
    runtime: &'a RuntimeConfiguration,
    opts: &'a InstallOptions,
}

impl<'a> Installer<'a> {
    pub fn new(
        pkgmgr: &'a PkgMgr,
        runner: &'a dyn ContainerRunner,
        selection: &'a dyn SelectionUi,
        wrappers: &'a dyn WrapperGenerator,
        state: &'a mut StateStore,
        runtime: &'a RuntimeConfiguration,
        opts: &'a InstallOptions,
    ) -> Self {
        Installer {
            pkgmgr,
            runner,
            selection,
            wrappers,
            state,
            runtime,
            opts,
        }
    }

    /// Install `package` and, if the user selects any, its optional
    /// dependencies. Returns the exit code of the primary install command;
    /// non-zero is reported, not raised, so the caller decides whether it is
    /// fatal.
    ///
    /// Exit codes of dependency installs are deliberately not folded into the
    /// result: optional dependencies are best-effort extras, and a failed one
    /// leaves the primary install intact.
    pub fn install(&mut self, package: &str) -> Result<i32> {
        let quiet_flag = if self.opts.quiet {
            self.pkgmgr.quiet_flag.as_str()
        } else {
            ""
        };
        // resolve {quiet} now, keep {opt_dep} deferred until each request
        let install_cmd = self.pkgmgr.install.replace("{quiet}", quiet_flag);
        let use_opt_deps = !self.opts.skip_opt_deps || self.opts.with_opt_deps.is_some();
        let (opt_deps_cmd, opt_dep_flag) = if use_opt_deps {
            (
                self.pkgmgr.opt_deps.as_str(),
                self.pkgmgr.opt_dep_flag.as_str(),
            )
        } else {
            ("", "")
        };
        let check_cmd = if self.opts.check_package {
            self.pkgmgr.info.as_str()
        } else {
            ""
        };

        let mut queue = VecDeque::new();
        queue.push_back(InstallRequest {
            package: package.to_string(),
            opt_dep_install: false,
        });
        let mut primary_code = None;
        while let Some(request) = queue.pop_front() {
            let code = self.install_one(
                &request,
                package,
                &install_cmd,
                opt_deps_cmd,
                opt_dep_flag,
                check_cmd,
                &mut queue,
            )?;
            primary_code.get_or_insert(code);
        }
        Ok(primary_code.unwrap_or(0))
    }

    #[allow(clippy::too_many_arguments)]
    fn install_one(
        &mut self,
        request: &InstallRequest,
        primary: &str,
        install_cmd: &str,
        opt_deps_cmd: &str,
        opt_dep_flag: &str,
        check_cmd: &str,
        queue: &mut VecDeque<InstallRequest>,
    ) -> Result<i32> {
        let container = self.runtime.name.clone();
        let package = &request.package;

        // Discovery must run before the install: once the package and its new
        // required dependencies are on disk, the distro search can no longer
        // report second-level optional dependencies.
        let mut optional_deps: Vec<OptionalDep> = Vec::new();
        if !request.opt_dep_install
            && !opt_deps_cmd.is_empty()
            && self.opts.with_opt_deps.is_none()
        {
            optional_deps = self.runner.find_optional_deps(
                &container,
                &format!("{opt_deps_cmd} {package}"),
                package,
            )?;
        }

        let resolved_install_cmd = install_cmd.replace(
            "{opt_dep}",
            if request.opt_dep_install {
                opt_dep_flag
            } else {
                ""
            },
        );

        let mut code = -1;
        if !check_cmd.is_empty() {
            code = self
                .runner
                .run_quiet(&container, &format!("{check_cmd} {package}"))?;
            if code == 0 && !self.opts.quiet {
                emit(
                    Level::Notice,
                    "install.exists",
                    &format!("'{package}' is already installed in '{container}'"),
                    None,
                );
            }
        }
        if code != 0 {
            if !self.opts.quiet {
                emit(
                    Level::Info,
                    "install.run",
                    &format!("Installing '{package}' in '{container}'"),
                    None,
                );
            }
            code = self
                .runner
                .run_terminal(&container, &format!("{resolved_install_cmd} {package}"))?;
        }
        if code != 0 {
            return Ok(code);
        }

        let local_copies = if !request.opt_dep_install || self.opts.add_dep_wrappers {
            self.wrappers.wrap_package(package, self.runtime)
        } else {
            Vec::new()
        };
        let package_type = if request.opt_dep_install {
            StateStore::optional_package_type(primary)
        } else {
            String::new()
        };
        self.state.register_package(
            &container,
            package,
            &self.runtime.shared_root,
            &local_copies,
            &package_type,
        )?;

        let selected = if request.opt_dep_install {
            Vec::new()
        } else if let Some(explicit) = &self.opts.with_opt_deps {
            explicit.clone()
        } else if !optional_deps.is_empty() {
            self.select_optional_deps(package, &optional_deps)?
        } else {
            Vec::new()
        };
        for dep in selected {
            queue.push_back(InstallRequest {
                package: dep,
                opt_dep_install: true,
            });
        }
        Ok(code)
    }

    fn select_optional_deps(&self, package: &str, deps: &[OptionalDep]) -> Result<Vec<String>> {
        let labels: Vec<String> = deps
            .iter()
            .map(|dep| {
                format!(
                    "{} {} ({})",
                    if dep.level <= 1 { "*" } else { " " },
                    dep.name,
                    dep.description.trim()
                )
            })
            .collect();
        emit(
            Level::Info,
            "install.select",
            &format!(
                "Select optional dependencies of {package} (starred ones are the \
                 immediate dependencies):"
            ),
            None,
        );
        let selection = self
            .selection
            .select_multiple("Optional dependencies", &labels)?;
        Ok(selection
            .into_iter()
            .filter_map(|index| deps.get(index).map(|dep| dep.name.clone()))
            .collect())
    }
}
