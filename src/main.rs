mod cmd;
mod config;
mod install;
mod state;
mod ui;
mod wrapper;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use crate::cmd::EngineRunner;
use crate::install::select::MenuSelection;
use crate::install::{InstallOptions, Installer};
use crate::state::StateStore;
use crate::ui::prelude::*;
use crate::wrapper::ContainerWrapper;

/// Manage packages on sandboxed desktop-application containers.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Activate debug mode
    #[arg(short, long, global = true)]
    debug: bool,

    /// Emit machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install a package on a container, optionally with its optional
    /// dependencies
    Install {
        /// Package to install
        package: String,
        /// Name of the target container
        #[arg(short = 'C', long)]
        container: String,
        /// Pass the distro's no-confirm flag and suppress notices
        #[arg(short, long)]
        quiet: bool,
        /// Do not look for optional dependencies
        #[arg(long)]
        skip_opt_deps: bool,
        /// Comma-separated optional dependencies to install without prompting
        #[arg(long, conflicts_with = "skip_opt_deps")]
        with_opt_deps: Option<String>,
        /// Check whether the package is already installed first
        #[arg(long)]
        check_package: bool,
        /// Do not create desktop file wrappers
        #[arg(long)]
        skip_desktop_files: bool,
        /// Do not create executable wrappers
        #[arg(long)]
        skip_executables: bool,
        /// Also create wrappers for installed optional dependencies
        #[arg(long)]
        add_dep_wrappers: bool,
        /// Path of the podman/docker executable to use
        #[arg(long)]
        engine_path: Option<String>,
        /// Distro configuration file (defaults to the per-distribution file in
        /// the pkgbox config directory)
        #[arg(long)]
        distro_config: Option<String>,
    },

    /// Remove a package registration and clean up its host wrapper files
    Remove {
        /// Package to remove
        package: String,
        /// Name of the owning container
        #[arg(short = 'C', long)]
        container: String,
    },

    /// Record a container in the state database (used by the container
    /// creation tooling)
    RegisterContainer {
        name: String,
        #[arg(long)]
        distribution: String,
        /// Shared root path, empty when the container has a private root
        #[arg(long, default_value = "")]
        shared_root: String,
        /// Resolved container configuration file (INI)
        #[arg(long)]
        config_file: String,
    },

    /// Drop a container from the state database, orphaning shared-root
    /// packages still owned by peers
    UnregisterContainer { name: String },

    /// List registered packages
    List {
        /// Only packages owned by this container
        #[arg(short = 'C', long)]
        container: Option<String>,
        /// Only packages under this shared root
        #[arg(long)]
        shared_root: Option<String>,
        /// Regular expression filter on package names (substring search)
        #[arg(long, default_value = ".*")]
        regex: String,
        /// SQL LIKE pattern on the package type tag
        #[arg(long = "type", default_value = "%")]
        type_pattern: String,
    },

    /// List registered containers
    Containers {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        distribution: Option<String>,
        #[arg(long)]
        shared_root: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();
    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };
    ui::init(format, true);
    if cli.debug {
        eprintln!("Debug mode is on");
    }

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            emit(Level::Error, "main.error", &format!("{err:#}"), None);
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Install {
            package,
            container,
            quiet,
            skip_opt_deps,
            with_opt_deps,
            check_package,
            skip_desktop_files,
            skip_executables,
            add_dep_wrappers,
            engine_path,
            distro_config,
        } => {
            let opts = InstallOptions {
                quiet,
                skip_opt_deps,
                with_opt_deps: with_opt_deps.map(|deps| {
                    deps.split(',')
                        .map(str::trim)
                        .filter(|d| !d.is_empty())
                        .map(str::to_string)
                        .collect()
                }),
                check_package,
                skip_desktop_files,
                skip_executables,
                add_dep_wrappers,
            };
            run_install(
                &package,
                &container,
                opts,
                engine_path.as_deref(),
                distro_config.as_deref(),
            )
        }
        Commands::Remove { package, container } => {
            let mut store = StateStore::open(&config::state_db_path()?)?;
            let Some(runtime) = store.get_container_configuration(&container)? else {
                bail!("Container '{container}' is not registered");
            };
            let copies =
                store.unregister_package(&container, &package, &runtime.shared_root)?;
            for copy in &copies {
                if let Err(err) = std::fs::remove_file(copy) {
                    emit(
                        Level::Warn,
                        "remove.wrapper",
                        &format!("Failed to remove wrapper {copy}: {err}"),
                        None,
                    );
                }
            }
            emit(
                Level::Success,
                "remove.done",
                &format!("Removed '{package}' from '{container}'"),
                None,
            );
            Ok(0)
        }
        Commands::RegisterContainer {
            name,
            distribution,
            shared_root,
            config_file,
        } => {
            let path = shellexpand::tilde(&config_file).into_owned();
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read container configuration {path}"))?;
            let parsed = config::BoxConfig::Parsed(config::IniDoc::parse(&text));
            let mut store = StateStore::open(&config::state_db_path()?)?;
            store.register_container(&name, &distribution, &shared_root, &parsed)?;
            Ok(0)
        }
        Commands::UnregisterContainer { name } => {
            let mut store = StateStore::open(&config::state_db_path()?)?;
            if !store.unregister_container(&name)? {
                emit(
                    Level::Warn,
                    "unregister.missing",
                    &format!("Container '{name}' was not registered"),
                    None,
                );
            }
            Ok(0)
        }
        Commands::List {
            container,
            shared_root,
            regex,
            type_pattern,
        } => {
            let store = StateStore::open(&config::state_db_path()?)?;
            let packages = store.get_packages(
                container.as_deref(),
                shared_root.as_deref(),
                &regex,
                &type_pattern,
            )?;
            print_names(&packages, "state.packages");
            Ok(0)
        }
        Commands::Containers {
            name,
            distribution,
            shared_root,
        } => {
            let store = StateStore::open(&config::state_db_path()?)?;
            let containers = store.get_containers(
                name.as_deref(),
                distribution.as_deref(),
                shared_root.as_deref(),
            )?;
            print_names(&containers, "state.containers");
            Ok(0)
        }
    }
}

fn run_install(
    package: &str,
    container: &str,
    opts: InstallOptions,
    engine_path: Option<&str>,
    distro_config: Option<&str>,
) -> Result<i32> {
    let mut store = StateStore::open(&config::state_db_path()?)?;
    let Some(runtime) = store.get_container_configuration(container)? else {
        bail!("Container '{container}' is not registered");
    };
    let config_path = match distro_config {
        Some(path) => path.to_string(),
        None => config::default_distro_config(&runtime.distribution)?,
    };
    let distro = config::load_distro_config(&config_path)?;
    let engine = cmd::detect_engine(engine_path)?;
    let runner = EngineRunner::new(engine.clone());
    let wrappers = ContainerWrapper {
        runner: &runner,
        engine,
        list_files_cmd: distro.pkgmgr.list_files.clone(),
        applications_dir: config::user_applications_dir()?,
        executables_dir: config::user_executables_dir()?,
        skip_desktop_files: opts.skip_desktop_files,
        skip_executables: opts.skip_executables,
        prompt_overwrite: !opts.quiet,
    };
    let mut installer = Installer::new(
        &distro.pkgmgr,
        &runner,
        &MenuSelection,
        &wrappers,
        &mut store,
        &runtime,
        &opts,
    );
    let code = installer
        .install(package)
        .with_context(|| format!("Failed installing '{package}'"))?;
    store.close()?;
    Ok(code)
}

fn print_names(names: &[String], code: &str) {
    match get_output_format() {
        OutputFormat::Json => emit(
            Level::Info,
            code,
            "",
            Some(serde_json::json!(names)),
        ),
        OutputFormat::Text => {
            for name in names {
                println!("{name}");
            }
        }
    }
}
