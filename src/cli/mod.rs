// Purpose: Command-line surface: build/run sources and manage the extension registry.
// Inputs/Outputs: Reads argv (without the program name) and returns the process exit code.
// Invariants: Every failure path returns nonzero; the build log goes through a LogSink, never println! in stages.
// Gotchas: `--link-flag` values start with `-`, so that argument accepts hyphen values.

use std::io::Write;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use colored::Colorize;

use crate::config::{BuildOptions, Settings};
use crate::ext::{CustomExtension, ExtensionProvider, ExtensionRegistry, InstallContext};
use crate::pipeline::Builder;
use crate::process::CancelToken;
use crate::report::{Level, LogSink, Reporter, init_tracing};
use crate::toolchain::ToolchainContext;

#[derive(Parser, Debug)]
#[command(
    name = "cmpile",
    version,
    about = "Compile and run C/C++ sources with automatic dependency discovery"
)]
struct Cli {
    /// Print diagnostic tracing (also enabled by CMPILE_LOG / RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Compile and link the given sources
    Build(BuildArgs),
    /// Build, then execute the produced program
    Run(BuildArgs),
    /// Manage extensions (fetched, custom and built-in libraries)
    Ext {
        #[command(subcommand)]
        cmd: ExtCmd,
    },
}

#[derive(Args, Debug, Clone)]
struct BuildArgs {
    /// Source files or directories (searched recursively)
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Extra compiler flags, split shell-style
    #[arg(long = "compiler-flags", allow_hyphen_values = true)]
    compiler_flags: Option<String>,

    /// Recompile every unit
    #[arg(long)]
    clean: bool,

    /// Produce a shared library instead of an executable
    #[arg(long)]
    shared: bool,

    /// GUI subsystem on Windows (no console window)
    #[arg(long = "no-console")]
    no_console: bool,

    /// Build through a generated CMake project
    #[arg(long)]
    cmake: bool,

    /// Extra include directory (repeatable)
    #[arg(short = 'I', long = "include")]
    include: Vec<PathBuf>,

    /// Extra library search directory (repeatable)
    #[arg(short = 'L', long = "lib-dir")]
    lib_dir: Vec<PathBuf>,

    /// Extra linker flag such as -lm (repeatable)
    #[arg(long = "link-flag", allow_hyphen_values = true)]
    link_flag: Vec<String>,

    /// Also use every installed registry extension
    #[arg(long = "with-extensions")]
    with_extensions: bool,
}

impl BuildArgs {
    fn into_options(self, run: bool) -> BuildOptions {
        BuildOptions {
            inputs: self.paths,
            compiler_flags: self.compiler_flags.unwrap_or_default(),
            clean: self.clean,
            shared: self.shared,
            no_console: self.no_console,
            use_generator: self.cmake,
            run,
            extra_includes: self.include,
            extra_lib_dirs: self.lib_dir,
            extra_link_flags: self.link_flag,
        }
    }
}

#[derive(Subcommand, Debug)]
enum ExtCmd {
    /// Show every known extension and whether it is installed
    List,
    /// Install one extension
    Install { name: String },
    /// Install every extension that is not installed yet
    InstallAll,
    /// Register a prebuilt library by its paths
    Add {
        name: String,
        #[arg(long = "include")]
        include: PathBuf,
        #[arg(long = "lib")]
        lib: Option<PathBuf>,
        #[arg(long = "flag", allow_hyphen_values = true)]
        flag: Vec<String>,
    },
    /// Register a GitHub repository to fetch and build
    AddFetch {
        url: String,
        #[arg(long, default_value = "main")]
        version: String,
    },
    /// Remove an extension from the list (deleting fetched files)
    Remove { name: String },
}

/// Renders the build log with the familiar bracketed prefixes.
struct ConsoleSink;

impl LogSink for ConsoleSink {
    fn log(&self, level: Level, msg: &str) {
        match level {
            Level::Info => println!("{} {}", "[CMP]".cyan().bold(), msg),
            Level::Success => println!("{} {}", "[PASS]".green().bold(), msg),
            Level::Warn => eprintln!("{} {}", "[WARN]".yellow().bold(), msg),
            Level::Error => eprintln!("{} {}", "[ERR]".red().bold(), msg),
        }
        let _ = std::io::stdout().flush();
    }
}

pub fn run_cli<I>(args: I) -> i32
where
    I: IntoIterator<Item = String>,
{
    let argv = std::iter::once("cmpile".to_string()).chain(args);
    let cli = match Cli::try_parse_from(argv) {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { 2 } else { 0 };
            let _ = e.print();
            return code;
        }
    };
    init_tracing(cli.verbose);

    let sink = ConsoleSink;
    let reporter = Reporter::new(&sink);
    let settings = match Settings::from_env() {
        Ok(s) => s,
        Err(e) => {
            reporter.error(&format!("{:#}", e));
            return 1;
        }
    };

    match cli.cmd {
        Cmd::Build(args) => build(args, false, settings, reporter),
        Cmd::Run(args) => build(args, true, settings, reporter),
        Cmd::Ext { cmd } => match ext(cmd, &settings, reporter) {
            Ok(()) => 0,
            Err(e) => {
                reporter.error(&format!("{:#}", e));
                1
            }
        },
    }
}

fn build(args: BuildArgs, run: bool, settings: Settings, reporter: Reporter<'_>) -> i32 {
    let with_extensions = args.with_extensions;
    let opts = args.into_options(run);
    let mut builder = Builder::from_settings(settings);
    if with_extensions {
        let registry = ExtensionRegistry::load(builder.settings(), reporter);
        builder = builder.with_contributions(registry.installed_contributions());
    }
    builder.build(&opts, reporter).status_code()
}

fn ext(cmd: ExtCmd, settings: &Settings, reporter: Reporter<'_>) -> anyhow::Result<()> {
    let mut registry = ExtensionRegistry::load(settings, reporter);
    match cmd {
        ExtCmd::List => {
            for e in registry.list() {
                let state = if e.is_installed() {
                    "installed".green()
                } else {
                    "not installed".dimmed()
                };
                println!(
                    "{:<16} {:<8} {:<10} {}",
                    e.name().bold(),
                    e.kind(),
                    e.version().unwrap_or_default(),
                    state
                );
            }
        }
        ExtCmd::Install { name } => {
            let toolchain = ToolchainContext::discover(settings);
            let cancel = CancelToken::new();
            let ctx = InstallContext {
                settings,
                toolchain: &toolchain,
                cancel: &cancel,
            };
            registry.install(&name, &ctx, reporter)?;
            reporter.success(&format!("{} is installed", name));
        }
        ExtCmd::InstallAll => {
            let toolchain = ToolchainContext::discover(settings);
            let cancel = CancelToken::new();
            let ctx = InstallContext {
                settings,
                toolchain: &toolchain,
                cancel: &cancel,
            };
            let failures = registry.install_all(&ctx, reporter);
            if !failures.is_empty() {
                anyhow::bail!("{} extension(s) failed to install", failures.len());
            }
            reporter.success("all extensions installed");
        }
        ExtCmd::Add {
            name,
            include,
            lib,
            flag,
        } => {
            registry.add_custom(CustomExtension {
                name: name.clone(),
                include_path: include,
                lib_path: lib.unwrap_or_default(),
                flags: flag,
            })?;
            reporter.success(&format!("added {}", name));
        }
        ExtCmd::AddFetch { url, version } => {
            let name = registry.add_fetch(&url, &version)?;
            reporter.success(&format!("added {} ({})", name, version));
        }
        ExtCmd::Remove { name } => registry.remove(&name, reporter)?,
    }
    Ok(())
}
