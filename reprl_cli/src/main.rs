mod repl;
#[cfg(feature = "sancov")]
mod sancov;

use reprl_core::config::HarnessConfig;
use reprl_core::coverage;
use reprl_core::driver::ReprlDriver;
use reprl_core::executor::{CellSettings, LuaExecutor, flush_std_streams};
use reprl_core::interp::{COPYRIGHT, InitScript, LuaSession, SessionOptions, error_message, report};
use reprl_core::interrupt::{InterruptToken, SigintGuard};
use reprl_core::natives::Natives;
use reprl_core::observer::{CoverageObserver, ThroughputObserver};
use reprl_core::transport::{ReprlChannel, open_data_write};

use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "lua-reprl",
    about = "Lua stand-alone interpreter with a persistent REPRL fuzzing mode",
    override_usage = "lua-reprl [options] [script [args]]",
    disable_version_flag = true
)]
struct Cli {
    /// Execute string 'stat'
    #[arg(short = 'e', value_name = "stat")]
    execute: Vec<String>,
    /// Require library 'mod' into global 'mod', or 'g=mod' into global 'g'
    #[arg(short = 'l', value_name = "mod")]
    library: Vec<String>,
    /// Enter interactive mode after executing 'script'
    #[arg(short = 'i')]
    interactive: bool,
    /// Show version information
    #[arg(short = 'v')]
    show_version: bool,
    /// Ignore environment variables
    #[arg(short = 'E')]
    ignore_env: bool,
    /// Turn warnings on
    #[arg(short = 'W')]
    warnings: bool,
    /// Serve the REPRL protocol on descriptors 100-103
    #[arg(short = 'r', long = "reprl")]
    reprl: bool,
    /// Harness configuration file (TOML)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Script to run ('-' for stdin) followed by its arguments
    #[arg(value_name = "script", trailing_var_arg = true)]
    script: Vec<String>,
}

/// A `-e` or `-l` option, kept in command-line order.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Action {
    Execute(String),
    Require(String),
}

fn ordered_actions(matches: &ArgMatches, cli: &Cli) -> Vec<Action> {
    let indexed = |id: &str| -> Vec<usize> {
        matches
            .indices_of(id)
            .map(|indices| indices.collect())
            .unwrap_or_default()
    };
    let mut actions: Vec<(usize, Action)> = indexed("execute")
        .into_iter()
        .zip(cli.execute.iter().cloned().map(Action::Execute))
        .chain(
            indexed("library")
                .into_iter()
                .zip(cli.library.iter().cloned().map(Action::Require)),
        )
        .collect();
    actions.sort_by_key(|(index, _)| *index);
    actions.into_iter().map(|(_, action)| action).collect()
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn load_config(path: Option<&Path>) -> Result<HarnessConfig, anyhow::Error> {
    match path {
        Some(path) => HarnessConfig::load_from_file(path),
        None => Ok(HarnessConfig::default()),
    }
}

fn main() -> ExitCode {
    let argv: Vec<String> = std::env::args_os()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();
    let matches = Cli::command().get_matches_from(&argv);
    let cli = match Cli::from_arg_matches(&matches) {
        Ok(cli) => cli,
        Err(e) => e.exit(),
    };

    let progname = argv.first().cloned().unwrap_or_else(|| "lua".to_string());
    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            report(Some(progname.as_str()), &format!("{e:#}"));
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config.logging.level);
    debug!(?config, "effective configuration");

    if cli.reprl {
        if let Err(e) = run_reprl(&cli, &config, argv) {
            error!("{e:#}");
            return ExitCode::FAILURE;
        }
        return ExitCode::SUCCESS;
    }

    let actions = ordered_actions(&matches, &cli);
    let script_index = argv.len() - cli.script.len();
    let standalone = Standalone {
        cli: &cli,
        config: &config,
        argv: &argv,
        progname: &progname,
        actions,
        script_index,
    };
    match standalone.run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            report(Some(progname.as_str()), &format!("{e:#}"));
            ExitCode::FAILURE
        }
    }
}

/// Only returns on failure: the loop has no natural end.
fn run_reprl(cli: &Cli, config: &HarnessConfig, argv: Vec<String>) -> Result<(), anyhow::Error> {
    let coverage = coverage::global();
    match coverage.region() {
        Some(region) => info!(
            edges = region.num_edges(),
            shared = region.is_shared(),
            "coverage active"
        ),
        None => info!("binary is not instrumented, coverage disabled"),
    }

    let channel = ReprlChannel::from_reserved_fds()?;
    let natives = match open_data_write() {
        Some(fuzzout) => Natives::with_fuzzout(fuzzout),
        None => Natives::new(),
    };

    let mut execution = config.execution.clone();
    execution.ignore_env |= cli.ignore_env;
    let executor = LuaExecutor::new(CellSettings::from_config(&execution, argv), natives);
    let token = executor.interrupt_token().clone();
    let _sigint = SigintGuard::install(&token)?;

    let mut driver = ReprlDriver::new(channel, executor, config.transport.status_encoding)
        .with_observer(CoverageObserver::new(coverage))
        .with_observer(ThroughputObserver::new(config.logging.stats_interval));
    let Err(e) = driver.run();
    Err(e.into())
}

/// The ordinary `lua` command line.
struct Standalone<'a> {
    cli: &'a Cli,
    config: &'a HarnessConfig,
    argv: &'a [String],
    progname: &'a str,
    actions: Vec<Action>,
    script_index: usize,
}

impl Standalone<'_> {
    /// `Ok(false)` when a chunk failed and was already reported.
    fn run(&self) -> Result<bool, anyhow::Error> {
        let natives = Natives::new();
        let session = LuaSession::create(&SessionOptions {
            ignore_env: self.cli.ignore_env,
            natives: Some(&natives),
        })
        .map_err(lua_failure)?;
        if self.cli.show_version || self.cli.interactive {
            print_version(&session);
        }
        session
            .set_arg_table(self.argv, self.script_index)
            .map_err(lua_failure)?;
        session.set_gc_mode(self.config.execution.gc_mode);
        session.install_warnings(self.cli.warnings);
        let token = InterruptToken::new();
        session.install_interrupt(&token, self.config.execution.interrupt_interval);

        if !self.cli.ignore_env {
            if let Some(init) = InitScript::from_env() {
                if !self.check(repl::call_interruptible(&token, || session.run_init(&init))) {
                    return Ok(false);
                }
            }
        }

        for action in &self.actions {
            let result = match action {
                Action::Execute(stat) => repl::call_interruptible(&token, || {
                    session
                        .run_chunk(stat.as_bytes(), "=(command line)", false)
                        .map(drop)
                }),
                Action::Require(binding) => {
                    repl::call_interruptible(&token, || session.require_into(binding))
                }
            };
            if !self.check(result) {
                return Ok(false);
            }
        }

        let has_script = self.script_index < self.argv.len();
        if has_script {
            let path = self.script_path();
            let args = self.argv[self.script_index + 1..].to_vec();
            let result =
                repl::call_interruptible(&token, || session.run_file(path, args).map(drop));
            if !self.check(result) {
                return Ok(false);
            }
        }

        if self.cli.interactive {
            repl::run(&session, &token)?;
        } else if !has_script && self.cli.execute.is_empty() && !self.cli.show_version {
            if std::io::stdin().is_terminal() {
                print_version(&session);
                repl::run(&session, &token)?;
            } else {
                let result = repl::call_interruptible(&token, || {
                    session.run_file(None, Vec::new()).map(drop)
                });
                if !self.check(result) {
                    return Ok(false);
                }
            }
        }
        flush_std_streams();
        Ok(true)
    }

    /// `-` names stdin unless it came right after `--`.
    fn script_path(&self) -> Option<&Path> {
        let name = self.argv[self.script_index].as_str();
        let after_dashes = self.script_index > 0 && self.argv[self.script_index - 1] == "--";
        if name == "-" && !after_dashes {
            None
        } else {
            Some(Path::new(name))
        }
    }

    fn check(&self, result: mlua::Result<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                flush_std_streams();
                report(Some(self.progname), &error_message(&e));
                false
            }
        }
    }
}

/// `mlua::Error` is not `Send`, so it crosses into `anyhow` as text.
fn lua_failure(e: mlua::Error) -> anyhow::Error {
    anyhow::anyhow!(error_message(&e))
}

fn print_version(session: &LuaSession) {
    println!("{}  {}", session.version(), COPYRIGHT);
}
