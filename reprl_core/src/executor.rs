use crate::config::{ExecutionSettings, GcMode};
use crate::input::Script;
use crate::interp::{InitScript, LuaSession, SessionOptions, error_message, report};
use crate::interrupt::InterruptToken;
use crate::natives::Natives;
use std::io::{self, Write};
use thiserror::Error;
use tracing::{debug, error};

pub const STATUS_OK: u8 = 0;
pub const STATUS_RUNTIME_ERROR: u8 = 2;
pub const STATUS_SYNTAX_ERROR: u8 = 3;
pub const STATUS_MEMORY_ERROR: u8 = 4;

/// Outcome of running one payload. Payload failures are values here, never
/// errors: the loop keeps going after any of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    Ok,
    RuntimeError(String),
    SyntaxError(String),
    MemoryError(String),
}

impl ExecutionStatus {
    pub fn from_lua_error(err: &mlua::Error) -> Self {
        let message = error_message(err);
        match err {
            mlua::Error::SyntaxError { .. } => ExecutionStatus::SyntaxError(message),
            mlua::Error::MemoryError(_) => ExecutionStatus::MemoryError(message),
            _ => ExecutionStatus::RuntimeError(message),
        }
    }

    /// The status byte sent back to the supervisor.
    pub fn code(&self) -> u8 {
        match self {
            ExecutionStatus::Ok => STATUS_OK,
            ExecutionStatus::RuntimeError(_) => STATUS_RUNTIME_ERROR,
            ExecutionStatus::SyntaxError(_) => STATUS_SYNTAX_ERROR,
            ExecutionStatus::MemoryError(_) => STATUS_MEMORY_ERROR,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ExecutionStatus::Ok)
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            ExecutionStatus::Ok => None,
            ExecutionStatus::RuntimeError(m)
            | ExecutionStatus::SyntaxError(m)
            | ExecutionStatus::MemoryError(m) => Some(m),
        }
    }
}

/// Failures of the cell itself rather than of the payload. None of these can
/// be blamed on the input, so the caller should stop.
///
/// Lua errors are kept as rendered text: `mlua::Error` is not `Send`.
#[derive(Error, Debug)]
pub enum CellError {
    #[error("Cannot create Lua state: {0}")]
    StateCreation(String),
    #[error("Cannot configure Lua state: {0}")]
    Configure(String),
    #[error("Initialization script failed: {0}")]
    Init(String),
}

pub trait Executor {
    fn execute(&mut self, script: &Script) -> Result<ExecutionStatus, CellError>;
}

#[derive(Debug, Clone)]
pub struct CellSettings {
    /// Prefix for error reports on stderr.
    pub progname: String,
    /// Process arguments exposed to payloads as `arg`.
    pub argv: Vec<String>,
    pub gc_mode: GcMode,
    pub init: Option<InitScript>,
    pub chunk_name: String,
    pub interrupt_interval: u32,
    pub ignore_env: bool,
    pub text_only: bool,
}

impl CellSettings {
    /// Resolves the init script from the environment unless `ignore-env` is set.
    pub fn from_config(execution: &ExecutionSettings, argv: Vec<String>) -> Self {
        let progname = argv.first().cloned().unwrap_or_else(|| "lua".to_string());
        let init = if execution.ignore_env {
            None
        } else {
            InitScript::from_env()
        };
        Self {
            progname,
            argv,
            gc_mode: execution.gc_mode,
            init,
            chunk_name: execution.chunk_name.clone(),
            interrupt_interval: execution.interrupt_interval,
            ignore_env: execution.ignore_env,
            text_only: execution.text_only,
        }
    }
}

impl Default for CellSettings {
    fn default() -> Self {
        Self::from_config(
            &ExecutionSettings {
                ignore_env: true,
                ..ExecutionSettings::default()
            },
            vec!["lua".to_string()],
        )
    }
}

/// Runs every payload in a brand-new Lua state that is dropped before the
/// status is known to the caller.
pub struct LuaExecutor {
    settings: CellSettings,
    natives: Natives,
    interrupt: InterruptToken,
}

impl LuaExecutor {
    pub fn new(settings: CellSettings, natives: Natives) -> Self {
        Self {
            settings,
            natives,
            interrupt: InterruptToken::new(),
        }
    }

    /// Token checked by the running payload; cancel it to stop a hang.
    pub fn interrupt_token(&self) -> &InterruptToken {
        &self.interrupt
    }

    pub fn settings(&self) -> &CellSettings {
        &self.settings
    }

    fn prepare(&self) -> Result<LuaSession, CellError> {
        let session = LuaSession::create(&SessionOptions {
            ignore_env: self.settings.ignore_env,
            natives: Some(&self.natives),
        })
        .map_err(|e| CellError::StateCreation(error_message(&e)))?;

        session
            .set_arg_table(&self.settings.argv, self.settings.argv.len())
            .map_err(|e| CellError::Configure(error_message(&e)))?;
        session.set_gc_mode(self.settings.gc_mode);
        session.install_interrupt(&self.interrupt, self.settings.interrupt_interval);

        if let Some(init) = &self.settings.init {
            if let Err(e) = session.run_init(init) {
                let message = error_message(&e);
                error!(%message, "initialization script failed");
                return Err(CellError::Init(message));
            }
        }
        Ok(session)
    }

    fn run_payload(&self, session: &LuaSession, script: &Script) -> ExecutionStatus {
        let progname = Some(self.settings.progname.as_str());
        match session.run_chunk(
            script.source(),
            &self.settings.chunk_name,
            self.settings.text_only,
        ) {
            Ok(values) => {
                if let Err(e) = session.print_values(values) {
                    report(
                        progname,
                        &format!("error calling 'print' ({})", error_message(&e)),
                    );
                }
                ExecutionStatus::Ok
            }
            Err(e) => {
                let status = ExecutionStatus::from_lua_error(&e);
                report(progname, status.message().unwrap_or_default());
                status
            }
        }
    }
}

impl Executor for LuaExecutor {
    fn execute(&mut self, script: &Script) -> Result<ExecutionStatus, CellError> {
        self.interrupt.clear();
        let status = {
            let session = self.prepare()?;
            self.run_payload(&session, script)
        };
        flush_std_streams();
        debug!(code = status.code(), "execution finished");
        Ok(status)
    }
}

/// Flushes Rust's and C's stdio. The interpreter's `print` writes through C
/// `stdout`, which is block-buffered when it is a pipe.
pub fn flush_std_streams() {
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();
    // SAFETY: fflush(NULL) flushes every open C stream.
    unsafe {
        libc::fflush(std::ptr::null_mut());
    }
}
