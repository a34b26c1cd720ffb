//! Thin wrapper over an `mlua` state with the handful of operations the
//! harness and the stand-alone interpreter share.

use crate::config::GcMode;
use crate::interrupt::InterruptToken;
use crate::natives::Natives;
use mlua::{
    ChunkMode, Function, HookTriggers, Lua, LuaOptions, MultiValue, StdLib, Table, Value,
    Variadic, VmState,
};
use std::cell::Cell;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// Checked before [`LUA_INIT`].
pub const LUA_INIT_VERSIONED: &str = "LUA_INIT_5_4";
pub const LUA_INIT: &str = "LUA_INIT";

pub const COPYRIGHT: &str = "Copyright (C) 1994-2022 Lua.org, PUC-Rio";

/// Code run before any other chunk in a fresh state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitScript {
    Inline { name: String, source: String },
    File(PathBuf),
}

impl InitScript {
    pub fn from_env() -> Option<Self> {
        [LUA_INIT_VERSIONED, LUA_INIT]
            .into_iter()
            .find_map(|var| std::env::var(var).ok().map(|value| Self::parse(var, value)))
    }

    /// `@path` names a file; anything else is source text.
    pub fn parse(var: &str, value: String) -> Self {
        match value.strip_prefix('@') {
            Some(path) => InitScript::File(PathBuf::from(path)),
            None => InitScript::Inline {
                name: format!("={var}"),
                source: value,
            },
        }
    }
}

#[derive(Default)]
pub struct SessionOptions<'a> {
    /// Sets `LUA_NOENV` so `package` ignores `LUA_PATH`/`LUA_CPATH`.
    pub ignore_env: bool,
    pub natives: Option<&'a Natives>,
}

pub struct LuaSession {
    lua: Lua,
}

impl LuaSession {
    /// Creates a state, registers natives, then opens every standard library,
    /// `debug` included.
    pub fn create(options: &SessionOptions<'_>) -> mlua::Result<Self> {
        // SAFETY: `debug` and C module loading can break Lua's memory safety.
        // Scripts get exactly the library set of the stock `lua` binary, and
        // no Rust data is reachable from Lua beyond the registered natives.
        let lua = unsafe { Lua::unsafe_new_with(StdLib::NONE, LuaOptions::default()) };
        if options.ignore_env {
            lua.set_named_registry_value("LUA_NOENV", true)?;
        }
        if let Some(natives) = options.natives {
            natives.register(&lua)?;
        }
        lua.load_std_libs(StdLib::ALL)?;
        Ok(Self { lua })
    }

    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    /// Builds the global `arg` table: `argv[script]` at index 0, what follows
    /// at positive indices, what precedes at negative ones. A `script` past the
    /// end means there is no script and the program name takes index 0.
    pub fn set_arg_table(&self, argv: &[String], script: usize) -> mlua::Result<()> {
        let script = if script >= argv.len() { 0 } else { script };
        let positive = argv.len().saturating_sub(script + 1);
        let table = self.lua.create_table_with_capacity(positive, script + 1)?;
        for (i, value) in argv.iter().enumerate() {
            table.raw_set(i as i64 - script as i64, value.as_str())?;
        }
        self.lua.globals().set("arg", table)
    }

    pub fn set_gc_mode(&self, mode: GcMode) {
        match mode {
            GcMode::Generational => {
                self.lua.gc_gen(0, 0);
            }
            GcMode::Incremental => {
                self.lua.gc_inc(0, 0, 0);
            }
        }
    }

    /// Makes running code raise `interrupted!` once `token` is cancelled,
    /// checked every `interval` VM instructions. `0` disables the check.
    pub fn install_interrupt(&self, token: &InterruptToken, interval: u32) {
        if interval == 0 {
            return;
        }
        let token = token.clone();
        self.lua.set_hook(
            HookTriggers::new().every_nth_instruction(interval),
            move |_lua, _debug| {
                if token.take() {
                    Err(mlua::Error::runtime("interrupted!"))
                } else {
                    Ok(VmState::Continue)
                }
            },
        );
    }

    /// Routes `warn` output to stderr as `Lua warning: ...`. Scripts can still
    /// toggle it with the `@on`/`@off` control messages.
    pub fn install_warnings(&self, enabled: bool) {
        let on = Cell::new(enabled);
        let continuing = Cell::new(false);
        self.lua.set_warning_function(move |_lua, message, incomplete| {
            let first = !continuing.replace(incomplete);
            if first && !incomplete {
                if let Some(control) = message.strip_prefix('@') {
                    match control {
                        "on" => on.set(true),
                        "off" => on.set(false),
                        _ => {}
                    }
                    return Ok(());
                }
            }
            if !on.get() {
                return Ok(());
            }
            write_warning(first, message, incomplete).map_err(mlua::Error::external)
        });
    }

    pub fn run_init(&self, init: &InitScript) -> mlua::Result<()> {
        match init {
            InitScript::Inline { name, source } => {
                self.lua.load(source.as_str()).set_name(name.as_str()).exec()
            }
            InitScript::File(path) => self.run_file(Some(path.as_path()), Vec::new()).map(drop),
        }
    }

    /// Compiles and runs `source`, returning whatever the chunk returns.
    pub fn run_chunk(&self, source: &[u8], name: &str, text_only: bool) -> mlua::Result<MultiValue> {
        let mut chunk = self.lua.load(source).set_name(name);
        if text_only {
            chunk = chunk.set_mode(ChunkMode::Text);
        }
        chunk.call(())
    }

    /// Runs a script file, or stdin when `path` is `None`, passing `args` as `...`.
    pub fn run_file(&self, path: Option<&Path>, args: Vec<String>) -> mlua::Result<MultiValue> {
        let (source, name) = match path {
            Some(path) => {
                let source = std::fs::read(path).map_err(|e| {
                    mlua::Error::runtime(format!("cannot open {}: {e}", path.display()))
                })?;
                (source, format!("@{}", path.display()))
            }
            None => {
                let mut source = Vec::new();
                io::stdin()
                    .lock()
                    .read_to_end(&mut source)
                    .map_err(|e| mlua::Error::runtime(format!("cannot read stdin: {e}")))?;
                (source, "=stdin".to_string())
            }
        };
        self.lua
            .load(skip_shebang(source))
            .set_name(name)
            .call(Variadic::from_iter(args))
    }

    /// `globname = require(modname)` for a `-l` argument of the form
    /// `mod` or `glob=mod`.
    pub fn require_into(&self, binding: &str) -> mlua::Result<()> {
        let (global, module) = binding.split_once('=').unwrap_or((binding, binding));
        let globals = self.lua.globals();
        let require: Function = globals.get("require")?;
        let loaded: Value = require.call(module)?;
        globals.set(global, loaded)
    }

    /// Passes `values` to the global `print`, if there are any.
    pub fn print_values(&self, values: MultiValue) -> mlua::Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let print: Function = self.lua.globals().get("print")?;
        print.call::<()>(values)
    }

    pub fn version(&self) -> String {
        self.lua
            .globals()
            .get::<String>("_VERSION")
            .unwrap_or_else(|_| "Lua".to_string())
    }

    pub fn globals(&self) -> Table {
        self.lua.globals()
    }
}

fn write_warning(first: bool, message: &str, incomplete: bool) -> io::Result<()> {
    let mut err = io::stderr().lock();
    if first {
        err.write_all(b"Lua warning: ")?;
    }
    err.write_all(message.as_bytes())?;
    if !incomplete {
        err.write_all(b"\n")?;
    }
    err.flush()
}

/// Blanks a leading `#` line, keeping its newline so line numbers hold.
pub fn skip_shebang(mut source: Vec<u8>) -> Vec<u8> {
    if source.first() == Some(&b'#') {
        let end = source
            .iter()
            .position(|&b| b == b'\n')
            .unwrap_or(source.len());
        source.drain(..end);
    }
    source
}

/// The message of a Lua error without `mlua`'s decoration.
pub fn error_message(err: &mlua::Error) -> String {
    match err {
        mlua::Error::RuntimeError(message) | mlua::Error::MemoryError(message) => message.clone(),
        mlua::Error::SyntaxError { message, .. } => message.clone(),
        mlua::Error::CallbackError { traceback, cause } => {
            let message = error_message(cause);
            // A Lua error raised below a native call already has its traceback.
            if message.contains("stack traceback:") {
                message
            } else {
                format!("{message}\n{traceback}")
            }
        }
        other => other.to_string(),
    }
}

/// Writes `progname: message` (or just `message`) to stderr.
pub fn report(progname: Option<&str>, message: &str) {
    let mut err = io::stderr().lock();
    let _ = match progname {
        Some(progname) => writeln!(err, "{progname}: {message}"),
        None => writeln!(err, "{message}"),
    };
    let _ = err.flush();
}
