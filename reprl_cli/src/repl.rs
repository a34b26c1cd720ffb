use mlua::{Function, MultiValue};
use reprl_core::interp::{LuaSession, error_message, report};
use reprl_core::interrupt::{InterruptToken, SigintGuard};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tracing::warn;

const PROMPT: &str = "> ";
const PROMPT2: &str = ">> ";
const CHUNK_NAME: &str = "=stdin";

/// Result of reading one complete statement or expression.
enum Line {
    Chunk(Function),
    Error(mlua::Error),
    Eof,
}

/// Reads, evaluates and prints until end of input. Errors are reported
/// without a program name, as an interactive session expects.
pub fn run(session: &LuaSession, token: &InterruptToken) -> Result<(), anyhow::Error> {
    let mut editor = DefaultEditor::new()?;
    loop {
        match read_chunk(session, &mut editor)? {
            Line::Eof => break,
            Line::Error(e) => report(None, &error_message(&e)),
            Line::Chunk(chunk) => {
                let result = call_interruptible(token, || chunk.call::<MultiValue>(()));
                match result.and_then(|values| print_results(session, values)) {
                    Ok(()) => {}
                    Err(e) => report(None, &error_message(&e)),
                }
            }
        }
    }
    println!();
    Ok(())
}

fn print_results(session: &LuaSession, values: MultiValue) -> mlua::Result<()> {
    session.print_values(values).map_err(|e| {
        mlua::Error::runtime(format!("error calling 'print' ({})", error_message(&e)))
    })
}

/// Runs `f` with SIGINT routed to `token`.
pub fn call_interruptible<T>(token: &InterruptToken, f: impl FnOnce() -> T) -> T {
    token.clear();
    let guard = SigintGuard::install(token)
        .inspect_err(|e| warn!(error = %e, "cannot install SIGINT handler"))
        .ok();
    let result = f();
    drop(guard);
    result
}

fn prompt(session: &LuaSession, first: bool) -> String {
    let (global, default) = if first {
        ("_PROMPT", PROMPT)
    } else {
        ("_PROMPT2", PROMPT2)
    };
    session
        .globals()
        .get::<Option<String>>(global)
        .ok()
        .flatten()
        .unwrap_or_else(|| default.to_string())
}

fn read_line(
    session: &LuaSession,
    editor: &mut DefaultEditor,
    first: bool,
) -> Result<Option<String>, anyhow::Error> {
    loop {
        match editor.readline(&prompt(session, first)) {
            Ok(line) => return Ok(Some(line)),
            // Ctrl-C drops the pending input.
            Err(ReadlineError::Interrupted) if first => continue,
            Err(ReadlineError::Interrupted) => return Ok(Some(String::new())),
            Err(ReadlineError::Eof) => return Ok(None),
            Err(e) => return Err(e.into()),
        }
    }
}

fn read_chunk(session: &LuaSession, editor: &mut DefaultEditor) -> Result<Line, anyhow::Error> {
    let Some(mut line) = read_line(session, editor, true)? else {
        return Ok(Line::Eof);
    };
    if let Some(rest) = line.strip_prefix('=') {
        line = format!("return {rest}");
    }

    if let Ok(chunk) = compile(session, &format!("return {line};")) {
        remember(editor, &line);
        return Ok(Line::Chunk(chunk));
    }

    loop {
        match compile(session, &line) {
            Ok(chunk) => {
                remember(editor, &line);
                return Ok(Line::Chunk(chunk));
            }
            Err(mlua::Error::SyntaxError {
                incomplete_input: true,
                ..
            }) => match read_line(session, editor, false)? {
                Some(more) => {
                    line.push('\n');
                    line.push_str(&more);
                }
                None => {
                    return Ok(Line::Error(compile(session, &line).err().unwrap_or_else(
                        || mlua::Error::runtime("unexpected end of input"),
                    )));
                }
            },
            Err(e) => {
                remember(editor, &line);
                return Ok(Line::Error(e));
            }
        }
    }
}

fn compile(session: &LuaSession, source: &str) -> mlua::Result<Function> {
    session.lua().load(source).set_name(CHUNK_NAME).into_function()
}

fn remember(editor: &mut DefaultEditor, line: &str) {
    if !line.trim().is_empty() {
        let _ = editor.add_history_entry(line);
    }
}
