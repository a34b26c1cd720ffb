use pretty_assertions::assert_eq;
use std::io::Write;
use std::process::{Command, Output, Stdio};

fn lua() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_lua-reprl"));
    cmd.env_remove("LUA_INIT")
        .env_remove("LUA_INIT_5_4")
        .env_remove("RUST_LOG")
        .stdin(Stdio::null());
    cmd
}

fn run(args: &[&str]) -> Output {
    lua().args(args).output().unwrap()
}

fn run_with_stdin(args: &[&str], input: &str) -> Output {
    let mut child = lua()
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    child
        .stdin
        .take()
        .unwrap()
        .write_all(input.as_bytes())
        .unwrap();
    child.wait_with_output().unwrap()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn script(source: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".lua").tempfile().unwrap();
    file.write_all(source.as_bytes()).unwrap();
    file
}

#[test]
fn executes_command_line_statement() {
    let output = run(&["-e", "print(1+1)"]);
    assert!(output.status.success());
    assert_eq!(stdout(&output), "2\n");
}

#[test]
fn statements_and_libraries_run_in_order() {
    let output = run(&["-l", "s=string", "-e", "print(s.upper('x'))", "-e", "print(2)"]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert_eq!(stdout(&output), "X\n2\n");
}

#[test]
fn failing_statement_exits_nonzero_with_report() {
    let output = run(&["-e", "error('boom')"]);
    assert!(!output.status.success());
    let err = stderr(&output);
    assert!(err.contains("lua-reprl"), "{err}");
    assert!(err.contains("boom"), "{err}");
}

#[test]
fn bad_option_prints_usage() {
    let output = run(&["-x"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("lua-reprl [options] [script [args]]"));
}

#[test]
fn script_receives_arguments() {
    let file = script("print(#arg, ...)\nprint(arg[-1] ~= nil)");
    let path = file.path().to_str().unwrap();
    let output = run(&["-e", "x=1", path, "a", "b"]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert_eq!(stdout(&output), "2\ta\tb\ntrue\n");
}

#[test]
fn shebang_line_is_skipped() {
    let file = script("#!/usr/bin/env lua\nprint('ok')\nerror('line')");
    let output = run(&[file.path().to_str().unwrap()]);
    assert!(!output.status.success());
    assert_eq!(stdout(&output), "ok\n");
    assert!(stderr(&output).contains(":3: line"), "{}", stderr(&output));
}

#[test]
fn missing_script_is_reported() {
    let output = run(&["/nonexistent/reprl/missing.lua"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("cannot open"));
}

#[test]
fn dash_reads_script_from_stdin() {
    let output = run_with_stdin(&["-", "z"], "print('stdin', ...)");
    assert!(output.status.success(), "{}", stderr(&output));
    assert_eq!(stdout(&output), "stdin\tz\n");
}

#[test]
fn no_arguments_and_piped_stdin_runs_stdin() {
    let output = run_with_stdin(&[], "print(arg[0] ~= nil)");
    assert!(output.status.success(), "{}", stderr(&output));
    assert_eq!(stdout(&output), "true\n");
}

#[test]
fn version_banner() {
    let output = run(&["-v"]);
    assert!(output.status.success());
    let out = stdout(&output);
    assert!(out.starts_with("Lua 5.4"), "{out}");
    assert!(out.contains("Copyright"));
}

#[test]
fn lua_init_runs_unless_ignored() {
    let output = lua()
        .env("LUA_INIT", "greeting = 'hi'")
        .args(["-e", "print(greeting)"])
        .output()
        .unwrap();
    assert_eq!(stdout(&output), "hi\n");

    let output = lua()
        .env("LUA_INIT", "greeting = 'hi'")
        .args(["-E", "-e", "print(greeting)"])
        .output()
        .unwrap();
    assert_eq!(stdout(&output), "nil\n");
}

#[test]
fn versioned_init_variable_wins() {
    let output = lua()
        .env("LUA_INIT", "who = 'plain'")
        .env("LUA_INIT_5_4", "who = 'versioned'")
        .args(["-e", "print(who)"])
        .output()
        .unwrap();
    assert_eq!(stdout(&output), "versioned\n");
}

#[test]
fn init_from_file() {
    let file = script("from_file = 42");
    let output = lua()
        .env("LUA_INIT", format!("@{}", file.path().display()))
        .args(["-e", "print(from_file)"])
        .output()
        .unwrap();
    assert_eq!(stdout(&output), "42\n");
}

#[test]
fn warnings_need_flag() {
    let output = run(&["-W", "-e", "warn('careful')"]);
    assert!(stderr(&output).contains("Lua warning: careful"));

    let output = run(&["-e", "warn('careful')"]);
    assert!(!stderr(&output).contains("careful"));
}
