//! Native functions installed into every fuzzing state before the standard
//! libraries are opened.

use crate::executor::flush_std_streams;
use mlua::{Lua, Value};
use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;

/// Sink for `fuzzilli("FUZZILLI_PRINT", ...)`, normally descriptor 103.
pub type FuzzOut = Rc<RefCell<dyn Write>>;

#[derive(Clone, Default)]
pub struct Natives {
    fuzzout: Option<FuzzOut>,
}

impl Natives {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fuzzout(out: impl Write + 'static) -> Self {
        Self::with_shared_fuzzout(Rc::new(RefCell::new(out)))
    }

    pub fn with_shared_fuzzout(out: FuzzOut) -> Self {
        Self { fuzzout: Some(out) }
    }

    pub fn register(&self, lua: &Lua) -> mlua::Result<()> {
        let out = self.fuzzout.clone();
        let fuzzilli = lua.create_function(
            move |_, (command, value): (String, Value)| match command.as_str() {
                "FUZZILLI_PRINT" => {
                    let text = render(&value)?;
                    let written = match &out {
                        Some(out) => emit(&mut *out.borrow_mut(), &text),
                        None => {
                            // Keep ordering with `print`, which goes through C stdio.
                            flush_std_streams();
                            emit(&mut io::stdout().lock(), &text)
                        }
                    };
                    written.map_err(mlua::Error::external)
                }
                #[cfg(feature = "fault-injection")]
                "FUZZILLI_CRASH" => fault::crash(),
                other => Err(mlua::Error::runtime(format!(
                    "unknown fuzzilli command '{other}'"
                ))),
            },
        )?;
        lua.globals().set("fuzzilli", fuzzilli)?;

        #[cfg(feature = "fault-injection")]
        fault::register(lua)?;

        Ok(())
    }
}

/// Same text as the global `tostring`, byte strings passed through untouched.
fn render(value: &Value) -> mlua::Result<Vec<u8>> {
    match value {
        Value::String(s) => Ok(s.as_bytes().to_vec()),
        other => Ok(other.to_string()?.into_bytes()),
    }
}

fn emit(out: &mut dyn Write, text: &[u8]) -> io::Result<()> {
    out.write_all(text)?;
    out.write_all(b"\n")?;
    out.flush()
}

/// Intentional crash primitives for checking that a supervisor notices a dead
/// target. Compiled only with the `fault-injection` feature.
#[cfg(feature = "fault-injection")]
pub mod fault {
    use mlua::Lua;

    pub fn crash() -> ! {
        tracing::warn!("fault injection requested, aborting");
        std::process::abort()
    }

    pub fn register(lua: &Lua) -> mlua::Result<()> {
        let test_crash = lua.create_function(|_, ()| -> mlua::Result<()> { crash() })?;
        lua.globals().set("test_crash", test_crash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlua::{Function, Lua};

    #[test]
    fn fuzzilli_print_writes_line_to_fuzzout() {
        let sink = Rc::new(RefCell::new(Vec::<u8>::new()));
        let natives = Natives::with_shared_fuzzout(sink.clone());
        let lua = Lua::new();
        natives.register(&lua).unwrap();
        lua.load(r#"fuzzilli("FUZZILLI_PRINT", "hello") fuzzilli("FUZZILLI_PRINT", 42)"#)
            .exec()
            .unwrap();
        assert_eq!(sink.borrow().as_slice(), b"hello\n42\n");
    }

    #[test]
    fn fuzzilli_print_renders_any_value() {
        let sink = Rc::new(RefCell::new(Vec::<u8>::new()));
        let natives = Natives::with_shared_fuzzout(sink.clone());
        let lua = Lua::new();
        natives.register(&lua).unwrap();
        lua.load(
            r#"
            fuzzilli("FUZZILLI_PRINT", true)
            fuzzilli("FUZZILLI_PRINT", nil)
            fuzzilli("FUZZILLI_PRINT")
            fuzzilli("FUZZILLI_PRINT", 1.5)
            fuzzilli("FUZZILLI_PRINT", setmetatable({}, { __tostring = function() return "custom" end }))
            "#,
        )
        .exec()
        .unwrap();
        assert_eq!(
            String::from_utf8_lossy(&sink.borrow()),
            "true\nnil\nnil\n1.5\ncustom\n"
        );
    }

    #[test]
    fn fuzzilli_print_table_uses_address_form() {
        let sink = Rc::new(RefCell::new(Vec::<u8>::new()));
        let natives = Natives::with_shared_fuzzout(sink.clone());
        let lua = Lua::new();
        natives.register(&lua).unwrap();
        lua.load(r#"fuzzilli("FUZZILLI_PRINT", {})"#).exec().unwrap();
        let line = String::from_utf8_lossy(&sink.borrow()).into_owned();
        assert!(line.starts_with("table: "), "{line}");
        assert!(line.ends_with('\n'));
    }

    #[test]
    fn unknown_command_raises() {
        let lua = Lua::new();
        Natives::new().register(&lua).unwrap();
        let err = lua
            .load(r#"fuzzilli("FUZZILLI_NOPE")"#)
            .exec()
            .unwrap_err();
        assert!(err.to_string().contains("unknown fuzzilli command 'FUZZILLI_NOPE'"));
    }

    #[cfg(not(feature = "fault-injection"))]
    #[test]
    fn crash_primitives_absent_by_default() {
        let lua = Lua::new();
        Natives::new().register(&lua).unwrap();
        assert!(lua.globals().get::<Option<Function>>("test_crash").unwrap().is_none());
        assert!(lua.load(r#"fuzzilli("FUZZILLI_CRASH", 0)"#).exec().is_err());
    }

    #[cfg(feature = "fault-injection")]
    #[test]
    fn crash_primitive_is_registered() {
        let lua = Lua::new();
        Natives::new().register(&lua).unwrap();
        assert!(lua.globals().get::<Option<Function>>("test_crash").unwrap().is_some());
    }
}
