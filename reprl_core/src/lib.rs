pub mod config;
pub mod coverage;
pub mod driver;
pub mod executor;
pub mod input;
pub mod interp;
pub mod interrupt;
pub mod natives;
pub mod observer;
pub mod region;
pub mod transport;

pub use config::HarnessConfig;
pub use coverage::{CoverageContext, CoverageError, InitOutcome};
pub use driver::{HarnessError, ReprlDriver};
pub use executor::{CellError, CellSettings, ExecutionStatus, Executor, LuaExecutor};
pub use input::Script;
pub use interp::{InitScript, LuaSession, SessionOptions};
pub use interrupt::{InterruptToken, SigintGuard};
pub use natives::Natives;
pub use observer::{CoverageObserver, Observer, ThroughputObserver};
pub use transport::{ProtocolError, ReprlChannel};
