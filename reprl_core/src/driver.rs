//! The persistent REPRL loop: one handshake, then receive, execute, respond,
//! forever.

use crate::config::StatusEncoding;
use crate::executor::{CellError, ExecutionStatus, Executor};
use crate::observer::Observer;
use crate::transport::{ProtocolError, ReprlChannel};
use std::convert::Infallible;
use std::io::{Read, Write};
use thiserror::Error;
use tracing::{Level, debug, enabled, info};

/// Reasons the loop stops. Every variant means the harness itself is broken,
/// not the payload; whether that kills the process is up to the caller.
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Cell(#[from] CellError),
    #[error("Observer '{name}' failed: {source}")]
    Observer {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

pub struct ReprlDriver<'o, E, CR, CW, DR> {
    channel: ReprlChannel<CR, CW, DR>,
    executor: E,
    encoding: StatusEncoding,
    observers: Vec<Box<dyn Observer + 'o>>,
}

impl<'o, E, CR, CW, DR> ReprlDriver<'o, E, CR, CW, DR>
where
    E: Executor,
    CR: Read,
    CW: Write,
    DR: Read,
{
    pub fn new(channel: ReprlChannel<CR, CW, DR>, executor: E, encoding: StatusEncoding) -> Self {
        Self {
            channel,
            executor,
            encoding,
            observers: Vec::new(),
        }
    }

    pub fn with_observer(mut self, observer: impl Observer + 'o) -> Self {
        self.observers.push(Box::new(observer));
        self
    }

    pub fn channel(&self) -> &ReprlChannel<CR, CW, DR> {
        &self.channel
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn handshake(&mut self) -> Result<(), HarnessError> {
        self.channel.perform_handshake()?;
        info!("handshake complete");
        Ok(())
    }

    /// Serves exactly one request.
    pub fn step(&mut self) -> Result<ExecutionStatus, HarnessError> {
        let script = self.channel.receive_script()?;
        if enabled!(Level::DEBUG) {
            debug!(len = script.len(), digest = %script.digest(), "received script");
        }

        for obs in self.observers.iter_mut() {
            obs.pre_exec().map_err(|source| HarnessError::Observer {
                name: obs.name(),
                source,
            })?;
        }

        let status = self.executor.execute(&script)?;
        drop(script);
        self.channel.send_status(status.code(), self.encoding)?;

        for obs in self.observers.iter_mut() {
            obs.post_exec(&status).map_err(|source| HarnessError::Observer {
                name: obs.name(),
                source,
            })?;
        }
        Ok(status)
    }

    /// Handshakes, then serves requests until something breaks.
    pub fn run(&mut self) -> Result<Infallible, HarnessError> {
        self.handshake()?;
        loop {
            self.step()?;
        }
    }
}
