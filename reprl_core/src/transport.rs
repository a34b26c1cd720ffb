//! The REPRL channel: four inherited descriptors shared with the supervisor.
//!
//! ```text
//! handshake   child -> CW: "HELO"        CR -> child: "HELO"
//! request     CR -> child: "exec" u64    DR -> child: <len bytes of source>
//! response    child -> CW: u32 status word
//! ```
//!
//! Every failure here means the supervisor went away or broke framing, so all
//! of them surface as [`ProtocolError`] and none is retried.

use crate::config::StatusEncoding;
use crate::input::Script;
use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::{FromRawFd, RawFd};
use thiserror::Error;

pub const REPRL_CRFD: RawFd = 100;
pub const REPRL_CWFD: RawFd = 101;
pub const REPRL_DRFD: RawFd = 102;
pub const REPRL_DWFD: RawFd = 103;

pub const HELO: [u8; 4] = *b"HELO";
/// The only recognized action tag.
pub const ACTION_EXEC: [u8; 4] = *b"exec";

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("REPRL descriptor {0} is not open")]
    MissingDescriptor(RawFd),
    #[error("Failed to send HELO to parent: {0}")]
    GreetingWrite(#[source] io::Error),
    #[error("Invalid HELO response from parent: {0}")]
    GreetingRead(#[source] io::Error),
    #[error("Invalid response from parent: {0:?}")]
    GreetingMismatch([u8; 4]),
    #[error("Failed to read action: {0}")]
    ActionRead(#[source] io::Error),
    #[error("Unknown action: {0:?}")]
    UnknownAction([u8; 4]),
    #[error("Failed to read script size: {0}")]
    LengthRead(#[source] io::Error),
    #[error("Script size {0} cannot be allocated")]
    LengthTooLarge(u64),
    #[error("Failed to load script: got {received} of {expected} bytes before end of stream")]
    TruncatedScript { expected: usize, received: usize },
    #[error("Failed to load script: {0}")]
    ScriptRead(#[source] io::Error),
    #[error("Failed to send status: {0}")]
    StatusWrite(#[source] io::Error),
}

/// Control-read, control-write and data-read ends of the channel. The
/// data-write end belongs to the scripts (see [`crate::natives`]).
pub struct ReprlChannel<CR, CW, DR> {
    control_read: CR,
    control_write: CW,
    data_read: DR,
}

impl<CR: Read, CW: Write, DR: Read> ReprlChannel<CR, CW, DR> {
    pub fn new(control_read: CR, control_write: CW, data_read: DR) -> Self {
        Self {
            control_read,
            control_write,
            data_read,
        }
    }

    /// Sends `HELO` and expects the supervisor to echo it.
    pub fn perform_handshake(&mut self) -> Result<(), ProtocolError> {
        self.control_write
            .write_all(&HELO)
            .and_then(|()| self.control_write.flush())
            .map_err(ProtocolError::GreetingWrite)?;

        let mut reply = [0u8; 4];
        self.control_read
            .read_exact(&mut reply)
            .map_err(ProtocolError::GreetingRead)?;
        if reply != HELO {
            return Err(ProtocolError::GreetingMismatch(reply));
        }
        Ok(())
    }

    /// Reads one `exec` request and its payload.
    pub fn receive_script(&mut self) -> Result<Script, ProtocolError> {
        let mut action = [0u8; 4];
        self.control_read
            .read_exact(&mut action)
            .map_err(ProtocolError::ActionRead)?;
        if action != ACTION_EXEC {
            return Err(ProtocolError::UnknownAction(action));
        }

        let mut size = [0u8; 8];
        self.control_read
            .read_exact(&mut size)
            .map_err(ProtocolError::LengthRead)?;
        let declared = u64::from_ne_bytes(size);
        let len = usize::try_from(declared)
            .ok()
            .filter(|len| *len < usize::MAX)
            .ok_or(ProtocolError::LengthTooLarge(declared))?;

        let mut buf = Vec::new();
        buf.try_reserve_exact(len + 1)
            .map_err(|_| ProtocolError::LengthTooLarge(declared))?;
        buf.resize(len + 1, 0);

        let mut received = 0;
        while received < len {
            match self.data_read.read(&mut buf[received..len]) {
                Ok(0) => {
                    return Err(ProtocolError::TruncatedScript {
                        expected: len,
                        received,
                    });
                }
                Ok(n) => received += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(ProtocolError::ScriptRead(e)),
            }
        }
        Ok(Script::from_terminated(buf))
    }

    pub fn send_status(
        &mut self,
        status: u8,
        encoding: StatusEncoding,
    ) -> Result<(), ProtocolError> {
        let word = encoding.encode(status);
        self.control_write
            .write_all(&word.to_ne_bytes())
            .and_then(|()| self.control_write.flush())
            .map_err(ProtocolError::StatusWrite)
    }

    pub fn control_write(&self) -> &CW {
        &self.control_write
    }

    pub fn into_parts(self) -> (CR, CW, DR) {
        (self.control_read, self.control_write, self.data_read)
    }
}

fn is_open(fd: RawFd) -> bool {
    // SAFETY: F_GETFD only queries descriptor flags.
    unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
}

/// Takes ownership of an inherited descriptor if it is open.
fn adopt(fd: RawFd) -> Result<File, ProtocolError> {
    if !is_open(fd) {
        return Err(ProtocolError::MissingDescriptor(fd));
    }
    // SAFETY: the descriptor is open and nothing else in the process owns it.
    Ok(unsafe { File::from_raw_fd(fd) })
}

impl ReprlChannel<File, File, File> {
    /// Adopts descriptors 100, 101 and 102. Must be called at most once.
    pub fn from_reserved_fds() -> Result<Self, ProtocolError> {
        Ok(Self::new(
            adopt(REPRL_CRFD)?,
            adopt(REPRL_CWFD)?,
            adopt(REPRL_DRFD)?,
        ))
    }
}

/// Adopts descriptor 103 if the supervisor provided it.
pub fn open_data_write() -> Option<File> {
    adopt(REPRL_DWFD).ok()
}
