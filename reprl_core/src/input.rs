/// A script payload received from the supervisor.
///
/// The buffer is one byte longer than the declared payload and always ends in
/// a NUL, so the source can also be handed to C code expecting a string.
#[derive(Clone, PartialEq, Eq)]
pub struct Script {
    buf: Vec<u8>,
}

impl Script {
    /// Takes a buffer of `len + 1` bytes whose first `len` bytes are the source.
    pub(crate) fn from_terminated(mut buf: Vec<u8>) -> Self {
        match buf.last_mut() {
            Some(last) => *last = 0,
            None => buf.push(0),
        }
        Self { buf }
    }

    pub fn from_source(source: impl AsRef<[u8]>) -> Self {
        let source = source.as_ref();
        let mut buf = Vec::with_capacity(source.len() + 1);
        buf.extend_from_slice(source);
        buf.push(0);
        Self { buf }
    }

    /// The payload without its terminator.
    pub fn source(&self) -> &[u8] {
        &self.buf[..self.len()]
    }

    pub fn as_bytes_with_nul(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hex MD5 of the payload.
    pub fn digest(&self) -> String {
        format!("{:x}", md5::compute(self.source()))
    }
}

impl std::fmt::Debug for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Script")
            .field("len", &self.len())
            .field("source", &String::from_utf8_lossy(self.source()))
            .finish()
    }
}
