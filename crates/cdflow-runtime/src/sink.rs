use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard};

fn poisoned() -> io::Error {
    io::Error::other("output sink mutex poisoned")
}

/// A cloneable in-memory byte sink. Every clone appends to the same buffer.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> io::Result<MutexGuard<'_, Vec<u8>>> {
        self.0.lock().map_err(|_| poisoned())
    }

    pub fn contents(&self) -> Vec<u8> {
        self.lock().map(|b| b.clone()).unwrap_or_default()
    }

    pub fn contents_lossy(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }

    /// Take the buffered bytes, leaving the buffer empty.
    pub fn take(&self) -> Vec<u8> {
        self.lock().map(|mut b| std::mem::take(&mut *b)).unwrap_or_default()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock()?.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A cloneable handle onto one underlying writer, such as the process stdout.
#[derive(Clone)]
pub struct SharedWriter(Arc<Mutex<Box<dyn Write + Send>>>);

impl SharedWriter {
    pub fn new(inner: impl Write + Send + 'static) -> Self {
        Self(Arc::new(Mutex::new(Box::new(inner))))
    }

    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    pub fn stderr() -> Self {
        Self::new(io::stderr())
    }

    pub fn sink() -> Self {
        Self::new(io::sink())
    }
}

impl std::fmt::Debug for SharedWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedWriter")
    }
}

impl Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().map_err(|_| poisoned())?.write(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.0.lock().map_err(|_| poisoned())?.write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().map_err(|_| poisoned())?.flush()
    }
}

/// Writes everything to both `primary` and `copy`.
pub struct TeeWriter<A, B> {
    primary: A,
    copy: B,
}

impl<A: Write, B: Write> TeeWriter<A, B> {
    pub fn new(primary: A, copy: B) -> Self {
        Self { primary, copy }
    }

    pub fn into_inner(self) -> (A, B) {
        (self.primary, self.copy)
    }
}

impl<A: Write, B: Write> Write for TeeWriter<A, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.primary.write_all(buf)?;
        self.copy.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.primary.flush()?;
        self.copy.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_buffer_clones_share_contents() {
        let buffer = SharedBuffer::new();
        let mut writer = buffer.clone();
        writer.write_all(b"hello ").unwrap();
        writer.write_all(b"world").unwrap();
        assert_eq!(buffer.contents_lossy(), "hello world");
    }

    #[test]
    fn shared_buffer_take_empties() {
        let buffer = SharedBuffer::new();
        buffer.clone().write_all(b"abc").unwrap();
        assert_eq!(buffer.take(), b"abc");
        assert!(buffer.contents().is_empty());
    }

    #[test]
    fn shared_writer_forwards_to_inner() {
        let buffer = SharedBuffer::new();
        let mut a = SharedWriter::new(buffer.clone());
        let mut b = a.clone();
        a.write_all(b"one\n").unwrap();
        b.write_all(b"two\n").unwrap();
        b.flush().unwrap();
        assert_eq!(buffer.contents_lossy(), "one\ntwo\n");
    }

    #[test]
    fn tee_writes_both() {
        let mut tee = TeeWriter::new(Vec::new(), SharedBuffer::new());
        tee.write_all(b"Plan: 1 to add, 0 to change, 0 to destroy.")
            .unwrap();
        let (primary, copy) = tee.into_inner();
        assert_eq!(primary, copy.contents());
    }
}
