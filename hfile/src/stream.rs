use {
    crate::mode::Mode,
    std::{
        fmt,
        io::{self, ErrorKind, Read, Seek, SeekFrom, Write},
    },
    tracing::debug,
};

/// Low-level operations a stream backend provides.
///
/// Backends are unbuffered. `close` consumes the backend, so it runs at most
/// once; a backend dropped without `close` is closed abruptly and must still
/// release everything it owns.
pub trait Backend: Send {
    /// Reads up to `buf.len()` bytes. `Ok(0)` means end of stream.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes up to `buf.len()` bytes and returns how many were accepted.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64>;

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn close(self: Box<Self>) -> io::Result<()>;
}

/// An open stream: a backend together with the mode it was opened in.
pub struct HFile {
    backend: Option<Box<dyn Backend>>,
    mode: Mode,
}

fn bad_direction(what: &str, mode: &Mode) -> io::Error {
    io::Error::new(
        ErrorKind::PermissionDenied,
        format!("cannot {what} a stream opened {}", mode.access()),
    )
}

fn closed() -> io::Error {
    io::Error::other("stream is already closed")
}

impl HFile {
    #[must_use]
    #[inline]
    pub fn new(backend: Box<dyn Backend>, mode: Mode) -> Self {
        Self {
            backend: Some(backend),
            mode,
        }
    }

    #[must_use]
    #[inline]
    pub fn mode(&self) -> &Mode {
        &self.mode
    }

    fn backend(&mut self) -> io::Result<&mut Box<dyn Backend>> {
        self.backend.as_mut().ok_or_else(closed)
    }

    #[inline]
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.mode.access().can_read() {
            return Err(bad_direction("read from", &self.mode));
        }
        self.backend()?.read(buf)
    }

    /// Reads until `buf` is full or the stream ends.
    ///
    /// A count shorter than `buf.len()` always means end of stream.
    #[inline]
    pub fn read_full(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut total = 0;
        while let Some(rest) = buf.get_mut(total..) {
            if rest.is_empty() {
                break;
            }
            match self.read(rest) {
                Ok(0) => break,
                Ok(n) => total = total.saturating_add(n),
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        Ok(total)
    }

    #[inline]
    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.mode.access().can_write() {
            return Err(bad_direction("write to", &self.mode));
        }
        self.backend()?.write(buf)
    }

    #[inline]
    pub fn write_all(&mut self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.write(buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        ErrorKind::WriteZero,
                        "backend accepted no more data",
                    ));
                }
                Ok(n) => buf = buf.get(n..).unwrap_or_default(),
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    #[inline]
    pub fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.backend()?.seek(pos)
    }

    #[inline]
    pub fn flush(&mut self) -> io::Result<()> {
        self.backend()?.flush()
    }

    /// Flushes and closes the backend.
    ///
    /// The backend is closed even if the flush fails; the flush error is the
    /// one reported in that case.
    #[inline]
    pub fn close(mut self) -> io::Result<()> {
        let backend = self.backend.take().ok_or_else(closed)?;
        close_backend(backend, self.mode.access().can_write())
    }
}

fn close_backend(mut backend: Box<dyn Backend>, flush: bool) -> io::Result<()> {
    let flushed = if flush { backend.flush() } else { Ok(()) };
    let closed = backend.close();
    flushed.and(closed)
}

impl Drop for HFile {
    #[inline]
    fn drop(&mut self) {
        if self.backend.take().is_some() {
            debug!(mode = ?self.mode, "stream dropped without close");
        }
    }
}

impl fmt::Debug for HFile {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HFile")
            .field("mode", &self.mode)
            .field("open", &self.backend.is_some())
            .finish()
    }
}

impl Read for HFile {
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        HFile::read(self, buf)
    }
}

impl Write for HFile {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        HFile::write(self, buf)
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        HFile::flush(self)
    }
}

impl Seek for HFile {
    #[inline]
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        HFile::seek(self, pos)
    }
}

#[cfg(test)]
#[expect(
    clippy::unwrap_used,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    reason = "test"
)]
mod tests {
    use {
        super::*,
        std::sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    };

    /// Backend that hands out data a few bytes at a time and counts closes.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        step: usize,
        closes: Arc<AtomicUsize>,
    }

    impl Backend for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.step).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }

        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len().min(self.step))
        }

        fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
            Err(ErrorKind::Unsupported.into())
        }

        fn close(self: Box<Self>) -> io::Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn trickle(data: &[u8], step: usize, closes: &Arc<AtomicUsize>) -> Box<Trickle> {
        Box::new(Trickle {
            data: data.to_vec(),
            pos: 0,
            step,
            closes: Arc::clone(closes),
        })
    }

    #[test]
    fn read_full_collects_short_reads() {
        let closes = Arc::new(AtomicUsize::new(0));
        let mut file = HFile::new(trickle(b"0123456789", 3, &closes), Mode::parse("r").unwrap());
        let mut buf = [0u8; 8];
        assert_eq!(file.read_full(&mut buf).unwrap(), 8);
        assert_eq!(&buf, b"01234567");
        assert_eq!(file.read_full(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"89");
        assert_eq!(file.read_full(&mut buf).unwrap(), 0);
        file.close().unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wrong_direction_is_rejected() {
        let closes = Arc::new(AtomicUsize::new(0));
        let mut file = HFile::new(trickle(b"abc", 3, &closes), Mode::parse("r").unwrap());
        let err = file.write(b"x").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);

        let mut file = HFile::new(trickle(b"abc", 3, &closes), Mode::parse("w").unwrap());
        let err = file.read(&mut [0u8; 4]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }

    #[test]
    fn drop_without_close_skips_backend_close() {
        let closes = Arc::new(AtomicUsize::new(0));
        let mut file = HFile::new(trickle(b"", 2, &closes), Mode::parse("w").unwrap());
        file.write_all(b"hello").unwrap();
        drop(file);
        assert_eq!(closes.load(Ordering::SeqCst), 0);
    }
}
