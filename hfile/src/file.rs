use {
    crate::{
        mode::Mode,
        registry::{BUILTIN_PRIORITY, Registry, SchemeHandler, strip_scheme},
        stream::{Backend, HFile},
    },
    fs_err::File,
    std::io::{self, Read, Seek, SeekFrom, Write},
    tracing::debug,
};

/// Local files, addressed by a bare path or a `file:` URL.
#[derive(Debug, Clone, Copy)]
pub struct FileHandler;

impl SchemeHandler for FileHandler {
    #[inline]
    fn open(&self, _registry: &Registry, url: &str, mode: &Mode) -> io::Result<HFile> {
        let path = strip_scheme(url, "file");
        let file = mode.open_options().open(path)?;
        debug!(path, ?mode, "opened local file");
        let backend = FileBackend {
            file,
            writable: mode.access().can_write(),
        };
        Ok(HFile::new(Box::new(backend), mode.clone()))
    }

    #[inline]
    fn is_remote(&self, _registry: &Registry, _url: &str) -> bool {
        false
    }

    #[inline]
    fn provider(&self) -> &str {
        "file"
    }

    #[inline]
    fn priority(&self) -> u32 {
        BUILTIN_PRIORITY
    }
}

struct FileBackend {
    file: File,
    writable: bool,
}

impl Backend for FileBackend {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }

    fn close(self: Box<Self>) -> io::Result<()> {
        // Surfaces write-back errors that dropping the descriptor would hide.
        if self.writable {
            self.file.sync_all()?;
        }
        Ok(())
    }
}
