//! In-memory `mem:` streams with failure injection.

#![expect(
    clippy::unwrap_used,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    clippy::as_conversions,
    reason = "test"
)]

use {
    crate::{
        Aes128CtrSuite, CipError, CipHandler, CipOptions, CipherEngine, CipherSuite, Direction,
        Iv, Key, KeySource,
    },
    hfile::{Backend, HFile, Mode, Registry, SchemeHandler, strip_scheme},
    std::{
        collections::HashMap,
        io::{self, ErrorKind, SeekFrom},
        sync::{
            Arc, Mutex,
            atomic::{AtomicBool, AtomicUsize, Ordering},
        },
    },
};

#[derive(Debug, Default)]
pub struct MemStore {
    files: Mutex<HashMap<String, Vec<u8>>>,
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    /// Total bytes accepted before writes start failing.
    pub write_budget: Mutex<Option<usize>>,
    pub fail_close: AtomicBool,
    pub remote: AtomicBool,
}

impl MemStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, name: &str) -> Vec<u8> {
        self.files.lock().unwrap().get(name).cloned().unwrap_or_default()
    }

    pub fn put(&self, name: &str, data: &[u8]) {
        self.files.lock().unwrap().insert(name.into(), data.to_vec());
    }
}

struct MemHandler(Arc<MemStore>);

impl SchemeHandler for MemHandler {
    fn open(&self, _registry: &Registry, url: &str, mode: &Mode) -> io::Result<HFile> {
        let name = strip_scheme(url, "mem").to_owned();
        self.0.opens.fetch_add(1, Ordering::SeqCst);
        let data = if mode.truncate() {
            self.0.put(&name, &[]);
            Vec::new()
        } else {
            self.0
                .files
                .lock()
                .unwrap()
                .get(&name)
                .cloned()
                .ok_or(ErrorKind::NotFound)?
        };
        let backend = MemBackend {
            store: Arc::clone(&self.0),
            name,
            data,
            pos: 0,
        };
        Ok(HFile::new(Box::new(backend), mode.clone()))
    }

    fn is_remote(&self, _registry: &Registry, _url: &str) -> bool {
        self.0.remote.load(Ordering::SeqCst)
    }

    fn provider(&self) -> &str {
        "mem"
    }

    fn priority(&self) -> u32 {
        10
    }
}

struct MemBackend {
    store: Arc<MemStore>,
    name: String,
    // Snapshot taken at open, used for reads.
    data: Vec<u8>,
    pos: usize,
}

impl Backend for MemBackend {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut budget = self.store.write_budget.lock().unwrap();
        let n = match budget.as_mut() {
            Some(0) => return Err(io::Error::other("device full")),
            Some(left) => {
                let n = buf.len().min(*left);
                *left -= n;
                n
            }
            None => buf.len(),
        };
        self.store
            .files
            .lock()
            .unwrap()
            .entry(self.name.clone())
            .or_default()
            .extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match pos {
            SeekFrom::Start(offset) => {
                self.pos = usize::try_from(offset).unwrap().min(self.data.len());
                Ok(self.pos as u64)
            }
            _ => Err(ErrorKind::Unsupported.into()),
        }
    }

    fn close(self: Box<Self>) -> io::Result<()> {
        self.store.closes.fetch_add(1, Ordering::SeqCst);
        if self.store.fail_close.load(Ordering::SeqCst) {
            return Err(io::Error::other("close failed"));
        }
        Ok(())
    }
}

pub fn options(passphrase: &str, buffer_blocks: usize) -> CipOptions {
    CipOptions {
        key_source: KeySource::fixed(passphrase),
        buffer_blocks,
    }
}

/// Registry with `mem:` backed by `store` and `cip:` using `options`.
pub fn registry(store: &Arc<MemStore>, options: CipOptions) -> Registry {
    registry_with_suite(store, options, Arc::new(Aes128CtrSuite))
}

pub fn registry_with_suite(
    store: &Arc<MemStore>,
    options: CipOptions,
    suite: Arc<dyn CipherSuite>,
) -> Registry {
    let mut registry = Registry::new();
    registry.add_scheme_handler("mem", Arc::new(MemHandler(Arc::clone(store))));
    CipHandler::with_suite(options, suite).register(&mut registry);
    registry
}

/// Which steps of a [`FailingSuite`] fail.
#[derive(Debug, Clone, Copy, Default)]
pub struct Failures {
    pub derive: bool,
    pub update: bool,
    pub finalize: bool,
    pub release: bool,
}

/// AES-128-CTR with injectable failures. Counts engine releases.
#[derive(Debug, Default)]
pub struct FailingSuite {
    pub fail: Failures,
    pub releases: Arc<AtomicUsize>,
}

impl FailingSuite {
    pub fn new(fail: Failures) -> Arc<Self> {
        Arc::new(Self {
            fail,
            releases: Arc::default(),
        })
    }
}

impl CipherSuite for FailingSuite {
    fn derive_key(&self, passphrase: &[u8]) -> Result<Key, CipError> {
        if self.fail.derive {
            return Err(CipError::KeyDerivationError("derive".into()));
        }
        Aes128CtrSuite.derive_key(passphrase)
    }

    fn new_engine(
        &self,
        direction: Direction,
        key: &Key,
        iv: &Iv,
    ) -> Result<Box<dyn CipherEngine>, CipError> {
        Ok(Box::new(FailingEngine {
            inner: Aes128CtrSuite.new_engine(direction, key, iv)?,
            fail: self.fail,
            releases: Arc::clone(&self.releases),
        }))
    }
}

struct FailingEngine {
    inner: Box<dyn CipherEngine>,
    fail: Failures,
    releases: Arc<AtomicUsize>,
}

impl CipherEngine for FailingEngine {
    fn update(&mut self, input: &[u8], output: &mut [u8]) -> Result<usize, CipError> {
        if self.fail.update {
            return Err(CipError::CipherError("update".into()));
        }
        self.inner.update(input, output)
    }

    fn finalize(&mut self, output: &mut [u8]) -> Result<usize, CipError> {
        let n = self.inner.finalize(output)?;
        if self.fail.finalize {
            return Err(CipError::CipherError("finalize".into()));
        }
        Ok(n)
    }

    fn release(self: Box<Self>) -> Result<(), CipError> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.inner.release()?;
        if self.fail.release {
            return Err(CipError::CipherError("release".into()));
        }
        Ok(())
    }
}
