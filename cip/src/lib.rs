//! Transparent encryption of hfile streams, exposed as the `cip:` scheme.
//!
//! `cip:<url>`, `cip:///<path>` and `cip://localhost/<path>` open `<url>`
//! through the same registry and encrypt everything written to it, or decrypt
//! everything read from it. Streams are either read-only or write-only and
//! cannot seek. Append modes are refused: a second IV and keystream after an
//! existing container could not be decrypted.
//!
//! The key is derived from a passphrase (by default the `HTS_CIP_KEY`
//! environment variable) with PBKDF2-HMAC-SHA1, 1024 iterations and a fixed
//! 8-byte salt. Content is encrypted with AES-128 in counter mode.
//!
//! An encrypted stream has the following layout:
//!
//! - IV (128 bits) - random, generated when the stream is opened for writing;
//!   also the initial counter block
//! - ciphertext - same length as the plaintext
//!
//! There is no magic number, length or authentication tag. A damaged stream or
//! a wrong passphrase decrypts to garbage without an error.

mod error;
mod key;
mod stream;
mod suite;
#[cfg(test)]
mod testing;

pub use {
    error::CipError,
    key::{
        CipOptions, DEFAULT_BUFFER_BLOCKS, DEFAULT_KEY_VARIABLE, KeySource, MAX_BUFFER_BLOCKS,
    },
    stream::CipStream,
    suite::{
        Aes128CtrSuite, BLOCK_SIZE, CipherEngine, CipherSuite, Direction, IV_LEN, Iv, KEY_LEN,
        Key, PBKDF2_ITERATIONS, SALT,
    },
};

use {
    hfile::{HFile, Mode, Registry, SchemeHandler, strip_scheme},
    std::{fmt, io, sync::Arc},
};

pub const SCHEME: &str = "cip";

pub const PRIORITY: u32 = 50;

/// Scheme handler for `cip:` URLs.
#[derive(Clone)]
pub struct CipHandler {
    options: CipOptions,
    suite: Arc<dyn CipherSuite>,
}

impl CipHandler {
    #[must_use]
    #[inline]
    pub fn new(options: CipOptions) -> Self {
        Self::with_suite(options, Arc::new(Aes128CtrSuite))
    }

    #[must_use]
    #[inline]
    pub fn with_suite(options: CipOptions, suite: Arc<dyn CipherSuite>) -> Self {
        Self { options, suite }
    }

    #[must_use]
    #[inline]
    pub fn options(&self) -> &CipOptions {
        &self.options
    }

    #[inline]
    pub fn register(self, registry: &mut Registry) {
        registry.add_scheme_handler(SCHEME, Arc::new(self));
    }
}

impl Default for CipHandler {
    #[inline]
    fn default() -> Self {
        Self::new(CipOptions::default())
    }
}

impl fmt::Debug for CipHandler {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipHandler")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl SchemeHandler for CipHandler {
    #[inline]
    fn open(&self, registry: &Registry, url: &str, mode: &Mode) -> io::Result<HFile> {
        let inner_url = strip_scheme(url, SCHEME);
        let stream = CipStream::open(registry, inner_url, mode, &self.options, &*self.suite)?;
        Ok(stream.into_hfile(mode.clone()))
    }

    #[inline]
    fn is_remote(&self, registry: &Registry, url: &str) -> bool {
        registry.is_remote(strip_scheme(url, SCHEME))
    }

    #[inline]
    fn provider(&self) -> &str {
        SCHEME
    }

    #[inline]
    fn priority(&self) -> u32 {
        PRIORITY
    }
}

/// Plugin entry point: registers `cip:` with the passphrase taken from
/// `HTS_CIP_KEY`.
#[inline]
pub fn plugin_init(registry: &mut Registry) -> io::Result<&'static str> {
    CipHandler::default().register(registry);
    Ok(SCHEME)
}
