use {
    crate::{
        error::CipError,
        key::CipOptions,
        suite::{CipherEngine, CipherSuite, Direction, IV_LEN, Iv},
    },
    hfile::{Access, Backend, HFile, Mode, Registry},
    rand::{TryRngCore, rngs::OsRng},
    std::io::{self, SeekFrom},
    tracing::{debug, warn},
};

fn random_iv(iv: &mut Iv) -> Result<(), CipError> {
    OsRng
        .try_fill_bytes(iv)
        .map_err(|err| CipError::IvError(err.to_string()))
}

/// Encrypting or decrypting stream over another stream.
///
/// The counter of the cipher engine advances with every byte processed and is
/// never reset, which is why these streams cannot seek.
pub struct CipStream {
    direction: Direction,
    // Reused for every chunk; a whole number of cipher blocks.
    buffer: Vec<u8>,
    inner: HFile,
    engine: Box<dyn CipherEngine>,
}

impl CipStream {
    /// Opens `inner_url` (already stripped of the `cip:` prefix) through
    /// `registry` and sets up the cipher.
    ///
    /// In read mode the first 16 bytes of the inner stream are the IV. In
    /// write mode a random IV is generated and written first.
    #[inline]
    pub fn open(
        registry: &Registry,
        inner_url: &str,
        mode: &Mode,
        options: &CipOptions,
        suite: &dyn CipherSuite,
    ) -> Result<Self, CipError> {
        Self::open_with_iv_source(registry, inner_url, mode, options, suite, random_iv)
    }

    pub(crate) fn open_with_iv_source(
        registry: &Registry,
        inner_url: &str,
        mode: &Mode,
        options: &CipOptions,
        suite: &dyn CipherSuite,
        iv_source: impl FnOnce(&mut Iv) -> Result<(), CipError>,
    ) -> Result<Self, CipError> {
        let direction = match mode.access() {
            Access::ReadOnly => Direction::Decrypt,
            Access::WriteOnly if !mode.append() => Direction::Encrypt,
            Access::WriteOnly | Access::ReadWrite => {
                return Err(CipError::InvalidMode(mode.as_str().to_owned()));
            }
        };
        let passphrase = options.key_source.passphrase()?;

        // From here on, an early return drops `inner`, closing it abruptly.
        let mut inner = registry
            .open_with_mode(inner_url, mode)
            .map_err(CipError::InnerOpenFailed)?;
        let buffer = vec![0; options.buffer_len()];

        let mut iv: Iv = [0; IV_LEN];
        match direction {
            Direction::Decrypt => {
                let n = inner
                    .read_full(&mut iv)
                    .map_err(CipError::InnerReadFailed)?;
                if n < IV_LEN {
                    return Err(CipError::TruncatedHeader(n));
                }
            }
            Direction::Encrypt => {
                iv_source(&mut iv)?;
                inner.write_all(&iv).map_err(CipError::InnerWriteFailed)?;
            }
        }

        let key = suite.derive_key(&passphrase)?;
        let engine = suite.new_engine(direction, &key, &iv)?;
        debug!(inner_url, %direction, buffer_len = buffer.len(), "opened cipher stream");
        Ok(Self {
            direction,
            buffer,
            inner,
            engine,
        })
    }

    #[must_use]
    #[inline]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    #[must_use]
    #[inline]
    pub fn into_hfile(self, mode: Mode) -> HFile {
        HFile::new(Box::new(self), mode)
    }

    /// Decrypts up to `buf.len()` bytes.
    ///
    /// Fewer bytes are returned only at the end of the underlying stream.
    #[expect(
        clippy::indexing_slicing,
        clippy::arithmetic_side_effects,
        reason = "chunk lengths never exceed the remaining output"
    )]
    fn decrypt_into(&mut self, buf: &mut [u8]) -> Result<usize, CipError> {
        let mut total = 0;
        while total < buf.len() {
            let want = (buf.len() - total).min(self.buffer.len());
            let chunk = &mut self.buffer[..want];
            let n = self
                .inner
                .read_full(chunk)
                .map_err(CipError::InnerReadFailed)?;
            if n == 0 {
                break;
            }
            total += self.engine.update(&chunk[..n], &mut buf[total..total + n])?;
            if n < want {
                break;
            }
        }
        Ok(total)
    }

    /// Encrypts all of `buf` chunk by chunk and writes the ciphertext out.
    #[expect(clippy::indexing_slicing, reason = "chunks fit the buffer")]
    fn encrypt_from(&mut self, buf: &[u8]) -> Result<usize, CipError> {
        for chunk in buf.chunks(self.buffer.len()) {
            let n = self.engine.update(chunk, &mut self.buffer[..chunk.len()])?;
            self.inner
                .write_all(&self.buffer[..n])
                .map_err(CipError::InnerWriteFailed)?;
        }
        Ok(buf.len())
    }

    /// Finalizes the cipher, releases it and closes the inner stream.
    ///
    /// All steps run even if one fails; the first error is returned.
    #[inline]
    pub fn finish(self) -> Result<(), CipError> {
        let Self {
            direction,
            mut buffer,
            mut inner,
            mut engine,
        } = self;
        let mut first_error = None;

        if direction == Direction::Encrypt {
            let flushed = engine.finalize(&mut buffer).and_then(|n| {
                let tail = buffer.get(..n).unwrap_or_default();
                inner.write_all(tail).map_err(CipError::InnerWriteFailed)
            });
            if let Err(err) = flushed {
                warn!(?err, "failed to finalize cipher stream");
                first_error.get_or_insert(err);
            }
        }
        if let Err(err) = engine.release() {
            warn!(?err, "failed to release cipher engine");
            first_error.get_or_insert(err);
        }
        if let Err(err) = inner.close() {
            warn!(?err, "failed to close underlying stream");
            first_error.get_or_insert(CipError::InnerCloseFailed(err));
        }
        debug!(%direction, ok = first_error.is_none(), "closed cipher stream");
        first_error.map_or(Ok(()), Err)
    }
}

impl Backend for CipStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.decrypt_into(buf)?)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.encrypt_from(buf)?)
    }

    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(CipError::NotSeekable.into())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(self.inner.flush().map_err(CipError::InnerWriteFailed)?)
    }

    fn close(self: Box<Self>) -> io::Result<()> {
        Ok(self.finish()?)
    }
}

#[cfg(test)]
#[expect(
    clippy::unwrap_used,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    clippy::as_conversions,
    clippy::cast_possible_truncation,
    reason = "test"
)]
mod tests {
    use {
        super::*,
        crate::{
            suite::Aes128CtrSuite,
            testing::{FailingSuite, Failures, MemStore, options, registry, registry_with_suite},
        },
        aes::{
            Aes128,
            cipher::{KeyIvInit, StreamCipher},
        },
        proptest::prelude::*,
        std::{
            io::ErrorKind,
            sync::{Arc, atomic::Ordering},
        },
    };

    const FOX: &[u8] = b"the quick brown fox";

    fn encrypt(registry: &Registry, url: &str, pieces: &[&[u8]]) {
        let mut file = registry.open(url, "w").unwrap();
        for piece in pieces {
            file.write_all(piece).unwrap();
        }
        file.close().unwrap();
    }

    fn decrypt(registry: &Registry, url: &str) -> Vec<u8> {
        let mut file = registry.open(url, "r").unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 1000];
        loop {
            let n = file.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        file.close().unwrap();
        out
    }

    fn encrypt_with_iv(store: &Arc<MemStore>, blocks: usize, iv: Iv, pieces: &[&[u8]]) -> Vec<u8> {
        let registry = registry(store, options("k", blocks));
        let mode = Mode::parse("w").unwrap();
        let mut stream = CipStream::open_with_iv_source(
            &registry,
            "mem:fixed",
            &mode,
            &options("k", blocks),
            &Aes128CtrSuite,
            |out| {
                *out = iv;
                Ok(())
            },
        )
        .unwrap();
        for piece in pieces {
            assert_eq!(Backend::write(&mut stream, piece).unwrap(), piece.len());
        }
        stream.finish().unwrap();
        store.get("fixed")
    }

    fn error_of(err: &io::Error) -> &CipError {
        CipError::of(err).unwrap()
    }

    #[test]
    fn correct_horse() {
        let store = MemStore::new();
        let good = registry(&store, options("correct-horse", 8192));
        encrypt(&good, "cip:mem:fox", &[FOX]);

        let container = store.get("fox");
        assert_eq!(container.len(), 35);
        assert_ne!(&container[16..], FOX);
        assert_eq!(decrypt(&good, "cip:mem:fox"), FOX);

        // No authentication: a wrong passphrase silently yields garbage.
        let bad = registry(&store, options("wrong-horse", 8192));
        let garbage = decrypt(&bad, "cip:mem:fox");
        assert_eq!(garbage.len(), FOX.len());
        assert_ne!(garbage, FOX);
    }

    #[test]
    fn header_is_the_iv() {
        let store = MemStore::new();
        let registry = registry(&store, options("correct-horse", 8192));
        encrypt(&registry, "cip:mem:fox", &[FOX]);
        let container = store.get("fox");

        let key = Aes128CtrSuite.derive_key(b"correct-horse").unwrap();
        let mut cipher =
            ctr::Ctr128BE::<Aes128>::new_from_slices(&key[..], &container[..IV_LEN]).unwrap();
        let mut body = container[IV_LEN..].to_vec();
        cipher.apply_keystream(&mut body);
        assert_eq!(body, FOX);
    }

    #[test]
    fn fresh_iv_per_stream() {
        let store = MemStore::new();
        let registry = registry(&store, options("correct-horse", 8192));
        encrypt(&registry, "cip:mem:a", &[FOX]);
        encrypt(&registry, "cip:mem:b", &[FOX]);
        let (a, b) = (store.get("a"), store.get("b"));
        assert_ne!(a[..IV_LEN], b[..IV_LEN]);
        assert_ne!(a[IV_LEN..], b[IV_LEN..]);
    }

    #[test]
    fn empty_plaintext_is_just_the_header() {
        let store = MemStore::new();
        let registry = registry(&store, options("k", 1));
        encrypt(&registry, "cip:mem:empty", &[]);
        assert_eq!(store.get("empty").len(), IV_LEN);
        assert!(decrypt(&registry, "cip:mem:empty").is_empty());
    }

    #[test]
    fn truncated_header() {
        let store = MemStore::new();
        let registry = registry(&store, options("k", 8192));
        for len in [0, 1, 15] {
            store.put("short", &vec![7; len]);
            let err = registry.open("cip:mem:short", "r").unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidData);
            assert!(matches!(error_of(&err), CipError::TruncatedHeader(n) if *n == len));
        }
        // The inner stream was closed each time, never through `close`.
        assert_eq!(store.opens.load(Ordering::SeqCst), 3);
        assert_eq!(store.closes.load(Ordering::SeqCst), 0);

        store.put("exact", &[0; IV_LEN]);
        assert!(decrypt(&registry, "cip:mem:exact").is_empty());
    }

    #[test]
    fn seek_is_refused_without_side_effects() {
        let store = MemStore::new();
        let registry = registry(&store, options("correct-horse", 1));

        let mut writer = registry.open("cip:mem:fox", "w").unwrap();
        writer.write_all(&FOX[..5]).unwrap();
        let err = writer.seek(SeekFrom::Start(0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSeekable);
        assert!(matches!(error_of(&err), CipError::NotSeekable));
        writer.write_all(&FOX[5..]).unwrap();
        writer.close().unwrap();

        let mut reader = registry.open("cip:mem:fox", "r").unwrap();
        let mut head = [0u8; 4];
        assert_eq!(reader.read_full(&mut head).unwrap(), 4);
        for pos in [SeekFrom::Start(0), SeekFrom::Current(-4), SeekFrom::End(0)] {
            assert!(matches!(error_of(&reader.seek(pos).unwrap_err()), CipError::NotSeekable));
        }
        let mut rest = [0u8; 64];
        let n = reader.read_full(&mut rest).unwrap();
        assert_eq!([&head[..], &rest[..n]].concat(), FOX);
        reader.close().unwrap();
    }

    #[test]
    fn chunking_is_invisible() {
        let iv = [9; IV_LEN];
        let data: Vec<u8> = (0..5000u32).map(|i| (i * 31 % 251) as u8).collect();
        let whole = encrypt_with_iv(&MemStore::new(), 8192, iv, &[&data]);
        let small_buffer = encrypt_with_iv(&MemStore::new(), 1, iv, &[&data]);
        let pieces: Vec<&[u8]> = data.chunks(13).collect();
        let many_writes = encrypt_with_iv(&MemStore::new(), 3, iv, &pieces);
        assert_eq!(whole.len(), IV_LEN + data.len());
        assert_eq!(&whole[..IV_LEN], &iv);
        assert_eq!(whole, small_buffer);
        assert_eq!(whole, many_writes);
    }

    #[test]
    fn missing_passphrase_touches_nothing() {
        let store = MemStore::new();
        let options = CipOptions {
            key_source: crate::KeySource::Env("HFILE_CIP_TEST_SURELY_UNSET_77d0".into()),
            ..CipOptions::default()
        };
        let registry = registry(&store, options);
        for mode in ["r", "w"] {
            let err = registry.open("cip:mem:x", mode).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::PermissionDenied);
            assert!(matches!(error_of(&err), CipError::ConfigMissing(_)));
        }
        assert_eq!(store.opens.load(Ordering::SeqCst), 0);
        assert!(store.get("x").is_empty());
    }

    #[test]
    fn read_write_and_append_modes_are_invalid() {
        let store = MemStore::new();
        let registry = registry(&store, options("k", 8192));
        for mode in ["r+", "w+", "a", "ab", "a+"] {
            let err = registry.open("cip:mem:x", mode).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidInput);
            assert!(matches!(error_of(&err), CipError::InvalidMode(m) if m == mode));
        }
        assert_eq!(store.opens.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn inner_open_failure_keeps_its_kind() {
        let store = MemStore::new();
        let registry = registry(&store, options("k", 8192));
        let err = registry.open("cip:mem:absent", "r").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(matches!(error_of(&err), CipError::InnerOpenFailed(_)));
    }

    #[test]
    fn failed_iv_write_aborts_open() {
        let store = MemStore::new();
        *store.write_budget.lock().unwrap() = Some(10);
        let registry = registry(&store, options("k", 8192));
        let err = registry.open("cip:mem:x", "w").unwrap_err();
        assert!(matches!(error_of(&err), CipError::InnerWriteFailed(_)));
        assert_eq!(store.closes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failing_iv_source_aborts_open() {
        let store = MemStore::new();
        let registry = registry(&store, options("k", 8192));
        let result = CipStream::open_with_iv_source(
            &registry,
            "mem:x",
            &Mode::parse("w").unwrap(),
            &options("k", 8192),
            &Aes128CtrSuite,
            |_| Err(CipError::IvError("entropy source unavailable".into())),
        );
        assert!(matches!(result, Err(CipError::IvError(_))));
        assert!(store.get("x").is_empty());
    }

    #[test]
    fn inner_write_failure_is_reported() {
        let store = MemStore::new();
        let registry = registry(&store, options("k", 2));
        let mut file = registry.open("cip:mem:x", "w").unwrap();
        *store.write_budget.lock().unwrap() = Some(40);
        let err = file.write(&[0; 100]).unwrap_err();
        assert!(matches!(error_of(&err), CipError::InnerWriteFailed(_)));
        // Bytes accepted before the failure are not rolled back.
        assert_eq!(store.get("x").len(), IV_LEN + 40);
        drop(file);
    }

    #[test]
    fn close_reports_inner_failure_after_closing() {
        let store = MemStore::new();
        let registry = registry(&store, options("k", 8192));
        let mut file = registry.open("cip:mem:x", "w").unwrap();
        file.write_all(FOX).unwrap();
        store.fail_close.store(true, Ordering::SeqCst);
        let err = file.close().unwrap_err();
        assert!(matches!(error_of(&err), CipError::InnerCloseFailed(_)));
        assert_eq!(store.closes.load(Ordering::SeqCst), 1);
        assert_eq!(store.get("x").len(), IV_LEN + FOX.len());
    }

    #[test]
    fn oversized_buffer_setting_is_clamped() {
        let store = MemStore::new();
        let registry = registry(&store, options("k", usize::MAX));
        encrypt(&registry, "cip:mem:x", &[FOX]);
        assert_eq!(decrypt(&registry, "cip:mem:x"), FOX);
    }

    #[test]
    fn key_derivation_failure_closes_inner_abruptly() {
        let store = MemStore::new();
        let suite = FailingSuite::new(Failures {
            derive: true,
            ..Failures::default()
        });
        let registry = registry_with_suite(&store, options("k", 8192), suite);

        let err = registry.open("cip:mem:x", "w").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Other);
        assert!(matches!(error_of(&err), CipError::KeyDerivationError(_)));
        // The IV went out before the key was derived.
        assert_eq!(store.get("x").len(), IV_LEN);

        let err = registry.open("cip:mem:x", "r").unwrap_err();
        assert!(matches!(error_of(&err), CipError::KeyDerivationError(_)));
        assert_eq!(store.opens.load(Ordering::SeqCst), 2);
        assert_eq!(store.closes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cipher_update_failure_aborts_io() {
        let store = MemStore::new();
        encrypt(&registry(&store, options("k", 8192)), "cip:mem:fox", &[FOX]);
        let suite = FailingSuite::new(Failures {
            update: true,
            ..Failures::default()
        });
        let failing = registry_with_suite(&store, options("k", 8192), suite);

        let mut reader = failing.open("cip:mem:fox", "r").unwrap();
        let err = reader.read(&mut [0u8; 64]).unwrap_err();
        assert!(matches!(error_of(&err), CipError::CipherError(msg) if msg == "update"));
        drop(reader);

        let mut writer = failing.open("cip:mem:y", "w").unwrap();
        let err = writer.write(FOX).unwrap_err();
        assert!(matches!(error_of(&err), CipError::CipherError(msg) if msg == "update"));
        assert_eq!(store.get("y").len(), IV_LEN);
    }

    #[test]
    fn close_runs_every_step_and_reports_first_error() {
        for (fail, first) in [
            (
                Failures {
                    finalize: true,
                    release: true,
                    ..Failures::default()
                },
                "finalize",
            ),
            (
                Failures {
                    release: true,
                    ..Failures::default()
                },
                "release",
            ),
        ] {
            let store = MemStore::new();
            let suite = FailingSuite::new(fail);
            let releases = Arc::clone(&suite.releases);
            let registry = registry_with_suite(&store, options("k", 8192), suite);

            let mut file = registry.open("cip:mem:x", "w").unwrap();
            file.write_all(FOX).unwrap();
            let err = file.close().unwrap_err();
            assert!(matches!(error_of(&err), CipError::CipherError(msg) if msg == first));
            assert_eq!(releases.load(Ordering::SeqCst), 1);
            assert_eq!(store.closes.load(Ordering::SeqCst), 1);
            assert_eq!(store.get("x").len(), IV_LEN + FOX.len());
        }
    }

    #[test]
    fn reads_span_many_chunks() {
        let store = MemStore::new();
        let registry = registry(&store, options("pass", 1));
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 256) as u8).collect();
        encrypt(&registry, "cip:mem:big", &[&data]);

        let mut file = registry.open("cip:mem:big", "r").unwrap();
        let mut out = vec![0u8; 20_000];
        let n = file.read(&mut out).unwrap();
        assert_eq!(n, data.len());
        assert_eq!(out[..n], data[..]);
        assert_eq!(file.read(&mut out).unwrap(), 0);
        file.close().unwrap();
    }

    #[test]
    fn remoteness_follows_inner_stream() {
        let store = MemStore::new();
        let registry = registry(&store, options("k", 8192));
        assert!(!registry.is_remote("cip:mem:x"));
        assert!(!registry.is_remote("cip:///tmp/x"));
        store.remote.store(true, Ordering::SeqCst);
        assert!(registry.is_remote("cip:mem:x"));
    }

    proptest! {
        #[test]
        fn round_trip(
            data in proptest::collection::vec(any::<u8>(), 0..3000),
            passphrase in "[ -~]{0,20}",
            piece_len in 1usize..400,
            blocks in 1usize..5,
        ) {
            let store = MemStore::new();
            let registry = registry(&store, options(&passphrase, blocks));
            let pieces: Vec<&[u8]> = data.chunks(piece_len).collect();
            encrypt(&registry, "cip:mem:p", &pieces);
            prop_assert_eq!(store.get("p").len(), IV_LEN + data.len());
            prop_assert_eq!(decrypt(&registry, "cip:mem:p"), data);
        }

        #[test]
        fn write_splits_do_not_change_ciphertext(
            data in proptest::collection::vec(any::<u8>(), 1..2000),
            cut in 1usize..64,
        ) {
            let iv = [0xa5; IV_LEN];
            let whole = encrypt_with_iv(&MemStore::new(), 4, iv, &[&data]);
            let pieces: Vec<&[u8]> = data.chunks(cut).collect();
            prop_assert_eq!(whole, encrypt_with_iv(&MemStore::new(), 4, iv, &pieces));
        }
    }
}
