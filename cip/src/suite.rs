use {
    crate::error::CipError,
    aes::{
        Aes128,
        cipher::{KeyIvInit, StreamCipher},
    },
    derive_more::Display,
    hmac::Hmac,
    sha1::Sha1,
    zeroize::Zeroizing,
};

/// Cipher block size in bytes. The chunk buffer is a multiple of it.
pub const BLOCK_SIZE: usize = 16;

/// Length of the plaintext IV header of every encrypted stream.
pub const IV_LEN: usize = 16;

pub const KEY_LEN: usize = 16;

/// Salt for deriving the key from the passphrase.
///
/// Fixed for compatibility with existing containers; per-stream uniqueness
/// comes from the random IV.
pub const SALT: [u8; 8] = [244, 34, 1, 0, 158, 223, 78, 21];

pub const PBKDF2_ITERATIONS: u32 = 1024;

pub type Iv = [u8; IV_LEN];
pub type Key = Zeroizing<[u8; KEY_LEN]>;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Direction {
    #[display("decrypt")]
    Decrypt,
    #[display("encrypt")]
    Encrypt,
}

/// Key derivation and cipher construction used by cipher streams.
pub trait CipherSuite: Send + Sync {
    fn derive_key(&self, passphrase: &[u8]) -> Result<Key, CipError>;

    /// Creates an engine bound to `key` and `iv`. The engine's position starts
    /// at the beginning of the keystream and only moves forward.
    fn new_engine(
        &self,
        direction: Direction,
        key: &Key,
        iv: &Iv,
    ) -> Result<Box<dyn CipherEngine>, CipError>;
}

/// Stateful encryptor or decryptor.
pub trait CipherEngine: Send {
    /// Transforms `input` into the start of `output`.
    ///
    /// Engines are length-preserving: exactly `input.len()` bytes are
    /// produced, and `output` must have room for them.
    fn update(&mut self, input: &[u8], output: &mut [u8]) -> Result<usize, CipError>;

    /// Writes any trailing output (at most one block) and ends the stream.
    fn finalize(&mut self, output: &mut [u8]) -> Result<usize, CipError>;

    fn release(self: Box<Self>) -> Result<(), CipError>;
}

/// AES-128 in counter mode with a PBKDF2-HMAC-SHA1 key.
///
/// The whole 16-byte IV is the initial big-endian counter block, matching
/// OpenSSL's `EVP_aes_128_ctr`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Aes128CtrSuite;

impl CipherSuite for Aes128CtrSuite {
    #[inline]
    fn derive_key(&self, passphrase: &[u8]) -> Result<Key, CipError> {
        let mut key = Zeroizing::new([0; KEY_LEN]);
        pbkdf2::pbkdf2::<Hmac<Sha1>>(passphrase, &SALT, PBKDF2_ITERATIONS, &mut *key)
            .map_err(|err| CipError::KeyDerivationError(err.to_string()))?;
        Ok(key)
    }

    #[inline]
    fn new_engine(
        &self,
        direction: Direction,
        key: &Key,
        iv: &Iv,
    ) -> Result<Box<dyn CipherEngine>, CipError> {
        let cipher = Aes128Ctr::new_from_slices(&key[..], iv)
            .map_err(|err| CipError::CipherError(err.to_string()))?;
        Ok(Box::new(Aes128CtrEngine {
            direction,
            cipher: Some(cipher),
        }))
    }
}

struct Aes128CtrEngine {
    direction: Direction,
    // `None` once finalized.
    cipher: Option<Aes128Ctr>,
}

impl CipherEngine for Aes128CtrEngine {
    fn update(&mut self, input: &[u8], output: &mut [u8]) -> Result<usize, CipError> {
        let direction = self.direction;
        let cipher = self
            .cipher
            .as_mut()
            .ok_or_else(|| CipError::CipherError(format!("{direction} after finalize")))?;
        let available = output.len();
        let output = output.get_mut(..input.len()).ok_or_else(|| {
            CipError::CipherError(format!(
                "output buffer too small ({available} < {})",
                input.len()
            ))
        })?;
        cipher
            .apply_keystream_b2b(input, output)
            .map_err(|err| CipError::CipherError(err.to_string()))?;
        Ok(input.len())
    }

    fn finalize(&mut self, _output: &mut [u8]) -> Result<usize, CipError> {
        // Counter mode has no padding, so nothing is held back.
        self.cipher
            .take()
            .map(|_| 0)
            .ok_or_else(|| CipError::CipherError("finalized twice".into()))
    }

    fn release(self: Box<Self>) -> Result<(), CipError> {
        // Key schedule and counter are zeroized on drop.
        Ok(())
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used, reason = "test")]
mod tests {
    use super::*;

    const IV: Iv = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15];

    #[test]
    fn pbkdf2_sha1_key() {
        let key = Aes128CtrSuite.derive_key(b"correct-horse").unwrap();
        assert_eq!(hex::encode(*key), "f62a6b6f4de6b4a83de64d8a0057d88f");
        let key = Aes128CtrSuite.derive_key(b"wrong-horse").unwrap();
        assert_eq!(hex::encode(*key), "fed893ec2b29f595a9b94dfbe49979c3");
    }

    #[test]
    fn aes_128_ctr_vector() {
        let key = Aes128CtrSuite.derive_key(b"correct-horse").unwrap();
        let mut engine = Aes128CtrSuite
            .new_engine(Direction::Encrypt, &key, &IV)
            .unwrap();
        let mut out = [0u8; 19];
        let n = engine.update(b"the quick brown fox", &mut out).unwrap();
        assert_eq!(n, 19);
        assert_eq!(hex::encode(out), "d90c7e40a11a4c1589029c4641cd95f8f8df66");
        assert_eq!(engine.finalize(&mut out).unwrap(), 0);
        engine.release().unwrap();
    }

    #[test]
    fn keystream_continues_across_updates() {
        let key = Aes128CtrSuite.derive_key(b"k").unwrap();
        let plaintext: Vec<u8> = (0..100).collect();

        let mut whole = vec![0u8; plaintext.len()];
        let mut engine = Aes128CtrSuite.new_engine(Direction::Encrypt, &key, &IV).unwrap();
        engine.update(&plaintext, &mut whole).unwrap();

        let mut pieces = Vec::new();
        let mut engine = Aes128CtrSuite.new_engine(Direction::Encrypt, &key, &IV).unwrap();
        for chunk in plaintext.chunks(7) {
            let mut out = vec![0u8; chunk.len()];
            engine.update(chunk, &mut out).unwrap();
            pieces.extend_from_slice(&out);
        }
        assert_eq!(whole, pieces);
    }

    #[test]
    fn update_after_finalize_fails() {
        let key = Aes128CtrSuite.derive_key(b"k").unwrap();
        let mut engine = Aes128CtrSuite.new_engine(Direction::Decrypt, &key, &IV).unwrap();
        engine.finalize(&mut []).unwrap();
        let err = engine.update(b"x", &mut [0u8; 1]).unwrap_err();
        assert!(matches!(err, CipError::CipherError(_)));
        engine.finalize(&mut []).unwrap_err();
    }

    #[test]
    fn short_output_buffer_is_an_error() {
        let key = Aes128CtrSuite.derive_key(b"k").unwrap();
        let mut engine = Aes128CtrSuite.new_engine(Direction::Encrypt, &key, &IV).unwrap();
        let err = engine.update(b"abcd", &mut [0u8; 3]).unwrap_err();
        assert!(matches!(err, CipError::CipherError(ref msg) if msg.contains("3 < 4")));
        // The keystream did not advance, so a retry with room succeeds.
        let mut out = [0u8; 4];
        assert_eq!(engine.update(b"abcd", &mut out).unwrap(), 4);
    }
}
