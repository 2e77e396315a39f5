use {
    crate::{error::CipError, suite::BLOCK_SIZE},
    derivative::Derivative,
    std::env,
    zeroize::Zeroizing,
};

/// Environment variable holding the passphrase of registered `cip:` streams.
pub const DEFAULT_KEY_VARIABLE: &str = "HTS_CIP_KEY";

/// Chunk buffer size in cipher blocks (128 KiB).
pub const DEFAULT_BUFFER_BLOCKS: usize = 8192;

/// Largest chunk buffer, in cipher blocks (1 MiB). Larger settings are clamped.
pub const MAX_BUFFER_BLOCKS: usize = 65536;

/// Where the passphrase comes from.
#[derive(Derivative, Clone, PartialEq, Eq)]
#[derivative(Debug)]
pub enum KeySource {
    /// Read from an environment variable each time a stream is opened.
    Env(String),
    Fixed(#[derivative(Debug = "ignore")] Zeroizing<Vec<u8>>),
}

impl KeySource {
    #[must_use]
    #[inline]
    pub fn fixed(passphrase: impl Into<Vec<u8>>) -> Self {
        Self::Fixed(Zeroizing::new(passphrase.into()))
    }

    /// Returns the passphrase bytes.
    ///
    /// An unset variable is [`CipError::ConfigMissing`]. A variable set to
    /// the empty string is a valid (if weak) passphrase.
    #[inline]
    pub fn passphrase(&self) -> Result<Zeroizing<Vec<u8>>, CipError> {
        match self {
            Self::Env(variable) => env::var_os(variable)
                .map(|value| Zeroizing::new(value.into_encoded_bytes()))
                .ok_or_else(|| CipError::ConfigMissing(variable.clone())),
            Self::Fixed(passphrase) => Ok(passphrase.clone()),
        }
    }
}

impl Default for KeySource {
    #[inline]
    fn default() -> Self {
        Self::Env(DEFAULT_KEY_VARIABLE.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipOptions {
    pub key_source: KeySource,
    /// Capacity of the per-stream chunk buffer, in cipher blocks.
    pub buffer_blocks: usize,
}

impl CipOptions {
    #[must_use]
    #[inline]
    pub fn buffer_len(&self) -> usize {
        self.buffer_blocks
            .clamp(1, MAX_BUFFER_BLOCKS)
            .saturating_mul(BLOCK_SIZE)
    }
}

impl Default for CipOptions {
    #[inline]
    fn default() -> Self {
        Self {
            key_source: KeySource::default(),
            buffer_blocks: DEFAULT_BUFFER_BLOCKS,
        }
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used, clippy::arithmetic_side_effects, reason = "test")]
mod tests {
    use super::*;

    #[test]
    fn unset_variable_is_config_missing() {
        const VARIABLE: &str = "HFILE_CIP_TEST_SURELY_UNSET_3f9a";
        let err = KeySource::Env(VARIABLE.into()).passphrase().unwrap_err();
        assert!(matches!(err, CipError::ConfigMissing(ref name) if name == VARIABLE));
    }

    #[test]
    fn fixed_passphrase_is_hidden_from_debug() {
        let source = KeySource::fixed("correct-horse");
        assert_eq!(source.passphrase().unwrap().as_slice(), b"correct-horse");
        assert!(!format!("{source:?}").contains("horse"));
    }

    #[test]
    fn buffer_len_is_whole_blocks() {
        let mut options = CipOptions::default();
        assert_eq!(options.buffer_len(), 128 * 1024);
        options.buffer_blocks = 0;
        assert_eq!(options.buffer_len(), BLOCK_SIZE);
        options.buffer_blocks = usize::MAX;
        assert_eq!(options.buffer_len(), MAX_BUFFER_BLOCKS * BLOCK_SIZE);
    }
}
