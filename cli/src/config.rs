use {
    anyhow::{Context as _, Result, anyhow, ensure},
    hfile_cip::{DEFAULT_BUFFER_BLOCKS, DEFAULT_KEY_VARIABLE, MAX_BUFFER_BLOCKS},
    serde::{Deserialize, Serialize},
    std::{io::ErrorKind, path::Path},
    tracing::debug,
};

pub const CONFIG_FILE_NAME: &str = "hcip.json5";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Environment variable holding the passphrase.
    #[serde(default = "default_key_variable")]
    pub key_variable: String,
    #[serde(default = "default_buffer_blocks")]
    pub buffer_blocks: usize,
    /// Used when `RUST_LOG` is not set.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_key_variable() -> String {
    DEFAULT_KEY_VARIABLE.into()
}

fn default_buffer_blocks() -> usize {
    DEFAULT_BUFFER_BLOCKS
}

fn default_log_filter() -> String {
    "info".into()
}

impl Default for Config {
    #[inline]
    fn default() -> Self {
        Self {
            key_variable: default_key_variable(),
            buffer_blocks: default_buffer_blocks(),
            log_filter: default_log_filter(),
        }
    }
}

impl Config {
    /// Loads `path`, or the default config file if `path` is `None`.
    ///
    /// Only an explicitly given file is required to exist.
    #[inline]
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::read(path);
        }
        let config_dir = dirs::config_dir().ok_or_else(|| anyhow!("cannot find config dir"))?;
        let path = config_dir.join(CONFIG_FILE_NAME);
        match fs_err::read_to_string(&path) {
            Ok(text) => Self::parse(&text).with_context(|| format!("invalid config {path:?}")),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(?path, "no config file, using defaults");
                Ok(Self::default())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn read(path: &Path) -> Result<Self> {
        let text = fs_err::read_to_string(path)?;
        Self::parse(&text).with_context(|| format!("invalid config {path:?}"))
    }

    #[inline]
    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = json5::from_str(text)?;
        ensure!(
            (1..=MAX_BUFFER_BLOCKS).contains(&config.buffer_blocks),
            "`buffer_blocks` must be between 1 and {MAX_BUFFER_BLOCKS}, got {}",
            config.buffer_blocks
        );
        Ok(config)
    }
}
