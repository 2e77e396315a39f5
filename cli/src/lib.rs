pub mod cli;
pub mod config;

use {
    anyhow::{Context as _, Result, anyhow, bail},
    cli::{Cli, Command},
    config::Config,
    hfile::{HFile, Registry},
    hfile_cip::{CipHandler, CipOptions, KeySource},
    rand::{
        distr::{Alphanumeric, SampleString},
        rand_core,
        rngs::OsRng,
    },
    std::{
        any::Any,
        io::{self, Write},
        panic::catch_unwind,
    },
    tracing::info,
    tracing_subscriber::{EnvFilter, prelude::*},
};

pub const GENERATED_KEY_LEN: usize = 32;

/// Installs a stderr logger filtered by `RUST_LOG`, or by `log_filter` when
/// it is unset.
#[inline]
pub fn setup_logger(log_filter: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(log_filter)
            .with_context(|| format!("invalid log filter {log_filter:?}"))?,
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
    Ok(())
}

#[inline]
pub fn key_source(cli: &Cli, config: &Config) -> Result<KeySource> {
    if !cli.ask_key {
        return Ok(KeySource::Env(config.key_variable.clone()));
    }
    let passphrase = rpassword::prompt_password("Passphrase: ")?;
    if passphrase.is_empty() {
        bail!("no passphrase provided");
    }
    Ok(KeySource::fixed(passphrase))
}

/// Registry with every available scheme: plain files, `mmap:` and `cip:`.
#[inline]
pub fn build_registry(config: &Config, key_source: KeySource) -> Result<Registry> {
    let mut registry = Registry::new();
    registry.load_plugin(hfile_mmap::plugin_init)?;
    let cip = CipHandler::new(CipOptions {
        key_source,
        buffer_blocks: config.buffer_blocks,
    });
    registry.load_plugin(|target| {
        cip.register(target);
        Ok(hfile_cip::SCHEME)
    })?;
    Ok(registry)
}

/// Random alphanumeric passphrase drawn from the OS generator.
#[inline]
pub fn generate_key() -> Result<String> {
    catch_unwind(|| {
        Alphanumeric.sample_string(&mut rand_core::UnwrapErr(OsRng), GENERATED_KEY_LEN)
    })
    .map_err(|err| anyhow!("failed to generate key: {}", panic_message(&*err)))
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[inline]
pub fn run(cli: &Cli, config: &Config) -> Result<()> {
    let mut stdout = io::stdout().lock();
    if cli.command == Command::GenerateKey {
        writeln!(stdout, "{}", generate_key()?)?;
        return Ok(());
    }
    let registry = build_registry(config, key_source(cli, config)?)?;
    handle_command(&cli.command, &registry, &mut stdout)
}

#[inline]
pub fn handle_command(command: &Command, registry: &Registry, out: &mut dyn Write) -> Result<()> {
    match command {
        Command::Copy { from, to } => {
            let bytes = copy(registry, from, to)?;
            info!(from, to, bytes, "copied");
        }
        Command::Cat { url } => {
            let mut source = open(registry, url, "r")?;
            let copied =
                io::copy(&mut source, out).with_context(|| format!("failed to read {url}"));
            let closed = source.close().with_context(|| format!("failed to close {url}"));
            copied?;
            closed?;
            out.flush()?;
        }
        Command::GenerateKey => writeln!(out, "{}", generate_key()?)?,
        Command::IsRemote { url } => writeln!(out, "{}", registry.is_remote(url))?,
    }
    Ok(())
}

/// Streams `from` into `to`, closing both. Returns the number of bytes copied.
#[inline]
pub fn copy(registry: &Registry, from: &str, to: &str) -> Result<u64> {
    let mut source = open(registry, from, "r")?;
    let mut target = open(registry, to, "w")?;
    let copied = io::copy(&mut source, &mut target)
        .with_context(|| format!("failed to copy {from} to {to}"));
    let source_closed = source.close().with_context(|| format!("failed to close {from}"));
    // Closing the target writes out whatever it still buffers.
    let target_closed = target.close().with_context(|| format!("failed to close {to}"));
    let bytes = copied?;
    source_closed?;
    target_closed?;
    Ok(bytes)
}

fn open(registry: &Registry, url: &str, mode: &str) -> Result<HFile> {
    registry
        .open(url, mode)
        .with_context(|| format!("failed to open {url} ({mode})"))
}

#[cfg(test)]
#[expect(clippy::unwrap_used, clippy::indexing_slicing, reason = "test")]
mod tests {
    use {super::*, hfile_cip::CipError, tempfile::TempDir};

    fn registry(passphrase: &str) -> Registry {
        let config = Config {
            buffer_blocks: 2,
            ..Config::default()
        };
        build_registry(&config, KeySource::fixed(passphrase)).unwrap()
    }

    #[test]
    fn encrypt_then_decrypt_through_files() {
        let dir = TempDir::new().unwrap();
        let plain = dir.path().join("plain.txt");
        let encrypted = dir.path().join("plain.enc");
        let decrypted = dir.path().join("decrypted.txt");
        let content = "some text that spans several cipher blocks and chunks".repeat(5);
        fs_err::write(&plain, &content).unwrap();
        let registry = registry("correct-horse");

        let bytes = copy(
            &registry,
            plain.to_str().unwrap(),
            &format!("cip:{}", encrypted.display()),
        )
        .unwrap();
        assert_eq!(bytes, u64::try_from(content.len()).unwrap());
        let ciphertext = fs_err::read(&encrypted).unwrap();
        assert_eq!(ciphertext.len(), content.len() + 16);
        assert_ne!(&ciphertext[16..], content.as_bytes());

        copy(
            &registry,
            &format!("cip:mmap://{}", encrypted.display()),
            decrypted.to_str().unwrap(),
        )
        .unwrap();
        assert_eq!(fs_err::read_to_string(&decrypted).unwrap(), content);
    }

    #[test]
    fn cat_decrypts_to_output() {
        let dir = TempDir::new().unwrap();
        let encrypted = dir.path().join("note.enc");
        let url = format!("cip:{}", encrypted.display());
        let registry = registry("correct-horse");
        let mut file = registry.open(&url, "w").unwrap();
        file.write_all(b"the quick brown fox").unwrap();
        file.close().unwrap();

        let mut out = Vec::new();
        handle_command(&Command::Cat { url }, &registry, &mut out).unwrap();
        assert_eq!(out, b"the quick brown fox");
    }

    #[test]
    fn missing_passphrase_is_reported() {
        let dir = TempDir::new().unwrap();
        let plain = dir.path().join("plain.txt");
        fs_err::write(&plain, "data").unwrap();
        let config = Config {
            key_variable: "HCIP_TEST_VARIABLE_THAT_IS_NEVER_SET".into(),
            ..Config::default()
        };
        let key_source = KeySource::Env(config.key_variable.clone());
        let registry = build_registry(&config, key_source).unwrap();
        let target = dir.path().join("out.enc");

        let err = copy(
            &registry,
            plain.to_str().unwrap(),
            &format!("cip:{}", target.display()),
        )
        .unwrap_err();
        let io_err = err.downcast_ref::<io::Error>().unwrap();
        assert!(matches!(
            CipError::of(io_err),
            Some(CipError::ConfigMissing(_))
        ));
        assert!(!target.exists());
    }

    #[test]
    fn every_plugin_is_listed() {
        let registry = registry("x");
        assert_eq!(registry.plugins(), ["mmap", "cip"]);
        assert_eq!(registry.handler("cip").unwrap().priority(), 50);
    }

    #[test]
    fn is_remote_and_generate_key() {
        let registry = registry("x");
        let mut out = Vec::new();
        let url = "cip:/tmp/local.enc".to_owned();
        handle_command(&Command::IsRemote { url }, &registry, &mut out).unwrap();
        assert_eq!(out, b"false\n");

        let key = generate_key().unwrap();
        assert_eq!(key.len(), GENERATED_KEY_LEN);
        assert!(key.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(key, generate_key().unwrap());
    }
}
