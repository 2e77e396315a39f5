use {
    clap::{Parser, Subcommand},
    std::path::PathBuf,
};

#[derive(Debug, Parser)]
#[clap(name = "hcip", version, about)]
pub struct Cli {
    /// Config file (json5). Defaults to `hcip.json5` in the user config dir.
    #[clap(long)]
    pub config: Option<PathBuf>,
    /// Prompt for the passphrase instead of reading it from the environment.
    #[clap(long)]
    pub ask_key: bool,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, PartialEq, Eq)]
pub enum Command {
    /// Stream bytes from one URL to another.
    ///
    /// `hcip copy notes.txt cip:notes.enc` encrypts, and
    /// `hcip copy cip:notes.enc notes.txt` decrypts.
    Copy { from: String, to: String },
    /// Write the content of a URL to stdout.
    Cat { url: String },
    /// Print a random passphrase.
    GenerateKey,
    /// Print whether a URL refers to remote storage.
    IsRemote { url: String },
}
