use {
    anyhow::Result,
    clap::Parser,
    hfile_cli::{cli::Cli, config::Config, run, setup_logger},
};

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    setup_logger(&config.log_filter)?;
    run(&cli, &config)
}
