mod cli;

use clap::Parser;
use cli::Cli;
use tracing::debug;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("procdump-rs: {err:#}");
        // Fatal initialisation and dump-pipeline errors exit -1.
        std::process::exit(255);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    // NOTE: The verbosity flag sets the default log level; the environment
    // variable (`PROCDUMP_LOG`) can still adjust the level per crate, e.g.
    // `PROCDUMP_LOG=engine=trace procdump-rs ...`.
    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.parse()?)
        .with_env_var("PROCDUMP_LOG")
        .from_env()?;

    let layer = tracing_subscriber::fmt::layer()
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(layer)
        .with(env_filter)
        .init();

    banner();

    let config = cli.into_config()?;
    config.ensure_helper_available()?;
    debug!(?config);

    engine::Engine::new(config).run()?;
    Ok(())
}

fn banner() {
    println!(
        "procdump-rs v{} - process monitor and core dump utility",
        env!("CARGO_PKG_VERSION")
    );
    println!("Monitors one or more processes and writes a core dump file when the");
    println!("processes exceed the specified criteria.\n");
}
