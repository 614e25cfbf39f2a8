//! tusk - application server for PHP workers

mod cli;

use anyhow::{Context, Result, bail};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr, Stream::Stdout};

use cli::{Cli, Commands, StartArgs};
use tusk::config::Config;
use tusk::logging::{self, LogConfig};
use tusk::runtime::RuntimeLocator;
use tusk::server::{ServerConfig, run_server};
use tusk::worker::Supervisor;

/// Parse arguments, run the selected command and print the error chain on failure.
fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        owo_colors::set_override(false);
    }
    logging::init(
        LogConfig::from_verbosity(cli.verbose, cli.quiet)
            .with_ansi(!cli.no_color)
            .with_env_overrides(),
    );

    let result = match &cli.command {
        Commands::Start(args) => cmd_start(&cli, args),
        Commands::Setup => cmd_setup(&cli),
        Commands::Init => cmd_init(&cli),
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

/// Load the config file and apply `start` overrides.
fn load_start_config(cli: &Cli, args: &StartArgs) -> Result<Config> {
    let mut config = Config::load(&cli.config)
        .with_context(|| format!("failed to read {}", cli.config.display()))?;

    if let Some(file) = &args.worker_file {
        config.set_worker_file(file)?;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(address) = &args.address {
        config.address = address.clone();
    }
    if let Some(workers) = args.workers {
        config.worker_count = workers;
    }

    config.validate()?;
    Ok(config)
}

/// Run the worker pool and the gateway until SIGINT/SIGTERM.
fn cmd_start(cli: &Cli, args: &StartArgs) -> Result<()> {
    let config = load_start_config(cli, args)?;

    let runtime = RuntimeLocator::new()
        .resolve(&config.php_binary)
        .context("cannot start workers")?;
    let entry_point = config.entry_point();
    if !entry_point.is_file() {
        bail!("worker script not found: {}", entry_point.display());
    }

    tracing::info!(
        runtime = %runtime.display(),
        entry_point = %entry_point.display(),
        workers = config.worker_count,
        "Starting tusk"
    );

    let pool = config.pool_config(runtime);
    let server = ServerConfig {
        bind: config.bind_address(),
        max_body_bytes: config.max_body_bytes,
    };

    let rt = tokio::runtime::Runtime::new().context("failed to create Tokio runtime")?;
    rt.block_on(async {
        let supervisor = Supervisor::start(pool).await?;
        run_server(server, &supervisor).await
    })?;

    Ok(())
}

/// Report the interpreter and worker script `start` would use.
fn cmd_setup(cli: &Cli) -> Result<()> {
    let config = Config::load(&cli.config)
        .with_context(|| format!("failed to read {}", cli.config.display()))?;
    let runtime = RuntimeLocator::new().resolve(&config.php_binary)?;
    let entry_point = config.entry_point();

    let label = |text: &'static str| text.if_supports_color(Stdout, |t| t.bold()).to_string();
    println!("{} {}", label("PHP runtime: "), runtime.display());
    if let Some(ini) = config.runtime_config() {
        println!("{} {}", label("PHP ini:     "), ini.display());
    }
    println!("{} {}", label("Project root:"), config.project_root);
    if entry_point.is_file() {
        println!("{} {}", label("Entry point: "), entry_point.display());
    } else {
        println!(
            "{} {} {}",
            label("Entry point: "),
            entry_point.display(),
            "(missing)".if_supports_color(Stdout, |t| t.yellow())
        );
    }
    println!("{} {}", label("Workers:     "), config.worker_count);
    println!("{} {}", label("Listen:      "), config.bind_address());
    Ok(())
}

/// Write a default config file.
fn cmd_init(cli: &Cli) -> Result<()> {
    Config::default().write_new(&cli.config)?;
    println!(
        "{} {}",
        "Created".if_supports_color(Stdout, |t| t.green()),
        cli.config.display()
    );
    Ok(())
}
