//! Perun CLI - self-contained DMR network server.

use std::sync::Arc;

use clap::Parser;
use colored::Colorize;

use perun::cli::{
    Cli, Commands, ConfigArgs, LastheardArgs, RepeaterArgs, RepeaterCommands, RunArgs,
};
use perun::config::{init_logging, Config, LoggingConfig};
use perun::error::Result;
use perun::identdb::IdentDb;
use perun::protocol::Timeslot;
use perun::registry::{Registry, RepeaterRecord};
use perun::server::{setup_signal_handlers, DmrServer, Signal};
use perun::VERSION;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load config if specified
    let config = if let Some(ref path) = cli.config {
        Config::load(path)?
    } else if Config::default_path().exists() {
        Config::load(Config::default_path())?
    } else {
        Config::default()
    };

    // Initialize logging
    let log_config = LoggingConfig {
        level: cli.log_level.clone(),
        color: !cli.no_color,
        ..config.logging.clone()
    };
    init_logging(&log_config)?;

    // Dispatch command
    match cli.command {
        Commands::Run(args) => run_server(args, config).await,
        Commands::Config(args) => run_config(&args),
        Commands::Repeater(args) => run_repeater(&args, &config),
        Commands::Lastheard(args) => run_lastheard(&args, &config),
    }
}

/// Run the DMR server
async fn run_server(args: RunArgs, mut config: Config) -> Result<()> {
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    if let Some(port) = args.port {
        config.server.dmr_port = port;
    }
    config.validate()?;

    println!("{} {}", "Perun DMR server".bright_cyan().bold(), VERSION);
    println!();

    let registry = Arc::new(Registry::open(&config.registry.db_path)?);
    println!(
        "  {} Registry: {} ({} repeaters)",
        "●".green(),
        config.registry.db_path.display(),
        registry.count()
    );

    let identdb = match config.identity.snapshot {
        Some(ref path) => {
            let db = Arc::new(IdentDb::load(path)?);
            println!(
                "  {} Identity snapshot: {} ({} users)",
                "●".green(),
                path.display(),
                db.len()
            );
            db
        }
        None => {
            println!(
                "  {} No identity snapshot, callsign checks disabled",
                "○".yellow()
            );
            Arc::new(IdentDb::empty())
        }
    };

    let snapshot_path = config.identity.snapshot.clone();
    let server = Arc::new(DmrServer::new(config, registry, Arc::clone(&identdb)));
    Arc::clone(&server).start().await?;

    println!(
        "  {} Listening on {}",
        "●".green(),
        server
            .local_addr()
            .map_or_else(|| "?".into(), |a| a.to_string())
    );
    println!();
    println!("{} Server running. Press Ctrl+C to stop.", "●".green());

    // SIGHUP swaps in a fresh identity snapshot without a restart.
    let (handler, mut signal_rx) = setup_signal_handlers();
    if let Some(path) = snapshot_path {
        let identdb = Arc::clone(&identdb);
        handler.set_reload_callback(move || {
            if let Err(e) = identdb.reload(&path) {
                tracing::error!("Failed to reload identity snapshot: {e}");
            }
        });
    }

    loop {
        match signal_rx.recv().await {
            Ok(Signal::Terminate | Signal::Interrupt) | Err(_) => break,
            Ok(Signal::Hangup) => continue,
        }
    }

    println!();
    println!("{} Shutting down...", "→".yellow());
    server.shutdown().await;
    println!("{} Server stopped.", "●".yellow());

    Ok(())
}

/// Show example configuration
fn run_config(args: &ConfigArgs) -> Result<()> {
    let config = Config::example();

    if let Some(ref path) = args.output {
        config.save(path)?;
        println!(
            "{} Configuration written to {}",
            "✓".green(),
            path.display()
        );
    } else {
        let output = toml::to_string_pretty(&config)
            .map_err(|e| perun::Error::Config(format!("Failed to serialize config: {e}")))?;
        println!("{output}");
    }

    Ok(())
}

/// Manage registered repeaters
fn run_repeater(args: &RepeaterArgs, config: &Config) -> Result<()> {
    let registry = Registry::open(&config.registry.db_path)?;

    match &args.command {
        RepeaterCommands::Add {
            radio_id,
            password,
            owner,
            ts1,
            ts2,
            hotspot,
        } => {
            let record = RepeaterRecord::new(*radio_id, password.clone(), *owner)
                .with_hotspot(*hotspot)
                .with_static(Timeslot::One, ts1.clone())
                .with_static(Timeslot::Two, ts2.clone());
            registry.add_repeater(record)?;
            println!("{} Registered repeater {}", "✓".green(), radio_id);
        }
        RepeaterCommands::List => {
            let repeaters = registry.list();
            if repeaters.is_empty() {
                println!("{} No repeaters registered", "○".dimmed());
                return Ok(());
            }
            for r in repeaters {
                println!(
                    "  {} {} {} owner={} TS1={:?} TS2={:?}{}",
                    "●".green(),
                    r.radio_id.to_string().bright_white(),
                    if r.callsign.is_empty() {
                        "-".into()
                    } else {
                        r.callsign.clone()
                    },
                    r.owner_id,
                    r.static_ts1,
                    r.static_ts2,
                    if r.hotspot { " [hotspot]" } else { "" },
                );
            }
        }
        RepeaterCommands::Remove { radio_id } => {
            registry.remove_repeater(*radio_id)?;
            println!("{} Removed repeater {}", "✓".green(), radio_id);
        }
    }

    Ok(())
}

/// Query the lastheard call archive
fn run_lastheard(args: &LastheardArgs, config: &Config) -> Result<()> {
    let registry = Registry::open(&config.registry.db_path)?;

    let calls = if let Some(user) = args.user {
        registry.lastheard_for_user(user, args.limit)?
    } else if let Some(repeater) = args.repeater {
        registry.lastheard_for_repeater(repeater, args.limit)?
    } else if let Some(talkgroup) = args.talkgroup {
        registry.lastheard_for_talkgroup(talkgroup, args.limit)?
    } else {
        registry.lastheard(args.limit)?
    };

    if calls.is_empty() {
        println!("{} No calls recorded", "○".dimmed());
        return Ok(());
    }

    for call in calls {
        println!(
            "  {} {} -> {} via {} TS{} {:.1}s {} pkts ({} lost) BER {:.1}%{}",
            if call.group_call {
                "G".cyan()
            } else {
                "U".magenta()
            },
            call.source_id.to_string().bright_white(),
            call.destination_id,
            call.repeater_id,
            call.timeslot,
            call.duration_ms as f64 / 1000.0,
            call.total_packets,
            call.lost_packets,
            call.ber,
            if call.lost_terminator {
                " [lost terminator]".dimmed().to_string()
            } else {
                String::new()
            },
        );
    }

    Ok(())
}
