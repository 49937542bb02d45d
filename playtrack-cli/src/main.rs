#![forbid(unsafe_code)]

use std::path::PathBuf;

use clap::{command, value_parser, Arg, ArgAction};
use color_eyre::eyre::Result;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::util::SubscriberInitExt;

use crate::commands::Command;
use crate::config::Config;

mod commands;
mod config;

use playtrack::log::*;

#[tokio::main]
async fn main() -> Result<()> {
    install_color_eyre()?;

    // Command configuration
    let matches = command!()
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Turn debugging information on. Overrides -q. Can specify up to -vvvv.")
                .action(ArgAction::Count)
                .global(true),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .help("Silence all output. Overridden by -v.")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .arg(
            Arg::new("config")
                .help("Path to the config file. Defaults to the user config directory.")
                .long("config")
                .value_parser(value_parser!(PathBuf))
                .global(true),
        )
        .arg(
            Arg::new("server")
                .help("Base URL of the runner. Overrides the config file and PLAYTRACK_SERVER.")
                .long("server")
                .global(true),
        )
        .subcommand(command!("playbooks").about("List the runner's playbooks."))
        .subcommand(
            command!("host")
                .about("Show what the runner knows about a host.")
                .arg(Arg::new("hostname").help("Host to look up.").required(true)),
        )
        .subcommand(
            command!("run")
                .about("Run a playbook and watch it.")
                .arg(
                    Arg::new("playbook")
                        .help("Playbook name or path. Prompts when missing.")
                        .short('p')
                        .long("playbook"),
                )
                .arg(
                    Arg::new("hosts")
                        .help("Comma-separated hosts to run on.")
                        .short('H')
                        .long("hosts")
                        .value_delimiter(',')
                        .action(ArgAction::Append)
                        .required(true),
                )
                .arg(
                    Arg::new("extra-var")
                        .help("Extra variable as key=value. Can be repeated.")
                        .short('e')
                        .long("extra-var")
                        .action(ArgAction::Append),
                )
                .arg(
                    Arg::new("per-host")
                        .help("Submit one job per host even if the playbook is not a per-host one.")
                        .long("per-host")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("no-watch")
                        .help("Submit and exit. Follow later with `watch`.")
                        .long("no-watch")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            command!("status")
                .about("Show a job's status and parsed output.")
                .arg(Arg::new("job-id").required(true))
                .arg(
                    Arg::new("raw")
                        .help("Print the raw output instead of parsing it.")
                        .long("raw")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("export")
                        .help("Print the configuration summary and task lists, then the log.")
                        .long("export")
                        .action(ArgAction::SetTrue)
                        .conflicts_with("raw"),
                ),
        )
        .subcommand(
            command!("cancel")
                .about("Cancel a job, or every running job of a per-host run.")
                .arg(Arg::new("job-id").required(true)),
        )
        .subcommand(command!("watch").about("Resume watching the jobs of an earlier session."))
        .subcommand(
            command!("output")
                .about("Parse a saved playbook log.")
                .arg(
                    Arg::new("file")
                        .help("Path to the log file.")
                        .short('f')
                        .long("file")
                        .required(true),
                )
                .arg(
                    Arg::new("host")
                        .help("Only show this host.")
                        .long("host"),
                )
                .arg(
                    Arg::new("summary")
                        .help("Print the configuration summary followed by the log.")
                        .long("summary")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            command!("baseline")
                .about("Manage per-host baseline configuration.")
                .subcommand(
                    command!("configure")
                        .about("Set the hostname and passwords a baseline run applies to a host.")
                        .arg(Arg::new("host").required(true))
                        .arg(
                            Arg::new("hostname")
                                .help("New hostname. Prompts when missing.")
                                .long("hostname"),
                        )
                        .arg(
                            Arg::new("generate")
                                .help("Generate both passwords instead of prompting.")
                                .short('g')
                                .long("generate")
                                .action(ArgAction::SetTrue),
                        ),
                )
                .subcommand(
                    command!("show")
                        .about("Show stored baseline configs.")
                        .arg(Arg::new("host"))
                        .arg(
                            Arg::new("reveal")
                                .help("Print passwords in clear text.")
                                .long("reveal")
                                .action(ArgAction::SetTrue),
                        ),
                )
                .subcommand(
                    command!("remove")
                        .about("Forget a host's baseline config.")
                        .arg(Arg::new("host").required(true)),
                )
                .subcommand(
                    command!("generate-password")
                        .about("Print a random password.")
                        .arg(
                            Arg::new("length")
                                .short('l')
                                .long("length")
                                .value_parser(value_parser!(usize)),
                        ),
                )
                .subcommand_required(true),
        )
        .subcommand_required(true)
        .get_matches();

    // Set up logging
    let logging_config = tracing_subscriber::fmt::SubscriberBuilder::default()
        .with_timer(tracing_subscriber::fmt::time::UtcTime::new(
            time::macros::format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
        ))
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::NONE)
        .compact();

    let quiet = matches.get_flag("quiet");
    let verbose = matches.get_count("verbose") as usize;
    let level = if quiet && verbose == 0 {
        LevelFilter::ERROR
    } else {
        match verbose {
            0 => LevelFilter::ERROR,
            1 => LevelFilter::WARN,
            2 => LevelFilter::INFO,
            3 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    };
    let filter = match std::env::var("RUST_LOG") {
        Ok(_) => EnvFilter::try_from_default_env()?,
        Err(_) => EnvFilter::default().add_directive(level.into()),
    };

    let subscriber = logging_config.with_env_filter(filter).finish();
    subscriber.init();

    let config = Config::load(matches.get_one::<PathBuf>("config").map(PathBuf::as_path))
        .await?
        .with_server(matches.get_one::<String>("server").cloned());
    debug!("using runner at {}", config.server);

    // Run the commands
    if let Some((subcommand, matches)) = matches.subcommand() {
        let ctx = commands::CliContext::new(config, matches)?;
        debug!(
            "matched subcommand {} with matches: {:?}",
            &subcommand,
            &matches.ids().map(|id| id.as_str()).collect::<Vec<_>>()
        );
        match subcommand {
            "playbooks" => commands::inventory::PlaybooksCommand::new().run(&ctx).await?,
            "host" => commands::inventory::HostCommand::new().run(&ctx).await?,
            "run" => commands::job::RunCommand::new().run(&ctx).await?,
            "status" => commands::job::StatusCommand::new().run(&ctx).await?,
            "cancel" => commands::job::CancelCommand::new().run(&ctx).await?,
            "watch" => commands::job::WatchCommand::new().run(&ctx).await?,
            "output" => commands::output::OutputCommand::new().run(&ctx).await?,
            "baseline" => commands::baseline::BaselineCommand::new().run(&ctx).await?,
            _ => return Err(eyre!("Unrecognized subcommand: {}", subcommand)),
        }
    }
    Ok(())
}
