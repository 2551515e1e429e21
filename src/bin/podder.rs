//! podder - unprivileged layer-based containers
//!
//! ```sh
//! podder pull registry-1.docker.io/library/ubuntu:latest
//! podder start ubuntu
//! podder exec ubuntu /bin/sh
//! podder stop ubuntu --timeout 5
//! podder rm ubuntu
//! ```

use podder::{lifecycle, Importer, Launcher, LayerStore, RegistryClient, StartOutcome};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug)]
enum Command {
    Pull {
        reference: String,
    },
    Start {
        name: String,
    },
    Stop {
        name: String,
        signal: String,
        timeout: Duration,
    },
    Status {
        name: String,
    },
    Create {
        name: String,
        parent: Option<String>,
    },
    Remove {
        name: String,
    },
    List,
    Exec {
        name: String,
        command: Vec<String>,
    },
    Version,
    Help,
}

struct Invocation {
    store: Option<PathBuf>,
    command: Command,
}

fn parse_args() -> Result<Invocation, String> {
    let mut args: Vec<String> = std::env::args().skip(1).collect();

    let mut store = None;
    if let Some(position) = args.iter().position(|a| a == "--store") {
        if position + 1 >= args.len() {
            return Err("--store requires a path".to_string());
        }
        args.remove(position);
        store = Some(PathBuf::from(args.remove(position)));
    }

    if args.is_empty() {
        return Ok(Invocation {
            store,
            command: Command::Help,
        });
    }

    let require = |args: &[String], what: &str| -> Result<String, String> {
        args.get(1)
            .cloned()
            .ok_or_else(|| format!("{} requires a name", what))
    };

    let command = match args[0].as_str() {
        "pull" => Command::Pull {
            reference: require(&args, "pull")?,
        },
        "start" => Command::Start {
            name: require(&args, "start")?,
        },
        "stop" => {
            let name = require(&args, "stop")?;
            let mut signal = "SIGTERM".to_string();
            let mut timeout = podder::constants::DEFAULT_STOP_TIMEOUT;
            let mut i = 2;
            while i < args.len() {
                match args[i].as_str() {
                    "--signal" | "-s" => {
                        signal = args
                            .get(i + 1)
                            .cloned()
                            .ok_or("--signal requires a value")?;
                        i += 2;
                    }
                    "--timeout" | "-t" => {
                        let seconds: u64 = args
                            .get(i + 1)
                            .ok_or("--timeout requires seconds")?
                            .parse()
                            .map_err(|_| "--timeout requires a number of seconds")?;
                        timeout = Duration::from_secs(seconds);
                        i += 2;
                    }
                    unknown => return Err(format!("unknown stop option: {}", unknown)),
                }
            }
            Command::Stop {
                name,
                signal,
                timeout,
            }
        }
        "status" => Command::Status {
            name: require(&args, "status")?,
        },
        "create" => {
            let name = require(&args, "create")?;
            let mut parent = None;
            let mut i = 2;
            while i < args.len() {
                match args[i].as_str() {
                    "--parent" | "-p" => {
                        parent = Some(
                            args.get(i + 1)
                                .cloned()
                                .ok_or("--parent requires a layer name")?,
                        );
                        i += 2;
                    }
                    unknown => return Err(format!("unknown create option: {}", unknown)),
                }
            }
            Command::Create { name, parent }
        }
        "rm" => Command::Remove {
            name: require(&args, "rm")?,
        },
        "list" => Command::List,
        "exec" => {
            let name = require(&args, "exec")?;
            let command: Vec<String> = args[2..].to_vec();
            if command.is_empty() {
                return Err("exec requires a command".to_string());
            }
            Command::Exec { name, command }
        }
        "version" | "--version" | "-v" => Command::Version,
        "help" | "--help" | "-h" => Command::Help,
        unknown => return Err(format!("unknown command: {}", unknown)),
    };

    Ok(Invocation { store, command })
}

// =============================================================================
// Commands
// =============================================================================

fn open_store(path: Option<PathBuf>) -> podder::Result<LayerStore> {
    match path {
        Some(path) => LayerStore::open(path),
        None => LayerStore::open_default(),
    }
}

fn run(invocation: Invocation) -> podder::Result<()> {
    let store = open_store(invocation.store)?;

    match invocation.command {
        Command::Pull { reference } => {
            let reference = podder::importer::resolve_pull_target(&store, &reference)?;
            let client = RegistryClient::new()?;
            let outcome = Importer::new(&store).pull_blocking(&client, &reference)?;
            println!(
                "{}: {} layer(s) pulled, {} reused",
                outcome.top_layer, outcome.created, outcome.reused
            );
        }
        Command::Start { name } => match Launcher::new(&store).start(&name)? {
            StartOutcome::Detached(pid) => {
                println!("{}: started (pid {})", name, pid.as_raw());
            }
            StartOutcome::Attached { exit_code, .. } => {
                std::process::exit(exit_code);
            }
        },
        Command::Stop {
            name,
            signal,
            timeout,
        } => {
            let signal = lifecycle::parse_signal(&signal)?;
            lifecycle::stop(&store, &name, signal, timeout)?;
            println!("{}: stopped", name);
        }
        Command::Status { name } => {
            println!("{}: {}", name, lifecycle::status(&store, &name)?);
        }
        Command::Create { name, parent } => {
            store.create(&name, parent.as_deref(), None)?;
            println!("{}: created", name);
        }
        Command::Remove { name } => {
            store.remove(&name)?;
            println!("{}: removed", name);
        }
        Command::List => {
            for layer in store.list()? {
                let parent = store
                    .parent_of(&layer)
                    .unwrap_or(None)
                    .unwrap_or_else(|| "-".to_string());
                let status = lifecycle::status(&store, layer.name())?;
                println!("{}\t{}\t{}", layer.name(), parent, status);
            }
        }
        Command::Exec { name, command } => {
            let code = Launcher::new(&store).exec(&name, &command)?;
            std::process::exit(code);
        }
        Command::Version => {
            println!("podder {}", env!("CARGO_PKG_VERSION"));
        }
        Command::Help => print_help(),
    }
    Ok(())
}

fn print_help() {
    println!(
        r#"podder - unprivileged layer-based containers

USAGE:
    podder [--store PATH] <command> [args]

COMMANDS:
    pull REF                    Pull an image into a chain of layers
    start NAME                  Start a container on a layer
    stop NAME [-s SIG] [-t S]   Stop a running container
    status NAME                 Show whether a container is running
    create NAME [--parent P]    Create an empty layer
    rm NAME                     Remove a layer
    list                        List layers with parent and status
    exec NAME CMD...            Run a command inside a running container
    version                     Show version info
    help                        Show this help

The store defaults to $PODDER_STORE, then $XDG_DATA_HOME/podder.

EXAMPLES:
    podder pull registry-1.docker.io/library/ubuntu:latest
    podder start ubuntu
    podder create scratch --parent ubuntu
"#
    );
}

// =============================================================================
// Main
// =============================================================================

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("podder=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let invocation = match parse_args() {
        Ok(invocation) => invocation,
        Err(message) => {
            eprintln!("podder: {}", message);
            print_help();
            return ExitCode::FAILURE;
        }
    };

    match run(invocation) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("podder: {}", err);
            ExitCode::from(err.exit_code())
        }
    }
}
