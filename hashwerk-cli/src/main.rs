//! Command-line tools for hashwerk.
//!
//! The `--hub` option locates the hub (jobs + graph state) and `--data`
//! the artefact storage backend; both fall back to the `HUB_URL` and
//! `DATA_URL` environment variables. Exit code 2 signals not-found or
//! timeout conditions.

use std::io::Write;
use std::time::Duration;

use clap::{crate_version, Parser, Subcommand};
use hashwerk::{
    self as hw, get, wait_for, ContentHash, EngineError, Object, Server, Session,
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const EXIT_NOT_FOUND: i32 = 2;

/// Command-line tools for the hashwerk workflow engine.
#[derive(Parser)]
#[clap(version = crate_version!(), author = "Hashwerk Contributors")]
struct Opts {
    /// Hub connection URL (jobs and graph state).
    #[clap(short = 'j', long = "hub", env = "HUB_URL")]
    hub: Option<String>,

    /// Storage backend URL (hub:// or file:///path).
    #[clap(short = 'd', long = "data", env = "DATA_URL")]
    data: Option<String>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Attach a worker to a set of queues.
    Worker {
        /// Queues to listen on, in priority order.
        queues: Vec<String>,
        /// Quit once all queues are drained.
        #[clap(short, long)]
        burst: bool,
    },
    /// Enqueue execution of the given targets.
    Execute {
        /// Target artefact or operation hashes.
        hashes: Vec<String>,
    },
    /// Block until all targets are computed.
    Wait {
        /// Target hashes.
        hashes: Vec<String>,
        /// Give up after this many seconds.
        #[clap(short, long)]
        timeout: Option<f64>,
    },
    /// Print artefact payloads to standard output.
    Cat {
        /// Artefact hashes.
        hashes: Vec<String>,
    },
    /// Invalidate operations and their dependents.
    Reset {
        /// Operation or artefact hashes.
        hashes: Vec<String>,
    },
    /// Drop job queues and owner locks. Artefact data is kept.
    Clean,
    /// Stop workers, and optionally the hub itself.
    Shutdown {
        /// Clear the locks of jobs still running.
        #[clap(short, long)]
        force: bool,
        /// Also shut down the hub server. Implies --force.
        #[clap(long)]
        all: bool,
    },
    /// Emit a DOT representation of the graph feeding the targets.
    Graph {
        /// Target hashes.
        hashes: Vec<String>,
    },
}

fn resolve_one(session: &Session, prefix: &str) -> Result<Object, i32> {
    let found = get(&session.hub, prefix).map_err(|e| {
        error!("{e}");
        EXIT_NOT_FOUND
    })?;
    match found.len() {
        0 => {
            error!("hash {prefix} does not correspond to anything");
            Err(EXIT_NOT_FOUND)
        }
        1 => Ok(found.into_iter().next().expect("one element")),
        n => {
            error!("hash {prefix} is ambiguous ({n} matches); provide more characters:");
            for object in &found {
                let hash = match object {
                    Object::Artefact(a) => a.hash.as_str(),
                    Object::Funsie(f) => f.hash.as_str(),
                    Object::Operation(o) => o.hash.as_str(),
                };
                eprintln!("      {hash}");
            }
            Err(EXIT_NOT_FOUND)
        }
    }
}

fn object_hash(object: &Object) -> ContentHash {
    match object {
        Object::Artefact(a) => a.hash.clone(),
        Object::Funsie(f) => f.hash.clone(),
        Object::Operation(o) => o.hash.clone(),
    }
}

fn cmd_execute(session: &Session, hashes: &[String]) -> i32 {
    for prefix in hashes {
        let object = match resolve_one(session, prefix) {
            Ok(o) => o,
            Err(code) => return code,
        };
        let hash = object_hash(&object);
        if let Err(e) = hw::dag::start_dag_execution(session, &hash, None) {
            error!("could not execute {}: {e}", hash.short());
            return EXIT_NOT_FOUND;
        }
        info!("executing {}", hash.short());
    }
    0
}

fn cmd_wait(session: &Session, hashes: &[String], timeout: Option<f64>) -> i32 {
    let timeout = timeout.map(Duration::from_secs_f64);
    for prefix in hashes {
        let object = match resolve_one(session, prefix) {
            Ok(o) => o,
            Err(code) => return code,
        };
        let outcome = match object {
            Object::Artefact(artefact) => wait_for(session, &artefact, timeout),
            Object::Operation(op) => wait_for(session, &op, timeout),
            Object::Funsie(funsie) => {
                error!("{} is a funsie, not waitable", funsie.hash.short());
                return EXIT_NOT_FOUND;
            }
        };
        match outcome {
            Ok(()) => {}
            Err(EngineError::WaitTimeout { target, waited }) => {
                error!("waited on {target} for {waited:.1}s");
                return EXIT_NOT_FOUND;
            }
            Err(e) => {
                error!("{e}");
                return EXIT_NOT_FOUND;
            }
        }
    }
    0
}

fn cmd_cat(session: &Session, hashes: &[String]) -> i32 {
    for prefix in hashes {
        let object = match resolve_one(session, prefix) {
            Ok(o) => o,
            Err(code) => return code,
        };
        match object {
            Object::Artefact(artefact) => {
                match hw::take_result(session, &artefact) {
                    Ok(Ok(data)) => {
                        let mut stdout = std::io::stdout();
                        if stdout.write_all(&data).and_then(|()| stdout.flush()).is_err() {
                            return EXIT_NOT_FOUND;
                        }
                        info!("{} output to stdout", artefact.hash.short());
                    }
                    Ok(Err(err)) => {
                        warn!(
                            "error at {}: {}",
                            artefact.hash.short(),
                            err.kind.as_str()
                        );
                        if let Some(details) = err.details {
                            eprintln!("{details}");
                        }
                        if let Some(source) = err.source {
                            warn!("error source: {source}");
                        }
                    }
                    Err(e) => {
                        error!("{e}");
                        return EXIT_NOT_FOUND;
                    }
                }
            }
            Object::Operation(op) => {
                error!("{} is an operation, not an artefact", op.hash.short());
                eprintln!("      INPUTS:");
                for (name, hash) in &op.inp {
                    eprintln!("      {name:<30} -> {}", hash.short());
                }
                eprintln!("      OUTPUTS:");
                for (name, hash) in &op.out {
                    eprintln!("      {name:<30} -> {}", hash.short());
                }
            }
            Object::Funsie(funsie) => {
                error!("{} is a funsie, not an artefact", funsie.hash.short());
            }
        }
    }
    0
}

fn cmd_reset(session: &Session, hashes: &[String]) -> i32 {
    for prefix in hashes {
        let object = match resolve_one(session, prefix) {
            Ok(o) => o,
            Err(code) => return code,
        };
        let outcome = match object {
            Object::Artefact(artefact) => hw::reset(session, &artefact, true),
            Object::Operation(op) => hw::reset(session, &op, true),
            Object::Funsie(funsie) => {
                error!("{} is a funsie, not resettable", funsie.hash.short());
                return EXIT_NOT_FOUND;
            }
        };
        if let Err(e) = outcome {
            error!("{e}");
            return EXIT_NOT_FOUND;
        }
    }
    0
}

fn cmd_graph(session: &Session, hashes: &[String]) -> i32 {
    let mut targets = Vec::new();
    for prefix in hashes {
        match resolve_one(session, prefix) {
            Ok(object) => targets.push(object_hash(&object)),
            Err(code) => return code,
        }
    }
    match hw::viz::export_dot(session, &targets) {
        Ok(dot) => {
            println!("{dot}");
            0
        }
        Err(e) => {
            error!("{e}");
            EXIT_NOT_FOUND
        }
    }
}

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hashwerk=info,hashwerk_cli=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let opts = Opts::parse();
    let server = Server::new(opts.hub, opts.data);
    let session = match server.open() {
        Ok(session) => session,
        Err(e) => {
            error!("could not connect: {e}");
            std::process::exit(EXIT_NOT_FOUND);
        }
    };

    let code = match opts.command {
        Command::Worker { queues, burst } => match hw::run_worker(&session, queues, burst) {
            Ok(()) => 0,
            Err(e) => {
                error!("worker failed: {e}");
                1
            }
        },
        Command::Execute { hashes } => cmd_execute(&session, &hashes),
        Command::Wait { hashes, timeout } => cmd_wait(&session, &hashes, timeout),
        Command::Cat { hashes } => cmd_cat(&session, &hashes),
        Command::Reset { hashes } => cmd_reset(&session, &hashes),
        Command::Clean => match session.cleanup() {
            Ok(()) => {
                info!("done");
                0
            }
            Err(e) => {
                error!("{e}");
                1
            }
        },
        Command::Shutdown { force, all } => {
            let force = force || all;
            match session.shutdown_workers(force) {
                Ok(()) => {
                    if all {
                        info!("shutting down the hub server");
                        if let Err(e) = session.hub.server_shutdown() {
                            error!("{e}");
                        }
                    }
                    info!("done");
                    0
                }
                Err(e) => {
                    error!("{e}");
                    1
                }
            }
        }
        Command::Graph { hashes } => cmd_graph(&session, &hashes),
    };
    std::process::exit(code);
}
