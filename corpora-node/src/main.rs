use std::path::PathBuf;
use std::process;

use anyhow::Context;
use crossbeam_channel as chan;

use corpora::sync::Upstream;
use corpora_node::spool::SpoolUpstream;
use corpora_node::{logger, signals, Config, Runtime, VERSION};

pub const HELP_MSG: &str = r#"
Usage

   corpora-node [<option>...]

   Runs as a leader by default: syncs the configured sources into the local
   mutation log and serves it on `/logs`. With `follow` set in the
   configuration, runs as a follower of another node instead.

Options

    --config             <path>         Config file to use (default: ./config.json)
    --data-dir           <path>         Override the configured data directory
    --listen             <address>      Override the address to listen on
    --follow             <url>          Follow the leader at this URL
    --init-and-quit                     Initialize the corpus, then exit
    --log                <level>        Set log level (default: info)
    --version                           Print program version
    --help                              Print help
"#;

#[derive(Debug)]
struct Options {
    config: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    listen: Option<std::net::SocketAddr>,
    follow: Option<String>,
    init_and_quit: bool,
    log: Option<log::Level>,
}

impl Options {
    fn from_env() -> Result<Self, anyhow::Error> {
        use lexopt::prelude::*;

        let mut parser = lexopt::Parser::from_env();
        let mut config = None;
        let mut data_dir = None;
        let mut listen = None;
        let mut follow = None;
        let mut init_and_quit = false;
        let mut log = None;

        while let Some(arg) = parser.next()? {
            match arg {
                Long("config") => {
                    config = Some(PathBuf::from(parser.value()?));
                }
                Long("data-dir") => {
                    data_dir = Some(PathBuf::from(parser.value()?));
                }
                Long("listen") => {
                    listen = Some(parser.value()?.parse()?);
                }
                Long("follow") => {
                    follow = Some(parser.value()?.string()?);
                }
                Long("init-and-quit") => {
                    init_and_quit = true;
                }
                Long("log") => {
                    log = Some(parser.value()?.parse()?);
                }
                Long("help") | Short('h') => {
                    println!("{HELP_MSG}");
                    process::exit(0);
                }
                Long("version") => {
                    println!("corpora-node {VERSION}");
                    process::exit(0);
                }
                _ => anyhow::bail!(arg.unexpected()),
            }
        }

        Ok(Self {
            config,
            data_dir,
            listen,
            follow,
            init_and_quit,
            log,
        })
    }
}

fn execute() -> anyhow::Result<()> {
    let options = Options::from_env()?;

    logger::init(
        options
            .log
            .or_else(logger::env_level)
            .unwrap_or(log::Level::Info),
    )?;

    let path = options
        .config
        .unwrap_or_else(|| PathBuf::from("config.json"));
    let mut config = if path.exists() {
        Config::load(&path).context("couldn't load configuration")?
    } else {
        let data_dir = options
            .data_dir
            .clone()
            .context("no configuration file; `--data-dir` is required")?;
        Config::new(data_dir)
    };
    if let Some(data_dir) = options.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(listen) = options.listen {
        config.listen = listen;
    }
    if let Some(follow) = options.follow {
        config.follow = Some(follow);
    }

    log::info!(target: "node", "Starting node..");
    log::info!(target: "node", "Version {VERSION}");

    let (notify, signals) = chan::bounded(1);
    signals::install(notify)?;

    let (trigger, ctx) = corpora::cancel::channel();

    // Leaders read their spool directories; one per source.
    let upstreams = config
        .sources
        .iter()
        .map(|source| {
            let spool = config.data_dir.join("spool").join(source.label());
            (
                source.clone(),
                Box::new(SpoolUpstream::new(spool)) as Box<dyn Upstream>,
            )
        })
        .collect();

    let runtime = Runtime::init(config, upstreams, signals, &ctx)?;

    if options.init_and_quit {
        log::info!(
            target: "node",
            "Corpus initialized with {} mutations; exiting",
            runtime.corpus().read().applied()
        );
        return Ok(());
    }
    runtime.run(ctx, trigger)?;

    Ok(())
}

fn main() {
    if let Err(err) = execute() {
        if log::log_enabled!(target: "node", log::Level::Error) {
            log::error!(target: "node", "Fatal: {err:#}");
        } else {
            eprintln!("Error: {err:#}");
        }
        process::exit(1);
    }
}
