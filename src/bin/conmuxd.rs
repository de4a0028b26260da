use std::path::PathBuf;
use std::process::exit;

use clap::error::ErrorKind;
use clap::Parser;

use conmux::conf::{self, ServerConf};
use conmux::opener::TtyOpener;
use conmux::server::Server;
use conmux::{Registry, Result};

#[derive(Parser)]
#[command(
    name = "conmuxd",
    about = "Serial console concentrator daemon",
    disable_version_flag = true
)]
struct Cli {
    /// Specify alternate configuration file
    #[arg(short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Kill daemon running with specified configuration
    #[arg(short = 'k')]
    kill: bool,

    /// Specify alternate port number
    #[arg(short = 'p', value_name = "PORT")]
    port: Option<String>,

    /// Be verbose
    #[arg(short = 'v')]
    verbose: bool,

    /// Display version information
    #[arg(short = 'V')]
    version: bool,

    /// Zero console log files
    #[arg(short = 'z')]
    zero_logs: bool,
}

fn main() {
    env_logger::init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if err.kind() == ErrorKind::DisplayHelp => {
            print!("{err}");
            return;
        }
        Err(err) => {
            eprintln!("ERROR: {err}");
            exit(1);
        }
    };

    if cli.version {
        println!("{}-{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        return;
    }

    let mut conf = ServerConf::new();
    if let Some(file) = cli.config {
        conf.filename = file;
    }
    conf.verbose = cli.verbose;
    conf.zero_logs = cli.zero_logs;
    if let Some(port) = cli.port {
        match port.parse::<u16>() {
            Ok(n) if n > 0 => conf.port = n,
            _ => eprintln!("WARNING: Ignoring invalid port \"{port}\"."),
        }
    }

    if cli.kill {
        if let Err(err) = conf::kill_daemon(&conf) {
            eprintln!("ERROR: {err}.");
            exit(1);
        }
        return;
    }

    if let Err(err) = run(conf) {
        eprintln!("ERROR: {err}.");
        exit(1);
    }
}

fn run(mut conf: ServerConf) -> Result<()> {
    let mut reg = Registry::new();
    conf::process_conf_file(&mut conf, &mut reg, &TtyOpener)?;
    let mut server = Server::new(conf, reg)?;
    server.run()
}
