//! Server configuration: defaults, the config-file parser, and the `-k`
//! kill path.
//!
//! Directive errors are reported as `ERROR: <file>:<line>: <reason>.` and
//! the parser resynchronizes at the next end of line; startup only fails
//! outright when errors occurred and no valid console survived. The config
//! file's handle is kept open for the daemon's lifetime because it carries
//! the single-instance read lock.

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use crate::lex::{Keyword, Lexer, Tok};
use crate::link;
use crate::lock;
use crate::obj::{open_obj, Obj, ObjKind};
use crate::opener::{Opener, SUPPORTED_BAUD};
use crate::registry::Registry;
use crate::{Error, Result};

pub const DEFAULT_CONF: &str = "/etc/conmux.conf";
pub const DEFAULT_PORT: u16 = 7890;
pub const DEFAULT_BAUD: u32 = 9600;

pub struct ServerConf {
    pub filename: PathBuf,
    /// Zero means "not yet set"; resolved after the config file is parsed
    /// (command line beats config file beats the built-in default).
    pub port: u16,
    pub keepalive: bool,
    pub loopback: bool,
    pub zero_logs: bool,
    pub verbose: bool,
    /// Clients idle longer than this are closed; `None` disables the sweep.
    pub idle_timeout: Option<Duration>,
    lock_file: Option<File>,
}

impl ServerConf {
    pub fn new() -> Self {
        Self {
            filename: PathBuf::from(DEFAULT_CONF),
            port: 0,
            keepalive: true,
            loopback: false,
            zero_logs: false,
            verbose: false,
            idle_timeout: None,
            lock_file: None,
        }
    }
}

impl Default for ServerConf {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses the configuration file, creating console and log-file objects
/// in `reg`, and leaves the single-instance read lock held.
pub fn process_conf_file(
    conf: &mut ServerConf,
    reg: &mut Registry,
    opener: &dyn Opener,
) -> Result<()> {
    let saved_port = conf.port;
    let display = conf.filename.display().to_string();

    let mut file = File::open(&conf.filename)
        .map_err(|err| Error::Config(format!("unable to open \"{display}\": {err}")))?;
    if let Some(pid) = lock::write_lock_holder(&file)? {
        return Err(Error::Config(format!(
            "configuration \"{display}\" in use by pid {pid}"
        )));
    }
    if !lock::acquire_read_lock(&file)? {
        return Err(Error::Config(format!(
            "unable to lock configuration \"{display}\""
        )));
    }

    let mut text = String::new();
    file.read_to_string(&mut text)
        .map_err(|err| Error::Config(format!("unable to read \"{display}\": {err}")))?;

    let mut lexer = Lexer::new(&text);
    let mut errors = 0usize;
    loop {
        match lexer.next() {
            Tok::Key(Keyword::Console) => {
                parse_console_directive(&mut lexer, conf, reg, opener, &mut errors)
            }
            Tok::Key(Keyword::Server) => {
                parse_server_directive(&mut lexer, conf, &mut errors)
            }
            Tok::Eol => continue,
            Tok::Eof => break,
            Tok::Err(msg) => {
                report(conf, lexer.line(), msg, &mut errors);
                resync(&mut lexer);
            }
            other => {
                report(
                    conf,
                    lexer.line(),
                    &format!("unrecognized token '{}'", tok_text(&other)),
                    &mut errors,
                );
                resync(&mut lexer);
            }
        }
    }

    conf.lock_file = Some(file);

    if saved_port > 0 {
        conf.port = saved_port;
    } else if conf.port == 0 {
        conf.port = DEFAULT_PORT;
    }

    let consoles = reg
        .iter()
        .filter(|(_, obj)| obj.kind() == ObjKind::Console)
        .count();
    if errors > 0 && consoles == 0 {
        return Err(Error::Config(
            "no valid console directives remain".to_string(),
        ));
    }
    Ok(())
}

/// `CONSOLE NAME="<str>" DEV="<str>" [LOG=<str>] [RST=<str>] [BPS=<int>]`
fn parse_console_directive(
    lexer: &mut Lexer<'_>,
    conf: &ServerConf,
    reg: &mut Registry,
    opener: &dyn Opener,
    errors: &mut usize,
) {
    let mut err: Option<String> = None;
    let mut done = false;
    let mut name = String::new();
    let mut dev = String::new();
    let mut log = String::new();
    let mut rst = String::new();
    let mut bps = DEFAULT_BAUD;

    while !done && err.is_none() {
        match lexer.next() {
            Tok::Key(Keyword::Name) => match eq_then_str(lexer, Keyword::Name) {
                Ok(value) => name = value,
                Err(reason) => err = Some(reason),
            },
            Tok::Key(Keyword::Dev) => match eq_then_str(lexer, Keyword::Dev) {
                Ok(value) => dev = value,
                Err(reason) => err = Some(reason),
            },
            Tok::Key(Keyword::Log) => match eq_then_str(lexer, Keyword::Log) {
                Ok(value) => log = value,
                Err(reason) => err = Some(reason),
            },
            Tok::Key(Keyword::Rst) => match eq_then_str(lexer, Keyword::Rst) {
                Ok(value) => rst = value,
                Err(reason) => err = Some(reason),
            },
            Tok::Key(Keyword::Bps) => match eq_then_int(lexer, Keyword::Bps) {
                Ok(value) => {
                    if value > 0 && SUPPORTED_BAUD.contains(&(value as u32)) {
                        bps = value as u32;
                    } else {
                        err = Some(format!("invalid BPS value {value}"));
                    }
                }
                Err(reason) => err = Some(reason),
            },
            Tok::Eol | Tok::Eof => done = true,
            Tok::Err(msg) => err = Some(msg.to_string()),
            other => err = Some(format!("unrecognized token '{}'", tok_text(&other))),
        }
    }

    if err.is_none() && (name.is_empty() || dev.is_empty()) {
        err = Some("incomplete CONSOLE directive".to_string());
    }
    if let Some(reason) = err {
        report(conf, lexer.line(), &reason, errors);
        resync(lexer);
        return;
    }

    let rst = if rst.is_empty() { None } else { Some(rst) };
    let console = match reg.insert(Obj::console(&name, &dev, bps, rst)) {
        Ok(id) => id,
        Err(err) => {
            log::warn!("Console [{name}] removed from the configuration: {err}");
            return;
        }
    };
    if let Err(err) = open_obj(reg, console, opener, conf.zero_logs) {
        log::warn!("Console [{name}] removed from the configuration: {err}");
        reg.remove(console);
        return;
    }

    if !log.is_empty() {
        match reg.insert(Obj::logfile(&log)) {
            Ok(logfile) => {
                if let Err(err) = link::attach(reg, console, logfile, opener, conf.zero_logs) {
                    log::warn!("Console [{name}] cannot be logged to \"{log}\": {err}");
                    reg.remove(logfile);
                }
            }
            Err(err) => {
                log::warn!("Console [{name}] cannot be logged to \"{log}\": {err}");
            }
        }
    }
}

/// `SERVER KEEPALIVE={ON|OFF} | LOOPBACK={ON|OFF} | PORT=<int> | ...`
fn parse_server_directive(lexer: &mut Lexer<'_>, conf: &mut ServerConf, errors: &mut usize) {
    let mut err: Option<String> = None;
    let mut done = false;

    while !done && err.is_none() {
        match lexer.next() {
            Tok::Key(Keyword::Keepalive) => match eq_then_on_off(lexer, Keyword::Keepalive) {
                Ok(value) => conf.keepalive = value,
                Err(reason) => err = Some(reason),
            },
            Tok::Key(Keyword::Loopback) => match eq_then_on_off(lexer, Keyword::Loopback) {
                Ok(value) => conf.loopback = value,
                Err(reason) => err = Some(reason),
            },
            Tok::Key(Keyword::Port) => match eq_then_int(lexer, Keyword::Port) {
                Ok(value) => {
                    if value > 0 && value <= i64::from(u16::MAX) {
                        conf.port = value as u16;
                    } else {
                        err = Some(format!("invalid PORT value {value}"));
                    }
                }
                Err(reason) => err = Some(reason),
            },
            Tok::Key(key @ (Keyword::Logfile | Keyword::Pidfile | Keyword::Timestamp)) => {
                err = Some(match lexer.next() {
                    Tok::Eq => format!("{} keyword not yet implemented", key.as_str()),
                    _ => format!("expected '=' after {} keyword", key.as_str()),
                });
            }
            Tok::Eol | Tok::Eof => done = true,
            Tok::Err(msg) => err = Some(msg.to_string()),
            other => err = Some(format!("unrecognized token '{}'", tok_text(&other))),
        }
    }

    if let Some(reason) = err {
        report(conf, lexer.line(), &reason, errors);
        resync(lexer);
    }
}

/// Finds the daemon holding the config's read lock and SIGTERMs it.
pub fn kill_daemon(conf: &ServerConf) -> Result<()> {
    let display = conf.filename.display().to_string();
    let file = File::open(&conf.filename)
        .map_err(|err| Error::Config(format!("unable to open \"{display}\": {err}")))?;

    match lock::write_lock_holder(&file)? {
        None => {
            if conf.verbose {
                println!("Configuration \"{display}\" is not active.");
            }
        }
        Some(pid) => {
            if unsafe { libc::kill(pid, libc::SIGTERM) } < 0 {
                return Err(Error::Config(format!(
                    "unable to send SIGTERM to pid {pid}: {}",
                    std::io::Error::last_os_error()
                )));
            }
            if conf.verbose {
                println!("Configuration \"{display}\" (pid {pid}) terminated.");
            }
        }
    }
    Ok(())
}

fn eq_then_str(lexer: &mut Lexer<'_>, key: Keyword) -> std::result::Result<String, String> {
    if lexer.next() != Tok::Eq {
        return Err(format!("expected '=' after {} keyword", key.as_str()));
    }
    match lexer.next() {
        Tok::Str(value) => Ok(value),
        Tok::Err(msg) => Err(msg.to_string()),
        _ => Err(format!("expected STRING for {} value", key.as_str())),
    }
}

fn eq_then_int(lexer: &mut Lexer<'_>, key: Keyword) -> std::result::Result<i64, String> {
    if lexer.next() != Tok::Eq {
        return Err(format!("expected '=' after {} keyword", key.as_str()));
    }
    match lexer.next() {
        Tok::Int(value) => Ok(value),
        Tok::Str(text) => text
            .parse::<i64>()
            .map_err(|_| format!("expected INTEGER for {} value", key.as_str())),
        Tok::Err(msg) => Err(msg.to_string()),
        _ => Err(format!("expected INTEGER for {} value", key.as_str())),
    }
}

fn eq_then_on_off(lexer: &mut Lexer<'_>, key: Keyword) -> std::result::Result<bool, String> {
    if lexer.next() != Tok::Eq {
        return Err(format!("expected '=' after {} keyword", key.as_str()));
    }
    match lexer.next() {
        Tok::Key(Keyword::On) => Ok(true),
        Tok::Key(Keyword::Off) => Ok(false),
        Tok::Err(msg) => Err(msg.to_string()),
        _ => Err(format!("expected ON or OFF for {} value", key.as_str())),
    }
}

fn tok_text(tok: &Tok) -> String {
    match tok {
        Tok::Key(key) => key.as_str().to_string(),
        Tok::Str(text) => text.clone(),
        Tok::Int(value) => value.to_string(),
        Tok::Eq => "=".to_string(),
        Tok::Eol => "<eol>".to_string(),
        Tok::Eof => "<eof>".to_string(),
        Tok::Err(msg) => (*msg).to_string(),
    }
}

fn report(conf: &ServerConf, line: usize, reason: &str, errors: &mut usize) {
    eprintln!("ERROR: {}:{}: {}.", conf.filename.display(), line, reason);
    *errors += 1;
}

fn resync(lexer: &mut Lexer<'_>) {
    while !matches!(lexer.prev(), Tok::Eol | Tok::Eof) {
        lexer.next();
    }
}
