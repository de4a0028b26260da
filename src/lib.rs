//! Serial console concentrator.
//!
//! A graph of typed endpoints (consoles, log files, clients) connected by
//! writer→readers links, fed by a poll-driven I/O engine. Each endpoint
//! owns a bounded ring buffer that overwrites rather than blocks, so a
//! slow subscriber never stalls a console stream.

pub mod conf;
pub mod control;
pub mod engine;
pub mod error;
pub mod lex;
pub mod link;
pub mod lock;
pub mod obj;
pub mod opener;
pub mod registry;
pub mod ring;
pub mod server;
pub mod timestr;

pub use error::{Error, Result};
pub use obj::{Aux, ClientAux, ConsoleAux, Obj, ObjKind};
pub use registry::{ObjId, Registry};
pub use ring::{Drain, Push, Ring, DEFAULT_CAP};
