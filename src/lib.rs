//! delegtrace core library: NFSv4 delegation scenarios, wire-trace replay, and verification.

#[path = "runtime/actor.rs"]
mod actor;
#[path = "verify/basic.rs"]
mod basic;
#[path = "runtime/capture.rs"]
mod capture;
#[path = "runtime/clock.rs"]
mod clock;
#[path = "platform/config.rs"]
mod config;
#[path = "runtime/cursor.rs"]
mod cursor;
#[path = "platform/duration.rs"]
mod duration;
#[path = "runtime/engine.rs"]
mod engine;
#[path = "platform/envinfo.rs"]
mod envinfo;
#[path = "platform/error.rs"]
mod error;
#[path = "runtime/exec.rs"]
mod exec;
#[path = "model/filter.rs"]
mod filter;
#[path = "verify/grant.rs"]
mod grant;
#[path = "verify/io.rs"]
mod io;
#[path = "model/nfs.rs"]
mod nfs;
#[path = "verify/recall.rs"]
mod recall;
#[path = "model/reporting.rs"]
mod reporting;
#[path = "model/scenario.rs"]
mod scenario;
#[path = "runtime/tracefile.rs"]
mod tracefile;

pub use actor::*;
pub use basic::*;
pub use capture::*;
pub use clock::*;
pub use config::*;
pub use cursor::*;
pub use duration::*;
pub use engine::*;
pub use envinfo::*;
pub use error::*;
pub use exec::*;
pub use filter::*;
pub use grant::*;
pub use io::*;
pub use nfs::*;
pub use recall::*;
pub use reporting::*;
pub use scenario::*;
pub use tracefile::*;
