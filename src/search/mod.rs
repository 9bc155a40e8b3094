//! Stateful continuation protocols built on the client pipeline: simple
//! paging, VLV windowing, DirSync and SyncRepl. Each is a cursor owning its
//! cookie/offset state; only the cursor's own advance operation mutates it.

mod dirsync;
mod paging;
mod syncrepl;
mod vlv;

pub use dirsync::DirSync;
pub use paging::Paging;
pub use syncrepl::{CookieHandler, SyncEntry, SyncHandler, SyncPoll, SyncRepl};
pub use vlv::Vlv;
