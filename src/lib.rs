#![cfg_attr(not(test), no_std)]
#![cfg_attr(feature = "strict", deny(warnings))]
extern crate alloc;

pub mod filesys;
pub mod logging;

pub mod prelude {
    pub use crate::filesys::fat::{
        Client, DirEntry, FatType, Filesystem, Origin, Outcome, Record, ShortName, Volume,
    };
    pub use crate::filesys::{BlockDevice, Channel, Completion, Flow, FsError, Transfer};
}
