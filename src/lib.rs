//! Mount a HopsFS/HDFS namespace as a local POSIX filesystem.
//!
//! The crate is split along the mediation path: [`fuse`] adapts kernel
//! requests onto the async core, [`fs`] holds the inode tree, handle state
//! machine and fault-tolerant DFS plumbing, and the `webhdfs` workspace
//! crate speaks the wire protocol.

pub mod config;
pub mod fs;
pub mod fuse;
pub mod logging;
