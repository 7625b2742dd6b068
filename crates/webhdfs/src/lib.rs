//! Minimal async client for the WebHDFS REST API as spoken by HopsFS/HDFS
//! name nodes.
//!
//! Only the operations needed by the mount daemon are implemented: metadata
//! queries, directory listing, streamed reads, streamed creates, and the
//! namespace mutations (mkdir/rename/delete/chown/chmod).

mod client;
mod error;
mod models;

pub use client::{Client, ClientBuilder, FileReader, FileWriter, TlsOptions};
pub use error::WebHdfsError;
pub use models::{ContentSummary, FileStatus, FileType, RemoteException};
