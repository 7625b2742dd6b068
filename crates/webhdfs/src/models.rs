//! Wire models for the WebHDFS JSON envelopes.

use serde::Deserialize;

/// Entry type reported in a `FileStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileType {
    File,
    Directory,
    Symlink,
}

/// A single `FileStatus` object.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStatus {
    /// Inode id assigned by the name node. Absent on very old servers.
    #[serde(default)]
    pub file_id: u64,
    /// Base name of the entry. Empty for `GETFILESTATUS` on the path itself.
    pub path_suffix: String,
    #[serde(rename = "type")]
    pub file_type: FileType,
    pub length: u64,
    /// Octal permission string, e.g. `"644"`.
    pub permission: String,
    pub owner: String,
    pub group: String,
    /// Milliseconds since the epoch.
    pub modification_time: u64,
    /// Milliseconds since the epoch.
    pub access_time: u64,
    #[serde(default)]
    pub block_size: u64,
    #[serde(default)]
    pub replication: u32,
}

impl FileStatus {
    /// Permission string parsed into mode bits.
    pub fn mode(&self) -> u32 {
        u32::from_str_radix(&self.permission, 8).unwrap_or(0o644)
    }

    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FileStatusResponse {
    pub file_status: FileStatus,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FileStatusesResponse {
    pub file_statuses: FileStatuses,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FileStatuses {
    pub file_status: Vec<FileStatus>,
}

/// `GETCONTENTSUMMARY` payload. Quotas are -1 when unset.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentSummary {
    pub directory_count: u64,
    pub file_count: u64,
    pub length: u64,
    pub quota: i64,
    pub space_consumed: u64,
    pub space_quota: i64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContentSummaryResponse {
    pub content_summary: ContentSummary,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BooleanResponse {
    pub boolean: bool,
}

/// Serialized Java exception returned on failure.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteException {
    pub exception: String,
    #[serde(default)]
    pub java_class_name: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RemoteExceptionResponse {
    pub remote_exception: RemoteException,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedirectResponse {
    #[serde(rename = "Location")]
    pub location: String,
}
