//! The WebHDFS client proper.
//!
//! All namespace operations go to the name node; reads and creates follow the
//! usual WebHDFS two-step redirect to a data node. The underlying
//! `reqwest::Client` is rebuilt lazily after [`Client::reset_connection`], so
//! a caller can force fresh connections after a suspected name-node failover.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::SinkExt as _;
use parking_lot::Mutex;
use reqwest::{redirect, Method, Response, StatusCode};

use crate::error::WebHdfsError;
use crate::models::{
    BooleanResponse, ContentSummary, ContentSummaryResponse, FileStatus, FileStatusResponse,
    FileStatusesResponse, RedirectResponse, RemoteExceptionResponse,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Percent-encode set for path segments: everything except unreserved chars.
const PATH_ENCODE: &percent_encoding::AsciiSet = &percent_encoding::NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// TLS material for clusters that require mutual TLS (HopsFS).
#[derive(Debug, Clone)]
pub struct TlsOptions {
    pub root_ca_bundle: PathBuf,
    pub client_certificate: PathBuf,
    pub client_key: PathBuf,
}

struct Inner {
    /// `http(s)://namenode:port` without a trailing slash.
    base: String,
    /// Value for the `user.name` query parameter.
    user: Option<String>,
    tls: Option<TlsOptions>,
    /// Lazily (re)built transport. `None` after `reset_connection`.
    http: Mutex<Option<reqwest::Client>>,
}

/// Cheaply clonable handle to one name node endpoint.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

pub struct ClientBuilder {
    base: String,
    user: Option<String>,
    tls: Option<TlsOptions>,
}

impl ClientBuilder {
    /// `user.name` to present to the name node.
    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    #[must_use]
    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn build(self) -> Client {
        Client {
            inner: Arc::new(Inner {
                base: self.base,
                user: self.user,
                tls: self.tls,
                http: Mutex::new(None),
            }),
        }
    }
}

impl Client {
    /// Start building a client for `namenode` (`host:port`).
    pub fn builder(namenode: &str, tls: bool) -> ClientBuilder {
        let scheme = if tls { "https" } else { "http" };
        ClientBuilder {
            base: format!("{scheme}://{namenode}"),
            user: None,
            tls: None,
        }
    }

    /// Drop the current transport; the next request builds a fresh one.
    pub fn reset_connection(&self) {
        *self.inner.http.lock() = None;
    }

    fn transport(&self) -> Result<reqwest::Client, WebHdfsError> {
        let mut guard = self.inner.http.lock();
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            // Redirects are followed by hand so the data-node hop stays visible.
            .redirect(redirect::Policy::none())
            .use_rustls_tls();

        if let Some(tls) = &self.inner.tls {
            let ca = std::fs::read(&tls.root_ca_bundle)
                .map_err(|e| WebHdfsError::Tls(format!("root CA bundle: {e}")))?;
            builder = builder.add_root_certificate(
                reqwest::Certificate::from_pem(&ca)
                    .map_err(|e| WebHdfsError::Tls(format!("root CA bundle: {e}")))?,
            );

            let mut identity = std::fs::read(&tls.client_certificate)
                .map_err(|e| WebHdfsError::Tls(format!("client certificate: {e}")))?;
            let key = std::fs::read(&tls.client_key)
                .map_err(|e| WebHdfsError::Tls(format!("client key: {e}")))?;
            identity.extend_from_slice(&key);
            builder = builder.identity(
                reqwest::Identity::from_pem(&identity)
                    .map_err(|e| WebHdfsError::Tls(format!("client identity: {e}")))?,
            );
        }

        let client = builder.build()?;
        *guard = Some(client.clone());
        Ok(client)
    }

    fn url(&self, path: &str, op: &str, params: &[(&str, String)]) -> String {
        let normalized = if path.starts_with('/') {
            path.to_owned()
        } else {
            format!("/{path}")
        };
        let encoded = percent_encoding::utf8_percent_encode(&normalized, PATH_ENCODE);
        let mut url = format!("{}/webhdfs/v1{}?op={}", self.inner.base, encoded, op);
        if let Some(user) = &self.inner.user {
            url.push_str("&user.name=");
            url.push_str(user);
        }
        for (k, v) in params {
            url.push('&');
            url.push_str(k);
            url.push('=');
            url.push_str(v);
        }
        url
    }

    /// Issue `method` and surface a `RemoteException` body as an error.
    async fn request(
        &self,
        op: &'static str,
        method: Method,
        url: String,
    ) -> Result<Response, WebHdfsError> {
        let resp = self.transport()?.request(method, url).send().await?;
        Self::check_status(op, resp).await
    }

    async fn check_status(op: &'static str, resp: Response) -> Result<Response, WebHdfsError> {
        let status = resp.status();
        if status.is_success() || status.is_redirection() {
            return Ok(resp);
        }
        match resp.json::<RemoteExceptionResponse>().await {
            Ok(body) => Err(WebHdfsError::Remote {
                status: status.as_u16(),
                exception: body.remote_exception,
            }),
            Err(_) => Err(WebHdfsError::UnexpectedStatus {
                op,
                status: status.as_u16(),
            }),
        }
    }

    /// Follow a single 307 hop to the data node, if the server issued one.
    async fn follow_redirect(
        &self,
        op: &'static str,
        method: Method,
        resp: Response,
    ) -> Result<Response, WebHdfsError> {
        if !resp.status().is_redirection() {
            return Ok(resp);
        }
        let location = resp
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(WebHdfsError::MissingRedirect(op))?
            .to_owned();
        let next = self.transport()?.request(method, location).send().await?;
        Self::check_status(op, next).await
    }

    pub async fn file_status(&self, path: &str) -> Result<FileStatus, WebHdfsError> {
        let url = self.url(path, "GETFILESTATUS", &[]);
        let resp = self.request("GETFILESTATUS", Method::GET, url).await?;
        let body: FileStatusResponse = resp.json().await?;
        Ok(body.file_status)
    }

    pub async fn list_status(&self, path: &str) -> Result<Vec<FileStatus>, WebHdfsError> {
        let url = self.url(path, "LISTSTATUS", &[]);
        let resp = self.request("LISTSTATUS", Method::GET, url).await?;
        let body: FileStatusesResponse = resp.json().await?;
        Ok(body.file_statuses.file_status)
    }

    pub async fn content_summary(&self, path: &str) -> Result<ContentSummary, WebHdfsError> {
        let url = self.url(path, "GETCONTENTSUMMARY", &[]);
        let resp = self.request("GETCONTENTSUMMARY", Method::GET, url).await?;
        let body: ContentSummaryResponse = resp.json().await?;
        Ok(body.content_summary)
    }

    pub async fn mkdirs(&self, path: &str, permission: u32) -> Result<(), WebHdfsError> {
        let url = self.url(
            path,
            "MKDIRS",
            &[("permission", format!("{permission:o}"))],
        );
        let resp = self.request("MKDIRS", Method::PUT, url).await?;
        let body: BooleanResponse = resp.json().await?;
        if body.boolean {
            Ok(())
        } else {
            Err(WebHdfsError::NotPerformed("MKDIRS"))
        }
    }

    /// `recursive=true`; HDFS deletes files and directories alike.
    pub async fn delete(&self, path: &str) -> Result<(), WebHdfsError> {
        let url = self.url(path, "DELETE", &[("recursive", "true".into())]);
        let resp = self.request("DELETE", Method::DELETE, url).await?;
        let body: BooleanResponse = resp.json().await?;
        if body.boolean {
            Ok(())
        } else {
            Err(WebHdfsError::NotPerformed("DELETE"))
        }
    }

    /// Plain WebHDFS rename: refuses to clobber an existing destination
    /// (the name node answers `false`).
    pub async fn rename(&self, src: &str, dst: &str) -> Result<bool, WebHdfsError> {
        let url = self.url(src, "RENAME", &[("destination", dst.to_owned())]);
        let resp = self.request("RENAME", Method::PUT, url).await?;
        let body: BooleanResponse = resp.json().await?;
        Ok(body.boolean)
    }

    pub async fn set_owner(&self, path: &str, owner: &str, group: &str) -> Result<(), WebHdfsError> {
        let url = self.url(
            path,
            "SETOWNER",
            &[("owner", owner.to_owned()), ("group", group.to_owned())],
        );
        self.request("SETOWNER", Method::PUT, url).await?;
        Ok(())
    }

    pub async fn set_permission(&self, path: &str, permission: u32) -> Result<(), WebHdfsError> {
        let url = self.url(
            path,
            "SETPERMISSION",
            &[("permission", format!("{permission:o}"))],
        );
        self.request("SETPERMISSION", Method::PUT, url).await?;
        Ok(())
    }

    /// Open a streaming reader positioned at `offset`.
    pub fn open(&self, path: &str, offset: u64) -> FileReader {
        FileReader {
            client: self.clone(),
            path: path.to_owned(),
            pos: offset,
            resp: None,
            leftover: Bytes::new(),
        }
    }

    /// Create `path` and return a streaming writer for its content.
    pub async fn create(
        &self,
        path: &str,
        permission: u32,
        overwrite: bool,
    ) -> Result<FileWriter, WebHdfsError> {
        let url = self.url(
            path,
            "CREATE",
            &[
                ("overwrite", overwrite.to_string()),
                ("permission", format!("{permission:o}")),
                ("noredirect", "true".into()),
            ],
        );
        let resp = self.request("CREATE", Method::PUT, url).await?;

        // Either a 307 with a Location header or a JSON {"Location": ...}.
        let location = if resp.status().is_redirection() {
            resp.headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or(WebHdfsError::MissingRedirect("CREATE"))?
                .to_owned()
        } else {
            resp.json::<RedirectResponse>().await?.location
        };

        let (tx, rx) = futures_channel::mpsc::channel::<Result<Bytes, std::io::Error>>(16);
        let transport = self.transport()?;
        let upload = tokio::spawn(async move {
            let resp = transport
                .put(location)
                .body(reqwest::Body::wrap_stream(rx))
                .send()
                .await?;
            let status = resp.status();
            if status == StatusCode::CREATED || status.is_success() {
                Ok(())
            } else {
                Self::check_status("CREATE", resp).await.map(|_| ())
            }
        });

        Ok(FileWriter {
            tx: Some(tx),
            upload: Some(upload),
        })
    }
}

/// Seekable streaming reader over one remote file.
///
/// A seek simply drops the current data-node stream; the next read reopens at
/// the tracked position.
pub struct FileReader {
    client: Client,
    path: String,
    pos: u64,
    resp: Option<Response>,
    leftover: Bytes,
}

impl FileReader {
    pub fn position(&self) -> u64 {
        self.pos
    }

    pub async fn seek(&mut self, pos: u64) -> Result<(), WebHdfsError> {
        if pos != self.pos || self.resp.is_none() {
            self.resp = None;
            self.leftover = Bytes::new();
            self.pos = pos;
        }
        Ok(())
    }

    /// Read into `buf`, returning 0 at end of file.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, WebHdfsError> {
        if buf.is_empty() {
            return Ok(0);
        }

        if self.leftover.is_empty() {
            if self.resp.is_none() {
                let url = self
                    .client
                    .url(&self.path, "OPEN", &[("offset", self.pos.to_string())]);
                let resp = self.client.request("OPEN", Method::GET, url).await?;
                let resp = self.client.follow_redirect("OPEN", Method::GET, resp).await?;
                self.resp = Some(resp);
            }
            let resp = self.resp.as_mut().unwrap_or_else(|| unreachable!());
            match resp.chunk().await? {
                Some(chunk) => self.leftover = chunk,
                None => return Ok(0), // EOF
            }
        }

        let n = self.leftover.len().min(buf.len());
        buf[..n].copy_from_slice(&self.leftover[..n]);
        self.leftover = self.leftover.slice(n..);
        self.pos += n as u64;
        Ok(n)
    }

    pub fn close(&mut self) {
        self.resp = None;
        self.leftover = Bytes::new();
    }
}

/// Streaming writer for a file being created.
///
/// Chunks are forwarded to the data node as they are written; `close`
/// finishes the upload and surfaces its final status.
pub struct FileWriter {
    tx: Option<futures_channel::mpsc::Sender<Result<Bytes, std::io::Error>>>,
    upload: Option<tokio::task::JoinHandle<Result<(), WebHdfsError>>>,
}

impl FileWriter {
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, WebHdfsError> {
        let tx = self.tx.as_mut().ok_or(WebHdfsError::UploadAborted)?;
        tx.send(Ok(Bytes::copy_from_slice(buf)))
            .await
            .map_err(|_| WebHdfsError::UploadAborted)?;
        Ok(buf.len())
    }

    pub async fn close(&mut self) -> Result<(), WebHdfsError> {
        // Dropping the sender ends the body stream.
        self.tx = None;
        match self.upload.take() {
            Some(handle) => handle.await.map_err(|_| WebHdfsError::UploadAborted)?,
            None => Ok(()),
        }
    }
}

impl Drop for FileWriter {
    fn drop(&mut self) {
        if let Some(handle) = self.upload.take() {
            handle.abort();
        }
    }
}
