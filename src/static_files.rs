//! Static bundle serving with single-page fallback
//!
//! Any path that does not name a file inside the static root is answered with
//! the root document (`index.html` by default) so client-side routes keep
//! working on reload. A missing root document is reported as an error rather
//! than an empty 200.

use crate::error::{full_body, ResponseBody, StaticFileError};
use crate::mime;
use hyper::body::Bytes;
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::{debug, error, warn};

/// A file resolved from the static root
#[derive(Debug)]
pub struct StaticFile {
    /// Absolute path of the file that was read
    pub path: PathBuf,
    pub content: Bytes,
    pub content_type: &'static str,
    /// True when the root document was served in place of the requested path
    pub fallback: bool,
}

/// Serves files from a fixed directory
#[derive(Debug, Clone)]
pub struct StaticFiles {
    root: PathBuf,
    index_file: String,
}

impl StaticFiles {
    pub fn new(root: impl Into<PathBuf>, index_file: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            index_file: index_file.into(),
        }
    }

    /// Build the response for a request path
    pub async fn serve(&self, request_path: &str, is_head: bool) -> Response<ResponseBody> {
        match self.resolve(request_path).await {
            Ok(file) => {
                debug!(
                    path = request_path,
                    file = %file.path.display(),
                    fallback = file.fallback,
                    bytes = file.content.len(),
                    "Serving static file"
                );
                build_file_response(file, is_head)
            }
            Err(e) => {
                error!(path = request_path, error = %e, "Failed to serve static content");
                e.to_response()
            }
        }
    }

    /// Resolve a request path to a file, falling back to the root document
    pub async fn resolve(&self, request_path: &str) -> Result<StaticFile, StaticFileError> {
        let root = fs::canonicalize(&self.root)
            .await
            .map_err(|source| StaticFileError::RootUnavailable {
                path: self.root.clone(),
                source,
            })?;

        if let Some(path) = self.locate(&root, request_path).await {
            let content = read_file(&path).await?;
            return Ok(StaticFile {
                content_type: mime::content_type_for(&path),
                path,
                content,
                fallback: false,
            });
        }

        let index = root.join(&self.index_file);
        let content = match fs::read(&index).await {
            Ok(content) => Bytes::from(content),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StaticFileError::RootDocumentMissing(index));
            }
            Err(source) => return Err(StaticFileError::Read { path: index, source }),
        };

        Ok(StaticFile {
            content_type: mime::content_type_for(&index),
            path: index,
            content,
            fallback: true,
        })
    }

    /// Find an existing regular file for the request path inside `root`
    async fn locate(&self, root: &Path, request_path: &str) -> Option<PathBuf> {
        let relative = sanitize_path(request_path)?;
        let mut candidate = root.join(relative);

        if fs::metadata(&candidate).await.ok()?.is_dir() {
            candidate.push(&self.index_file);
        }

        // Not found is the common case, it just means fallback
        let canonical = fs::canonicalize(&candidate).await.ok()?;
        if !canonical.starts_with(root) {
            warn!(
                path = request_path,
                resolved = %canonical.display(),
                "Path traversal attempt blocked"
            );
            return None;
        }

        fs::metadata(&canonical)
            .await
            .ok()
            .filter(|m| m.is_file())
            .map(|_| canonical)
    }
}

/// Turn a URI path into a relative filesystem path.
///
/// Returns `None` for paths that cannot name a file in the bundle: invalid
/// percent-encoding, parent-directory segments, or embedded NULs.
pub fn sanitize_path(request_path: &str) -> Option<PathBuf> {
    let decoded = urlencoding::decode(request_path).ok()?;
    if decoded.contains('\0') {
        return None;
    }

    let mut relative = PathBuf::new();
    for component in Path::new(decoded.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    Some(relative)
}

async fn read_file(path: &Path) -> Result<Bytes, StaticFileError> {
    fs::read(path)
        .await
        .map(Bytes::from)
        .map_err(|source| StaticFileError::Read {
            path: path.to_path_buf(),
            source,
        })
}

fn build_file_response(file: StaticFile, is_head: bool) -> Response<ResponseBody> {
    let length = file.content.len();
    let body = if is_head {
        full_body(Bytes::new())
    } else {
        full_body(file.content)
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, file.content_type)
        .header(CONTENT_LENGTH, length)
        .body(body)
        .expect("valid response with static headers")
}
