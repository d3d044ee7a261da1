use std::io;
use std::path::{Component, Path, PathBuf};
use std::task::Poll;

use super::Handler;
use crate::buf::{Buf, File, FileRegion, Flags};
use crate::error::Error;
use crate::log::{debug, warning};
use crate::request::Request;
use crate::response::{ResponseHead, StatusCode};

/// Serves files below a root directory.
///
/// The body is sent from the file, it is never copied into memory.
#[derive(Debug, Clone)]
pub struct Static {
    root: PathBuf,
    prefix: String,
}

impl Static {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), prefix: String::new() }
    }

    /// Strip `prefix` from the request path before resolving it.
    pub fn strip_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// File path of request `path`, `None` if it escapes the root.
    fn resolve(&self, path: &str) -> Option<PathBuf> {
        let path = path.strip_prefix(self.prefix.as_str()).unwrap_or(path);
        let relative = Path::new(path.trim_start_matches('/'));
        if relative.components().any(|c| !matches!(c, Component::Normal(_))) {
            return None;
        }
        let mut full = self.root.join(relative);
        if path.is_empty() || path.ends_with('/') {
            full.push("index.html");
        }
        Some(full)
    }
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html" | "htm") => "text/html",
        Some("txt") => "text/plain",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

impl Handler for Static {
    fn handle(&mut self, req: &mut Request<'_>) -> Poll<Result<StatusCode, Error>> {
        let Some(path) = self.resolve(req.path()) else {
            return Poll::Ready(Ok(StatusCode::NOT_FOUND));
        };
        if path.is_dir() {
            return Poll::Ready(Ok(StatusCode::NOT_FOUND));
        }

        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) => {
                let status = match err.kind() {
                    io::ErrorKind::NotFound => StatusCode::NOT_FOUND,
                    io::ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
                    _ => {
                        warning!("open {path:?}: {err}");
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                debug!("open {path:?}: {err}");
                return Poll::Ready(Ok(status));
            }
        };

        let head = ResponseHead::new(StatusCode::OK)
            .header("Content-Type", content_type(&path))
            .content_length(file.len());
        req.send_header(head)?;

        let buf = match file.is_empty() {
            true => Buf::sentinel(Flags::LAST),
            false => Buf::from_file(FileRegion::whole(file)).with_flags(Flags::LAST),
        };
        let chain = req.pool().chain_from([buf])?;
        if let Poll::Ready(Err(err)) = req.submit(chain) {
            return Poll::Ready(Err(err));
        }
        Poll::Ready(Ok(StatusCode::OK))
    }
}
