use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio_util::io::ReaderStream;
use tracing::debug;

use loom_core::errors::SourceError;
use loom_core::source::{ElementRequest, ElementSource, ElementStream};

use crate::ndjson::NdjsonStream;

/// Replays a recorded NDJSON element stream from disk. Every `open`
/// starts from the beginning of the file.
pub struct ReplaySource {
    path: PathBuf,
}

impl ReplaySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ElementSource for ReplaySource {
    fn name(&self) -> &str {
        "replay"
    }

    async fn open(&self, request: &ElementRequest) -> Result<ElementStream, SourceError> {
        let file = tokio::fs::File::open(&self.path)
            .await
            .map_err(|e| SourceError::Io(format!("{}: {e}", self.path.display())))?;
        debug!(path = %self.path.display(), thread_id = %request.thread_id, "replaying element stream");
        Ok(Box::pin(NdjsonStream::new(ReaderStream::new(file))))
    }
}
