//! Local filesystem source and sink.
//!
//! Address type `File`, property `path`. A source path may be a file (one
//! part) or a directory (one part per regular file, non-recursive, by name).
//! A sink path is always a directory; it is created on demand.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use ferry_core::address::PATH;
use ferry_core::{DataAddress, StreamFailure, StreamResult};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::PipelineError;
use crate::part::DataPart;
use crate::sink::{DataSink, DataSinkFactory};
use crate::source::{required, DataSource, DataSourceFactory};

pub const FILE_TYPE: &str = "File";

// ── Source ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct FileSourceFactory;

#[async_trait]
impl DataSourceFactory for FileSourceFactory {
    fn supported_type(&self) -> &str {
        FILE_TYPE
    }

    fn validate(&self, address: &DataAddress) -> Result<(), PipelineError> {
        required(address, PATH).map(|_| ())
    }

    async fn create_source(&self, address: &DataAddress) -> StreamResult<Box<dyn DataSource>> {
        let path = PathBuf::from(address.required_property(PATH).map_err(StreamFailure::fatal)?);
        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| StreamFailure::from_io(&format!("stat {}", path.display()), &e))?;

        let files = if metadata.is_dir() {
            list_files(&path).await?
        } else {
            VecDeque::from([path])
        };
        Ok(Box::new(FileSource { files }))
    }
}

async fn list_files(dir: &Path) -> StreamResult<VecDeque<PathBuf>> {
    let context = format!("list {}", dir.display());
    let mut entries = fs::read_dir(dir)
        .await
        .map_err(|e| StreamFailure::from_io(&context, &e))?;
    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| StreamFailure::from_io(&context, &e))?
    {
        let file_type = entry
            .file_type()
            .await
            .map_err(|e| StreamFailure::from_io(&context, &e))?;
        if file_type.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files.into())
}

struct FileSource {
    files: VecDeque<PathBuf>,
}

#[async_trait]
impl DataSource for FileSource {
    async fn next_part(&mut self) -> StreamResult<Option<DataPart>> {
        let Some(path) = self.files.pop_front() else {
            return Ok(None);
        };
        let context = format!("open {}", path.display());
        let file = fs::File::open(&path)
            .await
            .map_err(|e| StreamFailure::from_io(&context, &e))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| StreamFailure::from_io(&context, &e))?
            .len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Some(DataPart::new(name, Some(size), Box::new(file))))
    }
}

// ── Sink ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct FileSinkFactory;

#[async_trait]
impl DataSinkFactory for FileSinkFactory {
    fn supported_type(&self) -> &str {
        FILE_TYPE
    }

    fn validate(&self, address: &DataAddress) -> Result<(), PipelineError> {
        required(address, PATH).map(|_| ())
    }

    async fn create_sink(&self, address: &DataAddress) -> StreamResult<Arc<dyn DataSink>> {
        let dir = PathBuf::from(address.required_property(PATH).map_err(StreamFailure::fatal)?);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StreamFailure::from_io(&format!("create {}", dir.display()), &e))?;
        Ok(Arc::new(FileSink { dir }))
    }
}

struct FileSink {
    dir: PathBuf,
}

impl FileSink {
    /// Target path for a part. Only the final component of the part name is
    /// used so a part can never escape the sink directory.
    fn target(&self, part_name: &str) -> StreamResult<PathBuf> {
        Path::new(part_name)
            .file_name()
            .map(|n| self.dir.join(n))
            .ok_or_else(|| StreamFailure::fatal(format!("invalid part name '{part_name}'")))
    }
}

#[async_trait]
impl DataSink for FileSink {
    async fn write_part(&self, part: DataPart) -> StreamResult<u64> {
        let target = self.target(&part.name)?;
        let context = format!("write {}", target.display());
        let mut file = fs::File::create(&target)
            .await
            .map_err(|e| StreamFailure::from_io(&context, &e))?;
        let mut reader = part.into_reader();
        let written = tokio::io::copy(&mut reader, &mut file)
            .await
            .map_err(|e| StreamFailure::from_io(&context, &e))?;
        file.flush()
            .await
            .map_err(|e| StreamFailure::from_io(&context, &e))?;
        Ok(written)
    }
}
