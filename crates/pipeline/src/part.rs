use std::fmt;
use std::io::Cursor;

use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest buffer [`DataPart::read_all`] reserves up front.
pub const PREALLOC_LIMIT: usize = 1024 * 1024;

/// One named unit of a transfer (a file, an object, an HTTP body).
pub struct DataPart {
    pub name: String,
    /// Size in bytes when known up front.
    pub size: Option<u64>,
    reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl DataPart {
    pub fn new(
        name: impl Into<String>,
        size: Option<u64>,
        reader: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Self {
        DataPart {
            name: name.into(),
            size,
            reader,
        }
    }

    pub fn from_bytes(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let size = bytes.len() as u64;
        Self::new(name, Some(size), Box::new(Cursor::new(bytes)))
    }

    pub fn reader(&mut self) -> &mut (dyn AsyncRead + Send + Unpin) {
        self.reader.as_mut()
    }

    pub fn into_reader(self) -> Box<dyn AsyncRead + Send + Unpin> {
        self.reader
    }

    /// Read the whole part into memory.
    ///
    /// The declared size only seeds the buffer up to [`PREALLOC_LIMIT`].
    pub async fn read_all(&mut self) -> std::io::Result<Vec<u8>> {
        let hint = self.size.unwrap_or(0).min(PREALLOC_LIMIT as u64) as usize;
        let mut buf = Vec::with_capacity(hint);
        self.reader.read_to_end(&mut buf).await?;
        Ok(buf)
    }
}

impl fmt::Debug for DataPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataPart")
            .field("name", &self.name)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}
