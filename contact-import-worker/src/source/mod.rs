use std::io::Read;

pub mod file;

/// Where the bytes of an import come from. Readers are blocking, the decoder runs
/// on a blocking thread.
pub trait DataSource: Send + Sync {
    /// Human readable name, for logs and status messages
    fn describe(&self) -> String;

    fn open(&self) -> Result<Box<dyn Read + Send>, std::io::Error>;

    /// Size in bytes, when the source knows it up front
    fn size(&self) -> Result<Option<u64>, std::io::Error>;
}
