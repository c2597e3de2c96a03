use std::{
    fs::File,
    io::{BufReader, Read},
    path::PathBuf,
};

use super::DataSource;

pub struct FileSource {
    pub path: PathBuf,
}

impl FileSource {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl DataSource for FileSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn open(&self) -> Result<Box<dyn Read + Send>, std::io::Error> {
        let file = File::open(&self.path)?;
        Ok(Box::new(BufReader::new(file)))
    }

    fn size(&self) -> Result<Option<u64>, std::io::Error> {
        Ok(Some(std::fs::metadata(&self.path)?.len()))
    }
}
