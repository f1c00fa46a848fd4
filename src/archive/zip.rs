use std::{
    fs::File,
    io::{BufReader, Read, Seek, Write},
    path::Path,
};

use zip::{result::ZipError, ZipArchive};

use super::{civil_to_system, DecodeError, Decoder, EntryMeta};

pub struct ZipDecoder<R: Read + Seek + Send> {
    archive: ZipArchive<R>,
    len: u64,
    password: Option<String>,
}

impl ZipDecoder<BufReader<File>> {
    pub fn open(path: &Path, password: Option<&str>) -> Result<Self, DecodeError> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Self::from_reader(BufReader::new(file), len, password)
    }
}

impl<R: Read + Seek + Send> ZipDecoder<R> {
    /// ZIP encryption is per entry, so "encryption required" is detected
    /// here by scanning the central directory, and a supplied password is
    /// verified against the first encrypted entry.
    pub fn from_reader(reader: R, len: u64, password: Option<&str>) -> Result<Self, DecodeError> {
        let mut archive = ZipArchive::new(reader).map_err(map_err)?;
        let mut first_encrypted = None;
        for i in 0..archive.len() {
            if archive.by_index_raw(i).map_err(map_err)?.encrypted() {
                first_encrypted = Some(i);
                break;
            }
        }
        match (first_encrypted, password) {
            (Some(_), None) => return Err(DecodeError::Password),
            (Some(i), Some(password)) => {
                archive
                    .by_index_decrypt(i, password.as_bytes())
                    .map_err(map_err)?;
            }
            (None, _) => {}
        }
        Ok(Self {
            archive,
            len,
            password: password.map(str::to_owned),
        })
    }
}

impl<R: Read + Seek + Send> Decoder for ZipDecoder<R> {
    fn entries(&mut self) -> Result<Vec<EntryMeta>, DecodeError> {
        let mut out = Vec::with_capacity(self.archive.len());
        for i in 0..self.archive.len() {
            let entry = self.archive.by_index_raw(i).map_err(map_err)?;
            let modified = entry.last_modified().and_then(|dt| {
                civil_to_system(
                    dt.year(),
                    dt.month(),
                    dt.day(),
                    dt.hour(),
                    dt.minute(),
                    dt.second(),
                )
            });
            out.push(EntryMeta {
                key: entry.name().to_string(),
                is_dir: entry.is_dir(),
                size: Some(entry.size()),
                modified,
                created: None,
                encrypted: entry.encrypted(),
            });
        }
        Ok(out)
    }

    fn copy_entry(&mut self, index: usize, out: &mut dyn Write) -> Result<u64, DecodeError> {
        let mut entry = match &self.password {
            Some(password) => self
                .archive
                .by_index_decrypt(index, password.as_bytes())
                .map_err(map_err)?,
            None => self.archive.by_index(index).map_err(map_err)?,
        };
        Ok(std::io::copy(&mut entry, out)?)
    }

    fn archive_len(&self) -> u64 {
        self.len
    }
}

fn map_err(err: ZipError) -> DecodeError {
    match err {
        ZipError::InvalidPassword => DecodeError::Password,
        ZipError::UnsupportedArchive(x) if x.contains("Password") => DecodeError::Password,
        ZipError::Io(x) => DecodeError::Io(x),
        other => DecodeError::Format(other.to_string()),
    }
}
