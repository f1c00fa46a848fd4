use std::{io::Write, path::Path, path::PathBuf};

use unrar::{error::Code, error::UnrarError, Archive};

use super::{civil_to_system, DecodeError, Decoder, EntryMeta};

/// The unrar cursor is forward-only and consumed by iteration, so each
/// copy reopens the archive and walks to the requested entry. Entry
/// indices follow listing order, which is also processing order.
pub struct RarDecoder {
    path: PathBuf,
    password: Option<String>,
    len: u64,
}

impl RarDecoder {
    pub fn open(path: &Path, password: Option<&str>) -> Result<Self, DecodeError> {
        let len = std::fs::metadata(path)?.len();
        let decoder = Self {
            path: path.to_path_buf(),
            password: password.map(str::to_owned),
            len,
        };
        // surfaces missing-password for header-encrypted archives
        decoder.archive().open_for_listing().map_err(map_err)?;
        Ok(decoder)
    }

    fn archive(&self) -> Archive {
        match &self.password {
            Some(p) => Archive::with_password(&self.path, p.as_str()),
            None => Archive::new(&self.path),
        }
    }
}

impl Decoder for RarDecoder {
    fn entries(&mut self) -> Result<Vec<EntryMeta>, DecodeError> {
        let mut out = Vec::new();
        for header in self.archive().open_for_listing().map_err(map_err)? {
            let header = header.map_err(map_err)?;
            let time = header.file_time;
            out.push(EntryMeta {
                key: header.filename.to_string_lossy().into_owned(),
                is_dir: header.is_directory(),
                size: Some(u64::try_from(header.unpacked_size).unwrap_or(u64::MAX)),
                modified: civil_to_system(
                    (time >> 25) as u16 + 1980,
                    ((time >> 21) & 0x0f) as u8,
                    ((time >> 16) & 0x1f) as u8,
                    ((time >> 11) & 0x1f) as u8,
                    ((time >> 5) & 0x3f) as u8,
                    ((time & 0x1f) * 2) as u8,
                ),
                created: None,
                encrypted: false,
            });
        }
        Ok(out)
    }

    fn copy_entry(&mut self, index: usize, out: &mut dyn Write) -> Result<u64, DecodeError> {
        let mut open = self.archive().open_for_processing().map_err(map_err)?;
        let mut i = 0usize;
        while let Some(before_file) = open.read_header().map_err(map_err)? {
            if i == index {
                let (data, _rest) = before_file.read().map_err(map_err)?;
                out.write_all(&data)?;
                return Ok(data.len() as u64);
            }
            open = before_file.skip().map_err(map_err)?;
            i += 1;
        }
        Err(DecodeError::Format(format!("no entry {index}")))
    }

    fn archive_len(&self) -> u64 {
        self.len
    }
}

fn map_err(err: UnrarError) -> DecodeError {
    match err.code {
        Code::MissingPassword | Code::BadPassword => DecodeError::Password,
        Code::BadArchive | Code::UnknownFormat | Code::BadData => {
            DecodeError::Format(err.to_string())
        }
        _ => DecodeError::Io(std::io::Error::other(err.to_string())),
    }
}
