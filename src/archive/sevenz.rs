use std::{fs::File, io::{Read, Write}, path::Path};

use sevenz_rust::{Password, SevenZReader};

use super::{filetime_to_system, DecodeError, Decoder, EntryMeta};

pub struct SevenZDecoder {
    reader: SevenZReader<File>,
    names: Vec<String>,
    len: u64,
}

impl SevenZDecoder {
    pub fn open(path: &Path, password: Option<&str>) -> Result<Self, DecodeError> {
        let len = std::fs::metadata(path)?.len();
        let password = match password {
            Some(x) => Password::from(x),
            None => Password::empty(),
        };
        let reader = SevenZReader::open(path, password).map_err(map_err)?;
        Ok(Self {
            reader,
            names: Vec::new(),
            len,
        })
    }
}

impl Decoder for SevenZDecoder {
    fn entries(&mut self) -> Result<Vec<EntryMeta>, DecodeError> {
        let files = &self.reader.archive().files;
        let mut out = Vec::with_capacity(files.len());
        for entry in files {
            out.push(EntryMeta {
                key: entry.name().to_string(),
                is_dir: entry.is_directory(),
                // entries without a stream have no declared size
                size: (entry.is_directory() || entry.has_stream()).then(|| entry.size()),
                modified: filetime_to_system(u64::from(entry.last_modified_date)),
                created: filetime_to_system(u64::from(entry.creation_date)),
                encrypted: false,
            });
        }
        self.names = out.iter().map(|meta| meta.key.clone()).collect();
        Ok(out)
    }

    fn copy_entry(&mut self, index: usize, out: &mut dyn Write) -> Result<u64, DecodeError> {
        let target = self
            .names
            .get(index)
            .ok_or_else(|| DecodeError::Format(format!("no entry {index}")))?
            .clone();
        let mut copied = None;
        self.reader
            .for_each_entries(&mut |entry: &sevenz_rust::SevenZArchiveEntry, reader: &mut dyn Read| {
                if entry.name() != target {
                    return Ok(true);
                }
                let mut n = 0u64;
                let mut buf = [0u8; 64 * 1024];
                loop {
                    let read = reader
                        .read(&mut buf)
                        .map_err(|e| sevenz_rust::Error::Io(e, target.clone().into()))?;
                    if read == 0 {
                        break;
                    }
                    out.write_all(&buf[..read])
                        .map_err(|e| sevenz_rust::Error::Io(e, target.clone().into()))?;
                    n += read as u64;
                }
                copied = Some(n);
                Ok(false)
            })
            .map_err(map_err)?;
        copied.ok_or_else(|| DecodeError::Format(format!("entry {target} has no stream")))
    }

    fn archive_len(&self) -> u64 {
        self.len
    }
}

fn map_err(err: sevenz_rust::Error) -> DecodeError {
    match err {
        sevenz_rust::Error::PasswordRequired => DecodeError::Password,
        sevenz_rust::Error::MaybeBadPassword(_) => DecodeError::Password,
        sevenz_rust::Error::Io(x, _) => DecodeError::Io(x),
        sevenz_rust::Error::FileOpen(x, _) => DecodeError::Io(x),
        other => DecodeError::Format(other.to_string()),
    }
}
