//! Archive decoders behind one interface.
//!
//! The core only ever sees a [`Decoder`]: an entry table enumerated once
//! at open, plus forward-only decompressed copies of single entries. One
//! backend per format; none of them are thread safe, so every call into a
//! decoder happens under the cache's decoder lock.

mod rar;
mod sevenz;
mod zip;

use std::{
    io::Write,
    path::Path,
    time::{Duration, SystemTime},
};

pub use self::rar::RarDecoder;
pub use self::sevenz::SevenZDecoder;
pub use self::zip::ZipDecoder;

#[cfg(test)]
pub(crate) use self::zip::fixture as zip_fixture;

/// Callback that asks the user for a password once the decoder reports
/// the archive is encrypted. Returning `None` aborts the open.
pub type PasswordProvider = Box<dyn Fn() -> Option<String> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// central structure missing or invalid
    #[error("archive format: {0}")]
    Format(String),
    #[error("missing or wrong password")]
    Password,
    #[error("source io: {0}")]
    Io(#[from] std::io::Error),
}

/// One row of the entry table, immutable after enumeration.
#[derive(Debug, Clone)]
pub struct EntryMeta {
    /// raw key as stored in the archive, separators not yet normalized
    pub key: String,
    pub is_dir: bool,
    /// `None` when the format does not declare an uncompressed size
    pub size: Option<u64>,
    pub modified: Option<SystemTime>,
    pub created: Option<SystemTime>,
    pub encrypted: bool,
}

pub trait Decoder: Send {
    /// Enumerate the entry table. Called exactly once per open; the
    /// position of an entry in the returned vector is its index for
    /// [`Decoder::copy_entry`].
    fn entries(&mut self) -> Result<Vec<EntryMeta>, DecodeError>;
    /// Decompress entry `index` into `out`, forward only.
    fn copy_entry(&mut self, index: usize, out: &mut dyn Write) -> Result<u64, DecodeError>;
    /// Decompress entry `index` into a fresh file at `dest`.
    fn extract_to(&mut self, index: usize, dest: &Path) -> Result<u64, DecodeError> {
        let mut file = std::fs::File::create(dest)?;
        let n = self.copy_entry(index, &mut file)?;
        file.flush()?;
        Ok(n)
    }
    /// Byte length of the archive itself.
    fn archive_len(&self) -> u64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Zip,
    SevenZ,
    Rar,
}

impl Format {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?;
        if ext.eq_ignore_ascii_case("zip") {
            Some(Self::Zip)
        } else if ext.eq_ignore_ascii_case("7z") {
            Some(Self::SevenZ)
        } else if ext.eq_ignore_ascii_case("rar") {
            Some(Self::Rar)
        } else {
            None
        }
    }
}

/// Open an archive, retrying once with a password from `provider` when
/// the decoder signals encryption.
pub fn open(
    path: &Path,
    format: Format,
    provider: &PasswordProvider,
) -> Result<Box<dyn Decoder>, DecodeError> {
    let attempt = |password: Option<&str>| -> Result<Box<dyn Decoder>, DecodeError> {
        Ok(match format {
            Format::Zip => Box::new(ZipDecoder::open(path, password)?),
            Format::SevenZ => Box::new(SevenZDecoder::open(path, password)?),
            Format::Rar => Box::new(RarDecoder::open(path, password)?),
        })
    };
    match attempt(None) {
        Err(DecodeError::Password) => {
            log::info!("archive is encrypted, asking for a password");
            let password = provider().ok_or(DecodeError::Password)?;
            attempt(Some(&password))
        }
        other => other,
    }
}

/// 100ns ticks since 1601-01-01, the NT FILETIME epoch.
pub(crate) fn filetime_to_system(raw: u64) -> Option<SystemTime> {
    if raw == 0 {
        return None;
    }
    const EPOCH_GAP_SECS: u64 = 11_644_473_600;
    let secs = raw / 10_000_000;
    let nanos = (raw % 10_000_000) * 100;
    let unix = secs.checked_sub(EPOCH_GAP_SECS)?;
    SystemTime::UNIX_EPOCH.checked_add(Duration::new(unix, nanos as u32))
}

/// Civil date/time (as stored in DOS-style headers) to `SystemTime`.
pub(crate) fn civil_to_system(
    year: u16,
    month: u8,
    day: u8,
    hour: u8,
    minute: u8,
    second: u8,
) -> Option<SystemTime> {
    if !(1970..=9999).contains(&year) || month == 0 || month > 12 || day == 0 {
        return None;
    }
    // days-from-civil, Howard Hinnant's algorithm
    let y = year as i64 - (month < 3) as i64;
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let m = month as i64;
    let d = day as i64;
    let doy = (153 * (m + if m > 2 { -3 } else { 9 }) + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    let days = era * 146_097 + doe - 719_468;
    let secs = days * 86_400 + hour as i64 * 3600 + minute as i64 * 60 + second as i64;
    SystemTime::UNIX_EPOCH.checked_add(Duration::from_secs(u64::try_from(secs).ok()?))
}


#[cfg(test)]
mod test {
    use super::*;
    use ::zip::unstable::write::FileOptionsExt;

    #[test]
    fn password_provider_retry() {
        let options =
            ::zip::write::SimpleFileOptions::default().with_deprecated_encryption(b"secret");
        let cursor = zip_fixture::build_with(&[("hidden.txt", b"plaintext")], options);

        let dir = std::env::temp_dir().join(format!("zipdrive-open-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("locked.zip");
        std::fs::write(&path, cursor.into_inner()).unwrap();

        let provider: PasswordProvider = Box::new(|| Some("secret".to_string()));
        let mut decoder = open(&path, Format::Zip, &provider).unwrap();
        let entries = decoder.entries().unwrap();
        assert!(entries[0].encrypted);
        let mut buf = Vec::new();
        decoder.copy_entry(0, &mut buf).unwrap();
        assert_eq!(buf, b"plaintext");

        let refused: PasswordProvider = Box::new(|| None);
        assert!(matches!(
            open(&path, Format::Zip, &refused),
            Err(DecodeError::Password)
        ));

        let wrong: PasswordProvider = Box::new(|| Some("hunter2".to_string()));
        assert!(matches!(
            open(&path, Format::Zip, &wrong),
            Err(DecodeError::Password)
        ));

        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn format_by_extension() {
        assert_eq!(Format::from_path(Path::new("a.ZIP")), Some(Format::Zip));
        assert_eq!(Format::from_path(Path::new("b.7z")), Some(Format::SevenZ));
        assert_eq!(Format::from_path(Path::new("c.rar")), Some(Format::Rar));
        assert_eq!(Format::from_path(Path::new("d.tar")), None);
        assert_eq!(Format::from_path(Path::new("noext")), None);
    }

    #[test]
    fn filetime_epoch_gap() {
        // 1601-01-01 itself has no unix representation
        assert_eq!(filetime_to_system(1), None);
        // 1970-01-01 00:00:00
        let unix_zero = 11_644_473_600 * 10_000_000;
        assert_eq!(filetime_to_system(unix_zero), Some(SystemTime::UNIX_EPOCH));
    }

    #[test]
    fn civil_roundtrip() {
        let t = civil_to_system(1970, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(t, SystemTime::UNIX_EPOCH);
        let t = civil_to_system(2024, 2, 29, 12, 30, 15).unwrap();
        let secs = t
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        assert_eq!(secs % 60, 15);
        // 2024-02-29 is a Thursday, same weekday slot as the epoch
        assert_eq!((secs / 86_400) % 7, 0);
        assert_eq!(civil_to_system(1960, 1, 1, 0, 0, 0), None);
    }
}
