use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    archive::{self, Format, PasswordProvider},
    config::CONFIG,
    error::Error,
    filesystem::{ArchiveIndex, Dispatcher, EntryCache, ExecCache, Filesystem, NamespaceView},
    session::SessionDir,
};

/// Candidates tried in drag-and-drop mode, in order.
const DRAG_DROP_LETTERS: [char; 5] = ['M', 'N', 'O', 'P', 'Q'];

/// Where the user asked us to mount.
///
/// A single letter selects the letter-named candidate directory under
/// the temp root, anything else is a directory path created on demand.
#[derive(Debug, PartialEq, Eq)]
pub enum MountPoint {
    Letter(char),
    Path(PathBuf),
}

impl MountPoint {
    pub fn parse(raw: &str) -> Self {
        let body = raw
            .strip_suffix(":\\")
            .or_else(|| raw.strip_suffix(":/"))
            .or_else(|| raw.strip_suffix(':'))
            .unwrap_or(raw);
        let mut chars = body.chars();
        match (chars.next(), chars.next()) {
            (Some(letter), None) if letter.is_ascii_alphabetic() => {
                Self::Letter(letter.to_ascii_uppercase())
            }
            _ => Self::Path(PathBuf::from(raw)),
        }
    }

    fn resolve(&self, temp_root: &Path) -> PathBuf {
        match self {
            Self::Letter(letter) => temp_root
                .join("SimpleZipDrive")
                .join("mnt")
                .join(letter.to_string()),
            Self::Path(path) => path.clone(),
        }
    }
}

/// One mount attempt, explicit mode. Blocks until clean unmount.
pub async fn run(
    archive: &Path,
    mount_point: Option<&str>,
    provider: PasswordProvider,
) -> Result<(), Error> {
    let temp_root = CONFIG.temp_root();
    match mount_point {
        Some(raw) => {
            let target = MountPoint::parse(raw).resolve(&temp_root);
            mount_session(archive, &target, &provider).await
        }
        None => {
            // drag-and-drop mode is gated on the extension up front
            detect_format(archive)?;
            let mut last = None;
            for letter in DRAG_DROP_LETTERS {
                let target = MountPoint::Letter(letter).resolve(&temp_root);
                match mount_session(archive, &target, &provider).await {
                    Ok(()) => return Ok(()),
                    Err(err) => {
                        log::error!("mount on {} failed: {}", target.display(), err);
                        last = Some(err);
                    }
                }
            }
            Err(last.unwrap_or_else(|| Error::Internal("no mount candidates".into())))
        }
    }
}

fn detect_format(archive: &Path) -> Result<Format, Error> {
    Format::from_path(archive).ok_or_else(|| {
        Error::UnknownFormat(
            archive
                .extension()
                .map(|ext| ext.to_string_lossy().into_owned())
                .unwrap_or_default(),
        )
    })
}

/// Full lifecycle of one mount: open, index, serve, tear down. The
/// session directory dies on every path out of here, including the
/// partially-initialized ones.
pub async fn mount_session(
    archive: &Path,
    target: &Path,
    provider: &PasswordProvider,
) -> Result<(), Error> {
    let meta = tokio::fs::metadata(archive).await.map_err(Error::Source)?;
    if !meta.is_file() {
        return Err(Error::Source(std::io::Error::other(
            "not a regular file",
        )));
    }
    let format = detect_format(archive)?;

    let session = SessionDir::create(&CONFIG.temp_root()).map_err(|err| {
        if err.raw_os_error() == Some(libc::ENOSPC) {
            Error::DiskFull
        } else {
            Error::Mount(err)
        }
    })?;
    let result = serve(archive, format, target, provider, &session).await;
    session.dispose().await;
    result
}

async fn serve(
    archive: &Path,
    format: Format,
    target: &Path,
    provider: &PasswordProvider,
    session: &SessionDir,
) -> Result<(), Error> {
    let mut decoder = archive::open(archive, format, provider)?;
    let entries = decoder.entries()?;
    let index = ArchiveIndex::build(&entries, decoder.archive_len());
    log::info!(
        "indexed {} entries into {} nodes",
        entries.len(),
        index.node_count()
    );

    let cache = EntryCache::new(
        decoder,
        session.cache_dir().to_path_buf(),
        CONFIG.mem_limit_per_entry,
        CONFIG.mem_budget_total,
    );
    let dispatcher = Arc::new(Dispatcher::new(
        NamespaceView::new(Arc::new(index)),
        cache,
        ExecCache::new(session.exec_dir().to_path_buf()),
    ));

    let result = bridge(dispatcher.clone(), target).await;
    dispatcher.dispose().await;
    result
}

async fn bridge(dispatcher: Arc<Dispatcher>, target: &Path) -> Result<(), Error> {
    tokio::fs::create_dir_all(target)
        .await
        .map_err(Error::Mount)?;
    let filesystem = Filesystem::new(dispatcher);
    let mut mount_handle = filesystem
        .raw_mount_with_path(target)
        .await
        .map_err(Error::Mount)?;
    log::info!("mounted on {}", target.display());

    let handle = &mut mount_handle;
    tokio::select! {
        res = handle => res.map_err(Error::Mount),
        _ = tokio::signal::ctrl_c() => {
            log::info!("interrupted, unmounting");
            mount_handle.unmount().await.map_err(Error::Mount)
        }
    }
}
