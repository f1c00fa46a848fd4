use std::{
    collections::HashMap,
    os::unix::fs::PermissionsExt,
    path::PathBuf,
};

use tokio::sync::Mutex;
use uuid::Uuid;

use super::{cache::EntryCache, error::OpError, handle::ByteSource, index::FileMeta, path::fold};

/// Extensions the host is liable to load and execute.
pub const EXEC_EXTENSIONS: &[&str] = &[
    "exe", "dll", "sys", "drv", "com", "bat", "cmd", "msi", "msp", "mst", "ps1", "vbs", "js",
    "wsf", "jar", "py", "rb", "pl", "sh",
];

pub fn is_executable_name(name: &str) -> bool {
    let Some((_, ext)) = name.rsplit_once('.') else {
        return false;
    };
    EXEC_EXTENSIONS
        .iter()
        .any(|candidate| ext.eq_ignore_ascii_case(candidate))
}

/// Redirects execute-intent opens to long-lived temp files.
///
/// Image loaders memory-map their file and expect delete-sharing, which
/// a handle-backed source cannot give them; a real file in the
/// `Executables/` directory can. Extractions are cached per canonical
/// path and reclaimed at teardown, independent of the normal disk cache.
pub struct ExecCache {
    table: Mutex<HashMap<String, (PathBuf, u64)>>,
    exec_dir: PathBuf,
}

impl ExecCache {
    pub fn new(exec_dir: PathBuf) -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            exec_dir,
        }
    }

    pub async fn materialize(
        &self,
        cache: &EntryCache,
        meta: &FileMeta,
    ) -> Result<ByteSource, OpError> {
        let key = fold(meta.path.as_str());
        let mut table = self.table.lock().await;
        if let Some((path, len)) = table.get(&key) {
            let file = tokio::fs::File::open(path).await?;
            return Ok(ByteSource::exec(file, *len));
        }

        let name = meta.path.file_name().unwrap_or("entry");
        let token = Uuid::new_v4().simple().to_string();
        let dest = self.exec_dir.join(format!("{}_{}", &token[..8], name));
        let len = match cache.extract_raw(meta, &dest).await {
            Ok(len) => len,
            Err(err) => {
                tokio::fs::remove_file(&dest).await.ok();
                return Err(err);
            }
        };
        tokio::fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o755)).await?;
        log::info!("redirected {} to {}", meta.path, dest.display());

        let file = tokio::fs::File::open(&dest).await?;
        table.insert(key, (dest, len));
        Ok(ByteSource::exec(file, len))
    }

    pub async fn dispose(&self) {
        let mut table = self.table.lock().await;
        for (_, (path, _)) in table.drain() {
            if let Err(err) = tokio::fs::remove_file(&path).await {
                log::warn!("leaking {}: {}", path.display(), err);
            }
        }
    }
}
