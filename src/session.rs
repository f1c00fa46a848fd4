use std::path::{Path, PathBuf};

use uuid::Uuid;

const ROOT_DIR: &str = "SimpleZipDrive";
const EXEC_DIR: &str = "Executables";

/// Per-process, per-mount temp directory.
///
/// Layout: `<temp-root>/SimpleZipDrive/<pid>_<uuid>/` with an
/// `Executables/` subdirectory for redirected executables. Everything
/// under the session directory is deleted at unmount; the shared
/// `SimpleZipDrive` root is removed as well once it turns empty.
pub struct SessionDir {
    root: PathBuf,
    session: PathBuf,
    exec: PathBuf,
}

impl SessionDir {
    pub fn create(temp_root: &Path) -> std::io::Result<Self> {
        let root = temp_root.join(ROOT_DIR);
        let session = root.join(format!("{}_{}", std::process::id(), Uuid::new_v4()));
        let exec = session.join(EXEC_DIR);
        std::fs::create_dir_all(&exec)?;
        log::debug!("session temp directory: {}", session.display());
        Ok(Self {
            root,
            session,
            exec,
        })
    }
    /// where the hybrid cache puts large-entry temp files
    pub fn cache_dir(&self) -> &Path {
        &self.session
    }
    /// where the executable redirector puts extracted images
    pub fn exec_dir(&self) -> &Path {
        &self.exec
    }
    /// Delete the session directory and, if it became empty, the root.
    ///
    /// Idempotent; callers run it on every teardown path, even after
    /// partial initialization.
    pub async fn dispose(&self) {
        if let Err(err) = tokio::fs::remove_dir_all(&self.session).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                log::warn!("leaking session dir {}: {}", self.session.display(), err);
            }
        }
        // only succeeds when no other session is live
        tokio::fs::remove_dir(&self.root).await.ok();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn create_and_dispose() {
        let base = std::env::temp_dir().join(format!("zipdrive-test-{}", Uuid::new_v4()));
        let session = SessionDir::create(&base).unwrap();
        assert!(session.exec_dir().is_dir());
        assert!(session.cache_dir().is_dir());

        tokio::fs::write(session.cache_dir().join("x.bin"), b"x")
            .await
            .unwrap();
        session.dispose().await;
        assert!(!session.cache_dir().exists());
        assert!(!base.join(ROOT_DIR).exists());

        tokio::fs::remove_dir_all(&base).await.ok();
    }
}
