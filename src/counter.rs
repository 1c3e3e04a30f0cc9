//! 报告编号计数器：读-加一-写 全程持锁。
//!
//! 进程内用 tokio 互斥锁排队，跨进程用 `.ccr/id.lock` 上的独占文件锁，
//! 多个服务实例共享同一上传目录时也不会分配出重复编号。

use fs2::FileExt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::sync::Mutex;
use tokio::time;
use tracing::debug;

use crate::atomic::write_atomic;
use crate::config::{COUNTER_FILE, COUNTER_LOCK_FILE};
use crate::error::ReportError;
use crate::report::ReportId;

#[derive(Debug)]
pub struct ReportCounter {
    path: PathBuf,
    lock_path: PathBuf,
    lock: Mutex<()>,
    lock_timeout: Duration,
}

impl ReportCounter {
    pub fn new(root: &Path, lock_timeout: Duration) -> Self {
        Self {
            path: root.join(COUNTER_FILE),
            lock_path: root.join(COUNTER_LOCK_FILE),
            lock: Mutex::new(()),
            lock_timeout,
        }
    }

    /// 分配下一个编号。编号不会复用；之后的步骤失败只会留下空号。
    pub async fn allocate(&self) -> Result<ReportId, ReportError> {
        let _guard = time::timeout(self.lock_timeout, self.lock.lock())
            .await
            .map_err(|_| ReportError::CounterBusy)?;
        let file_lock = self.lock_file().await?;

        let current = read_counter(&self.path).await?;
        let next = current
            .checked_add(1)
            .ok_or_else(|| ReportError::CounterCorrupt(format!("counter overflow at {current}")))?;
        write_atomic(&self.path, next.to_string().as_bytes()).await?;

        drop(file_lock);
        debug!(id = next, "allocated report id");
        Ok(ReportId::new(next))
    }

    /// 最近一次分配的编号，未分配过时为 0。
    pub async fn current(&self) -> Result<u64, ReportError> {
        read_counter(&self.path).await
    }

    async fn lock_file(&self) -> Result<std::fs::File, ReportError> {
        let lock_path = self.lock_path.clone();
        let lock_timeout = self.lock_timeout;
        let acquire = tokio::task::spawn_blocking(move || -> io::Result<std::fs::File> {
            if let Some(parent) = lock_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&lock_path)?;
            file.lock_exclusive()?;
            Ok(file)
        });
        match time::timeout(lock_timeout, acquire).await {
            Ok(joined) => joined
                .map_err(|err| ReportError::Io(io::Error::other(err.to_string())))?
                .map_err(ReportError::Io),
            Err(_) => Err(ReportError::CounterBusy),
        }
    }
}

async fn read_counter(path: &Path) -> Result<u64, ReportError> {
    let contents = match fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(ReportError::Io(err)),
    };
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        return Ok(0);
    }
    trimmed
        .parse::<u64>()
        .map_err(|_| ReportError::CounterCorrupt(format!("unexpected contents {trimmed:?}")))
}
