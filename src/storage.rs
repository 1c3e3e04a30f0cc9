//! 崩溃报告落盘：暂存目录、编号分配与一次性发布。
//!
//! 每次提交先写入 `<root>/.ccr/incoming/<uuid>/`，分配编号后在暂存目录内
//! 写好元数据并重命名附件，最后把整个目录重命名为 `<root>/<id>`。
//! 报告目录一旦可见即为完整报告。
//!
//! 目录布局：
//!
//! ```text
//! <root>/id                 最近分配的编号
//! <root>/<id>/<id>.json     表单字段 + UploadTime + RemoteAddr
//! <root>/<id>/<id>.<ext>    每个上传文件一个
//! <root>/.ccr/id.lock       计数器文件锁
//! <root>/.ccr/incoming/     未发布的暂存目录
//! ```
//!
//! 下游工具遍历 `<root>` 时应跳过以 `.` 开头的条目。

use chrono::Utc;
use std::collections::HashSet;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::ErrorKind;
use tracing::{info, warn};
use uuid::Uuid;

use crate::atomic::{sync_dir, write_atomic};
use crate::config::{
    DEFAULT_COUNTER_LOCK_TIMEOUT_SECS, INCOMING_DIR, MINIDUMP_FIELD, UPLOADER_FIELD,
};
use crate::counter::ReportCounter;
use crate::error::ReportError;
use crate::report::{ReportId, ReportMetadata, attachment_extension, uploader_build};

#[derive(Debug)]
pub struct ReportStore {
    root: PathBuf,
    counter: ReportCounter,
    min_uploader_build: Option<u64>,
}

/// 已写入暂存目录的上传文件。
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub field: String,
    pub file_name: String,
    pub path: PathBuf,
    pub size: u64,
}

/// HTTP 层交给存储层的一次提交。
#[derive(Debug)]
pub struct Submission {
    pub fields: ReportMetadata,
    pub files: Vec<UploadedFile>,
    pub remote_addr: IpAddr,
    pub staging: StagingDir,
}

impl ReportStore {
    pub fn new(root: PathBuf, min_uploader_build: Option<u64>) -> Self {
        let counter = ReportCounter::new(
            &root,
            Duration::from_secs(DEFAULT_COUNTER_LOCK_TIMEOUT_SECS),
        );
        Self {
            root,
            counter,
            min_uploader_build,
        }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(self.incoming_root()).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    pub fn counter(&self) -> &ReportCounter {
        &self.counter
    }

    fn incoming_root(&self) -> PathBuf {
        self.root.join(INCOMING_DIR)
    }

    pub async fn open_staging(&self) -> Result<StagingDir, ReportError> {
        let path = self.incoming_root().join(Uuid::new_v4().to_string());
        fs::create_dir_all(&path).await?;
        Ok(StagingDir::new(path))
    }

    /// 校验、分配编号并发布报告；任何失败都会删除暂存文件。
    pub async fn submit(&self, submission: Submission) -> Result<ReportId, ReportError> {
        let Submission {
            fields,
            files,
            remote_addr,
            staging,
        } = submission;

        match self.persist(fields, &files, remote_addr, &staging).await {
            Ok(id) => {
                staging.disarm();
                Ok(id)
            }
            Err(err) => {
                staging.discard().await;
                Err(err)
            }
        }
    }

    async fn persist(
        &self,
        mut metadata: ReportMetadata,
        files: &[UploadedFile],
        remote_addr: IpAddr,
        staging: &StagingDir,
    ) -> Result<ReportId, ReportError> {
        check_upload_shape(files)?;
        if !files.iter().any(|file| file.field == MINIDUMP_FIELD) {
            return Err(ReportError::MissingMinidump);
        }
        if let Some(minimum) = self.min_uploader_build {
            let build = uploader_build(metadata.get(UPLOADER_FIELD));
            if build < minimum {
                info!(build, minimum, "uploader too old");
                return Err(ReportError::UploaderOutdated { build });
            }
        }
        let extensions = resolve_extensions(files)?;

        let id = self.counter.allocate().await?;
        let target = self.root.join(id.to_string());
        match fs::symlink_metadata(&target).await {
            Ok(_) => return Err(ReportError::Collision(id.to_string())),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(ReportError::Io(err)),
        }

        metadata.stamp(Utc::now().timestamp(), remote_addr);
        let json = metadata
            .to_json()
            .map_err(|err| ReportError::Io(io::Error::other(err)))?;
        write_atomic(&staging.path().join(id.metadata_file_name()), &json).await?;

        for (file, ext) in files.iter().zip(&extensions) {
            fs::rename(&file.path, staging.path().join(id.file_name(ext))).await?;
        }

        fs::rename(staging.path(), &target).await.map_err(|err| {
            if err.kind() == ErrorKind::AlreadyExists || err.kind() == ErrorKind::DirectoryNotEmpty {
                ReportError::Collision(id.to_string())
            } else {
                ReportError::PublishFailed(format!("{id}: {err}"))
            }
        })?;
        let _ = sync_dir(&self.root).await;

        info!(
            report_id = %id,
            files = files.len(),
            bytes = files.iter().map(|file| file.size).sum::<u64>(),
            remote_addr = %remote_addr,
            "report stored"
        );
        Ok(id)
    }

    /// 清理超过 `ttl` 的暂存目录（被中断的上传）。
    pub async fn sweep_incoming(&self, ttl: Duration) -> io::Result<usize> {
        if ttl.is_zero() {
            return Ok(0);
        }
        let incoming = self.incoming_root();
        let mut dir = match fs::read_dir(&incoming).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err),
        };

        let now = SystemTime::now();
        let mut removed = 0;
        while let Some(entry) = dir.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_dir() {
                continue;
            }
            let Ok(modified) = metadata.modified() else {
                continue;
            };
            let Ok(age) = now.duration_since(modified) else {
                continue;
            };
            if age < ttl {
                continue;
            }
            let path = entry.path();
            match fs::remove_dir_all(&path).await {
                Ok(()) => {
                    info!(path = ?path, "removed abandoned upload");
                    removed += 1;
                }
                Err(err) => warn!(path = ?path, error = %err, "failed to remove abandoned upload"),
            }
        }
        Ok(removed)
    }
}

fn check_upload_shape(files: &[UploadedFile]) -> Result<(), ReportError> {
    let mut seen = HashSet::new();
    for file in files {
        if file.file_name.trim().is_empty() {
            return Err(ReportError::InvalidUpload(format!(
                "field {} has no file name",
                file.field
            )));
        }
        if !seen.insert(file.field.as_str()) {
            return Err(ReportError::InvalidUpload(format!(
                "field {} uploaded more than once",
                file.field
            )));
        }
    }
    Ok(())
}

/// 扩展名相同的附件会落到同一个 `<id>.<ext>`，直接拒绝。
fn resolve_extensions(files: &[UploadedFile]) -> Result<Vec<String>, ReportError> {
    let mut seen = HashSet::new();
    let mut extensions = Vec::with_capacity(files.len());
    for file in files {
        let ext = attachment_extension(&file.file_name)?;
        if !seen.insert(ext.to_ascii_lowercase()) {
            return Err(ReportError::DuplicateExtension(ext));
        }
        extensions.push(ext);
    }
    Ok(extensions)
}

/// 单次提交的暂存目录；未发布就被丢弃（客户端中途断开）时自行删除。
#[derive(Debug)]
pub struct StagingDir {
    path: PathBuf,
    armed: bool,
    next_part: usize,
}

impl StagingDir {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            armed: true,
            next_part: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 为下一个上传文件分配暂存路径。
    pub fn next_part_path(&mut self) -> PathBuf {
        let path = self.path.join(format!("upload-{}.part", self.next_part));
        self.next_part += 1;
        path
    }

    pub async fn discard(mut self) {
        self.armed = false;
        if let Err(err) = fs::remove_dir_all(&self.path).await
            && err.kind() != ErrorKind::NotFound
        {
            warn!(path = ?self.path, error = %err, "failed to remove staging dir");
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let path = std::mem::take(&mut self.path);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = fs::remove_dir_all(&path).await;
                });
            }
            Err(_) => {
                let _ = std::fs::remove_dir_all(&path);
            }
        }
    }
}
