//! 上报流程的错误类型与 HTTP 响应转换。

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use std::fmt;
use std::io;
use tracing::{error, warn};

/// 提交崩溃报告时可能出现的错误。
#[derive(Debug)]
pub enum ReportError {
    InvalidUpload(String),
    MissingMinidump,
    InvalidExtension(String),
    DuplicateExtension(String),
    UploaderOutdated { build: u64 },
    CounterCorrupt(String),
    CounterBusy,
    Collision(String),
    PublishFailed(String),
    Io(io::Error),
}

impl ReportError {
    /// 客户端错误：未修改任何状态，重试无意义。
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ReportError::InvalidUpload(_)
                | ReportError::MissingMinidump
                | ReportError::InvalidExtension(_)
                | ReportError::DuplicateExtension(_)
        )
    }
}

impl fmt::Display for ReportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportError::InvalidUpload(msg) => write!(f, "invalid upload: {msg}"),
            ReportError::MissingMinidump => write!(f, "no minidump in submission"),
            ReportError::InvalidExtension(ext) => write!(f, "invalid attachment extension {ext:?}"),
            ReportError::DuplicateExtension(ext) => {
                write!(f, "more than one attachment with extension {ext:?}")
            }
            ReportError::UploaderOutdated { build } => write!(f, "uploader build {build} too old"),
            ReportError::CounterCorrupt(msg) => write!(f, "report counter corrupt: {msg}"),
            ReportError::CounterBusy => write!(f, "timed out waiting for report counter"),
            ReportError::Collision(id) => write!(f, "report directory {id} already exists"),
            ReportError::PublishFailed(msg) => write!(f, "could not create report directory: {msg}"),
            ReportError::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

impl std::error::Error for ReportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReportError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for ReportError {
    fn from(err: io::Error) -> Self {
        ReportError::Io(err)
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    UpdateRequired(&'static str),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => {
                warn!(reason = %msg, "report rejected");
                StatusCode::BAD_REQUEST.into_response()
            }
            // 旧版客户端只在成功状态码下显示响应正文。
            ApiError::UpdateRequired(msg) => (
                StatusCode::OK,
                [(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; charset=utf-8"),
                )],
                msg,
            )
                .into_response(),
            ApiError::Internal(msg) => {
                error!(reason = %msg, "report intake failed");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

impl From<ReportError> for ApiError {
    fn from(error: ReportError) -> Self {
        match error {
            ReportError::UploaderOutdated { .. } => {
                ApiError::UpdateRequired(crate::config::UPDATE_REQUIRED_MESSAGE)
            }
            // 报告目录创建失败按 400 返回，编号留空。
            err @ (ReportError::Collision(_) | ReportError::PublishFailed(_)) => {
                ApiError::BadRequest(err.to_string())
            }
            err if err.is_client_error() => ApiError::BadRequest(err.to_string()),
            err => ApiError::Internal(err.to_string()),
        }
    }
}
