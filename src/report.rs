//! 报告编号、附件扩展名、上传端版本与元数据。

use serde_json::{Map, Value};
use std::fmt;
use std::net::IpAddr;

use crate::config::{REPORT_ID_PREFIX, REPORT_ID_WIDTH};
use crate::error::ReportError;

pub const UPLOAD_TIME_KEY: &str = "UploadTime";
pub const REMOTE_ADDR_KEY: &str = "RemoteAddr";
const METADATA_EXTENSION: &str = "json";
const FALLBACK_EXTENSION: &str = "bin";
const MAX_EXTENSION_LEN: usize = 16;

/// 顺序报告编号：至少 8 位补零，超过 99_999_999 后自动加宽，不截断。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReportId(u64);

impl ReportId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    /// 返回给客户端的编号，例如 `ccr-00000042`。
    pub fn tag(self) -> String {
        format!("{REPORT_ID_PREFIX}{self}")
    }

    pub fn file_name(self, ext: &str) -> String {
        format!("{self}.{ext}")
    }

    pub fn metadata_file_name(self) -> String {
        self.file_name(METADATA_EXTENSION)
    }
}

impl fmt::Display for ReportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:0width$}", self.0, width = REPORT_ID_WIDTH)
    }
}

/// 从客户端文件名取扩展名（只看最后一个路径分量）。
pub fn attachment_extension(file_name: &str) -> Result<String, ReportError> {
    let base = file_name.rsplit(['/', '\\']).next().unwrap_or(file_name);
    let Some((_, ext)) = base.rsplit_once('.') else {
        return Ok(FALLBACK_EXTENSION.to_string());
    };
    if ext.is_empty()
        || ext.len() > MAX_EXTENSION_LEN
        || !ext.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return Err(ReportError::InvalidExtension(ext.to_string()));
    }
    if ext.eq_ignore_ascii_case(METADATA_EXTENSION) {
        return Err(ReportError::InvalidExtension(ext.to_string()));
    }
    Ok(ext.to_string())
}

/// 解析 `CrashReporter/20141016` 形式的 `Uploader` 字段，格式不符时按 0 处理。
pub fn uploader_build(value: Option<&str>) -> u64 {
    let Some((prefix, digits)) = value.map(str::trim).and_then(|v| v.rsplit_once('/')) else {
        return 0;
    };
    if prefix.is_empty() || digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return 0;
    }
    digits.parse().unwrap_or(0)
}

/// 按提交顺序保存的表单字段；`UploadTime` 与 `RemoteAddr` 总是覆盖客户端传入的同名字段。
#[derive(Debug, Default, Clone)]
pub struct ReportMetadata {
    fields: Map<String, Value>,
}

impl ReportMetadata {
    pub fn from_fields<I>(fields: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let fields = fields
            .into_iter()
            .map(|(key, value)| (key, Value::String(value)))
            .collect();
        Self { fields }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn stamp(&mut self, upload_time: i64, remote_addr: IpAddr) {
        self.fields
            .insert(UPLOAD_TIME_KEY.to_string(), Value::from(upload_time));
        self.fields.insert(
            REMOTE_ADDR_KEY.to_string(),
            Value::String(remote_addr.to_string()),
        );
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&self.fields)
    }
}
