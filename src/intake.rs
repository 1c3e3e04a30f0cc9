//! 崩溃报告上传入口：解析 multipart 表单并交给 `ReportStore`。

use axum::extract::multipart::{Field, Multipart};
use axum::extract::{ConnectInfo, Extension};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{ApiError, ReportError};
use crate::http::resolve_client_ip;
use crate::report::ReportMetadata;
use crate::storage::{ReportStore, StagingDir, Submission, UploadedFile};

#[derive(Debug, Default)]
pub struct IntakeConfig {
    pub trust_forwarded_for: bool,
}

/// 接收一份崩溃报告，返回 `ccr-` 编号。
pub async fn submit_report(
    Extension(store): Extension<Arc<ReportStore>>,
    Extension(intake): Extension<Arc<IntakeConfig>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut staging = store.open_staging().await?;
    let (fields, files) = match read_form(&mut multipart, &mut staging).await {
        Ok(form) => form,
        Err(err) => {
            staging.discard().await;
            return Err(err.into());
        }
    };

    let remote_addr = resolve_client_ip(&headers, peer.ip(), intake.trust_forwarded_for);
    let id = store
        .submit(Submission {
            fields: ReportMetadata::from_fields(fields),
            files,
            remote_addr,
            staging,
        })
        .await?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        )],
        id.tag(),
    )
        .into_response())
}

type Form = (Vec<(String, String)>, Vec<UploadedFile>);

async fn read_form(
    multipart: &mut Multipart,
    staging: &mut StagingDir,
) -> Result<Form, ReportError> {
    let mut fields = Vec::new();
    let mut files = Vec::new();

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|err| ReportError::InvalidUpload(err.to_string()))?
    {
        let name = match field.name() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => return Err(ReportError::InvalidUpload("form part without a name".into())),
        };

        match field.file_name().map(str::to_string) {
            Some(file_name) => {
                let path = staging.next_part_path();
                let size = stream_to_file(&path, &mut field).await?;
                debug!(field = %name, file_name = %file_name, size, "upload part staged");
                files.push(UploadedFile {
                    field: name,
                    file_name,
                    path,
                    size,
                });
            }
            None => {
                let value = field
                    .text()
                    .await
                    .map_err(|err| ReportError::InvalidUpload(err.to_string()))?;
                fields.push((name, value));
            }
        }
    }

    Ok((fields, files))
}

async fn stream_to_file(path: &Path, field: &mut Field<'_>) -> Result<u64, ReportError> {
    let mut file = File::create(path).await?;
    let mut total_written: u64 = 0;
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|err| ReportError::InvalidUpload(err.to_string()))?
    {
        if chunk.is_empty() {
            continue;
        }
        total_written += chunk.len() as u64;
        file.write_all(&chunk).await?;
    }
    file.sync_all().await?;
    Ok(total_written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::body::Body;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::Request;
    use serde_json::Value;
    use tempfile::tempdir;
    use tower::ServiceExt;

    use crate::config::{COUNTER_FILE, MINIDUMP_FIELD, UPDATE_REQUIRED_MESSAGE};

    const BOUNDARY: &str = "----CrashReportBoundary7MA4YWxkTrZu0gW";
    const PEER: &str = "192.0.2.44:51234";

    fn make_app(min_uploader_build: Option<u64>) -> (tempfile::TempDir, Arc<ReportStore>, Router) {
        make_app_with_limit(min_uploader_build, 1024 * 1024)
    }

    fn make_app_with_limit(
        min_uploader_build: Option<u64>,
        max_upload_size: usize,
    ) -> (tempfile::TempDir, Arc<ReportStore>, Router) {
        let temp = tempdir().expect("tempdir");
        let store = Arc::new(ReportStore::new(
            temp.path().join("uploads"),
            min_uploader_build,
        ));
        std::fs::create_dir_all(store.root_path().join(crate::config::INCOMING_DIR))
            .expect("create incoming");
        let app = crate::build_app(
            store.clone(),
            Arc::new(IntakeConfig::default()),
            max_upload_size,
        )
        .layer(MockConnectInfo(PEER.parse::<SocketAddr>().expect("peer")));
        (temp, store, app)
    }

    fn multipart_body(fields: &[(&str, &str)], files: &[(&str, &str, &str)]) -> String {
        let mut body = String::new();
        for (name, value) in fields {
            body.push_str(&format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            ));
        }
        for (name, file_name, contents) in files {
            body.push_str(&format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n{contents}\r\n"
            ));
        }
        body.push_str(&format!("--{BOUNDARY}--\r\n"));
        body
    }

    async fn post(app: Router, uri: &str, body: String) -> (StatusCode, String) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                "Content-Type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .expect("request");
        let response = app.oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        (status, String::from_utf8(bytes.to_vec()).expect("utf8"))
    }

    #[tokio::test]
    async fn accepts_minidump_with_log_and_fields() {
        let (_temp, store, app) = make_app(None);
        let body = multipart_body(
            &[("ProductName", "Foo"), ("Version", "1.2.3")],
            &[
                (MINIDUMP_FIELD, "dump.dmp", "MDMP-DATA"),
                ("upload_file_log", "run.log", "started\nexploded\n"),
            ],
        );

        let (status, text) = post(app, "/addreport.php", body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(text, "ccr-00000001");

        let dir = store.root_path().join("00000001");
        assert_eq!(
            std::fs::read_to_string(dir.join("00000001.dmp")).expect("dmp"),
            "MDMP-DATA"
        );
        assert_eq!(
            std::fs::read_to_string(dir.join("00000001.log")).expect("log"),
            "started\nexploded\n"
        );
        let json: Value =
            serde_json::from_slice(&std::fs::read(dir.join("00000001.json")).expect("json"))
                .expect("parse json");
        assert_eq!(json["ProductName"], "Foo");
        assert_eq!(json["Version"], "1.2.3");
        assert!(json["UploadTime"].is_i64());
        assert_eq!(json["RemoteAddr"], "192.0.2.44");
    }

    #[tokio::test]
    async fn api_route_allocates_sequential_ids() {
        let (_temp, _store, app) = make_app(None);
        for expected in ["ccr-00000001", "ccr-00000002"] {
            let body = multipart_body(&[], &[(MINIDUMP_FIELD, "dump.dmp", "MDMP")]);
            let (status, text) = post(app.clone(), "/api/reports", body).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(text, expected);
        }
    }

    #[tokio::test]
    async fn missing_minidump_is_bad_request() {
        let (_temp, store, app) = make_app(None);
        let body = multipart_body(
            &[("ProductName", "Foo")],
            &[("upload_file_log", "run.log", "log")],
        );

        let (status, text) = post(app, "/addreport.php", body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(text.is_empty());
        assert!(!store.root_path().join(COUNTER_FILE).exists());
    }

    #[tokio::test]
    async fn malformed_multipart_is_bad_request() {
        let (_temp, store, app) = make_app(None);
        let body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{MINIDUMP_FIELD}\"; filename=\"dump.dmp\"\r\n\r\nMDMP"
        );

        let (status, _) = post(app, "/addreport.php", body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!store.root_path().join(COUNTER_FILE).exists());
        let incoming = store.root_path().join(crate::config::INCOMING_DIR);
        assert_eq!(std::fs::read_dir(incoming).expect("incoming").count(), 0);
    }

    #[tokio::test]
    async fn oversized_body_is_bad_request_and_leaves_nothing() {
        let (_temp, store, app) = make_app_with_limit(None, 16);
        let minidump = "M".repeat(256);
        let body = multipart_body(&[], &[(MINIDUMP_FIELD, "dump.dmp", minidump.as_str())]);

        let (status, text) = post(app, "/addreport.php", body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(text.is_empty());
        assert!(!store.root_path().join(COUNTER_FILE).exists());
        assert!(!store.root_path().join("00000001").exists());
        let incoming = store.root_path().join(crate::config::INCOMING_DIR);
        assert_eq!(std::fs::read_dir(incoming).expect("incoming").count(), 0);
    }

    #[tokio::test]
    async fn existing_report_directory_is_bad_request() {
        let (_temp, store, app) = make_app(None);
        std::fs::create_dir_all(store.root_path().join("00000001")).expect("squat dir");

        let body = multipart_body(&[], &[(MINIDUMP_FIELD, "dump.dmp", "MDMP")]);
        let (status, text) = post(app.clone(), "/addreport.php", body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(text.is_empty());
        assert_eq!(
            std::fs::read_dir(store.root_path().join("00000001"))
                .expect("squat dir")
                .count(),
            0
        );

        let body = multipart_body(&[], &[(MINIDUMP_FIELD, "dump.dmp", "MDMP")]);
        let (status, text) = post(app, "/addreport.php", body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(text, "ccr-00000002");
    }

    #[tokio::test]
    async fn duplicate_extension_is_bad_request() {
        let (_temp, _store, app) = make_app(None);
        let body = multipart_body(
            &[],
            &[
                (MINIDUMP_FIELD, "dump.dmp", "MDMP"),
                ("upload_file_second", "minidump.dmp", "MDMP"),
            ],
        );

        let (status, _) = post(app, "/addreport.php", body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn outdated_uploader_gets_update_message() {
        let (_temp, store, app) = make_app(Some(20141016));
        let body = multipart_body(
            &[("Uploader", "CrashReporter/20141014")],
            &[(MINIDUMP_FIELD, "dump.dmp", "MDMP")],
        );

        let (status, text) = post(app.clone(), "/addreport.php", body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(text, UPDATE_REQUIRED_MESSAGE);
        assert!(!store.root_path().join(COUNTER_FILE).exists());

        let body = multipart_body(
            &[("Uploader", "CrashReporter/20141016")],
            &[(MINIDUMP_FIELD, "dump.dmp", "MDMP")],
        );
        let (status, text) = post(app, "/addreport.php", body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(text, "ccr-00000001");
    }

    #[tokio::test]
    async fn responses_carry_security_headers() {
        let (_temp, _store, app) = make_app(None);
        let request = Request::builder()
            .method("POST")
            .uri("/api/reports")
            .header(
                "Content-Type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(multipart_body(&[], &[])))
            .expect("request");
        let response = app.oneshot(request).await.expect("response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get(header::X_CONTENT_TYPE_OPTIONS),
            Some(&HeaderValue::from_static("nosniff"))
        );
    }
}
