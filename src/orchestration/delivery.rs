//! # Result Delivery
//!
//! Last step before a request is reported done: every file the run left in its working
//! directory is copied to object storage under `{bucket}/{request_id}/`. The working
//! directory is released right after the result goes out, so delivery has to succeed
//! first; a failed upload fails the run.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::errors::{OrchestrationError, OrchestrationResult};
use crate::stages::{ProcessRunner, StageError};

#[async_trait]
pub trait OutputUploader: Send + Sync + 'static {
    /// Upload the files in `out_dir`, returning the object names written
    async fn upload(&self, request_id: &str, out_dir: &Path) -> OrchestrationResult<Vec<String>>;

    /// Where a request's outputs end up, for the result message
    fn location(&self, request_id: &str) -> String;
}

/// Object store coordinates handed to the upload program
#[derive(Clone, PartialEq, Eq)]
pub struct ObjectStoreTarget {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub secure: bool,
}

impl std::fmt::Debug for ObjectStoreTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreTarget")
            .field("endpoint", &self.endpoint)
            .field("bucket", &self.bucket)
            .field("secure", &self.secure)
            .finish()
    }
}

impl ObjectStoreTarget {
    /// Variables the upload program reads; credentials never appear in argv
    fn environment(&self) -> Vec<(String, String)> {
        vec![
            ("MINIO_ENDPOINT".to_string(), self.endpoint.clone()),
            ("MINIO_USER".to_string(), self.access_key.clone()),
            ("MINIO_PASSWORD".to_string(), self.secret_key.clone()),
            ("MINIO_BUCKET".to_string(), self.bucket.clone()),
            ("MINIO_SECURE".to_string(), self.secure.to_string()),
        ]
    }
}

/// Object name for one output file
pub fn object_name(request_id: &str, file_name: &str) -> String {
    format!("{}/{}", request_id, file_name)
}

/// Uploads by invoking an external program once per file
///
/// Arguments after the configured program are `local_file object_name`; the store
/// coordinates arrive as `MINIO_*` environment variables.
pub struct CommandUploader {
    runner: Arc<dyn ProcessRunner>,
    program: Vec<String>,
    target: ObjectStoreTarget,
}

impl std::fmt::Debug for CommandUploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandUploader")
            .field("program", &self.program)
            .field("target", &self.target)
            .finish()
    }
}

impl CommandUploader {
    pub fn new(runner: Arc<dyn ProcessRunner>, program: Vec<String>, target: ObjectStoreTarget) -> Self {
        Self {
            runner,
            program,
            target,
        }
    }

    pub fn argv(&self, local_file: &Path, object: &str) -> Vec<String> {
        let mut argv = self.program.clone();
        argv.push(local_file.to_string_lossy().into_owned());
        argv.push(object.to_string());
        argv
    }
}

/// Regular files directly inside `dir`, sorted by name
async fn output_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

#[async_trait]
impl OutputUploader for CommandUploader {
    async fn upload(&self, request_id: &str, out_dir: &Path) -> OrchestrationResult<Vec<String>> {
        let files = output_files(out_dir).await.map_err(|e| {
            OrchestrationError::delivery(request_id, format!("reading {}: {}", out_dir.display(), e))
        })?;
        let program = self.program.first().cloned().ok_or_else(|| {
            OrchestrationError::delivery(request_id, StageError::EmptyCommand.to_string())
        })?;
        let env = self.target.environment();

        let mut uploaded = Vec::with_capacity(files.len());
        for file in files {
            let Some(file_name) = file.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            let object = object_name(request_id, &file_name);
            self.runner
                .run_with_env(&self.argv(&file, &object), None, &env)
                .await
                .and_then(|output| output.into_result(&program))
                .map_err(|e| OrchestrationError::delivery(request_id, format!("{}: {}", object, e)))?;
            debug!(request_id = %request_id, object = %object, "Output uploaded");
            uploaded.push(object);
        }

        info!(request_id = %request_id, count = uploaded.len(), bucket = %self.target.bucket, "Outputs delivered");
        Ok(uploaded)
    }

    fn location(&self, request_id: &str) -> String {
        format!("{}/{}/", self.target.bucket, request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::{ProcessOutput, StageResult};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingRunner {
        calls: Mutex<Vec<(Vec<String>, Vec<(String, String)>)>>,
        fail_on: Option<String>,
    }

    #[async_trait]
    impl ProcessRunner for RecordingRunner {
        async fn run(&self, argv: &[String], cwd: Option<&Path>) -> StageResult<ProcessOutput> {
            self.run_with_env(argv, cwd, &[]).await
        }

        async fn run_with_env(
            &self,
            argv: &[String],
            _cwd: Option<&Path>,
            env: &[(String, String)],
        ) -> StageResult<ProcessOutput> {
            self.calls.lock().push((argv.to_vec(), env.to_vec()));
            let failed = self
                .fail_on
                .as_deref()
                .is_some_and(|name| argv.iter().any(|a| a.ends_with(name)));
            Ok(ProcessOutput {
                code: Some(if failed { 1 } else { 0 }),
                stdout: String::new(),
                stderr: if failed { "access denied".to_string() } else { String::new() },
            })
        }
    }

    fn target() -> ObjectStoreTarget {
        ObjectStoreTarget {
            endpoint: "minio:9000".to_string(),
            access_key: "minioadmin".to_string(),
            secret_key: "s3cret".to_string(),
            bucket: "generated".to_string(),
            secure: false,
        }
    }

    #[tokio::test]
    async fn test_uploads_each_file_under_request_id() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("b.svg"), b"<svg/>").unwrap();
        std::fs::write(temp.path().join("a.svg"), b"<svg/>").unwrap();
        std::fs::create_dir(temp.path().join("nested")).unwrap();

        let runner = Arc::new(RecordingRunner::default());
        let uploader = CommandUploader::new(runner.clone(), vec!["upload-object".to_string()], target());
        let uploaded = uploader.upload("req-1", temp.path()).await.unwrap();

        assert_eq!(uploaded, vec!["req-1/a.svg", "req-1/b.svg"]);
        let calls = runner.calls.lock();
        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls[0].0,
            vec![
                "upload-object".to_string(),
                temp.path().join("a.svg").to_string_lossy().into_owned(),
                "req-1/a.svg".to_string(),
            ]
        );
        assert!(!calls[0].0.iter().any(|a| a.contains("s3cret")));
        assert!(calls[0]
            .1
            .contains(&("MINIO_PASSWORD".to_string(), "s3cret".to_string())));
        assert_eq!(uploader.location("req-1"), "generated/req-1/");
    }

    #[tokio::test]
    async fn test_failed_upload_is_delivery_error() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("map.svg"), b"<svg/>").unwrap();
        let runner = Arc::new(RecordingRunner {
            fail_on: Some("map.svg".to_string()),
            ..Default::default()
        });
        let uploader = CommandUploader::new(runner, vec!["upload-object".to_string()], target());

        let err = uploader.upload("req-2", temp.path()).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::Delivery { .. }));
        assert!(err.to_string().contains("access denied"));
    }

    #[tokio::test]
    async fn test_missing_directory_uploads_nothing() {
        let temp = tempfile::tempdir().unwrap();
        let uploader = CommandUploader::new(
            Arc::new(RecordingRunner::default()),
            vec!["upload-object".to_string()],
            target(),
        );
        let uploaded = uploader.upload("req-3", &temp.path().join("gone")).await.unwrap();
        assert!(uploaded.is_empty());
    }
}
