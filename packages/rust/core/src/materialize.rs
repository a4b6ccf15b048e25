//! Idempotent download of converted results into the output layout.

use std::path::{Path, PathBuf};

use kbforge_shared::{ConversionTask, KbError, Result};
use reqwest::Client;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};

/// Where converted artifacts land: `<output_dir>/<relative_dir>/<stem>.zip`.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    pub output_dir: PathBuf,
}

impl OutputLayout {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// Final archive path for a task.
    pub fn archive_path(&self, task: &ConversionTask) -> PathBuf {
        self.output_dir
            .join(&task.relative_dir)
            .join(format!("{}.zip", task.file_stem()))
    }

    /// Final path for a source that is copied verbatim.
    pub fn copy_path(&self, relative_dir: &Path, file_name: &str) -> PathBuf {
        self.output_dir.join(relative_dir).join(file_name)
    }
}

/// Outcome of a materialization attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Materialized {
    /// Downloaded and moved into place.
    Written {
        path: PathBuf,
        bytes: u64,
        sha256: String,
    },
    /// The target already existed; nothing was fetched.
    AlreadyPresent { path: PathBuf },
}

impl Materialized {
    pub fn path(&self) -> &Path {
        match self {
            Self::Written { path, .. } | Self::AlreadyPresent { path } => path,
        }
    }
}

/// Downloads result archives with a temp-file-then-rename protocol.
pub struct ResultMaterializer {
    http: Client,
    layout: OutputLayout,
}

impl ResultMaterializer {
    pub fn new(http: Client, layout: OutputLayout) -> Self {
        Self { http, layout }
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    /// Place the result of `task` at its final path.
    ///
    /// The final path is only ever created by a rename of a fully written
    /// file. On error the partial file is removed and the caller gets
    /// [`KbError::IncompleteDownload`].
    #[instrument(skip_all, fields(task_id = %task.id))]
    pub async fn materialize(&self, task: &ConversionTask, url: &str) -> Result<Materialized> {
        let target = self.layout.archive_path(task);
        if target.exists() {
            debug!(path = %target.display(), "result already present, skipping download");
            return Ok(Materialized::AlreadyPresent { path: target });
        }

        let dir = target
            .parent()
            .ok_or_else(|| KbError::validation(format!("{} has no parent", target.display())))?;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| KbError::io(dir, e))?;
        let part = dir.join(format!(".{}.zip.part", task.file_stem()));

        let (bytes, sha256) = match self.download_to(url, &part).await {
            Ok(done) => done,
            Err(e) => {
                let _ = tokio::fs::remove_file(&part).await;
                return Err(e);
            }
        };

        if let Err(e) = tokio::fs::rename(&part, &target).await {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(KbError::incomplete_download(
                url,
                format!("rename to {} failed: {e}", target.display()),
            ));
        }

        info!(path = %target.display(), bytes, %sha256, "result materialized");
        Ok(Materialized::Written {
            path: target,
            bytes,
            sha256,
        })
    }

    /// Stream `url` into `part`, returning the byte count and SHA-256.
    async fn download_to(&self, url: &str, part: &Path) -> Result<(u64, String)> {
        let fail = |reason: String| KbError::incomplete_download(url, reason);

        let mut response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| fail(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(fail(format!("HTTP {status}")));
        }
        let expected = response.content_length();

        let mut file = tokio::fs::File::create(part)
            .await
            .map_err(|e| fail(format!("create {}: {e}", part.display())))?;
        let mut hasher = Sha256::new();
        let mut written: u64 = 0;

        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| fail(format!("body read failed after {written} bytes: {e}")))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|e| fail(format!("write {}: {e}", part.display())))?;
            hasher.update(&chunk);
            written += chunk.len() as u64;
        }

        file.flush()
            .await
            .map_err(|e| fail(format!("flush: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| fail(format!("sync: {e}")))?;

        if let Some(expected) = expected {
            if written != expected {
                return Err(fail(format!(
                    "short body: got {written} of {expected} bytes"
                )));
            }
        }

        Ok((written, format!("{:x}", hasher.finalize())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{temp_dir, task_in};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn materializer(out: &Path) -> ResultMaterializer {
        ResultMaterializer::new(Client::new(), OutputLayout::new(out))
    }

    #[tokio::test]
    async fn downloads_into_mirrored_layout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"PK\x03\x04zip".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let out = temp_dir();
        let task = task_in("u-1", "laws/tax", "policy.pdf");
        let m = materializer(&out);

        let result = m
            .materialize(&task, &format!("{}/a.zip", server.uri()))
            .await
            .unwrap();
        let expected = out.join("laws").join("tax").join("policy.zip");
        match &result {
            Materialized::Written { path, bytes, sha256 } => {
                assert_eq!(path, &expected);
                assert_eq!(*bytes, 7);
                assert_eq!(sha256.len(), 64);
            }
            other => panic!("expected Written, got {other:?}"),
        }
        assert_eq!(std::fs::read(&expected).unwrap(), b"PK\x03\x04zip");
        assert!(!expected.with_file_name(".policy.zip.part").exists());
    }

    #[tokio::test]
    async fn existing_target_skips_network() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("new"))
            .expect(0)
            .mount(&server)
            .await;

        let out = temp_dir();
        let task = task_in("u-1", "", "report.v2.pdf");
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(out.join("report.v2.zip"), "old").unwrap();

        let result = materializer(&out)
            .materialize(&task, &format!("{}/x.zip", server.uri()))
            .await
            .unwrap();
        assert!(matches!(result, Materialized::AlreadyPresent { .. }));
        assert_eq!(std::fs::read_to_string(out.join("report.v2.zip")).unwrap(), "old");
    }

    #[tokio::test]
    async fn http_error_leaves_no_files() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let out = temp_dir();
        let task = task_in("u-1", "sub", "a.pdf");
        let err = materializer(&out)
            .materialize(&task, &format!("{}/gone.zip", server.uri()))
            .await
            .unwrap_err();

        assert!(matches!(err, KbError::IncompleteDownload { .. }));
        assert!(!out.join("sub").join("a.zip").exists());
        assert!(!out.join("sub").join(".a.zip.part").exists());
    }

    #[test]
    fn layout_paths() {
        let layout = OutputLayout::new("/kb/02_raw_md_files");
        let task = task_in("u-1", "a/b", "doc.final.pdf");
        assert_eq!(
            layout.archive_path(&task),
            PathBuf::from("/kb/02_raw_md_files/a/b/doc.final.zip")
        );
        assert_eq!(
            layout.copy_path(Path::new("a"), "notes.md"),
            PathBuf::from("/kb/02_raw_md_files/a/notes.md")
        );
    }
}
