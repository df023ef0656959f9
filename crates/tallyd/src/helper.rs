//! Embedding extraction through a long-lived helper process.
//!
//! Protocol: one JSON object per line in each direction.
//! Request `{"imageData": "<base64>"}`; reply `{"embedding": [f32, ...]}`
//! or `{"error": "..."}`. Lines carrying only `{"status": ...}` are
//! progress chatter (model loading) and are skipped.
//!
//! The helper's stdout is drained by a reader thread so every exchange can
//! be bounded. A helper that misses the deadline is killed and respawned on
//! the next request. Its stderr is forwarded to tracing.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};
use tally_core::{Embedding, EmbeddingExtractor, ExtractionError, Sample};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Deserialize)]
struct HelperReply {
    #[serde(default)]
    embedding: Option<Vec<f32>>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

struct HelperProcess {
    child: Child,
    stdin: ChildStdin,
    lines: Receiver<std::io::Result<String>>,
}

impl Drop for HelperProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Extractor backed by an external helper program.
///
/// The helper is spawned lazily and respawned on the next request after
/// it dies or stops answering.
pub struct HelperExtractor {
    command: Vec<String>,
    model_version: Option<String>,
    timeout: Duration,
    process: Option<HelperProcess>,
}

impl HelperExtractor {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            model_version: None,
            timeout: DEFAULT_TIMEOUT,
            process: None,
        }
    }

    /// Tag produced embeddings with a model version.
    pub fn with_model_version(mut self, version: impl Into<String>) -> Self {
        self.model_version = Some(version.into());
        self
    }

    /// Longest wait for one reply before the helper is killed.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn spawn(&self) -> Result<HelperProcess, ExtractionError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| ExtractionError::Unavailable("empty helper command".into()))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ExtractionError::Unavailable(format!("spawn {program}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ExtractionError::Unavailable("helper stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExtractionError::Unavailable("helper stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExtractionError::Unavailable("helper stderr not captured".into()))?;

        let pid = child.id();
        let (tx, lines) = mpsc::channel();
        std::thread::Builder::new()
            .name("tally-helper-out".into())
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            })
            .map_err(|e| ExtractionError::Unavailable(format!("helper reader thread: {e}")))?;
        std::thread::Builder::new()
            .name("tally-helper-err".into())
            .spawn(move || forward_stderr(stderr, pid))
            .map_err(|e| ExtractionError::Unavailable(format!("helper stderr thread: {e}")))?;

        tracing::info!(program = %program, pid, "extraction helper started");
        Ok(HelperProcess { child, stdin, lines })
    }

    fn exchange(
        process: &mut HelperProcess,
        request: &str,
        timeout: Duration,
    ) -> Result<Vec<f32>, ExtractionError> {
        writeln!(process.stdin, "{request}")
            .and_then(|_| process.stdin.flush())
            .map_err(|e| ExtractionError::Unavailable(format!("write to helper: {e}")))?;

        let deadline = Instant::now() + timeout;
        loop {
            let line = match process.lines.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                Ok(Ok(line)) => line,
                Ok(Err(e)) => return Err(ExtractionError::Unavailable(format!("read from helper: {e}"))),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(ExtractionError::Unavailable(format!(
                        "helper did not answer within {}ms",
                        timeout.as_millis()
                    )))
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(ExtractionError::Unavailable("helper closed its output".into()))
                }
            };

            let reply: HelperReply = match serde_json::from_str(line.trim()) {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::warn!(error = %e, line = line.trim(), "skipping malformed helper line");
                    continue;
                }
            };

            if let Some(error) = reply.error {
                return Err(ExtractionError::NoUsableSample(error));
            }
            if let Some(values) = reply.embedding {
                if values.is_empty() {
                    return Err(ExtractionError::NoUsableSample("helper returned an empty embedding".into()));
                }
                return Ok(values);
            }
            if let Some(status) = reply.status {
                tracing::debug!(status = %status, "helper status");
            }
        }
    }
}

fn forward_stderr(stderr: impl Read, pid: u32) {
    for line in BufReader::new(stderr).lines() {
        match line {
            Ok(line) if !line.trim().is_empty() => tracing::warn!(pid, "helper: {}", line.trim()),
            Ok(_) => {}
            Err(_) => break,
        }
    }
}

/// Reject payloads that are not a recognizable image before a round trip.
fn sniff(sample: &Sample) -> Result<(), ExtractionError> {
    if sample.is_empty() {
        return Err(ExtractionError::UnreadableSample("empty sample".into()));
    }
    image::guess_format(&sample.data)
        .map(|format| tracing::trace!(?format, bytes = sample.data.len(), "sample sniffed"))
        .map_err(|e| ExtractionError::UnreadableSample(e.to_string()))
}

impl EmbeddingExtractor for HelperExtractor {
    fn extract(&mut self, sample: &Sample) -> Result<Embedding, ExtractionError> {
        sniff(sample)?;

        if self.process.is_none() {
            self.process = Some(self.spawn()?);
        }
        let request = serde_json::json!({ "imageData": BASE64.encode(&sample.data) }).to_string();

        let result = match self.process.as_mut() {
            Some(process) => Self::exchange(process, &request, self.timeout),
            None => Err(ExtractionError::Unavailable("helper not running".into())),
        };

        if let Err(ExtractionError::Unavailable(reason)) = &result {
            tracing::warn!(reason = %reason, "extraction helper lost; will respawn on next request");
            self.process = None;
        }

        result.map(|values| Embedding {
            values,
            model_version: self.model_version.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

    fn sh(script: &str) -> HelperExtractor {
        HelperExtractor::new(vec!["sh".into(), "-c".into(), script.into()])
    }

    #[test]
    fn test_embedding_reply() {
        let mut helper = sh(r#"echo '{"status":"model loaded"}'; while read line; do echo '{"embedding":[0.5,0.25]}'; done"#)
            .with_model_version("facenet");
        let e = helper.extract(&Sample::new(PNG_MAGIC.to_vec())).unwrap();
        assert_eq!(e.values, vec![0.5, 0.25]);
        assert_eq!(e.model_version.as_deref(), Some("facenet"));
        // Same process serves the next request.
        assert!(helper.extract(&Sample::new(PNG_MAGIC.to_vec())).is_ok());
    }

    #[test]
    fn test_error_reply_is_no_usable_sample() {
        let mut helper = sh(r#"while read line; do echo '{"error":"Face could not be detected"}'; done"#);
        let err = helper.extract(&Sample::new(PNG_MAGIC.to_vec())).unwrap_err();
        assert_eq!(err, ExtractionError::NoUsableSample("Face could not be detected".into()));
        assert!(helper.process.is_some(), "helper stays up after a per-sample error");
    }

    #[test]
    fn test_unrecognized_payload_never_reaches_helper() {
        let mut helper = HelperExtractor::new(vec!["/nonexistent/helper".into()]);
        assert!(matches!(
            helper.extract(&Sample::new(b"plain text".to_vec())),
            Err(ExtractionError::UnreadableSample(_))
        ));
        assert!(matches!(
            helper.extract(&Sample::new(Vec::new())),
            Err(ExtractionError::UnreadableSample(_))
        ));
        assert!(helper.process.is_none());
    }

    #[test]
    fn test_missing_program_is_unavailable() {
        let mut helper = HelperExtractor::new(vec!["/nonexistent/helper".into()]);
        assert!(matches!(
            helper.extract(&Sample::new(PNG_MAGIC.to_vec())),
            Err(ExtractionError::Unavailable(_))
        ));
    }

    #[test]
    fn test_dead_helper_is_respawned() {
        // Answers once, then exits.
        let mut helper = sh(r#"read line; echo '{"embedding":[1.0]}'"#);
        assert!(helper.extract(&Sample::new(PNG_MAGIC.to_vec())).is_ok());
        assert!(matches!(
            helper.extract(&Sample::new(PNG_MAGIC.to_vec())),
            Err(ExtractionError::Unavailable(_))
        ));
        assert!(helper.process.is_none());
        assert!(helper.extract(&Sample::new(PNG_MAGIC.to_vec())).is_ok());
    }

    #[test]
    fn test_hung_helper_is_killed_and_respawned() {
        let marker = std::env::temp_dir().join(format!("tally-helper-{}", tally_core::PrincipalId::new()));
        // First run swallows the request and hangs; later runs answer.
        let script = format!(
            r#"if [ -e '{m}' ]; then while read line; do echo '{{"embedding":[1.0]}}'; done; else touch '{m}'; read line; exec sleep 60; fi"#,
            m = marker.display()
        );
        let mut helper = sh(&script).with_timeout(Duration::from_millis(300));

        let started = Instant::now();
        assert!(matches!(
            helper.extract(&Sample::new(PNG_MAGIC.to_vec())),
            Err(ExtractionError::Unavailable(_))
        ));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(helper.process.is_none());

        assert_eq!(helper.extract(&Sample::new(PNG_MAGIC.to_vec())).unwrap().values, vec![1.0]);
        let _ = std::fs::remove_file(&marker);
    }

    #[tokio::test]
    async fn test_hung_helper_does_not_wedge_engine() {
        let helper = sh("read line; exec sleep 60").with_timeout(Duration::from_millis(300));
        let engine = crate::engine::spawn_engine(Box::new(helper)).unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), engine.extract(Sample::new(PNG_MAGIC.to_vec())))
            .await
            .unwrap();
        assert!(matches!(
            first,
            Err(crate::engine::EngineError::Extraction(ExtractionError::Unavailable(_)))
        ));

        // Requests that never reach the helper are answered promptly again.
        for _ in 0..3 {
            let later = tokio::time::timeout(Duration::from_secs(2), engine.extract(Sample::new(Vec::new())))
                .await
                .unwrap();
            assert!(matches!(
                later,
                Err(crate::engine::EngineError::Extraction(ExtractionError::UnreadableSample(_)))
            ));
        }
    }
}
