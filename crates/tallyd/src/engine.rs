use tally_core::{CosineMatcher, Embedding, EmbeddingExtractor, ExtractionError, Matcher, Resolution, RosterEntry, Sample};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Result of identifying a sample against a roster.
#[derive(Debug, Clone)]
pub struct Identified {
    pub resolution: Resolution,
    /// Dimension of the probe embedding.
    pub dim: usize,
}

/// Messages sent from request handlers to the engine thread.
enum EngineRequest {
    Extract {
        sample: Sample,
        reply: oneshot::Sender<Result<Embedding, EngineError>>,
    },
    Identify {
        sample: Sample,
        roster: Vec<RosterEntry>,
        threshold: f64,
        reply: oneshot::Sender<Result<Identified, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Extract a reference embedding from a sample (enrollment).
    pub async fn extract(&self, sample: Sample) -> Result<Embedding, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Extract {
                sample,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Extract a probe and resolve it against a read-only roster snapshot.
    pub async fn identify(
        &self,
        sample: Sample,
        roster: Vec<RosterEntry>,
        threshold: f64,
    ) -> Result<Identified, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Identify {
                sample,
                roster,
                threshold,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The extractor may block (helper process I/O, model inference) and the
/// roster scan is CPU-bound, so neither runs on the async runtime. No
/// per-principal lock is ever held while a request is in here.
pub fn spawn_engine(mut extractor: Box<dyn EmbeddingExtractor>) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("tally-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Extract { sample, reply } => {
                        let result = extractor.extract(&sample).map_err(EngineError::from);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Identify {
                        sample,
                        roster,
                        threshold,
                        reply,
                    } => {
                        let result = run_identify(&mut *extractor, &sample, &roster, threshold);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

fn run_identify(
    extractor: &mut dyn EmbeddingExtractor,
    sample: &Sample,
    roster: &[RosterEntry],
    threshold: f64,
) -> Result<Identified, EngineError> {
    let probe = extractor.extract(sample)?;
    let resolution = CosineMatcher.resolve(&probe, roster, threshold);

    match &resolution {
        Resolution::Matched { principal, distance } => {
            tracing::debug!(principal = %principal, distance, candidates = roster.len(), "identify: matched");
        }
        Resolution::NoMatch { best_distance } => {
            tracing::debug!(?best_distance, candidates = roster.len(), "identify: no match");
        }
    }

    Ok(Identified {
        resolution,
        dim: probe.dim(),
    })
}
