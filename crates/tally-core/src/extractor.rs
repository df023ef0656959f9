//! Embedding extraction seam.
//!
//! The engine only knows that a sample goes in and a vector or an error
//! comes out. Whether the model runs in-process, in a helper process or
//! behind a network call is the implementor's business.

use crate::types::Embedding;
use thiserror::Error;

/// Raw biometric capture (an encoded image for face samples).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub data: Vec<u8>,
}

impl Sample {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractionError {
    /// The sample was read but held no usable signal (e.g. no face found).
    #[error("no usable sample: {0}")]
    NoUsableSample(String),
    /// The payload could not be decoded at all.
    #[error("unreadable sample: {0}")]
    UnreadableSample(String),
    /// The extractor itself failed; the sample may be fine.
    #[error("extractor unavailable: {0}")]
    Unavailable(String),
}

impl ExtractionError {
    /// Whether recapturing the sample may help.
    pub fn is_recapturable(&self) -> bool {
        !matches!(self, ExtractionError::Unavailable(_))
    }
}

/// Turns a raw sample into a fixed-length embedding.
pub trait EmbeddingExtractor: Send {
    fn extract(&mut self, sample: &Sample) -> Result<Embedding, ExtractionError>;
}

impl<T: EmbeddingExtractor + ?Sized> EmbeddingExtractor for Box<T> {
    fn extract(&mut self, sample: &Sample) -> Result<Embedding, ExtractionError> {
        (**self).extract(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Vec<f32>);

    impl EmbeddingExtractor for Fixed {
        fn extract(&mut self, sample: &Sample) -> Result<Embedding, ExtractionError> {
            if sample.is_empty() {
                return Err(ExtractionError::NoUsableSample("empty sample".into()));
            }
            Ok(Embedding::new(self.0.clone()))
        }
    }

    #[test]
    fn test_boxed_extractor_delegates() {
        let mut boxed: Box<dyn EmbeddingExtractor> = Box::new(Fixed(vec![0.5, 0.5]));
        let e = boxed.extract(&Sample::new(vec![1, 2, 3])).unwrap();
        assert_eq!(e.values, vec![0.5, 0.5]);
        assert!(matches!(
            boxed.extract(&Sample::new(Vec::new())),
            Err(ExtractionError::NoUsableSample(_))
        ));
    }

    #[test]
    fn test_recapturable_kinds() {
        assert!(ExtractionError::NoUsableSample("x".into()).is_recapturable());
        assert!(ExtractionError::UnreadableSample("x".into()).is_recapturable());
        assert!(!ExtractionError::Unavailable("x".into()).is_recapturable());
    }
}
