use std::sync::Arc;
use tally_core::{MarkIntent, PrincipalId, Sample};
use zbus::interface;

use crate::attendance::{AttendanceError, AttendanceService, MarkTarget, SessionContext};

/// Typed errors returned to bus clients.
#[derive(Debug, zbus::DBusError)]
#[zbus(prefix = "io.tally.Error")]
pub enum TallyError {
    #[zbus(error)]
    ZBus(zbus::Error),
    Extraction(String),
    NoMatch(String),
    InvalidState(String),
    ConcurrencyConflict(String),
    Persistence(String),
    Timeout(String),
    UnknownPrincipal(String),
    NotPermitted(String),
    InvalidArgs(String),
}

impl From<AttendanceError> for TallyError {
    fn from(err: AttendanceError) -> Self {
        let msg = err.to_string();
        match err {
            AttendanceError::Extraction(_) => TallyError::Extraction(msg),
            AttendanceError::NoMatch { .. } => TallyError::NoMatch(msg),
            AttendanceError::InvalidState(_) | AttendanceError::PeriodNotOpen | AttendanceError::Ledger(_) => {
                TallyError::InvalidState(msg)
            }
            AttendanceError::ConcurrencyConflict(_) => TallyError::ConcurrencyConflict(msg),
            AttendanceError::Persistence(_) => TallyError::Persistence(msg),
            AttendanceError::Timeout(_) => TallyError::Timeout(msg),
            AttendanceError::UnknownPrincipal(_) | AttendanceError::UnknownContact(_) => {
                TallyError::UnknownPrincipal(msg)
            }
            AttendanceError::NotPermitted(_) => TallyError::NotPermitted(msg),
            AttendanceError::InvalidInput(_) => TallyError::InvalidArgs(msg),
        }
    }
}

fn parse_id(field: &str, value: &str) -> Result<PrincipalId, TallyError> {
    value
        .parse()
        .map_err(|e| TallyError::InvalidArgs(format!("{field}: {e}")))
}

fn context(supervisor: &str) -> Result<SessionContext, TallyError> {
    Ok(SessionContext {
        supervisor: parse_id("supervisor", supervisor)?,
    })
}

fn parse_intent(value: &str) -> Result<MarkIntent, TallyError> {
    value.parse().map_err(TallyError::InvalidArgs)
}

fn json<T: serde::Serialize>(value: &T) -> Result<String, TallyError> {
    serde_json::to_string(value).map_err(|e| TallyError::Persistence(e.to_string()))
}

/// D-Bus interface for the attendance daemon.
///
/// Bus name: io.tally.Attendance1
/// Object path: /io/tally/Attendance1
///
/// Every call acting for a supervisor takes that supervisor's id first.
/// Results are JSON strings.
///
/// The supervisor id is taken on trust: any client that can reach the bus
/// name can act for any supervisor. On the system bus, restrict the name
/// with a D-Bus policy file.
pub struct TallyService {
    service: Arc<AttendanceService>,
}

impl TallyService {
    pub fn new(service: Arc<AttendanceService>) -> Self {
        Self { service }
    }
}

#[interface(name = "io.tally.Attendance1")]
impl TallyService {
    /// Mark a principal by id. `intent` is "toggle" (or empty), "start" or "end".
    async fn mark(&self, supervisor: &str, principal: &str, intent: &str) -> Result<String, TallyError> {
        let ctx = context(supervisor)?;
        let target = MarkTarget::Principal(parse_id("principal", principal)?);
        tracing::info!(supervisor, principal, intent, "mark requested");
        json(&self.service.mark(&ctx, target, parse_intent(intent)?).await?)
    }

    /// Mark the subject on the supervisor's roster with this contact address.
    async fn mark_contact(&self, supervisor: &str, contact: &str, intent: &str) -> Result<String, TallyError> {
        let ctx = context(supervisor)?;
        tracing::info!(supervisor, contact, intent, "contact mark requested");
        let target = MarkTarget::Contact(contact.to_string());
        json(&self.service.mark(&ctx, target, parse_intent(intent)?).await?)
    }

    /// Mark whoever on the supervisor's roster the sample resolves to.
    async fn mark_sample(&self, supervisor: &str, sample: Vec<u8>, intent: &str) -> Result<String, TallyError> {
        let ctx = context(supervisor)?;
        tracing::info!(supervisor, bytes = sample.len(), intent, "sample mark requested");
        let target = MarkTarget::Sample(Sample::new(sample));
        json(&self.service.mark(&ctx, target, parse_intent(intent)?).await?)
    }

    /// Open or close the supervisor's own period.
    async fn mark_period(&self, supervisor: &str, intent: &str) -> Result<String, TallyError> {
        let ctx = context(supervisor)?;
        tracing::info!(supervisor, intent, "period mark requested");
        json(&self.service.mark_period(&ctx, parse_intent(intent)?).await?)
    }

    async fn period_status(&self, supervisor: &str) -> Result<String, TallyError> {
        json(&self.service.period_status(&context(supervisor)?).await?)
    }

    async fn ledger(&self, supervisor: &str, principal: &str) -> Result<String, TallyError> {
        let ctx = context(supervisor)?;
        json(&self.service.ledger(&ctx, parse_id("principal", principal)?).await?)
    }

    async fn roster(&self, supervisor: &str) -> Result<String, TallyError> {
        json(&self.service.roster(&context(supervisor)?).await?)
    }

    async fn enroll_supervisor(&self, name: &str, contact: &str) -> Result<String, TallyError> {
        tracing::info!(name, "supervisor enrollment requested");
        json(&self.service.enroll_supervisor(name, contact).await?)
    }

    async fn enroll_subject(
        &self,
        supervisor: &str,
        name: &str,
        contact: &str,
        sample: Vec<u8>,
    ) -> Result<String, TallyError> {
        let ctx = context(supervisor)?;
        tracing::info!(supervisor, name, bytes = sample.len(), "subject enrollment requested");
        json(&self.service.enroll_subject(&ctx, name, contact, Sample::new(sample)).await?)
    }

    /// Returns the subject's reference count after the addition.
    async fn add_reference(&self, supervisor: &str, principal: &str, sample: Vec<u8>) -> Result<u32, TallyError> {
        let ctx = context(supervisor)?;
        let id = parse_id("principal", principal)?;
        let count = self.service.add_reference(&ctx, id, Sample::new(sample)).await?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn remove_subject(&self, supervisor: &str, principal: &str) -> Result<bool, TallyError> {
        let ctx = context(supervisor)?;
        tracing::info!(supervisor, principal, "removal requested");
        self.service.remove_subject(&ctx, parse_id("principal", principal)?).await?;
        Ok(true)
    }

    /// Return daemon status information.
    async fn status(&self) -> Result<String, TallyError> {
        json(&self.service.status().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attendance::{Settings, SystemClock};
    use crate::engine::spawn_engine;
    use crate::notify::LogNotifier;
    use chrono::FixedOffset;
    use std::time::Duration;
    use tally_core::{Embedding, EmbeddingExtractor, ExtractionError, TransitionError};
    use tally_store::AttendanceStore;

    /// Sample bytes are the embedding itself, little-endian f32.
    struct RawExtractor;

    impl EmbeddingExtractor for RawExtractor {
        fn extract(&mut self, sample: &Sample) -> Result<Embedding, ExtractionError> {
            Embedding::from_le_bytes(&sample.data, None)
                .filter(|e| e.dim() > 0)
                .ok_or_else(|| ExtractionError::UnreadableSample("ragged".into()))
        }
    }

    async fn interface() -> TallyService {
        let store = AttendanceStore::in_memory().await.unwrap();
        let engine = spawn_engine(Box::new(RawExtractor)).unwrap();
        let service = AttendanceService::new(
            store,
            engine,
            Arc::new(LogNotifier),
            Arc::new(SystemClock),
            Settings {
                threshold: 0.35,
                tz: FixedOffset::east_opt(0).unwrap(),
                extract_timeout: Duration::from_secs(5),
                lock_timeout: Duration::from_secs(1),
            },
        );
        TallyService::new(Arc::new(service))
    }

    fn field(json: &str, key: &str) -> String {
        let value: serde_json::Value = serde_json::from_str(json).unwrap();
        value[key].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_json_replies_and_typed_errors() {
        let svc = interface().await;
        let sup = field(&svc.enroll_supervisor("Ada", "ada@example.com").await.unwrap(), "id");

        let period = svc.mark_period(&sup, "start").await.unwrap();
        assert_eq!(field(&period, "event"), "start");

        let sample = Embedding::new(vec![1.0, 0.0]).to_le_bytes();
        let bob = field(
            &svc.enroll_subject(&sup, "Bob", "bob@example.com", sample).await.unwrap(),
            "id",
        );

        let marked = svc.mark_contact(&sup, "bob@example.com", "").await.unwrap();
        assert_eq!(field(&marked, "principalId"), bob);
        assert_eq!(field(&marked, "event"), "start");

        assert!(matches!(
            svc.mark_contact(&sup, "nobody@example.com", "toggle").await,
            Err(TallyError::UnknownPrincipal(_))
        ));
        assert!(matches!(
            svc.mark(&sup, &bob, "start").await,
            Err(TallyError::InvalidState(_))
        ));
        assert!(matches!(
            svc.enroll_subject(&sup, "Robert", "bob@example.com", Embedding::new(vec![0.0, 1.0]).to_le_bytes())
                .await,
            Err(TallyError::InvalidArgs(_))
        ));
        assert!(svc.status().await.unwrap().contains("\"subjects\":1"));
    }

    #[test]
    fn test_period_not_open_is_invalid_state() {
        assert!(matches!(
            TallyError::from(AttendanceError::PeriodNotOpen),
            TallyError::InvalidState(_)
        ));
        assert!(matches!(
            TallyError::from(AttendanceError::InvalidState(TransitionError::NotOpen)),
            TallyError::InvalidState(_)
        ));
    }

    #[test]
    fn test_extraction_and_no_match_stay_distinct() {
        let extraction = TallyError::from(AttendanceError::Extraction(ExtractionError::NoUsableSample(
            "no face".into(),
        )));
        let no_match = TallyError::from(AttendanceError::NoMatch {
            best_distance: Some(0.6),
        });
        assert!(matches!(extraction, TallyError::Extraction(ref m) if m.contains("no face")));
        assert!(matches!(no_match, TallyError::NoMatch(_)));
    }

    #[test]
    fn test_bad_arguments_rejected() {
        assert!(matches!(context("not-a-uuid"), Err(TallyError::InvalidArgs(_))));
        assert!(matches!(parse_intent("sideways"), Err(TallyError::InvalidArgs(_))));
        assert_eq!(parse_intent("").unwrap(), MarkIntent::Toggle);
    }
}
