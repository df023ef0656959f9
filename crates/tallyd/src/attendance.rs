//! Mark orchestration: resolve, flip, fold into the ledger, commit, notify.
//!
//! Resolution runs on the engine thread against a roster snapshot with no
//! lock held. The flip and ledger write for one principal happen under that
//! principal's lock and land in a single store commit, version-guarded on
//! the principal and on the supervisor whose period authorizes the mark.

use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tally_core::{
    ExtractionError, Ledger, LedgerError, MarkEvent, MarkIntent, Presence, Principal, PrincipalId,
    PrincipalKind, Resolution, Sample, Transition, TransitionError,
};
use tally_store::{AttendanceStore, Commit, PrincipalWrite, StoreError};
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;

use crate::engine::{EngineError, EngineHandle};
use crate::locks::PrincipalLocks;
use crate::notify::{dispatch, Notification, Notifier};

#[derive(Error, Debug)]
pub enum AttendanceError {
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error("no enrolled principal within threshold")]
    NoMatch { best_distance: Option<f64> },
    #[error(transparent)]
    InvalidState(#[from] TransitionError),
    #[error("supervisor period is not open")]
    PeriodNotOpen,
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("{0} was updated concurrently; retry")]
    ConcurrencyConflict(PrincipalId),
    #[error("persistence failed: {0}")]
    Persistence(StoreError),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("unknown principal {0}")]
    UnknownPrincipal(PrincipalId),
    #[error("no subject with contact {0:?} on this roster")]
    UnknownContact(String),
    #[error("not permitted: {0}")]
    NotPermitted(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl From<StoreError> for AttendanceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::VersionConflict { principal, .. } => AttendanceError::ConcurrencyConflict(principal),
            StoreError::NotFound(id) => AttendanceError::UnknownPrincipal(id),
            StoreError::DuplicateContact(contact) => {
                AttendanceError::InvalidInput(format!("a subject with contact {contact:?} already exists"))
            }
            other => AttendanceError::Persistence(other),
        }
    }
}

impl From<EngineError> for AttendanceError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Extraction(e) => AttendanceError::Extraction(e),
            other => AttendanceError::Extraction(ExtractionError::Unavailable(other.to_string())),
        }
    }
}

/// Source of "now" for marks. Instants are millisecond precision.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        let now = Utc::now();
        Utc.timestamp_millis_opt(now.timestamp_millis()).single().unwrap_or(now)
    }
}

/// The authenticated supervisor a request acts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionContext {
    pub supervisor: PrincipalId,
}

/// Who a mark is for.
#[derive(Debug, Clone)]
pub enum MarkTarget {
    Principal(PrincipalId),
    /// A subject on the supervisor's roster, by contact address.
    Contact(String),
    /// Resolve against the supervisor's roster first.
    Sample(Sample),
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub threshold: f64,
    pub tz: FixedOffset,
    pub extract_timeout: Duration,
    pub lock_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkOutcome {
    pub principal_id: PrincipalId,
    pub name: String,
    pub event: MarkEvent,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
    /// Time credited by a close, across all days it touched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub online_ms: Option<i64>,
    /// Subjects closed along with a supervisor's period.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub force_closed: Vec<PrincipalId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrincipalView {
    pub id: PrincipalId,
    pub kind: PrincipalKind,
    pub name: String,
    pub contact: String,
    pub state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<DateTime<Utc>>,
}

impl From<&Principal> for PrincipalView {
    fn from(p: &Principal) -> Self {
        Self {
            id: p.id,
            kind: p.kind,
            name: p.name.clone(),
            contact: p.contact.clone(),
            state: p.presence.as_str(),
            opened_at: p.presence.opened_at(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerView {
    pub principal_id: PrincipalId,
    pub total_online_ms: i64,
    pub days: Ledger,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub version: &'static str,
    pub supervisors: usize,
    pub subjects: usize,
    pub references: usize,
    pub open: usize,
    pub distance_threshold: f64,
    pub utc_offset: String,
}

pub struct AttendanceService {
    store: AttendanceStore,
    engine: EngineHandle,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    locks: PrincipalLocks,
    settings: Settings,
}

impl AttendanceService {
    pub fn new(
        store: AttendanceStore,
        engine: EngineHandle,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        settings: Settings,
    ) -> Self {
        Self {
            store,
            engine,
            notifier,
            clock,
            locks: PrincipalLocks::new(),
            settings,
        }
    }

    // =========================================================================
    // Marks
    // =========================================================================

    /// Flip a subject's presence on behalf of their supervisor.
    ///
    /// A mark aimed at the caller's own id is a period mark.
    pub async fn mark(
        &self,
        ctx: &SessionContext,
        target: MarkTarget,
        intent: MarkIntent,
    ) -> Result<MarkOutcome, AttendanceError> {
        if matches!(target, MarkTarget::Principal(id) if id == ctx.supervisor) {
            return self.mark_period(ctx, intent).await;
        }

        // Fail fast before paying for extraction.
        let supervisor = self.supervisor(ctx).await?;
        if !supervisor.presence.is_open() {
            return Err(AttendanceError::PeriodNotOpen);
        }

        let (id, distance) = match target {
            MarkTarget::Principal(id) => (id, None),
            MarkTarget::Contact(contact) => (self.subject_by_contact(&supervisor, &contact).await?, None),
            MarkTarget::Sample(sample) => {
                let (id, distance) = self.identify(&supervisor, sample).await?;
                (id, Some(distance))
            }
        };

        let _guard = self.lock(id).await?;

        // Re-read both records under the lock; the commit pins the versions seen here.
        let supervisor = self.supervisor(ctx).await?;
        if !supervisor.presence.is_open() {
            return Err(AttendanceError::PeriodNotOpen);
        }
        let subject = self.owned_subject(&supervisor, id).await?;

        let now = self.clock.now();
        let transition = subject.presence.mark(intent, now)?;
        let (write, online_ms) = self.prepare_write(&subject, &transition).await?;
        self.store.commit(Commit::single(write).guard(&supervisor)).await?;

        tracing::info!(
            principal = %subject.id,
            supervisor = %supervisor.id,
            event = %transition.event(),
            ?distance,
            ?online_ms,
            "marked"
        );
        self.notify(&subject, transition.event(), now);

        Ok(MarkOutcome {
            principal_id: subject.id,
            name: subject.name,
            event: transition.event(),
            timestamp: now,
            distance,
            online_ms,
            force_closed: Vec::new(),
        })
    }

    /// Open or close the caller's own period.
    ///
    /// Closing also closes every subject still open, at the same instant and
    /// in the same commit.
    pub async fn mark_period(&self, ctx: &SessionContext, intent: MarkIntent) -> Result<MarkOutcome, AttendanceError> {
        let _supervisor_guard = self.lock(ctx.supervisor).await?;
        let supervisor = self.supervisor(ctx).await?;

        let now = self.clock.now();
        let transition = supervisor.presence.mark(intent, now)?;
        let (write, online_ms) = self.prepare_write(&supervisor, &transition).await?;
        let mut commit = Commit::single(write);

        let mut closed_subjects = Vec::new();
        // Held until the commit lands so no subject opens behind our back.
        let mut _subject_guards = Vec::new();
        if let Transition::Closed { closed_at, .. } = transition {
            let mut roster = self.store.subjects(supervisor.id).await?;
            roster.sort_by_key(|s| s.id);
            for subject in &roster {
                _subject_guards.push(self.lock(subject.id).await?);
            }

            for subject in self.store.open_subjects(supervisor.id).await? {
                let Some(opened_at) = subject.presence.opened_at() else {
                    continue;
                };
                let mut write = PrincipalWrite::new(&subject, Presence::Closed);
                if opened_at < closed_at {
                    let update = self
                        .store
                        .ledger(subject.id)
                        .await?
                        .with_interval(opened_at, closed_at, &self.settings.tz)?;
                    write = write.with_ledger(&update);
                } else {
                    tracing::warn!(
                        principal = %subject.id,
                        opened_at = %opened_at,
                        closed_at = %closed_at,
                        "subject opened at or after period close; closing without ledger entry"
                    );
                }
                commit.push(write);
                closed_subjects.push(subject);
            }
        }

        self.store.commit(commit).await?;

        tracing::info!(
            supervisor = %supervisor.id,
            event = %transition.event(),
            ?online_ms,
            force_closed = closed_subjects.len(),
            "period marked"
        );
        self.notify(&supervisor, transition.event(), now);
        for subject in &closed_subjects {
            self.notify(subject, MarkEvent::End, now);
        }

        Ok(MarkOutcome {
            principal_id: supervisor.id,
            name: supervisor.name,
            event: transition.event(),
            timestamp: now,
            distance: None,
            online_ms,
            force_closed: closed_subjects.iter().map(|s| s.id).collect(),
        })
    }

    /// Presence write for one transition, with the ledger days a close touches.
    async fn prepare_write(
        &self,
        principal: &Principal,
        transition: &Transition,
    ) -> Result<(PrincipalWrite, Option<i64>), AttendanceError> {
        let write = PrincipalWrite::new(principal, transition.presence_after());
        match *transition {
            Transition::Opened { .. } => Ok((write, None)),
            Transition::Closed { opened_at, closed_at } => {
                let update = self
                    .store
                    .ledger(principal.id)
                    .await?
                    .with_interval(opened_at, closed_at, &self.settings.tz)?;
                let credited = update.chunks.iter().map(|c| c.timing.duration_ms()).sum();
                Ok((write.with_ledger(&update), Some(credited)))
            }
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn period_status(&self, ctx: &SessionContext) -> Result<PrincipalView, AttendanceError> {
        let supervisor = self.supervisor(ctx).await?;
        Ok(PrincipalView::from(&supervisor))
    }

    /// Ledger of the caller or one of their subjects.
    pub async fn ledger(&self, ctx: &SessionContext, principal: PrincipalId) -> Result<LedgerView, AttendanceError> {
        if principal != ctx.supervisor {
            let supervisor = self.supervisor(ctx).await?;
            self.owned_subject(&supervisor, principal).await?;
        } else {
            self.supervisor(ctx).await?;
        }
        let days = self.store.ledger(principal).await?;
        Ok(LedgerView {
            principal_id: principal,
            total_online_ms: days.total_online_ms(),
            days,
        })
    }

    pub async fn roster(&self, ctx: &SessionContext) -> Result<Vec<PrincipalView>, AttendanceError> {
        let supervisor = self.supervisor(ctx).await?;
        let subjects = self.store.subjects(supervisor.id).await?;
        Ok(subjects.iter().map(PrincipalView::from).collect())
    }

    pub async fn status(&self) -> Result<ServiceStatus, AttendanceError> {
        let stats = self.store.stats().await?;
        Ok(ServiceStatus {
            version: env!("CARGO_PKG_VERSION"),
            supervisors: stats.supervisors,
            subjects: stats.subjects,
            references: stats.references,
            open: stats.open,
            distance_threshold: self.settings.threshold,
            utc_offset: self.settings.tz.to_string(),
        })
    }

    // =========================================================================
    // Enrollment
    // =========================================================================

    pub async fn enroll_supervisor(&self, name: &str, contact: &str) -> Result<PrincipalView, AttendanceError> {
        let name = required("name", name)?;
        let supervisor = Principal::new_supervisor(name, contact.trim());
        self.store.insert_principal(&supervisor, &[]).await?;
        tracing::info!(principal = %supervisor.id, "supervisor enrolled");
        Ok(PrincipalView::from(&supervisor))
    }

    /// Create a subject on the caller's roster with one reference embedding.
    ///
    /// Nothing is stored unless extraction succeeds.
    pub async fn enroll_subject(
        &self,
        ctx: &SessionContext,
        name: &str,
        contact: &str,
        sample: Sample,
    ) -> Result<PrincipalView, AttendanceError> {
        let name = required("name", name)?;
        let supervisor = self.supervisor(ctx).await?;
        let reference = self.extract(sample).await?;

        let subject = Principal::new_subject(supervisor.id, name, contact.trim());
        self.store.insert_principal(&subject, &[reference]).await?;
        tracing::info!(principal = %subject.id, supervisor = %supervisor.id, "subject enrolled");
        Ok(PrincipalView::from(&subject))
    }

    /// Append another reference embedding. Returns the reference count.
    pub async fn add_reference(
        &self,
        ctx: &SessionContext,
        principal: PrincipalId,
        sample: Sample,
    ) -> Result<usize, AttendanceError> {
        let supervisor = self.supervisor(ctx).await?;
        self.owned_subject(&supervisor, principal).await?;
        let reference = self.extract(sample).await?;
        let count = self.store.add_reference(principal, &reference).await?;
        tracing::info!(principal = %principal, references = count, "reference added");
        Ok(count)
    }

    /// Delete a subject with its references and ledger.
    pub async fn remove_subject(&self, ctx: &SessionContext, principal: PrincipalId) -> Result<(), AttendanceError> {
        let supervisor = self.supervisor(ctx).await?;
        let _guard = self.lock(principal).await?;
        self.owned_subject(&supervisor, principal).await?;
        if !self.store.remove_principal(principal).await? {
            return Err(AttendanceError::UnknownPrincipal(principal));
        }
        tracing::info!(principal = %principal, "subject removed");
        Ok(())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn supervisor(&self, ctx: &SessionContext) -> Result<Principal, AttendanceError> {
        match self.store.principal(ctx.supervisor).await? {
            Some(p) if p.is_supervisor() => Ok(p),
            Some(p) => Err(AttendanceError::NotPermitted(format!("{} is not a supervisor", p.id))),
            None => Err(AttendanceError::UnknownPrincipal(ctx.supervisor)),
        }
    }

    async fn owned_subject(&self, supervisor: &Principal, id: PrincipalId) -> Result<Principal, AttendanceError> {
        let subject = self
            .store
            .principal(id)
            .await?
            .ok_or(AttendanceError::UnknownPrincipal(id))?;
        if subject.supervisor != Some(supervisor.id) {
            return Err(AttendanceError::NotPermitted(format!(
                "{id} is not on the roster of {}",
                supervisor.id
            )));
        }
        Ok(subject)
    }

    async fn subject_by_contact(&self, supervisor: &Principal, contact: &str) -> Result<PrincipalId, AttendanceError> {
        let contact = required("contact", contact)?;
        self.store
            .subject_by_contact(supervisor.id, contact)
            .await?
            .map(|subject| subject.id)
            .ok_or_else(|| AttendanceError::UnknownContact(contact.to_string()))
    }

    async fn lock(&self, id: PrincipalId) -> Result<OwnedMutexGuard<()>, AttendanceError> {
        tokio::time::timeout(self.settings.lock_timeout, self.locks.acquire(id))
            .await
            .map_err(|_| AttendanceError::Timeout("principal lock"))
    }

    async fn extract(&self, sample: Sample) -> Result<tally_core::Embedding, AttendanceError> {
        let embedding = tokio::time::timeout(self.settings.extract_timeout, self.engine.extract(sample))
            .await
            .map_err(|_| AttendanceError::Timeout("extraction"))??;
        Ok(embedding)
    }

    async fn identify(&self, supervisor: &Principal, sample: Sample) -> Result<(PrincipalId, f64), AttendanceError> {
        let roster = self.store.roster(supervisor.id).await?;
        let identified = tokio::time::timeout(
            self.settings.extract_timeout,
            self.engine.identify(sample, roster, self.settings.threshold),
        )
        .await
        .map_err(|_| AttendanceError::Timeout("extraction"))??;

        match identified.resolution {
            Resolution::Matched { principal, distance } => Ok((principal, distance)),
            Resolution::NoMatch { best_distance } => {
                tracing::info!(
                    supervisor = %supervisor.id,
                    ?best_distance,
                    threshold = self.settings.threshold,
                    dim = identified.dim,
                    "sample matched nobody"
                );
                Err(AttendanceError::NoMatch { best_distance })
            }
        }
    }

    fn notify(&self, principal: &Principal, event: MarkEvent, timestamp: DateTime<Utc>) {
        dispatch(
            self.notifier.clone(),
            Notification {
                principal: principal.id,
                contact: principal.contact.clone(),
                event,
                timestamp,
            },
        );
    }
}

fn required<'a>(field: &str, value: &'a str) -> Result<&'a str, AttendanceError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(AttendanceError::InvalidInput(format!("{field} must not be empty")));
    }
    Ok(value)
}
