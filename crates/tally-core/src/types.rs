use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::presence::Presence;

/// Permanent identifier of a tracked principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrincipalId(Uuid);

impl PrincipalId {
    /// Generate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for PrincipalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for PrincipalId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Role of a principal in the attendance hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalKind {
    /// Someone whose attendance is taken (a student).
    Subject,
    /// Someone who runs periods and marks their subjects (an instructor).
    Supervisor,
}

impl PrincipalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrincipalKind::Subject => "subject",
            PrincipalKind::Supervisor => "supervisor",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "subject" => Some(PrincipalKind::Subject),
            "supervisor" => Some(PrincipalKind::Supervisor),
            _ => None,
        }
    }
}

/// Biometric embedding vector. Dimension is defined by the extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model that produced this embedding (e.g., "facenet-128").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Cosine distance in [0, 2]. Degenerate pairs (dimension mismatch,
    /// zero magnitude, non-finite components) are pinned to 1.0.
    pub fn distance(&self, other: &Embedding) -> f64 {
        crate::resolver::cosine_distance(&self.values, &other.values)
    }

    /// Little-endian f32 encoding used for at-rest storage.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Decode a blob written by [`to_le_bytes`](Self::to_le_bytes).
    /// Returns `None` if the length is not a multiple of four.
    pub fn from_le_bytes(bytes: &[u8], model_version: Option<String>) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Self {
            values,
            model_version,
        })
    }
}

/// A tracked identity together with its current presence state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    pub id: PrincipalId,
    pub kind: PrincipalKind,
    pub name: String,
    /// Notification target (usually an email address).
    pub contact: String,
    /// Owning supervisor. Always `None` for supervisors.
    pub supervisor: Option<PrincipalId>,
    pub presence: Presence,
    /// Bumped on every committed transition; used for optimistic writes.
    pub version: u64,
}

impl Principal {
    pub fn new_supervisor(name: impl Into<String>, contact: impl Into<String>) -> Self {
        Self {
            id: PrincipalId::new(),
            kind: PrincipalKind::Supervisor,
            name: name.into(),
            contact: contact.into(),
            supervisor: None,
            presence: Presence::Closed,
            version: 0,
        }
    }

    pub fn new_subject(
        supervisor: PrincipalId,
        name: impl Into<String>,
        contact: impl Into<String>,
    ) -> Self {
        Self {
            id: PrincipalId::new(),
            kind: PrincipalKind::Subject,
            name: name.into(),
            contact: contact.into(),
            supervisor: Some(supervisor),
            presence: Presence::Closed,
            version: 0,
        }
    }

    pub fn is_supervisor(&self) -> bool {
        self.kind == PrincipalKind::Supervisor
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// One resolver candidate: a reference embedding and the principal it belongs to.
///
/// A principal with several enrolled references appears once per reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub principal: PrincipalId,
    pub embedding: Embedding,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_principal_id_roundtrip_display() {
        let id = PrincipalId::new();
        let parsed: PrincipalId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_principal_id_rejects_garbage() {
        assert!("not-a-uuid".parse::<PrincipalId>().is_err());
    }

    #[test]
    fn test_kind_strings() {
        assert_eq!(PrincipalKind::parse("subject"), Some(PrincipalKind::Subject));
        assert_eq!(PrincipalKind::parse(PrincipalKind::Supervisor.as_str()), Some(PrincipalKind::Supervisor));
        assert_eq!(PrincipalKind::parse("instructor"), None);
    }

    #[test]
    fn test_embedding_blob_encoding() {
        let e = Embedding::new(vec![1.0, -0.5, 0.25]);
        let bytes = e.to_le_bytes();
        assert_eq!(bytes.len(), 12);
        let back = Embedding::from_le_bytes(&bytes, None).unwrap();
        assert_eq!(back.values, e.values);
    }

    #[test]
    fn test_embedding_blob_rejects_ragged_length() {
        assert!(Embedding::from_le_bytes(&[0, 0, 0], None).is_none());
    }

    #[test]
    fn test_new_subject_starts_closed() {
        let sup = Principal::new_supervisor("Ada", "ada@example.com");
        let s = Principal::new_subject(sup.id, "Bob", "bob@example.com");
        assert_eq!(s.supervisor, Some(sup.id));
        assert!(!s.presence.is_open());
        assert!(sup.is_supervisor());
        assert!(!s.is_supervisor());
    }
}
