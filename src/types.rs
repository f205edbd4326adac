//! Core types shared across the crate
//!
//! Entity kinds are a closed enumeration: every record in the system belongs
//! to exactly one `(family, role, source)` combination, and VIAF exists only
//! for agents.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, MefError>;

/// Maximum redirect chain length tolerated during resolution
pub const MAX_REDIRECT_DEPTH: usize = 16;

#[derive(Error, Debug)]
pub enum MefError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MefError {
    /// Whether a retry may succeed (SQLITE_BUSY, HTTP timeouts, ...)
    pub fn is_transient(&self) -> bool {
        match self {
            MefError::Transient(_) | MefError::Http(_) => true,
            MefError::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// CLI exit code: 0 success, 1 user error, 2 transient, 3 consistency
    pub fn exit_code(&self) -> i32 {
        match self {
            MefError::Validation(_) | MefError::NotFound(_) | MefError::Config(_) => 1,
            MefError::Conflict(_) => 3,
            _ => 2,
        }
    }
}

/// Entity family: determines which sources and cross-walks apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    Agent,
    Concept,
    Place,
}

impl Family {
    pub const ALL: [Family; 3] = [Family::Agent, Family::Concept, Family::Place];

    pub fn as_str(&self) -> &'static str {
        match self {
            Family::Agent => "agent",
            Family::Concept => "concept",
            Family::Place => "place",
        }
    }

    /// Sources of this family, in declared priority order.
    ///
    /// The order is also the precedence used when picking `type` or the
    /// authorized access point for the unified view.
    pub fn sources(&self) -> &'static [SourceName] {
        match self {
            Family::Agent => &[SourceName::Gnd, SourceName::Idref, SourceName::Rero],
            Family::Concept => &[SourceName::Idref, SourceName::Rero],
            Family::Place => &[SourceName::Idref, SourceName::Gnd],
        }
    }

    /// Whether a VIAF cross-walk exists for this family
    pub fn has_viaf(&self) -> bool {
        matches!(self, Family::Agent)
    }

    /// The MEF kind of this family
    pub fn mef_kind(&self) -> EntityKind {
        match self {
            Family::Agent => EntityKind::AgentMef,
            Family::Concept => EntityKind::ConceptMef,
            Family::Place => EntityKind::PlaceMef,
        }
    }

    /// The source kind for `source` within this family, if the family has it
    pub fn source_kind(&self, source: SourceName) -> Option<EntityKind> {
        let kind = match (self, source) {
            (Family::Agent, SourceName::Gnd) => EntityKind::AgentGnd,
            (Family::Agent, SourceName::Idref) => EntityKind::AgentIdref,
            (Family::Agent, SourceName::Rero) => EntityKind::AgentRero,
            (Family::Concept, SourceName::Idref) => EntityKind::ConceptIdref,
            (Family::Concept, SourceName::Rero) => EntityKind::ConceptRero,
            (Family::Place, SourceName::Idref) => EntityKind::PlaceIdref,
            (Family::Place, SourceName::Gnd) => EntityKind::PlaceGnd,
            _ => return None,
        };
        Some(kind)
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role a kind plays in the cluster model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Source,
    Crosswalk,
    Mef,
}

/// An authority provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceName {
    Gnd,
    Idref,
    Rero,
}

impl SourceName {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceName::Gnd => "gnd",
            SourceName::Idref => "idref",
            SourceName::Rero => "rero",
        }
    }
}

impl fmt::Display for SourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceName {
    type Err = MefError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gnd" => Ok(SourceName::Gnd),
            "idref" => Ok(SourceName::Idref),
            "rero" => Ok(SourceName::Rero),
            other => Err(MefError::Config(format!("Unknown source: {}", other))),
        }
    }
}

/// The closed enumeration of record kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    AgentGnd,
    AgentIdref,
    AgentRero,
    AgentViaf,
    AgentMef,
    ConceptIdref,
    ConceptRero,
    ConceptMef,
    PlaceIdref,
    PlaceGnd,
    PlaceMef,
}

impl EntityKind {
    pub const ALL: [EntityKind; 11] = [
        EntityKind::AgentGnd,
        EntityKind::AgentIdref,
        EntityKind::AgentRero,
        EntityKind::AgentViaf,
        EntityKind::AgentMef,
        EntityKind::ConceptIdref,
        EntityKind::ConceptRero,
        EntityKind::ConceptMef,
        EntityKind::PlaceIdref,
        EntityKind::PlaceGnd,
        EntityKind::PlaceMef,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::AgentGnd => "agent-gnd",
            EntityKind::AgentIdref => "agent-idref",
            EntityKind::AgentRero => "agent-rero",
            EntityKind::AgentViaf => "agent-viaf",
            EntityKind::AgentMef => "agent-mef",
            EntityKind::ConceptIdref => "concept-idref",
            EntityKind::ConceptRero => "concept-rero",
            EntityKind::ConceptMef => "concept-mef",
            EntityKind::PlaceIdref => "place-idref",
            EntityKind::PlaceGnd => "place-gnd",
            EntityKind::PlaceMef => "place-mef",
        }
    }

    pub fn family(&self) -> Family {
        match self {
            EntityKind::AgentGnd
            | EntityKind::AgentIdref
            | EntityKind::AgentRero
            | EntityKind::AgentViaf
            | EntityKind::AgentMef => Family::Agent,
            EntityKind::ConceptIdref | EntityKind::ConceptRero | EntityKind::ConceptMef => {
                Family::Concept
            }
            EntityKind::PlaceIdref | EntityKind::PlaceGnd | EntityKind::PlaceMef => Family::Place,
        }
    }

    pub fn role(&self) -> Role {
        match self {
            EntityKind::AgentViaf => Role::Crosswalk,
            EntityKind::AgentMef | EntityKind::ConceptMef | EntityKind::PlaceMef => Role::Mef,
            _ => Role::Source,
        }
    }

    /// The provider behind a source kind (`None` for crosswalk and MEF kinds)
    pub fn source(&self) -> Option<SourceName> {
        match self {
            EntityKind::AgentGnd | EntityKind::PlaceGnd => Some(SourceName::Gnd),
            EntityKind::AgentIdref | EntityKind::ConceptIdref | EntityKind::PlaceIdref => {
                Some(SourceName::Idref)
            }
            EntityKind::AgentRero | EntityKind::ConceptRero => Some(SourceName::Rero),
            _ => None,
        }
    }

    /// All source kinds, in family order
    pub fn source_kinds() -> impl Iterator<Item = EntityKind> {
        EntityKind::ALL
            .iter()
            .copied()
            .filter(|k| k.role() == Role::Source)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = MefError;

    fn from_str(s: &str) -> Result<Self> {
        EntityKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| MefError::Config(format!("Unknown entity kind: {}", s)))
    }
}

impl Serialize for EntityKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EntityKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Current UTC timestamp as ISO-8601 with offset
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        for kind in EntityKind::ALL {
            let parsed: EntityKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
        assert!("agent-unknown".parse::<EntityKind>().is_err());
    }

    #[test]
    fn test_family_sources_order() {
        assert_eq!(
            Family::Agent.sources(),
            &[SourceName::Gnd, SourceName::Idref, SourceName::Rero]
        );
        assert_eq!(Family::Concept.sources(), &[SourceName::Idref, SourceName::Rero]);
        assert_eq!(Family::Place.sources(), &[SourceName::Idref, SourceName::Gnd]);
    }

    #[test]
    fn test_viaf_only_for_agents() {
        assert!(Family::Agent.has_viaf());
        assert!(!Family::Concept.has_viaf());
        assert!(!Family::Place.has_viaf());
        assert_eq!(EntityKind::AgentViaf.role(), Role::Crosswalk);
    }

    #[test]
    fn test_source_kind_lookup() {
        assert_eq!(
            Family::Place.source_kind(SourceName::Gnd),
            Some(EntityKind::PlaceGnd)
        );
        // Concepts have no GND variant
        assert_eq!(Family::Concept.source_kind(SourceName::Gnd), None);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(MefError::Validation("x".into()).exit_code(), 1);
        assert_eq!(MefError::Transient("x".into()).exit_code(), 2);
        assert_eq!(MefError::Conflict("x".into()).exit_code(), 3);
    }
}
