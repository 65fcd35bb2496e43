//! Typed request identities
//!
//! Middleware and extractors produce these instead of stuffing ids into an
//! untyped per-request map. A handler that needs a project binding asks for
//! `ProjectBinding` in its signature and cannot run without one.

use serde::{Deserialize, Serialize};

/// Project identity established by API-key validation on the ingest path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProjectBinding {
    pub project_id: i32,
}

/// User identity established by JWT validation on the query paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserIdentity {
    pub user_id: i32,
}

/// Role a user holds on a project, as reported by the projects collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectRole {
    Owner,
    Admin,
    Viewer,
}

impl ProjectRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectRole::Owner => "owner",
            ProjectRole::Admin => "admin",
            ProjectRole::Viewer => "viewer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "owner" => Some(ProjectRole::Owner),
            "admin" => Some(ProjectRole::Admin),
            "viewer" => Some(ProjectRole::Viewer),
            _ => None,
        }
    }
}
