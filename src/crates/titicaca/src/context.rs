//! Caller identity carried through repositories and flows

use serde::{Deserialize, Serialize};

/// Who is asking, and with which roles
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestContext {
    pub user_id: Option<String>,
    pub project_id: Option<String>,
    pub roles: Vec<String>,
    pub is_admin: bool,
    pub request_id: String,
}

impl RequestContext {
    pub fn new(user_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            project_id: Some(project_id.into()),
            roles: Vec::new(),
            is_admin: false,
            request_id: format!("req-{}", uuid::Uuid::new_v4()),
        }
    }

    /// Context used by maintenance workers acting on behalf of the service
    pub fn admin() -> Self {
        Self {
            user_id: None,
            project_id: None,
            roles: vec!["admin".to_string()],
            is_admin: true,
            request_id: format!("req-{}", uuid::Uuid::new_v4()),
        }
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self.is_admin = self.roles.iter().any(|r| r == "admin");
        self
    }

    pub fn has_any_role(&self, roles: &[String]) -> bool {
        self.roles.iter().any(|r| roles.contains(r))
    }

    /// Project that owns what this caller creates
    pub fn owner(&self) -> String {
        self.project_id.clone().unwrap_or_default()
    }
}
