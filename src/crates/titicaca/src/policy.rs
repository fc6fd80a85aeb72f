//! Capability checks by action name

use crate::context::RequestContext;
use std::collections::HashMap;

/// Yes/no answer for "may this caller perform this action"
pub trait Policy: Send + Sync {
    fn enforce(&self, ctx: &RequestContext, action: &str) -> bool;
}

/// Admins may do anything; other callers need one of the roles listed
/// for an action. Actions without a rule are open.
#[derive(Debug, Clone, Default)]
pub struct RolePolicy {
    rules: HashMap<String, Vec<String>>,
}

impl RolePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule<I, S>(mut self, action: impl Into<String>, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rules
            .insert(action.into(), roles.into_iter().map(Into::into).collect());
        self
    }
}

impl Policy for RolePolicy {
    fn enforce(&self, ctx: &RequestContext, action: &str) -> bool {
        if ctx.is_admin {
            return true;
        }
        match self.rules.get(action) {
            Some(roles) => ctx.has_any_role(roles),
            None => true,
        }
    }
}
