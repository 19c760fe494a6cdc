use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{ServiceError, ServiceResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Role {
    Customer,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentUser {
    pub id: Uuid,
    pub email: String,
    pub role: Role,
}

impl CurrentUser {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn require_admin(&self) -> ServiceResult<()> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(ServiceError::Forbidden(format!(
                "user {} is not an administrator",
                self.id
            )))
        }
    }
}

/// Resolves the user on whose behalf the current call runs.
#[async_trait]
pub trait AuthContext: Send + Sync {
    async fn current_user(&self) -> ServiceResult<CurrentUser>;
}

/// Fixed identity, for tools and tests. `None` behaves as a signed-out session.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthContext {
    user: Option<CurrentUser>,
}

impl StaticAuthContext {
    pub fn new(user: CurrentUser) -> Self {
        Self { user: Some(user) }
    }

    pub fn anonymous() -> Self {
        Self { user: None }
    }
}

#[async_trait]
impl AuthContext for StaticAuthContext {
    async fn current_user(&self) -> ServiceResult<CurrentUser> {
        self.user
            .clone()
            .ok_or_else(|| ServiceError::Unauthorized("no authenticated session".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn anonymous_context_is_unauthorized() {
        let ctx = StaticAuthContext::anonymous();
        assert_matches!(ctx.current_user().await, Err(ServiceError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn admin_check() {
        let user = CurrentUser {
            id: Uuid::new_v4(),
            email: "ops@example.com".into(),
            role: Role::Customer,
        };
        assert_matches!(user.require_admin(), Err(ServiceError::Forbidden(_)));
        let ctx = StaticAuthContext::new(CurrentUser {
            role: Role::Admin,
            ..user
        });
        assert!(ctx.current_user().await.unwrap().require_admin().is_ok());
    }
}
