use std::env;

use serde::{Deserialize, Serialize};

use super::{client::TaskScope, config::ConfigError, model::Person};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Standard,
}

impl Role {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "standard" | "user" | "" => Some(Role::Standard),
            _ => None,
        }
    }
}

/// Caller context handed to the pipeline and the mutation path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub email: String,
    pub role: Role,
}

impl Identity {
    pub fn admin(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            role: Role::Admin,
        }
    }

    pub fn standard(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            role: Role::Standard,
        }
    }

    /// `TASK_BOARD_USER_NAME` (required), `TASK_BOARD_USER_EMAIL`, and
    /// `TASK_BOARD_ROLE` (`admin` or `standard`, default `standard`).
    pub fn from_env() -> Result<Self, ConfigError> {
        let name = env::var("TASK_BOARD_USER_NAME")
            .map(|v| v.trim().to_string())
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::MissingEnv("TASK_BOARD_USER_NAME"))?;
        let email = env::var("TASK_BOARD_USER_EMAIL")
            .map(|v| v.trim().to_string())
            .unwrap_or_default();
        let role = match env::var("TASK_BOARD_ROLE") {
            Ok(raw) => Role::parse(&raw).ok_or(ConfigError::InvalidEnv("TASK_BOARD_ROLE"))?,
            Err(_) => Role::Standard,
        };

        Ok(Self { name, email, role })
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn as_person(&self) -> Person {
        Person::new(self.name.clone(), self.email.clone())
    }

    /// Server-side pre-filter for retrieval. Admins get everything. A standard
    /// user gets their own assignments, unless they are browsing by an explicit
    /// assignee; then the full set is fetched and narrowed by the pipeline.
    pub fn retrieval_scope(&self, assignee_filter: Option<&str>) -> TaskScope {
        let browsing_other = assignee_filter.is_some_and(|a| !a.trim().is_empty());
        if self.is_admin() || browsing_other {
            TaskScope::All
        } else {
            TaskScope::Assignee(self.name.clone())
        }
    }
}
