//! The closed set of pollable remote resources.

use crate::error::{Result, SyncError};
use crate::types::{EntityKind, Params};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceType {
    PublicEvents,
    RepoEvents,
    RepoIssueEvents,
    RepoNetworkEvents,
    OrgEvents,
    UserReceivedEvents,
    UserReceivedPublicEvents,
    UserEvents,
    UserPublicEvents,
    UserOrgEvents,
    Notifications,
}

impl ResourceType {
    pub const ALL: [ResourceType; 11] = [
        ResourceType::PublicEvents,
        ResourceType::RepoEvents,
        ResourceType::RepoIssueEvents,
        ResourceType::RepoNetworkEvents,
        ResourceType::OrgEvents,
        ResourceType::UserReceivedEvents,
        ResourceType::UserReceivedPublicEvents,
        ResourceType::UserEvents,
        ResourceType::UserPublicEvents,
        ResourceType::UserOrgEvents,
        ResourceType::Notifications,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceType::PublicEvents => "PUBLIC_EVENTS",
            ResourceType::RepoEvents => "REPO_EVENTS",
            ResourceType::RepoIssueEvents => "REPO_ISSUE_EVENTS",
            ResourceType::RepoNetworkEvents => "REPO_NETWORK_EVENTS",
            ResourceType::OrgEvents => "ORG_EVENTS",
            ResourceType::UserReceivedEvents => "USER_RECEIVED_EVENTS",
            ResourceType::UserReceivedPublicEvents => "USER_RECEIVED_PUBLIC_EVENTS",
            ResourceType::UserEvents => "USER_EVENTS",
            ResourceType::UserPublicEvents => "USER_PUBLIC_EVENTS",
            ResourceType::UserOrgEvents => "USER_ORG_EVENTS",
            ResourceType::Notifications => "NOTIFICATIONS",
        }
    }

    /// Case-insensitive lookup by name.
    pub fn from_str_opt(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|resource| resource.as_str().eq_ignore_ascii_case(value))
    }

    /// Parameters that must be present (and non-blank) to register.
    pub fn required_params(self) -> &'static [&'static str] {
        match self {
            ResourceType::PublicEvents | ResourceType::Notifications => &[],
            ResourceType::RepoEvents
            | ResourceType::RepoIssueEvents
            | ResourceType::RepoNetworkEvents => &["owner", "repo"],
            ResourceType::OrgEvents => &["org"],
            ResourceType::UserReceivedEvents
            | ResourceType::UserReceivedPublicEvents
            | ResourceType::UserEvents
            | ResourceType::UserPublicEvents => &["username"],
            ResourceType::UserOrgEvents => &["username", "org"],
        }
    }

    /// Kind of the entities this resource returns.
    pub fn entity_kind(self) -> EntityKind {
        match self {
            ResourceType::Notifications => EntityKind::Notification,
            _ => EntityKind::Event,
        }
    }

    pub fn validate(self, params: &Params) -> Result<()> {
        for param in self.required_params() {
            let present = params
                .get(*param)
                .is_some_and(|value| !value.trim().is_empty());
            if !present {
                return Err(SyncError::MissingParameter {
                    resource: self.as_str().to_string(),
                    param: param.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Canonical remote path, with parameters substituted.
    pub fn path(self, params: &Params) -> Result<String> {
        self.validate(params)?;
        let p = |name: &str| params.get(name).map(|v| v.trim()).unwrap_or_default();

        let path = match self {
            ResourceType::PublicEvents => "/events".to_string(),
            ResourceType::RepoEvents => format!("/repos/{}/{}/events", p("owner"), p("repo")),
            ResourceType::RepoIssueEvents => {
                format!("/repos/{}/{}/issues/events", p("owner"), p("repo"))
            }
            ResourceType::RepoNetworkEvents => {
                format!("/networks/{}/{}/events", p("owner"), p("repo"))
            }
            ResourceType::OrgEvents => format!("/orgs/{}/events", p("org")),
            ResourceType::UserReceivedEvents => format!("/users/{}/received_events", p("username")),
            ResourceType::UserReceivedPublicEvents => {
                format!("/users/{}/received_events/public", p("username"))
            }
            ResourceType::UserEvents => format!("/users/{}/events", p("username")),
            ResourceType::UserPublicEvents => format!("/users/{}/events/public", p("username")),
            ResourceType::UserOrgEvents => {
                format!("/users/{}/events/orgs/{}", p("username"), p("org"))
            }
            ResourceType::Notifications => "/notifications".to_string(),
        };
        Ok(path)
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
