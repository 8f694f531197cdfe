//! Session host and role checks.
//!
//! The host is told about every client id this process connects under, and
//! answers which roles a client holds. Role checks back the
//! `local_user_can_send` callbacks of live objects that restrict who may
//! write.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::LiveError;

/// Roles a session participant can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LiveRole {
    Guest,
    Attendee,
    Presenter,
    Organizer,
}

/// The session host this process runs inside.
#[async_trait]
pub trait SessionHost: Send + Sync {
    /// Announce a client id for the local user. Returns the roles granted.
    async fn register_client_id(&self, client_id: &str) -> Result<Vec<LiveRole>, LiveError>;

    /// Roles held by a client, or `None` if the host doesn't know it.
    async fn client_roles(&self, client_id: &str) -> Result<Option<Vec<LiveRole>>, LiveError>;
}

/// In-memory host for tests and single-process sessions.
pub struct LocalSessionHost {
    default_roles: Vec<LiveRole>,
    roles: RwLock<HashMap<String, Vec<LiveRole>>>,
    registered: RwLock<Vec<String>>,
    fail_registration: AtomicBool,
}

impl LocalSessionHost {
    /// Every registered client receives `default_roles`.
    pub fn new(default_roles: Vec<LiveRole>) -> Self {
        Self {
            default_roles,
            roles: RwLock::new(HashMap::new()),
            registered: RwLock::new(Vec::new()),
            fail_registration: AtomicBool::new(false),
        }
    }

    /// Override the roles of one client.
    pub async fn set_roles(&self, client_id: impl Into<String>, roles: Vec<LiveRole>) {
        self.roles.write().await.insert(client_id.into(), roles);
    }

    /// Make `register_client_id` fail.
    pub fn set_fail_registration(&self, fail: bool) {
        self.fail_registration.store(fail, Ordering::Release);
    }

    /// Client ids registered so far, in order.
    pub async fn registered_client_ids(&self) -> Vec<String> {
        self.registered.read().await.clone()
    }
}

impl Default for LocalSessionHost {
    fn default() -> Self {
        Self::new(vec![LiveRole::Attendee])
    }
}

#[async_trait]
impl SessionHost for LocalSessionHost {
    async fn register_client_id(&self, client_id: &str) -> Result<Vec<LiveRole>, LiveError> {
        if self.fail_registration.load(Ordering::Acquire) {
            return Err(LiveError::Host(format!("failed to register client {client_id}")));
        }
        self.registered.write().await.push(client_id.to_string());
        let mut roles = self.roles.write().await;
        let granted = roles
            .entry(client_id.to_string())
            .or_insert_with(|| self.default_roles.clone());
        Ok(granted.clone())
    }

    async fn client_roles(&self, client_id: &str) -> Result<Option<Vec<LiveRole>>, LiveError> {
        Ok(self.roles.read().await.get(client_id).cloned())
    }
}

/// Checks clients against a list of allowed roles, caching host answers.
pub struct RoleVerifier {
    host: Arc<dyn SessionHost>,
    cache: RwLock<HashMap<String, Vec<LiveRole>>>,
}

impl RoleVerifier {
    pub fn new(host: Arc<dyn SessionHost>) -> Self {
        Self {
            host,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Whether `client_id` holds at least one of `allowed_roles`.
    ///
    /// An empty `allowed_roles` list admits everyone without asking the host.
    pub async fn verify_roles_allowed(
        &self,
        client_id: &str,
        allowed_roles: &[LiveRole],
    ) -> Result<bool, LiveError> {
        if allowed_roles.is_empty() {
            return Ok(true);
        }

        let cached = self.cache.read().await.get(client_id).cloned();
        let roles = match cached {
            Some(roles) => roles,
            None => match self.host.client_roles(client_id).await? {
                Some(roles) => {
                    self.cache
                        .write()
                        .await
                        .insert(client_id.to_string(), roles.clone());
                    roles
                }
                // Unknown clients are not cached; the host may learn them later
                None => return Ok(false),
            },
        };

        Ok(roles.iter().any(|role| allowed_roles.contains(role)))
    }

    /// Forget cached roles (e.g. after the host changes a participant's roles).
    pub async fn invalidate(&self, client_id: &str) {
        self.cache.write().await.remove(client_id);
    }
}
