//! Connection lifecycle management.
//!
//! External API connections move through a fixed authorization state
//! machine; every mutation goes through a named transition here, never an ad
//! hoc field write. The invariant maintained throughout: `oauth_state` is
//! non-null only while the connection is `connecting`, which closes the
//! window for correlation-token replay once a round-trip completes.
//!
//! Correlation state is datastore-backed, never process memory, so OAuth
//! callbacks survive restarts and multi-instance deployment.

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEventKind, EventBus};
use crate::storage::RedbStore;
use crate::types::{ApiConnection, AuthType, AuthorizationCode, ConnectionId, ConnectionStatus};
use chrono::Utc;

pub struct ConnectionLifecycle {
    store: RedbStore,
    events: EventBus,
    config: EngineConfig,
}

impl ConnectionLifecycle {
    pub fn new(store: RedbStore, events: EventBus, config: EngineConfig) -> Self {
        Self {
            store,
            events,
            config,
        }
    }

    pub fn create(
        &self,
        name: impl Into<String>,
        base_url: impl Into<String>,
        auth_type: AuthType,
    ) -> EngineResult<ApiConnection> {
        let now = Utc::now();
        let connection = ApiConnection {
            id: ConnectionId::new(),
            name: name.into(),
            base_url: base_url.into(),
            auth_type,
            status: ConnectionStatus::Draft,
            oauth_state: None,
            oauth_state_issued_at: None,
            created_at: now,
            updated_at: now,
        };
        self.store.put_connection(&connection)?;
        tracing::info!(connection_id = %connection.id, "Created connection draft");
        Ok(connection)
    }

    pub fn get(&self, id: &ConnectionId) -> EngineResult<Option<ApiConnection>> {
        Ok(self.store.get_connection(id)?)
    }

    /// Begin an OAuth round-trip: draft -> connecting, storing the opaque
    /// correlation token. The only transition that sets `oauth_state`.
    pub fn mark_connecting(
        &self,
        id: &ConnectionId,
        state_token: impl Into<String>,
    ) -> EngineResult<ApiConnection> {
        let token = state_token.into();
        self.transition(id, ConnectionStatus::Connecting, |connection| {
            connection.oauth_state = Some(token);
            connection.oauth_state_issued_at = Some(Utc::now());
        })
    }

    pub fn mark_connected(&self, id: &ConnectionId) -> EngineResult<ApiConnection> {
        self.transition(id, ConnectionStatus::Connected, |_| {})
    }

    pub fn mark_error(&self, id: &ConnectionId) -> EngineResult<ApiConnection> {
        self.transition(id, ConnectionStatus::Error, |_| {})
    }

    pub fn mark_disconnected(&self, id: &ConnectionId) -> EngineResult<ApiConnection> {
        self.transition(id, ConnectionStatus::Disconnected, |_| {})
    }

    pub fn mark_revoked(&self, id: &ConnectionId) -> EngineResult<ApiConnection> {
        self.transition(id, ConnectionStatus::Revoked, |_| {})
    }

    /// Resolve an inbound authorization callback to its originating
    /// connection. Unmatched and expired tokens are both "not found"; the
    /// caller surfaces a generic re-authorization prompt, not the reason.
    pub fn find_by_state_token(&self, token: &str) -> EngineResult<Option<ApiConnection>> {
        let cutoff = Utc::now() - self.config.oauth_state_ttl();
        let connection = self
            .store
            .list_connections()?
            .into_iter()
            .find(|c| c.oauth_state.as_deref() == Some(token));

        match connection {
            Some(c) => {
                let fresh = c.oauth_state_issued_at.map(|t| t >= cutoff).unwrap_or(false);
                if fresh {
                    Ok(Some(c))
                } else {
                    tracing::debug!(connection_id = %c.id, "Expired state token");
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }

    /// Capture the authorization code delivered with a valid state token as
    /// a short-lived record with an explicit expiry.
    pub fn record_authorization_code(
        &self,
        token: &str,
        code: impl Into<String>,
    ) -> EngineResult<Option<ConnectionId>> {
        let Some(connection) = self.find_by_state_token(token)? else {
            return Ok(None);
        };

        self.store.put_auth_code(&AuthorizationCode {
            connection_id: connection.id,
            code: code.into(),
            expires_at: Utc::now() + self.config.auth_code_ttl(),
        })?;
        Ok(Some(connection.id))
    }

    /// Single-use claim of a stored authorization code. Expired codes claim
    /// as None and are discarded.
    pub fn take_authorization_code(
        &self,
        connection_id: &ConnectionId,
    ) -> EngineResult<Option<AuthorizationCode>> {
        match self.store.take_auth_code(connection_id)? {
            Some(code) if code.expires_at > Utc::now() => Ok(Some(code)),
            Some(_) => Ok(None),
            None => Ok(None),
        }
    }

    /// Apply a transition if the state machine allows it. Every transition
    /// except into `connecting` clears `oauth_state`.
    fn transition<F>(
        &self,
        id: &ConnectionId,
        to: ConnectionStatus,
        extra: F,
    ) -> EngineResult<ApiConnection>
    where
        F: FnOnce(&mut ApiConnection),
    {
        let mut connection = self
            .store
            .get_connection(id)?
            .ok_or_else(|| EngineError::not_found("connection", id))?;

        let from = connection.status;
        if !allowed(from, to) {
            return Err(EngineError::InvalidTransition {
                connection_id: *id,
                from,
                to,
            });
        }

        connection.status = to;
        connection.oauth_state = None;
        connection.oauth_state_issued_at = None;
        connection.updated_at = Utc::now();
        extra(&mut connection);
        self.store.put_connection(&connection)?;

        tracing::info!(connection_id = %id, %from, %to, "Connection transition");
        self.events.publish(EngineEventKind::ConnectionStateChanged {
            connection_id: *id,
            from,
            to,
        });
        Ok(connection)
    }
}

fn allowed(from: ConnectionStatus, to: ConnectionStatus) -> bool {
    use ConnectionStatus::*;
    matches!(
        (from, to),
        (Draft, Connecting)
            | (Connecting, Connected)
            | (Connecting, Error)
            | (Connected, Disconnected)
            | (Connected, Revoked)
            | (Error, Revoked)
            | (Disconnected, Revoked)
    )
}
