//! # Domain Registrar
//!
//! Maps each public domain to the agent session currently serving it.
//! At most one session owns a domain; a later registration for the same
//! domain replaces the earlier one without notifying the replaced agent.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};
use tunnel_protocol::EdgeMessage;

use crate::error::{TunnelError, INVALID_API_KEY};
use crate::session::Session;

/// Domain → agent routing table, shared by the control channel handler and
/// the inbound proxy.
pub struct Registrar {
    /// Keys an agent may present in `register`.
    api_keys: HashSet<String>,

    /// Registered domain → the session currently serving it.
    domains: DashMap<String, Arc<Session>>,
}

impl Registrar {
    /// Creates an empty table accepting the given API keys.
    pub fn new(api_keys: impl IntoIterator<Item = String>) -> Self {
        Self {
            api_keys: api_keys.into_iter().collect(),
            domains: DashMap::new(),
        }
    }

    /// Whether `api_key` is in the allow-list.
    pub fn authorize(&self, api_key: &str) -> bool {
        self.api_keys.contains(api_key)
    }

    /// Binds `domain` to `session` when `api_key` is allowed and acknowledges
    /// with `registered`. A rejected agent receives `error` and the caller is
    /// expected to close its connection.
    pub async fn register(
        &self,
        session: &Arc<Session>,
        api_key: &str,
        domain: &str,
        id: Option<String>,
    ) -> Result<(), TunnelError> {
        if !self.authorize(api_key) {
            warn!(
                conn_id = %session.conn_id,
                domain = %domain,
                "Given API key is wrong/not recognised, stopping connection"
            );
            session
                .send(EdgeMessage::Error {
                    message: INVALID_API_KEY.to_owned(),
                })
                .await?;
            return Err(TunnelError::Unauthorized);
        }

        if let Some(previous) = self.domains.insert(domain.to_owned(), session.clone()) {
            if previous.conn_id != session.conn_id {
                info!(domain = %domain, previous = %previous.conn_id, "Replacing earlier registration");
            }
        }
        session.add_domain(domain);
        info!(domain = %domain, conn_id = %session.conn_id, "Domain registered");

        session
            .send(EdgeMessage::Registered {
                id,
                domain: domain.to_owned(),
            })
            .await?;
        Ok(())
    }

    /// Finds the session serving `host`. A host carrying a port falls back
    /// to its bare name when no registration matches it exactly.
    pub fn lookup(&self, host: &str) -> Option<Arc<Session>> {
        if let Some(session) = self.domains.get(host) {
            return Some(session.clone());
        }
        let (bare, port) = host.rsplit_once(':')?;
        if bare.is_empty() || !port.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        self.domains.get(bare).map(|session| session.clone())
    }

    /// Removes `domain` if it still belongs to connection `conn_id`.
    pub fn unregister_connection(&self, domain: &str, conn_id: &str) -> bool {
        self.domains
            .remove_if(domain, |_, session| session.conn_id == conn_id)
            .is_some()
    }

    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.domains.iter().map(|entry| entry.key().clone()).collect();
        domains.sort();
        domains
    }
}
