//! Account management on top of a running [`Runtime`](crate::runtime::Runtime).
//!
//! Validates account settings before they reach the event loop and answers
//! health probes from the published account snapshots.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use {
    anyhow::Result,
    gajim_config::{AccountConfig, Show},
    jid::BareJid,
    tokio::sync::mpsc,
    tracing::{info, warn},
};

use crate::{
    client::ClientCommand,
    context::AppCommand,
    runtime::Runtime,
    state::AccountStateMap,
};

/// How long a probe result is reused.
const PROBE_CACHE_TTL: Duration = Duration::from_secs(30);

/// Health of one account as seen by [`AccountManager::probe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthSnapshot {
    pub account_id: String,
    /// Signed in and available.
    pub connected: bool,
    pub details: Option<String>,
}

pub struct AccountManager {
    commands: mpsc::UnboundedSender<AppCommand>,
    accounts: AccountStateMap,
    probe_cache: RwLock<HashMap<String, (HealthSnapshot, Instant)>>,
}

impl AccountManager {
    pub fn new(runtime: &Runtime) -> Self {
        Self::with_parts(runtime.commands(), runtime.accounts())
    }

    pub(crate) fn with_parts(
        commands: mpsc::UnboundedSender<AppCommand>,
        accounts: AccountStateMap,
    ) -> Self {
        Self {
            commands,
            accounts,
            probe_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Register an account and bring it online.
    pub fn start_account(&self, account_id: &str, config: serde_json::Value) -> Result<()> {
        let config: AccountConfig = serde_json::from_value(config)?;
        if config.jid.is_empty() {
            anyhow::bail!("XMPP JID is required");
        }
        config
            .jid
            .parse::<BareJid>()
            .map_err(|e| anyhow::anyhow!("invalid JID '{}': {e}", config.jid))?;
        if !config.anonymous_auth && config.saved_password().is_none() {
            // The client asks for it through a password-required event.
            info!(account_id, "no saved password");
        }

        info!(account_id, jid = %config.jid, "starting account");
        self.send(AppCommand::AddAccount {
            name: account_id.to_string(),
            config: Box::new(config),
        })?;
        self.send(AppCommand::Client {
            account: account_id.to_string(),
            command: ClientCommand::ChangeStatus {
                show: Show::Online,
                message: String::new(),
            },
        })
    }

    /// Disconnect and forget an account.
    pub fn stop_account(&self, account_id: &str) -> Result<()> {
        if !self.account_ids().iter().any(|id| id == account_id) {
            warn!(account_id, "account not found");
            return Ok(());
        }
        info!(account_id, "stopping account");
        self.invalidate(account_id);
        self.send(AppCommand::RemoveAccount {
            name: account_id.to_string(),
        })
    }

    /// Forward a command to one account.
    pub fn command(&self, account_id: &str, command: ClientCommand) -> Result<()> {
        self.send(AppCommand::Client {
            account: account_id.to_string(),
            command,
        })
    }

    pub fn send(&self, command: AppCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| anyhow::anyhow!("event loop is not running"))
    }

    pub fn account_ids(&self) -> Vec<String> {
        // Skip rather than block while the loop publishes.
        match self.accounts.try_read() {
            Ok(accounts) => accounts.keys().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub async fn probe(&self, account_id: &str) -> HealthSnapshot {
        if let Ok(cache) = self.probe_cache.read()
            && let Some((snap, ts)) = cache.get(account_id)
            && ts.elapsed() < PROBE_CACHE_TTL
        {
            return snap.clone();
        }

        let snapshot = self.accounts.read().await.get(account_id).cloned();
        let result = HealthSnapshot {
            account_id: account_id.to_string(),
            connected: snapshot.as_ref().is_some_and(|s| s.state.is_available()),
            details: Some(match snapshot {
                Some(s) if s.state.is_available() => format!("available ({})", s.show),
                Some(s) if s.state.is_reconnect_scheduled() => "disconnected (reconnecting)".into(),
                Some(s) => s.state.to_string(),
                None => "account not started".into(),
            }),
        };

        if let Ok(mut cache) = self.probe_cache.write() {
            cache.insert(account_id.to_string(), (result.clone(), Instant::now()));
        }
        result
    }

    fn invalidate(&self, account_id: &str) {
        if let Ok(mut cache) = self.probe_cache.write() {
            cache.remove(account_id);
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{AccountSnapshot, ClientState};

    fn manager() -> (AccountManager, mpsc::UnboundedReceiver<AppCommand>, AccountStateMap) {
        let (tx, rx) = mpsc::unbounded_channel();
        let accounts: AccountStateMap = Arc::new(tokio::sync::RwLock::new(HashMap::new()));
        (AccountManager::with_parts(tx, Arc::clone(&accounts)), rx, accounts)
    }

    async fn publish(accounts: &AccountStateMap, state: ClientState) {
        accounts.write().await.insert("work".into(), AccountSnapshot {
            state,
            show: "online".into(),
            bound_jid: None,
        });
    }

    #[test]
    fn start_rejects_empty_jid() {
        let (manager, ..) = manager();
        let err = manager
            .start_account("test", serde_json::json!({ "jid": "", "password": "pass" }))
            .unwrap_err();
        assert!(err.to_string().contains("JID is required"));
    }

    #[test]
    fn start_rejects_malformed_jid() {
        let (manager, ..) = manager();
        let err = manager
            .start_account("test", serde_json::json!({ "jid": "@capulet.lit" }))
            .unwrap_err();
        assert!(err.to_string().contains("invalid JID"));
    }

    #[test]
    fn start_adds_then_connects() {
        let (manager, mut rx, _) = manager();
        manager
            .start_account("work", serde_json::json!({ "jid": "juliet@capulet.lit", "password": "pw" }))
            .unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            AppCommand::AddAccount { name, .. } if name == "work"
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            AppCommand::Client {
                command: ClientCommand::ChangeStatus { show: Show::Online, .. },
                ..
            }
        ));
    }

    #[test]
    fn start_fails_without_event_loop() {
        let (manager, rx, _) = manager();
        drop(rx);
        assert!(
            manager
                .start_account("work", serde_json::json!({ "jid": "juliet@capulet.lit" }))
                .is_err()
        );
    }

    #[tokio::test]
    async fn stop_nonexistent_account() {
        let (manager, mut rx, _) = manager();
        assert!(manager.stop_account("nonexistent").is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stop_known_account_removes_it() {
        let (manager, mut rx, accounts) = manager();
        publish(&accounts, ClientState::Available).await;
        assert_eq!(manager.account_ids(), vec!["work".to_string()]);
        manager.stop_account("work").unwrap();
        assert!(matches!(rx.try_recv().unwrap(), AppCommand::RemoveAccount { name } if name == "work"));
    }

    #[tokio::test]
    async fn probe_unknown_account() {
        let (manager, ..) = manager();
        let snap = manager.probe("unknown").await;
        assert!(!snap.connected);
        assert_eq!(snap.details.as_deref(), Some("account not started"));
    }

    #[tokio::test]
    async fn probe_results_are_cached() {
        let (manager, _rx, accounts) = manager();
        publish(&accounts, ClientState::ReconnectScheduled).await;
        let snap = manager.probe("work").await;
        assert!(!snap.connected);
        assert_eq!(snap.details.as_deref(), Some("disconnected (reconnecting)"));

        publish(&accounts, ClientState::Available).await;
        assert_eq!(manager.probe("work").await, snap);

        manager.invalidate("work");
        let fresh = manager.probe("work").await;
        assert!(fresh.connected);
        assert_eq!(fresh.details.as_deref(), Some("available (online)"));
    }
}
