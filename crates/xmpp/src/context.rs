//! Application context holding every account of the process.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Instant,
};

use {
    chrono::{DateTime, Utc},
    gajim_common::Clock,
    gajim_config::{AccountConfig, IdleConfig, Show},
    tokio::sync::mpsc,
    tracing::{debug, info, warn},
};

use crate::{
    client::{Client, ClientCommand},
    engine::{EngineEvent, EngineFactory},
    error::ClientError,
    ged::Ged,
    idle::IdleState,
    modules::Module,
    state::AccountSnapshot,
    storage::ArchiveStore,
};

/// Requests processed by the runtime that owns the [`AppContext`].
#[derive(Debug)]
pub enum AppCommand {
    AddAccount {
        name: String,
        config: Box<AccountConfig>,
    },
    RemoveAccount { name: String },
    Client {
        account: String,
        command: ClientCommand,
    },
}

/// Collaborators shared by all clients.
#[derive(Clone)]
pub struct Services {
    pub ged: Arc<Ged>,
    pub archive: Arc<dyn ArchiveStore>,
    pub clock: Arc<dyn Clock>,
    pub factory: Arc<dyn EngineFactory>,
    /// Where responders and clients post follow-up commands.
    pub commands: mpsc::UnboundedSender<AppCommand>,
}

pub struct AppContext {
    services: Services,
    idle_config: IdleConfig,
    clients: BTreeMap<String, Client>,
}

impl AppContext {
    pub fn new(services: Services, idle_config: IdleConfig) -> Self {
        Self {
            services,
            idle_config,
            clients: BTreeMap::new(),
        }
    }

    pub fn ged(&self) -> &Arc<Ged> {
        &self.services.ged
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn add_account(&mut self, name: &str, config: AccountConfig) -> Result<(), ClientError> {
        if self.clients.contains_key(name) {
            return Err(ClientError::DuplicateAccount(name.to_string()));
        }
        let client = Client::new(name, config, self.idle_config.clone(), &self.services)?;
        info!(account = name, "account added");
        self.clients.insert(name.to_string(), client);
        Ok(())
    }

    /// Remove an account, disconnecting it first if needed.
    pub fn remove_account(&mut self, name: &str) -> Result<(), ClientError> {
        let client = self
            .clients
            .get_mut(name)
            .ok_or_else(|| ClientError::UnknownAccount(name.to_string()))?;
        let state = client.state();
        if state.is_reconnect_scheduled() {
            client.change_status(Show::Offline, "");
        }
        if client.state().is_disconnected() {
            client.cleanup();
            self.clients.remove(name);
            info!(account = name, "account removed");
            return Ok(());
        }
        info!(account = name, %state, "disconnecting before removal");
        client.set_remove_account(true);
        client.disconnect(true, false, true);
        Ok(())
    }

    pub fn client(&self, name: &str) -> Option<&Client> {
        self.clients.get(name)
    }

    pub fn client_mut(&mut self, name: &str) -> Option<&mut Client> {
        self.clients.get_mut(name)
    }

    pub fn accounts(&self) -> impl Iterator<Item = &str> {
        self.clients.keys().map(String::as_str)
    }

    pub fn get_module(&self, account: &str, name: &str) -> Option<&dyn Module> {
        self.clients.get(account)?.get_module(name)
    }

    pub fn handle_engine_event(&mut self, event: EngineEvent) {
        match self.clients.get_mut(&event.account) {
            Some(client) => client.process_signal(event.generation, event.signal),
            None => debug!(account = event.account, "signal for a removed account"),
        }
    }

    pub fn handle_command(&mut self, command: AppCommand) {
        let result = match command {
            AppCommand::AddAccount { name, config } => self.add_account(&name, *config),
            AppCommand::RemoveAccount { name } => self.remove_account(&name),
            AppCommand::Client { account, command } => match self.clients.get_mut(&account) {
                Some(client) => {
                    client.handle_command(command);
                    Ok(())
                },
                None => Err(ClientError::UnknownAccount(account)),
            },
        };
        if let Err(e) = result {
            warn!("command failed: {e}");
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.clients.values().filter_map(Client::next_deadline).min()
    }

    pub fn fire_due_timers(&mut self) -> usize {
        self.clients.values_mut().map(Client::fire_due_timers).sum()
    }

    pub fn set_idle_state(&mut self, state: IdleState, idle_since: Option<DateTime<Utc>>) {
        for client in self.clients.values_mut() {
            client.set_idle_state(state, idle_since);
        }
    }

    /// Take every account offline for application exit.
    pub fn quit_all(&mut self) {
        for client in self.clients.values_mut() {
            if client.state().is_available() {
                client.change_status(Show::Offline, "");
            } else {
                client.quit(true);
            }
        }
    }

    /// Whether no account has a live or pending connection.
    pub fn all_disconnected(&self) -> bool {
        self.clients.values().all(|c| c.state().is_disconnected())
    }

    pub fn snapshots(&self) -> HashMap<String, AccountSnapshot> {
        self.clients
            .iter()
            .map(|(name, client)| (name.clone(), client.snapshot()))
            .collect()
    }

    pub fn cleanup(&mut self) {
        for client in self.clients.values_mut() {
            client.cleanup();
        }
        self.clients.clear();
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engine::EngineSignal,
        test_support::{TestServices, account_config},
    };

    #[test]
    fn duplicate_and_unknown_accounts() {
        let t = TestServices::new();
        let mut ctx = AppContext::new(t.services.clone(), IdleConfig::default());
        ctx.add_account("work", account_config()).unwrap();
        assert!(matches!(
            ctx.add_account("work", account_config()),
            Err(ClientError::DuplicateAccount(_))
        ));
        assert!(matches!(
            ctx.remove_account("home"),
            Err(ClientError::UnknownAccount(_))
        ));
        assert_eq!(ctx.accounts().collect::<Vec<_>>(), vec!["work"]);
    }

    #[test]
    fn registry_lookup_misses_are_none() {
        let t = TestServices::new();
        let mut ctx = AppContext::new(t.services.clone(), IdleConfig::default());
        ctx.add_account("work", account_config()).unwrap();
        assert!(ctx.get_module("work", "MAM").is_some());
        assert!(ctx.get_module("work", "Nonexistent").is_none());
        assert!(ctx.get_module("home", "MAM").is_none());
    }

    #[test]
    fn commands_are_routed_to_clients() {
        let t = TestServices::new();
        let mut ctx = AppContext::new(t.services.clone(), IdleConfig::default());
        ctx.handle_command(AppCommand::AddAccount {
            name: "work".into(),
            config: Box::new(account_config()),
        });
        ctx.handle_command(AppCommand::Client {
            account: "work".into(),
            command: ClientCommand::Connect,
        });
        assert!(ctx.client("work").unwrap().state().is_connecting());
        assert_eq!(t.mock().connects, 1);

        let generation = ctx.client("work").unwrap().generation();
        ctx.handle_engine_event(EngineEvent {
            account: "work".into(),
            generation,
            signal: EngineSignal::Connected,
        });
        assert!(ctx.client("work").unwrap().state().is_connected());
        assert!(ctx.next_deadline().is_some());
        assert!(!ctx.all_disconnected());
    }

    #[test]
    fn removing_a_connected_account_waits_for_disconnect() {
        let t = TestServices::new();
        let mut ctx = AppContext::new(t.services.clone(), IdleConfig::default());
        ctx.add_account("work", account_config()).unwrap();
        ctx.client_mut("work").unwrap().connect(false);

        ctx.remove_account("work").unwrap();
        assert!(ctx.client("work").unwrap().state().is_disconnecting());

        let generation = ctx.client("work").unwrap().generation();
        ctx.handle_engine_event(EngineEvent {
            account: "work".into(),
            generation,
            signal: EngineSignal::Disconnected,
        });
        let mut rx = t.take_receiver();
        let command = rx.try_recv().unwrap();
        assert!(matches!(&command, AppCommand::RemoveAccount { name } if name == "work"));
        ctx.handle_command(command);
        assert!(ctx.client("work").is_none());
    }

    #[test]
    fn removing_a_disconnected_account_is_immediate() {
        let t = TestServices::new();
        let mut ctx = AppContext::new(t.services.clone(), IdleConfig::default());
        ctx.add_account("work", account_config()).unwrap();
        ctx.remove_account("work").unwrap();
        assert!(ctx.client("work").is_none());
        assert_eq!(t.mock().destroyed, 1);
    }
}
