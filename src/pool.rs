use crate::command::Command;
use crate::config::ClientConfig;
use crate::connection::{Connection, InFlight, Phase};
use crate::error::{ClientError, ClientResult, ConnectionError};
use crate::pipeline::Pipeline;
use crate::resp::RespValue;
use crate::signal::{Listener, wait_any};
use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinSet;
use tracing::{debug, info};

#[derive(Debug)]
struct PoolShared {
    config: ClientConfig,
    members: Vec<Connection>,
    connected: AtomicBool,
}

/// A fixed set of connections to one server.
///
/// Calls go to the first member that is connected, idle and not holding a
/// transaction. When every member is busy the caller waits for any of them to
/// finish and scans again.
#[derive(Debug, Clone)]
pub struct Pool {
    shared: Arc<PoolShared>,
}

impl Pool {
    pub fn new(config: ClientConfig) -> Self {
        let members = (0..config.pool_size.max(1))
            .map(|_| Connection::new(config.clone()))
            .collect();
        Pool {
            shared: Arc::new(PoolShared {
                config,
                members,
                connected: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    pub fn size(&self) -> usize {
        self.shared.members.len()
    }

    pub fn members(&self) -> &[Connection] {
        &self.shared.members
    }

    /// Set by the first member to connect, cleared by `disconnect`.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Connect every member in parallel. Resolves with the first success;
    /// the remaining members keep connecting in the background. Fails only
    /// if every member fails.
    pub async fn connect(&self) -> ClientResult<()> {
        let mut attempts = JoinSet::new();
        for member in self.members() {
            let member = member.clone();
            attempts.spawn(async move { member.connect().await });
        }

        let mut last_err = None;
        while let Some(joined) = attempts.join_next().await {
            match joined {
                Ok(Ok(())) => {
                    attempts.detach_all();
                    if !self.shared.connected.swap(true, Ordering::AcqRel) {
                        info!("Pool of {} connected to {}", self.size(), self.config().addr());
                    }
                    return Ok(());
                }
                Ok(Err(err)) => last_err = Some(err),
                Err(join_err) => debug!("Pool connect task failed: {join_err}"),
            }
        }
        Err(last_err.unwrap_or(ClientError::Connection(ConnectionError::NotConnected)))
    }

    /// Gracefully close every member and wait for all of them.
    pub async fn disconnect(&self) -> ClientResult<()> {
        self.shared.connected.store(false, Ordering::Release);
        let mut closing = JoinSet::new();
        for member in self.members() {
            let member = member.clone();
            closing.spawn(async move { member.disconnect().await });
        }

        let mut result = Ok(());
        while let Some(joined) = closing.join_next().await {
            match joined {
                Ok(Err(err)) => result = Err(err),
                Err(join_err) => debug!("Pool disconnect task failed: {join_err}"),
                Ok(Ok(())) => {}
            }
        }
        result
    }

    /// The first available member. Waits for one to free up when all are
    /// busy; fails when no member is connected or on its way there.
    pub async fn pick(&self) -> ClientResult<Connection> {
        loop {
            let listeners = self.listen_all();
            if let Some(member) = self.members().iter().find(|m| m.is_available()) {
                return Ok(member.clone());
            }
            self.ensure_reachable()?;
            wait_any(listeners).await;
        }
    }

    /// Claim an idle member for one exchange. Unlike `pick`, the claim is
    /// made atomically, so concurrent callers never share a member.
    pub(crate) async fn checkout(&self) -> ClientResult<InFlight> {
        loop {
            let listeners = self.listen_all();
            for member in self.members() {
                if member.is_transaction_open() {
                    continue;
                }
                let Some(mut slot) = member.try_acquire() else {
                    continue;
                };
                // a multi() may have bound this member between the checks
                if member.is_transaction_open() {
                    continue;
                }
                if slot.prepare().await {
                    return Ok(slot);
                }
            }
            self.ensure_reachable()?;
            wait_any(listeners).await;
        }
    }

    pub async fn call<I, T>(&self, tokens: I, want_object: bool) -> ClientResult<RespValue>
    where
        I: IntoIterator<Item = T>,
        T: Display,
    {
        self.call_command(&Command::from_tokens(tokens), want_object)
            .await
    }

    pub async fn call_command(&self, command: &Command, want_object: bool) -> ClientResult<RespValue> {
        let mut slot = self.checkout().await?;
        slot.request(&command.encode(), want_object).await
    }

    /// A pipeline sent on whichever member is idle at `send` time.
    pub fn pipeline(&self) -> Pipeline {
        Pipeline::for_pool(self.clone())
    }

    pub fn pmulti(&self) -> Pipeline {
        Pipeline::for_pool(self.clone()).begin_transaction()
    }

    /// Bind a transaction to one idle member and send MULTI on it.
    ///
    /// The returned connection is skipped by the pool until the caller runs
    /// `exec()` on it; every command of the transaction must go through it.
    pub async fn multi(&self) -> ClientResult<Connection> {
        let member = loop {
            let listeners = self.listen_all();
            let bound = self
                .members()
                .iter()
                .find(|m| m.is_available() && m.try_open_transaction());
            if let Some(member) = bound {
                break member.clone();
            }
            self.ensure_reachable()?;
            wait_any(listeners).await;
        };
        debug!("Connection {} bound to a transaction", member.id());
        member.send_multi().await?;
        Ok(member)
    }

    fn listen_all(&self) -> Vec<Listener<'_>> {
        self.members().iter().map(Connection::listen).collect()
    }

    fn ensure_reachable(&self) -> ClientResult<()> {
        let down = self
            .members()
            .iter()
            .all(|m| matches!(m.phase(), Phase::Disconnected | Phase::Destroyed));
        if down {
            return Err(ConnectionError::NotConnected.into());
        }
        Ok(())
    }
}
