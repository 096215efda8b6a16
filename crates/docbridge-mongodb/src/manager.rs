//! Connection management with liveness probing and single-shot reconnect
//!
//! The manager owns the one live client handle. Operations never touch the
//! handle slot directly: they take a [`Lease`], an `Arc` clone that stays
//! valid even if a reconnect installs a new handle mid-call.

use docbridge_common::{DocBridgeError, Result};
use std::ops::Deref;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, instrument, warn};

use crate::config::ConnectionConfig;
use crate::driver::{Driver, StoreClient};

/// Observable connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// No usable handle; the next operation will try to connect
    NotReady,
    Ready,
    /// Closed by the caller; only an explicit `init` reopens
    Closed,
}

enum Slot<C> {
    NotReady,
    Ready(Arc<C>),
    Closed,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Ready,
            2 => ConnectionState::Closed,
            _ => ConnectionState::NotReady,
        }
    }
}

impl<C> Slot<C> {
    fn state(&self) -> ConnectionState {
        match self {
            Slot::NotReady => ConnectionState::NotReady,
            Slot::Ready(_) => ConnectionState::Ready,
            Slot::Closed => ConnectionState::Closed,
        }
    }
}

/// Scoped borrow of the live handle, released when dropped
pub struct Lease<C> {
    client: Arc<C>,
}

impl<C> Deref for Lease<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.client
    }
}

fn connect_error(err: DocBridgeError) -> DocBridgeError {
    match err {
        DocBridgeError::Connect(_) => err,
        other => DocBridgeError::Connect(other.to_string()),
    }
}

fn ping_error(err: DocBridgeError) -> DocBridgeError {
    match err {
        DocBridgeError::Ping(_) => err,
        other => DocBridgeError::Ping(other.to_string()),
    }
}

/// Owns the connection parameters and the live client handle.
pub struct ConnectionManager<D: Driver> {
    driver: D,
    config: ConnectionConfig,
    slot: RwLock<Slot<D::Client>>,
    // Mirrors the slot; updated under the slot's write lock
    state: AtomicU8,
    // Serializes init/reconnect/close so concurrent failures collapse into one reconnect
    transition: Mutex<()>,
}

impl<D: Driver> std::fmt::Debug for ConnectionManager<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl<D: Driver> ConnectionManager<D> {
    /// Creates a manager in the `NotReady` state. Nothing is dialed until
    /// `init` or the first operation.
    pub fn new(driver: D, config: ConnectionConfig) -> Self {
        Self {
            driver,
            config,
            slot: RwLock::new(Slot::NotReady),
            state: AtomicU8::new(ConnectionState::NotReady as u8),
            transition: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// State as of the last completed transition. Never blocks.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn install(&self, slot: &mut Slot<D::Client>, next: Slot<D::Client>) -> Slot<D::Client> {
        self.state.store(next.state() as u8, Ordering::Release);
        std::mem::replace(slot, next)
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Connects and probes, replacing any existing handle.
    #[instrument(skip(self), fields(uri = %self.config.redacted_uri()))]
    pub async fn init(&self) -> Result<()> {
        let _transition = self.transition.lock().await;
        self.connect_locked().await
    }

    async fn connect_locked(&self) -> Result<()> {
        match self.establish().await {
            Ok(client) => {
                // Old handle is dropped once its last lease ends
                let mut slot = self.slot.write().await;
                self.install(&mut slot, Slot::Ready(Arc::new(client)));
                drop(slot);
                info!(host = %self.config.host, database = %self.config.database, "Connection established");
                Ok(())
            }
            Err(e) => {
                let mut slot = self.slot.write().await;
                self.install(&mut slot, Slot::NotReady);
                drop(slot);
                error!(host = %self.config.host, error = %e, "Can't connect to the host");
                Err(e)
            }
        }
    }

    async fn establish(&self) -> Result<D::Client> {
        self.config.validate().map_err(connect_error)?;

        let client = self
            .driver
            .connect(&self.config)
            .await
            .map_err(connect_error)?;

        let probe = tokio::time::timeout(self.config.probe_timeout, client.ping()).await;
        let failure = match probe {
            Ok(Ok(())) => return Ok(client),
            Ok(Err(e)) => DocBridgeError::Connect(format!("Liveness probe failed: {}", e)),
            Err(_) => DocBridgeError::Connect(format!(
                "Liveness probe timed out after {:?}",
                self.config.probe_timeout
            )),
        };

        if let Err(e) = client.shutdown().await {
            warn!(error = %e, "Failed to release unprobed client");
        }
        Err(failure)
    }

    async fn probe(&self, client: &D::Client) -> Result<()> {
        match self.config.ping_timeout {
            Some(deadline) => tokio::time::timeout(deadline, client.ping())
                .await
                .map_err(|_| {
                    DocBridgeError::Ping(format!("Liveness check timed out after {:?}", deadline))
                })?
                .map_err(ping_error),
            None => client.ping().await.map_err(ping_error),
        }
    }

    /// Checks liveness. On failure the handle is dropped and, if
    /// `reconnect_on_failure` is set, `init` runs once.
    #[instrument(skip(self))]
    pub async fn ping(&self, reconnect_on_failure: bool) -> Result<()> {
        let current = match &*self.slot.read().await {
            Slot::Ready(client) => Some(Arc::clone(client)),
            Slot::NotReady => None,
            Slot::Closed => {
                return Err(DocBridgeError::NotConnected(
                    "Connection manager has been closed".to_string(),
                ))
            }
        };

        let failure = match &current {
            Some(client) => match self.probe(client).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(error = %e, reconnect = reconnect_on_failure, "Ping failed");
                    self.demote(client).await;
                    e
                }
            },
            None => DocBridgeError::Ping("Not connected".to_string()),
        };

        if !reconnect_on_failure {
            return Err(failure);
        }

        self.reconnect(current.as_ref()).await
    }

    /// Drops `failed` from the slot unless a newer handle already replaced it.
    async fn demote(&self, failed: &Arc<D::Client>) {
        let mut slot = self.slot.write().await;
        let still_installed =
            matches!(&*slot, Slot::Ready(installed) if Arc::ptr_eq(installed, failed));
        if still_installed {
            self.install(&mut slot, Slot::NotReady);
            info!("Connection marked not ready");
        }
    }

    async fn reconnect(&self, stale: Option<&Arc<D::Client>>) -> Result<()> {
        let _transition = self.transition.lock().await;

        // Another caller may have reconnected or closed while we waited
        match &*self.slot.read().await {
            Slot::Ready(installed) => {
                let replaced = stale.map_or(true, |stale| !Arc::ptr_eq(installed, stale));
                if replaced {
                    return Ok(());
                }
            }
            Slot::Closed => {
                return Err(DocBridgeError::NotConnected(
                    "Connection manager has been closed".to_string(),
                ))
            }
            Slot::NotReady => {}
        }

        info!("Reconnecting");
        self.connect_locked().await
    }

    /// Verifies liveness (reconnecting once if needed) and borrows the handle.
    pub async fn lease(&self) -> Result<Lease<D::Client>> {
        self.ping(true).await?;
        match &*self.slot.read().await {
            Slot::Ready(client) => Ok(Lease {
                client: Arc::clone(client),
            }),
            Slot::Closed => Err(DocBridgeError::NotConnected(
                "Connection manager has been closed".to_string(),
            )),
            Slot::NotReady => Err(DocBridgeError::NotConnected(
                "Connection lost before it could be used".to_string(),
            )),
        }
    }

    /// Releases the connection. Not idempotent: closing a manager without an
    /// open handle logs and returns a `Close` error.
    #[instrument(skip(self))]
    pub async fn close(&self) -> Result<()> {
        let _transition = self.transition.lock().await;
        let previous = {
            let mut slot = self.slot.write().await;
            self.install(&mut slot, Slot::Closed)
        };

        match previous {
            Slot::Ready(client) => {
                client.shutdown().await.map_err(|e| {
                    error!(error = %e, "Failed to close connection");
                    DocBridgeError::Close(e.to_string())
                })?;
                info!("Connection closed");
                Ok(())
            }
            Slot::NotReady => {
                error!("No connection to close");
                Err(DocBridgeError::Close("No connection to close".to_string()))
            }
            Slot::Closed => {
                error!("Connection already closed");
                Err(DocBridgeError::Close("Connection already closed".to_string()))
            }
        }
    }
}
