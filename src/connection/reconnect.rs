//! Automatic reconnection.
//!
//! [`ReconnectableConnection`] wraps a factory of single-use connections
//! behind a [`ReconnectPolicy`]. It presents the same [`Connection`]
//! surface while hiding transient disconnects, surfacing them instead as
//! `WillReconnect` / `Reconnected` / `ReconnectAttempt` events.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures_channel::mpsc;
use futures_util::StreamExt;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionEvent, ReconnectPolicy, RetryContext};
use crate::error::HubError;

/// Produces a fresh underlying connection wired to its own event channel.
pub type ConnectionFactory = Box<
    dyn Fn() -> (Arc<dyn Connection>, mpsc::UnboundedReceiver<ConnectionEvent>) + Send + Sync,
>;

/// Lifecycle of a reconnectable connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectableState {
    Disconnected,
    Starting,
    Reconnecting,
    Running,
    Stopping,
}

/// Everything the event pump serialises.
enum PumpEvent {
    /// An event from the underlying connection created at the given
    /// attempt epoch. Events from superseded attempts are dropped.
    Underlying(u64, ConnectionEvent),
    /// A scheduled restart delay elapsed.
    RestartTimerFired,
}

struct Inner {
    state: ReconnectableState,
    failed_attempts: u32,
    reconnect_start: Option<Instant>,
    current: Option<Arc<dyn Connection>>,
    epoch: u64,
    restart_timer: Option<JoinHandle<()>>,
    restart_pending: bool,
    stop_error: Option<HubError>,
}

/// A connection that survives transient failures by recreating its
/// underlying connection according to a retry policy.
pub struct ReconnectableConnection {
    factory: ConnectionFactory,
    policy: Arc<dyn ReconnectPolicy>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    pump: mpsc::UnboundedSender<PumpEvent>,
    inner: Mutex<Inner>,
}

impl ReconnectableConnection {
    pub fn new(
        factory: ConnectionFactory,
        policy: Arc<dyn ReconnectPolicy>,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Arc<Self> {
        let (pump, mut pump_rx) = mpsc::unbounded();
        let connection = Arc::new(Self {
            factory,
            policy,
            events,
            pump,
            inner: Mutex::new(Inner {
                state: ReconnectableState::Disconnected,
                failed_attempts: 0,
                reconnect_start: None,
                current: None,
                epoch: 0,
                restart_timer: None,
                restart_pending: false,
                stop_error: None,
            }),
        });

        let weak = Arc::downgrade(&connection);
        tokio::spawn(async move {
            while let Some(event) = pump_rx.next().await {
                let Some(connection) = weak.upgrade() else { break };
                match event {
                    PumpEvent::Underlying(epoch, event) => {
                        connection.handle_event(epoch, event).await;
                    }
                    PumpEvent::RestartTimerFired => connection.start_internal(false).await,
                }
            }
        });

        connection
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.unbounded_send(event);
    }

    /// Creates and starts a fresh underlying connection for the current
    /// attempt, unless a stop got there first.
    async fn start_internal(&self, reset_retry_attempts: bool) {
        let connection = {
            let mut inner = self.inner.lock().await;
            inner.restart_pending = false;
            if reset_retry_attempts {
                inner.failed_attempts = 0;
                inner.reconnect_start = None;
            }
            if !matches!(
                inner.state,
                ReconnectableState::Starting | ReconnectableState::Reconnecting
            ) {
                debug!(state = ?inner.state, "start attempt abandoned");
                return;
            }
            inner.epoch += 1;
            let epoch = inner.epoch;
            let (connection, mut events) = (self.factory)();
            inner.current = Some(connection.clone());

            let pump = self.pump.clone();
            tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    if pump
                        .unbounded_send(PumpEvent::Underlying(epoch, event))
                        .is_err()
                    {
                        break;
                    }
                }
            });
            connection
        };
        connection.start().await;
    }

    async fn handle_event(&self, epoch: u64, event: ConnectionEvent) {
        {
            let inner = self.inner.lock().await;
            if epoch != inner.epoch {
                debug!("dropping event from a superseded connection attempt");
                return;
            }
        }
        match event {
            ConnectionEvent::Opened { connection_id } => {
                self.handle_open_success(connection_id).await;
            }
            ConnectionEvent::FailedToOpen(error) => self.handle_open_failure(error).await,
            ConnectionEvent::Data(data) => self.emit(ConnectionEvent::Data(data)),
            ConnectionEvent::Closed(error) => self.handle_closed(error).await,
            other => debug!(?other, "unexpected event from underlying connection"),
        }
    }

    async fn handle_open_success(&self, connection_id: Option<String>) {
        let mut inner = self.inner.lock().await;
        inner.failed_attempts = 0;
        inner.reconnect_start = None;
        match inner.state {
            ReconnectableState::Starting => {
                inner.state = ReconnectableState::Running;
                drop(inner);
                self.emit(ConnectionEvent::Opened { connection_id });
            }
            ReconnectableState::Reconnecting => {
                inner.state = ReconnectableState::Running;
                info!("connection re-established");
                drop(inner);
                self.emit(ConnectionEvent::Reconnected);
            }
            ReconnectableState::Stopping => {
                // A stop raced a successful open; tear the fresh
                // connection down and let its close finish the stop
                let connection = inner.current.clone();
                let error = inner.stop_error.clone();
                drop(inner);
                if let Some(connection) = connection {
                    connection.stop(error).await;
                }
            }
            state => warn!(?state, "open event in unexpected state"),
        }
    }

    async fn handle_open_failure(&self, error: HubError) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            ReconnectableState::Starting | ReconnectableState::Reconnecting => {
                self.restart(inner, error);
            }
            _ => {
                inner.state = ReconnectableState::Disconnected;
                let stop_error = inner.stop_error.take();
                drop(inner);
                self.emit(ConnectionEvent::Closed(stop_error.or(Some(error))));
            }
        }
    }

    async fn handle_closed(&self, error: Option<HubError>) {
        let mut inner = self.inner.lock().await;
        if inner.state == ReconnectableState::Running {
            inner.state = ReconnectableState::Reconnecting;
            let error = error.unwrap_or(HubError::ConnectionIsBeingClosed);
            self.restart(inner, error);
        } else {
            inner.state = ReconnectableState::Disconnected;
            let stop_error = inner.stop_error.take();
            drop(inner);
            self.emit(ConnectionEvent::Closed(stop_error.or(error)));
        }
    }

    /// Consults the policy and either schedules the next attempt or gives
    /// up. `failed_attempts` still holds the count before this attempt.
    fn restart(&self, mut inner: MutexGuard<'_, Inner>, error: HubError) {
        let attempts = inner.failed_attempts;
        if attempts == 0 {
            inner.reconnect_start = Some(Instant::now());
        }
        let reconnect_start = inner.reconnect_start.unwrap_or_else(Instant::now);
        let context = RetryContext {
            failed_attempts_count: attempts,
            reconnect_start_time: reconnect_start,
            error: error.clone(),
        };

        match self.policy.next_attempt_interval(&context) {
            None => {
                info!(attempts, "giving up on reconnecting");
                let previous = inner.state;
                inner.state = ReconnectableState::Disconnected;
                drop(inner);
                if previous == ReconnectableState::Starting {
                    self.emit(ConnectionEvent::FailedToOpen(error));
                } else {
                    self.emit(ConnectionEvent::Closed(Some(error)));
                }
            }
            Some(interval) => {
                if inner.state == ReconnectableState::Reconnecting && attempts == 0 {
                    self.emit(ConnectionEvent::WillReconnect(error));
                }
                self.emit(ConnectionEvent::ReconnectAttempt(attempts));
                debug!(?interval, attempt = attempts, "scheduling restart");
                inner.failed_attempts = attempts + 1;
                inner.restart_pending = true;
                let pump = self.pump.clone();
                inner.restart_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(interval).await;
                    let _ = pump.unbounded_send(PumpEvent::RestartTimerFired);
                }));
            }
        }
    }
}

#[async_trait]
impl Connection for ReconnectableConnection {
    async fn start(&self) {
        {
            let mut inner = self.inner.lock().await;
            if inner.state != ReconnectableState::Disconnected {
                warn!(state = ?inner.state, "start ignored: connection is not disconnected");
                return;
            }
            inner.state = ReconnectableState::Starting;
            inner.stop_error = None;
        }
        self.start_internal(true).await;
    }

    async fn send(&self, data: Vec<u8>) -> Result<(), HubError> {
        let connection = {
            let inner = self.inner.lock().await;
            if inner.state == ReconnectableState::Reconnecting {
                return Err(HubError::ConnectionIsReconnecting);
            }
            inner.current.clone()
        };
        match connection {
            Some(connection) => connection.send(data).await,
            None => Err(HubError::InvalidState),
        }
    }

    async fn stop(&self, stop_error: Option<HubError>) {
        let (restart_was_pending, connection) = {
            let mut inner = self.inner.lock().await;
            if !matches!(
                inner.state,
                ReconnectableState::Starting
                    | ReconnectableState::Reconnecting
                    | ReconnectableState::Running
            ) {
                warn!(state = ?inner.state, "stop ignored");
                return;
            }
            inner.state = ReconnectableState::Stopping;
            inner.stop_error = stop_error;
            // Cancel a scheduled attempt before it can observe Stopping
            if let Some(timer) = inner.restart_timer.take() {
                timer.abort();
            }
            let pending = inner.restart_pending;
            inner.restart_pending = false;
            (pending, inner.current.clone())
        };

        if restart_was_pending {
            // Between attempts: nothing underlying will close, finish here
            let error = {
                let mut inner = self.inner.lock().await;
                inner.state = ReconnectableState::Disconnected;
                inner.stop_error.take()
            };
            self.emit(ConnectionEvent::Closed(error));
        } else if let Some(connection) = connection {
            let error = self.inner.lock().await.stop_error.clone();
            connection.stop(error).await;
        } else {
            let error = {
                let mut inner = self.inner.lock().await;
                inner.state = ReconnectableState::Disconnected;
                inner.stop_error.take()
            };
            self.emit(ConnectionEvent::Closed(error));
        }
    }

    async fn inherent_keep_alive(&self) -> bool {
        let connection = self.inner.lock().await.current.clone();
        match connection {
            Some(connection) => connection.inherent_keep_alive().await,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::time::timeout;

    use crate::connection::DefaultReconnectPolicy;

    struct ScriptedConnection {
        opens: bool,
        events: mpsc::UnboundedSender<ConnectionEvent>,
        stop_errors: StdMutex<Vec<Option<HubError>>>,
    }

    impl ScriptedConnection {
        fn fire(&self, event: ConnectionEvent) {
            self.events.unbounded_send(event).unwrap();
        }
    }

    #[async_trait]
    impl Connection for ScriptedConnection {
        async fn start(&self) {
            if self.opens {
                self.fire(ConnectionEvent::Opened {
                    connection_id: Some("c1".into()),
                });
            } else {
                self.fire(ConnectionEvent::FailedToOpen(HubError::WebError(599)));
            }
        }

        async fn send(&self, _data: Vec<u8>) -> Result<(), HubError> {
            Ok(())
        }

        async fn stop(&self, stop_error: Option<HubError>) {
            self.stop_errors.lock().unwrap().push(stop_error.clone());
            self.fire(ConnectionEvent::Closed(stop_error));
        }

        async fn inherent_keep_alive(&self) -> bool {
            false
        }
    }

    /// A factory whose first connection opens and whose later ones fail.
    fn scripted_factory(
        opens: fn(usize) -> bool,
    ) -> (ConnectionFactory, Arc<StdMutex<Vec<Arc<ScriptedConnection>>>>) {
        let created: Arc<StdMutex<Vec<Arc<ScriptedConnection>>>> =
            Arc::new(StdMutex::new(Vec::new()));
        let log = created.clone();
        let factory: ConnectionFactory = Box::new(move || {
            let (tx, rx) = mpsc::unbounded();
            let mut log = log.lock().unwrap();
            let connection = Arc::new(ScriptedConnection {
                opens: opens(log.len()),
                events: tx,
                stop_errors: StdMutex::new(Vec::new()),
            });
            log.push(connection.clone());
            let as_dyn: Arc<dyn Connection> = connection;
            (as_dyn, rx)
        });
        (factory, created)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
        timeout(Duration::from_secs(2), rx.next())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    fn short_ladder(attempts: &[u64]) -> Arc<DefaultReconnectPolicy> {
        Arc::new(DefaultReconnectPolicy::with_intervals(
            attempts.iter().map(|ms| Duration::from_millis(*ms)).collect(),
        ))
    }

    #[tokio::test]
    async fn reconnect_episode_runs_the_policy_to_exhaustion() {
        let (factory, created) = scripted_factory(|index| index == 0);
        let (tx, mut rx) = mpsc::unbounded();
        let connection = ReconnectableConnection::new(factory, short_ladder(&[10, 20]), tx);

        connection.start().await;
        assert!(matches!(
            next_event(&mut rx).await,
            ConnectionEvent::Opened { .. }
        ));

        // The transport drops out while running
        created.lock().unwrap()[0].fire(ConnectionEvent::Closed(Some(HubError::WebError(599))));

        assert!(matches!(
            next_event(&mut rx).await,
            ConnectionEvent::WillReconnect(HubError::WebError(599))
        ));
        assert!(matches!(
            next_event(&mut rx).await,
            ConnectionEvent::ReconnectAttempt(0)
        ));
        assert!(matches!(
            next_event(&mut rx).await,
            ConnectionEvent::ReconnectAttempt(1)
        ));
        assert!(matches!(
            next_event(&mut rx).await,
            ConnectionEvent::Closed(Some(HubError::WebError(599)))
        ));

        // One successful attempt plus two failed ones
        assert_eq!(created.lock().unwrap().len(), 3);
        assert_eq!(
            connection.inner.lock().await.state,
            ReconnectableState::Disconnected
        );
    }

    #[tokio::test]
    async fn send_fails_fast_while_reconnecting() {
        let (factory, created) = scripted_factory(|index| index == 0);
        let (tx, mut rx) = mpsc::unbounded();
        // A long delay keeps the connection in Reconnecting
        let connection = ReconnectableConnection::new(factory, short_ladder(&[10_000]), tx);

        connection.start().await;
        let _ = next_event(&mut rx).await;
        created.lock().unwrap()[0].fire(ConnectionEvent::Closed(Some(HubError::WebError(599))));
        let _ = next_event(&mut rx).await; // WillReconnect
        let _ = next_event(&mut rx).await; // ReconnectAttempt(0)

        assert!(matches!(
            connection.send(b"x".to_vec()).await,
            Err(HubError::ConnectionIsReconnecting)
        ));
    }

    #[tokio::test]
    async fn stop_while_waiting_for_a_retry_closes_locally() {
        let (factory, created) = scripted_factory(|index| index == 0);
        let (tx, mut rx) = mpsc::unbounded();
        let connection = ReconnectableConnection::new(factory, short_ladder(&[10_000]), tx);

        connection.start().await;
        let _ = next_event(&mut rx).await;
        created.lock().unwrap()[0].fire(ConnectionEvent::Closed(Some(HubError::WebError(599))));
        let _ = next_event(&mut rx).await; // WillReconnect
        let _ = next_event(&mut rx).await; // ReconnectAttempt(0)

        connection.stop(None).await;
        assert!(matches!(
            next_event(&mut rx).await,
            ConnectionEvent::Closed(None)
        ));
        // The cancelled timer never produced another attempt
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(created.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn start_is_ignored_unless_disconnected() {
        let (factory, created) = scripted_factory(|_| true);
        let (tx, mut rx) = mpsc::unbounded();
        let connection =
            ReconnectableConnection::new(factory, Arc::new(crate::connection::NoReconnectPolicy), tx);

        connection.start().await;
        let _ = next_event(&mut rx).await;
        connection.start().await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(created.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn initial_start_failure_without_retries_fails_to_open() {
        let (factory, _created) = scripted_factory(|_| false);
        let (tx, mut rx) = mpsc::unbounded();
        let connection =
            ReconnectableConnection::new(factory, Arc::new(crate::connection::NoReconnectPolicy), tx);

        connection.start().await;
        assert!(matches!(
            next_event(&mut rx).await,
            ConnectionEvent::FailedToOpen(HubError::WebError(599))
        ));
    }

    #[tokio::test]
    async fn clean_stop_while_running_forwards_the_close() {
        let (factory, created) = scripted_factory(|_| true);
        let (tx, mut rx) = mpsc::unbounded();
        let connection =
            ReconnectableConnection::new(factory, Arc::new(crate::connection::NoReconnectPolicy), tx);

        connection.start().await;
        let _ = next_event(&mut rx).await;

        connection.stop(None).await;
        assert!(matches!(
            next_event(&mut rx).await,
            ConnectionEvent::Closed(None)
        ));
        assert_eq!(created.lock().unwrap()[0].stop_errors.lock().unwrap().len(), 1);
    }
}
