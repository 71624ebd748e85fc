//! The dispatch loop
//!
//! One task owns the broker network loop, the sensor feed, the renewal timer
//! and the shutdown signal, and services them through a single
//! `tokio::select!`. Connection results and publishes are therefore handled in
//! the order they occur, and the credential re-application after a rejected
//! connect always happens before the next connect attempt.
//!
//! `EventLoop::poll` must not be cancelled while a connect is in progress:
//! dropping it discards the half-open connection. The network loop is
//! therefore moved into one boxed poll future that survives across
//! `select!` turns and hands the loop back when it completes.

use crate::config::{BridgeConfig, ModuleIdentity, MqttSection};
use crate::credentials::{CredentialProvider, WorkloadClient};
use crate::error::BridgeResult;
use crate::observability::metrics::metrics;
use crate::observability::HealthServer;
use crate::telemetry::{DeviceMapping, SensorSource, TelemetryFilter};
use crate::transport::mqtt::{
    BridgeClient, BridgeEvent, BridgeState, ConnectOutcome, ErrorRoute, EventRoute,
    HealthMonitor, MessageHandler, MqttError, MqttPublisher, ReconnectConfig,
    ReconnectionDecision,
};
use crate::transport::CredentialSink;
use rumqttc::{ConnectionError, Event, EventLoop, Outgoing};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior, Sleep};
use tracing::{debug, error, info, warn, Instrument};

/// How often the token is checked against its renewal margin
pub const RENEWAL_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Upper bound for flushing the DISCONNECT packet on shutdown
pub const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

type PollOutput = (EventLoop, Result<Event, ConnectionError>);
type PollFuture = Pin<Box<dyn Future<Output = PollOutput> + Send>>;

/// Start one `poll` that owns the network loop until it completes
fn poll_network(mut event_loop: EventLoop) -> PollFuture {
    Box::pin(async move {
        let polled = event_loop.poll().await;
        (event_loop, polled)
    })
}

#[derive(Debug, Default)]
struct SessionProgress {
    ever_connected: bool,
    reconnect_attempts: u32,
}

/// Credentials waiting for the network loop; written into its options
/// before the next poll, so they take effect on the next connect.
#[derive(Debug, Default)]
struct StagedCredentials(Option<(String, String)>);

impl StagedCredentials {
    fn flush_into<T: CredentialSink>(&mut self, sink: &mut T) {
        if let Some((username, password)) = self.0.take() {
            sink.apply_credentials(&username, &password);
        }
    }
}

impl CredentialSink for StagedCredentials {
    fn apply_credentials(&mut self, username: &str, password: &str) {
        self.0 = Some((username.to_string(), password.to_string()));
    }
}

/// The running bridge: broker session, filter and sensor feed
pub struct Bridge<S: SensorSource> {
    client: BridgeClient,
    event_loop: Option<EventLoop>,
    staged: StagedCredentials,
    filter: TelemetryFilter<MqttPublisher>,
    source: S,
    reconnect: ReconnectConfig,
    renewal_interval: Duration,
}

impl<S: SensorSource> Bridge<S> {
    pub fn new(
        client: BridgeClient,
        event_loop: EventLoop,
        mapping: DeviceMapping,
        source: S,
        config: &MqttSection,
    ) -> Self {
        let filter = TelemetryFilter::new(mapping, client.publisher());
        Self {
            client,
            event_loop: Some(event_loop),
            staged: StagedCredentials::default(),
            filter,
            source,
            reconnect: ReconnectConfig::from(&config.reconnect),
            renewal_interval: RENEWAL_CHECK_INTERVAL,
        }
    }

    /// Override the renewal check period
    pub fn with_renewal_interval(mut self, interval: Duration) -> Self {
        self.renewal_interval = interval;
        self
    }

    pub fn state_receiver(&self) -> watch::Receiver<BridgeState> {
        self.client.state_receiver()
    }

    /// Dispatch until `shutdown` resolves or a fatal error occurs
    pub async fn run<F>(mut self, shutdown: F) -> BridgeResult<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let mut renewal = tokio::time::interval_at(
            Instant::now() + self.renewal_interval,
            self.renewal_interval,
        );
        renewal.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut progress = SessionProgress::default();
        let mut in_flight: Option<PollFuture> = None;
        let mut backoff: Option<Pin<Box<Sleep>>> = None;
        let mut feed_open = true;

        loop {
            if in_flight.is_none() && backoff.is_none() {
                if let Some(mut event_loop) = self.event_loop.take() {
                    self.staged.flush_into(&mut event_loop);
                    in_flight = Some(poll_network(event_loop));
                }
            }

            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }

                (event_loop, polled) = wait_poll(&mut in_flight), if in_flight.is_some() => {
                    in_flight = None;
                    self.event_loop = Some(event_loop);
                    let delay = match polled {
                        Ok(event) => {
                            self.handle_event(event, &mut progress).await?;
                            None
                        }
                        Err(error) => self.handle_error(error, &mut progress).await?,
                    };
                    backoff = delay.map(|d| Box::pin(tokio::time::sleep(d)));
                }

                _ = wait_backoff(&mut backoff), if backoff.is_some() => {
                    backoff = None;
                }

                reading = self.source.next_reading(), if feed_open => {
                    match reading {
                        Some(reading) => {
                            let span = crate::telemetry_span!(sensor = %reading.address);
                            self.filter
                                .handle(&reading.address, reading.payload)
                                .instrument(span)
                                .await;
                        }
                        None => {
                            info!("Sensor feed ended; bridge stays up until shutdown");
                            feed_open = false;
                        }
                    }
                }

                _ = renewal.tick() => {
                    self.renew_if_due().await;
                }
            }
        }

        self.shutdown(in_flight).await
    }

    async fn handle_event(
        &mut self,
        event: Event,
        progress: &mut SessionProgress,
    ) -> BridgeResult<()> {
        match MessageHandler::route_mqtt_event(&event) {
            EventRoute::ConnectResult(result) => {
                let outcome = self
                    .client
                    .on_connect_result(result, &mut self.staged)
                    .await?;
                if outcome == ConnectOutcome::Connected {
                    progress.ever_connected = true;
                    progress.reconnect_attempts = 0;
                }
            }
            EventRoute::MessageReceived { topic, payload } => {
                metrics().record_command_received();
                info!(
                    topic = %topic,
                    payload = %MessageHandler::describe_payload(&payload),
                    "Command received"
                );
            }
            EventRoute::Disconnected => {
                warn!("Broker closed the session");
                self.client
                    .transition(BridgeEvent::ConnectionLost("broker disconnect".to_string()));
            }
            EventRoute::SubscriptionConfirmed { packet_id, rejected } => {
                if rejected {
                    warn!(packet_id, topic = %self.client.command_topic(), "Broker refused command subscription");
                } else {
                    debug!(packet_id, "Subscription confirmed");
                }
            }
            EventRoute::PublishAcknowledged { packet_id } => {
                debug!(packet_id, "Publish acknowledged");
            }
            EventRoute::InfrastructureEvent(description) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", description);
            }
            EventRoute::OutgoingEvent => {}
        }
        Ok(())
    }

    /// Returns the delay to wait before polling again, if any
    async fn handle_error(
        &mut self,
        error: ConnectionError,
        progress: &mut SessionProgress,
    ) -> BridgeResult<Option<Duration>> {
        let reason = match MessageHandler::route_connection_error(&error) {
            ErrorRoute::ConnectResult(result) => {
                self.client
                    .on_connect_result(result, &mut self.staged)
                    .await?;
                return Ok(None);
            }
            ErrorRoute::Transport(reason) => reason,
        };

        if !progress.ever_connected {
            error!("Could not reach broker: {}", reason);
            self.client.transition(BridgeEvent::Fatal(reason.clone()));
            return Err(MqttError::ConnectionFailed(reason).into());
        }

        self.client
            .transition(BridgeEvent::ConnectionLost(reason.clone()));

        match HealthMonitor::should_attempt_reconnection(progress.reconnect_attempts, &self.reconnect)
        {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                progress.reconnect_attempts = attempt;
                metrics().record_connection_attempt();
                let max_display = self
                    .reconnect
                    .max_attempts
                    .map_or("unlimited".to_string(), |max| max.to_string());
                warn!(
                    "Broker connection lost ({}); reconnection {}/{} in {}ms",
                    reason, attempt, max_display, delay_ms
                );
                Ok(Some(Duration::from_millis(delay_ms)))
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                let attempts = progress.reconnect_attempts;
                self.client.transition(BridgeEvent::Fatal(format!(
                    "gave up reconnecting after {attempts} attempts"
                )));
                Err(MqttError::ReconnectExhausted { attempts, reason }.into())
            }
        }
    }

    /// Proactive renewal while connected; a failure keeps the current token
    async fn renew_if_due(&mut self) {
        if self.client.state() != BridgeState::Connected {
            return;
        }
        if !self.client.provider().renewal_due().await {
            return;
        }
        let span = crate::credential_span!(operation = "proactive_renewal");
        match self
            .client
            .refresh_credentials(&mut self.staged)
            .instrument(span)
            .await
        {
            Ok(token) => info!(
                expires = %token.expiry().to_rfc3339(),
                "Token renewed ahead of expiry"
            ),
            Err(e) => warn!("Proactive token renewal failed, retrying later: {}", e),
        }
    }

    async fn shutdown(mut self, in_flight: Option<PollFuture>) -> BridgeResult<()> {
        let was_connected = self.client.state() == BridgeState::Connected;
        if let Err(e) = self.client.disconnect() {
            warn!("Disconnect request failed: {}", e);
        }

        if was_connected {
            let mut pending = in_flight.or_else(|| self.event_loop.take().map(poll_network));
            let flush = async {
                while let Some(poll) = pending.take() {
                    match poll.await {
                        (_, Ok(Event::Outgoing(Outgoing::Disconnect))) | (_, Err(_)) => break,
                        (event_loop, Ok(_)) => pending = Some(poll_network(event_loop)),
                    }
                }
            };
            if tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, flush).await.is_err() {
                warn!("Timed out flushing disconnect to broker");
            }
        }

        info!("Bridge stopped");
        Ok(())
    }
}

async fn wait_poll(in_flight: &mut Option<PollFuture>) -> PollOutput {
    match in_flight {
        Some(poll) => poll.await,
        None => std::future::pending().await,
    }
}

async fn wait_backoff(backoff: &mut Option<Pin<Box<Sleep>>>) {
    if let Some(sleep) = backoff {
        sleep.await;
    }
}

/// Full startup: identity, credentials, session, health endpoint, dispatch
pub async fn run_bridge<S, F>(config: &BridgeConfig, source: S, shutdown: F) -> BridgeResult<()>
where
    S: SensorSource,
    F: Future<Output = ()>,
{
    let identity = ModuleIdentity::from_env()?;
    let mapping = config.device_mapping()?;
    if mapping.is_empty() {
        warn!("Device mapping is empty; every sensor reading will be discarded");
    }

    let span = crate::bridge_span!(client_id = %identity.client_id());
    start_bridge(config, identity, mapping, source, shutdown)
        .instrument(span)
        .await
}

async fn start_bridge<S, F>(
    config: &BridgeConfig,
    identity: ModuleIdentity,
    mapping: DeviceMapping,
    source: S,
    shutdown: F,
) -> BridgeResult<()>
where
    S: SensorSource,
    F: Future<Output = ()>,
{
    info!(
        gateway = %identity.gateway_hostname,
        devices = mapping.len(),
        "Starting protocol translation module"
    );

    let signer = Arc::new(WorkloadClient::new(&identity, &config.token.key_id)?);
    let provider = Arc::new(
        CredentialProvider::create(&identity, &config.token, signer)
            .instrument(crate::credential_span!(operation = "issue"))
            .await?,
    );

    let (client, event_loop) = BridgeClient::connect(
        &identity,
        &config.mqtt,
        provider,
        &identity.gateway_hostname,
        config.mqtt.port,
    )
    .await?;

    let bridge = Bridge::new(client, event_loop, mapping, source, &config.mqtt);

    let health_task = if config.health.enabled {
        let server = HealthServer::new(
            identity.client_id(),
            config.health.port,
            bridge.state_receiver(),
        );
        Some(tokio::spawn(server.start()))
    } else {
        None
    };

    let result = bridge.run(shutdown).await;

    if let Some(task) = health_task {
        task.abort();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TokenSection;
    use crate::error::BridgeError;
    use crate::telemetry::ChannelSensorSource;
    use crate::testing::{MockSigner, RecordingSession};
    use rumqttc::{AsyncClient, MqttOptions};
    use std::collections::BTreeMap;

    fn identity() -> ModuleIdentity {
        ModuleIdentity {
            gateway_hostname: "127.0.0.1".to_string(),
            iothub_hostname: "hub.example.net".to_string(),
            device_id: "gw".to_string(),
            module_id: "ptm".to_string(),
            module_generation_id: "gen".to_string(),
            workload_uri: "unix:///tmp/workload.sock".to_string(),
            api_version: "2019-01-30".to_string(),
        }
    }

    async fn bridge_to(port: u16) -> Bridge<ChannelSensorSource> {
        let provider = Arc::new(
            CredentialProvider::create(&identity(), &TokenSection::default(), Arc::new(MockSigner::new()))
                .await
                .unwrap(),
        );
        let token = provider.current_token().await;
        let mut options = MqttOptions::new("gw/ptm", "127.0.0.1", port);
        options.set_credentials(identity().username(), token.as_str());
        let (client, event_loop) = AsyncClient::new(options, 16);
        let config = MqttSection::default();
        let mut client = BridgeClient::new(client, provider, &identity(), &config, token);
        client.transition(BridgeEvent::ConnectStarted);

        let entries = BTreeMap::from([("AA:AA".to_string(), "sensor_1".to_string())]);
        let (_tx, source) = ChannelSensorSource::new(4);
        Bridge::new(
            client,
            event_loop,
            DeviceMapping::from_entries(&entries).unwrap(),
            source,
            &config,
        )
    }

    async fn unused_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_unreachable_broker_before_first_connect_is_fatal() {
        let bridge = bridge_to(unused_port().await).await;
        let state = bridge.state_receiver();

        let result = bridge.run(std::future::pending()).await;

        let err = result.unwrap_err();
        assert!(matches!(err, BridgeError::Connection(MqttError::ConnectionFailed(_))));
        assert_eq!(err.exit_code(), 4);
        assert!(state.borrow().is_terminal());
    }

    #[tokio::test]
    async fn test_shutdown_before_connect_is_clean() {
        let bridge = bridge_to(unused_port().await).await;
        let state = bridge.state_receiver();

        bridge.run(async {}).await.unwrap();

        assert_eq!(*state.borrow(), BridgeState::ShuttingDown);
    }

    #[test]
    fn test_staged_credentials_flush_latest_once() {
        let mut staged = StagedCredentials::default();
        staged.apply_credentials("user", "first");
        staged.apply_credentials("user", "second");

        let mut session = RecordingSession::default();
        staged.flush_into(&mut session);
        staged.flush_into(&mut session);

        assert_eq!(session.applied, vec![("user".to_string(), "second".to_string())]);
    }

    #[tokio::test]
    async fn test_wait_poll_without_poll_is_pending() {
        let mut in_flight: Option<PollFuture> = None;
        let result =
            tokio::time::timeout(Duration::from_millis(20), wait_poll(&mut in_flight)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_wait_backoff_completes() {
        let mut backoff = Some(Box::pin(tokio::time::sleep(Duration::from_millis(5))));
        tokio::time::timeout(Duration::from_secs(1), wait_backoff(&mut backoff))
            .await
            .unwrap();
    }
}
