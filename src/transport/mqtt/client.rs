//! Impure broker session operations
//!
//! [`BridgeClient`] owns the `rumqttc` request handle and the credential
//! provider. The network loop is handed back to the caller from
//! [`BridgeClient::connect`] so a single dispatcher can poll it alongside the
//! sensor feed; credential changes are pushed into it through
//! [`CredentialSink`].

use super::connection::{configure_mqtt_options, BridgeState, ConnectResult, MqttError};
use super::health_monitor::{BridgeEvent, HealthMonitor};
use crate::config::{ModuleIdentity, MqttSection};
use crate::credentials::{CredentialError, CredentialProvider, SecurityToken};
use crate::error::{BridgeError, BridgeResult};
use crate::observability::metrics::metrics;
use crate::transport::{CredentialSink, Publisher};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, EventLoop, QoS};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// What the session should do after a connection result was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Session accepted, command topic subscription requested
    Connected,
    /// Token refreshed and re-applied; the next poll reconnects with it
    Reauthenticated,
}

/// Cloneable publish handle for the telemetry filter
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
}

#[async_trait]
impl Publisher for MqttPublisher {
    type Error = MqttError;

    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), MqttError> {
        // Non-blocking enqueue: the dispatcher that would drain a full
        // request queue is the same task that calls this.
        self.client
            .try_publish(topic, qos, false, payload.to_vec())
            .map_err(|e| MqttError::PublishFailed(Box::new(e)))
    }
}

/// Broker session wrapper with token-aware reauthentication
pub struct BridgeClient {
    client: AsyncClient,
    provider: Arc<CredentialProvider>,
    username: String,
    command_topic: String,
    max_reauth_attempts: u32,
    consecutive_reauths: u32,
    applied_token: SecurityToken,
    state_tx: watch::Sender<BridgeState>,
}

impl BridgeClient {
    /// Wrap an existing request handle. `applied_token` is the token the
    /// handle's session options were built with.
    pub fn new(
        client: AsyncClient,
        provider: Arc<CredentialProvider>,
        identity: &ModuleIdentity,
        config: &MqttSection,
        applied_token: SecurityToken,
    ) -> Self {
        let (state_tx, _) = watch::channel(BridgeState::Starting);
        Self {
            client,
            provider,
            username: identity.username(),
            command_topic: config.command_topic.clone(),
            max_reauth_attempts: config.max_reauth_attempts,
            consecutive_reauths: 0,
            applied_token,
            state_tx,
        }
    }

    /// Build a TLS session to `host:port` authenticated with the current
    /// token and trusting only the credential source's bundle.
    ///
    /// Nothing touches the network until the returned event loop is polled;
    /// the first poll performs the connect attempt.
    pub async fn connect(
        identity: &ModuleIdentity,
        config: &MqttSection,
        provider: Arc<CredentialProvider>,
        host: &str,
        port: u16,
    ) -> BridgeResult<(Self, EventLoop)> {
        let ca_pem = provider.server_certificate().await?;
        let token = provider.current_token().await;
        let options = configure_mqtt_options(identity, config, host, port, &token, &ca_pem)?;

        info!(
            client_id = %identity.client_id(),
            broker = %format!("{host}:{port}"),
            "Opening broker session"
        );

        let (client, event_loop) = AsyncClient::new(options, config.request_capacity);
        let mut bridge = Self::new(client, provider, identity, config, token);
        bridge.transition(BridgeEvent::ConnectStarted);
        metrics().record_connection_attempt();

        Ok((bridge, event_loop))
    }

    /// Handle the broker's verdict on one connect attempt.
    ///
    /// Bad credentials trigger exactly one refresh and one re-application of
    /// the fresh token to `session` before the caller polls again. Any other
    /// refusal is a connection error.
    pub async fn on_connect_result<S>(
        &mut self,
        result: ConnectResult,
        session: &mut S,
    ) -> BridgeResult<ConnectOutcome>
    where
        S: CredentialSink + ?Sized,
    {
        match result {
            ConnectResult::Accepted => {
                self.consecutive_reauths = 0;
                self.transition(BridgeEvent::ConnectAccepted);
                metrics().record_connection_established();
                if let Err(e) = self.subscribe_commands() {
                    warn!("Command subscription not requested: {}", e);
                }
                Ok(ConnectOutcome::Connected)
            }
            ConnectResult::BadCredentials => {
                self.consecutive_reauths += 1;
                self.transition(BridgeEvent::BadCredentials);
                metrics().record_reauthentication();

                if self.consecutive_reauths > self.max_reauth_attempts {
                    let attempts = self.consecutive_reauths - 1;
                    self.transition(BridgeEvent::Fatal(format!(
                        "credentials rejected after {attempts} refreshes"
                    )));
                    return Err(BridgeError::Reauthentication { attempts });
                }

                info!(
                    attempt = self.consecutive_reauths,
                    max = self.max_reauth_attempts,
                    "Broker rejected credentials, refreshing token"
                );
                match self.refresh_credentials(session).await {
                    Ok(_) => {
                        self.transition(BridgeEvent::RefreshSucceeded);
                        Ok(ConnectOutcome::Reauthenticated)
                    }
                    Err(e) => {
                        self.transition(BridgeEvent::RefreshFailed(e.to_string()));
                        Err(e.into())
                    }
                }
            }
            ConnectResult::Refused(code) => {
                error!(code, "Broker refused connection");
                self.transition(BridgeEvent::Fatal(format!(
                    "broker refused connection with code {code}"
                )));
                Err(MqttError::Refused { code }.into())
            }
        }
    }

    /// Refresh the token and push it into `session` for the next connect
    pub async fn refresh_credentials<S>(
        &mut self,
        session: &mut S,
    ) -> Result<SecurityToken, CredentialError>
    where
        S: CredentialSink + ?Sized,
    {
        let fresh = self.provider.refresh().await?;
        session.apply_credentials(&self.username, fresh.as_str());
        self.applied_token = fresh.clone();
        debug!(expires = %fresh.expiry().to_rfc3339(), "Session credentials updated");
        Ok(fresh)
    }

    /// Fire-and-forget publish
    pub async fn publish(&self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), MqttError> {
        self.publisher().publish(topic, payload, qos).await
    }

    /// Request a subscription to `topic` at QoS 1
    pub fn subscribe(&self, topic: &str) -> Result<(), MqttError> {
        self.client
            .try_subscribe(topic, QoS::AtLeastOnce)
            .map_err(|e| MqttError::SubscriptionFailed(Box::new(e)))?;
        debug!(topic, "Subscription requested");
        Ok(())
    }

    /// (Re)subscribe to the configured command topic
    pub fn subscribe_commands(&self) -> Result<(), MqttError> {
        self.subscribe(&self.command_topic)
    }

    /// Request a graceful disconnect
    pub fn disconnect(&mut self) -> Result<(), MqttError> {
        self.transition(BridgeEvent::ShutdownRequested);
        self.client
            .try_disconnect()
            .map_err(|e| MqttError::DisconnectFailed(Box::new(e)))
    }

    /// Publish handle sharing this session's request queue
    pub fn publisher(&self) -> MqttPublisher {
        MqttPublisher {
            client: self.client.clone(),
        }
    }

    /// Token last pushed into the session options
    pub fn applied_token(&self) -> &SecurityToken {
        &self.applied_token
    }

    pub fn provider(&self) -> &Arc<CredentialProvider> {
        &self.provider
    }

    pub fn command_topic(&self) -> &str {
        &self.command_topic
    }

    pub fn state(&self) -> BridgeState {
        self.state_tx.borrow().clone()
    }

    /// Watch channel following every state change
    pub fn state_receiver(&self) -> watch::Receiver<BridgeState> {
        self.state_tx.subscribe()
    }

    /// Apply a state machine event; invalid transitions are logged and ignored
    pub fn transition(&mut self, event: BridgeEvent) -> BridgeState {
        let current = self.state();
        match HealthMonitor::determine_next_state(&current, event) {
            Ok(next) => {
                HealthMonitor::log_state_transition(&current, &next);
                metrics().set_bridge_state(&next);
                self.state_tx.send_replace(next.clone());
                next
            }
            Err(e) => {
                debug!("{}", e);
                current
            }
        }
    }
}
