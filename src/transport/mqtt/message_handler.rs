//! Pure routing of broker events
//!
//! Turns what the network loop yields, events and errors alike, into routes
//! the dispatcher acts on. Connection results arrive on both paths: an
//! accepted CONNACK as an event, a refused one as a connection error.

use super::connection::ConnectResult;
use bytes::Bytes;
use rumqttc::{ConnectionError, Event, Packet, SubscribeReasonCode};
use tracing::debug;

/// Routing decisions for broker events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// CONNACK received; carries the broker's verdict
    ConnectResult(ConnectResult),
    /// Message received on a subscribed topic
    MessageReceived { topic: String, payload: Bytes },
    /// Broker closed the session
    Disconnected,
    /// Subscription acknowledged; `rejected` when any filter was refused
    SubscriptionConfirmed { packet_id: u16, rejected: bool },
    /// QoS 1 publish acknowledged by the broker
    PublishAcknowledged { packet_id: u16 },
    /// Infrastructure event (PingResp, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled by the library)
    OutgoingEvent,
}

/// Routing decisions for network loop errors
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorRoute {
    /// The broker answered the connect attempt with a refusal
    ConnectResult(ConnectResult),
    /// Transport-level failure
    Transport(String),
}

/// Pure message routing
pub struct MessageHandler;

impl MessageHandler {
    /// Route a network loop event
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) => EventRoute::ConnectResult(connack.code.into()),
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                },
                Packet::Disconnect => EventRoute::Disconnected,
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    rejected: suback
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure)),
                },
                Packet::PubAck(puback) => EventRoute::PublishAcknowledged {
                    packet_id: puback.pkid,
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Route a network loop error
    pub fn route_connection_error(error: &ConnectionError) -> ErrorRoute {
        match error {
            ConnectionError::ConnectionRefused(code) => ErrorRoute::ConnectResult((*code).into()),
            other => ErrorRoute::Transport(other.to_string()),
        }
    }

    /// Render a command payload for logging
    pub fn describe_payload(payload: &[u8]) -> String {
        match std::str::from_utf8(payload) {
            Ok(text) => text.to_string(),
            Err(_) => {
                debug!("Command payload is not UTF-8, logging length only");
                format!("<{} bytes of binary data>", payload.len())
            }
        }
    }
}
