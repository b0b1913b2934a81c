//! An MQTT 3.1.1 client for embedded and server-side use.
//!
//! The client keeps a single long-lived session with a broker, offering
//! publish, subscribe, unsubscribe, keep-alive and transparent
//! reconnect-with-resubscribe over a pluggable byte-stream transport.
//!
//! A background thread, spawned on the first successful [`MqttClient::connect`],
//! reads and dispatches incoming packets, drives the keep-alive probe,
//! retransmits unacknowledged QoS 1/2 requests and re-establishes dropped
//! connections. Message handlers run on that thread.
//!
//! ```no_run
//! use mqtt3_client::{ClientOptions, Message, MqttClient, QoS};
//!
//! let options = ClientOptions::new("test.mosquitto.org", 1883, "client01");
//! let client = MqttClient::new(options);
//!
//! client.connect()?;
//! client.subscribe("sensors/+/temperature", QoS::AtLeastOnce, None)?;
//! client.publish("sensors/a/temperature", &Message::new(b"23.5", QoS::AtLeastOnce))?;
//! # Ok::<(), mqtt3_client::Error>(())
//! ```

#[macro_use]
extern crate log;

mod acks;
mod buffer;
mod client;
mod error;
mod handlers;
mod message;
mod timer;
mod topic;
mod transport;

pub use crate::client::{ClientOptions, ClientState, MqttClient, WillOptions};
pub use crate::error::{Error, Result};
pub use crate::message::{
    InterceptorHandler, Message, MessageData, MessageHandler, ReconnectHandler, TOPIC_LEN_MAX,
};
pub use crate::topic::topic_matches;
pub use crate::transport::{Connector, TcpConnector, Transport};

pub use mqtt3_packet::{ConnectReturnCode, QoS};
