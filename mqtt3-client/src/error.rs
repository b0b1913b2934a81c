use std::io;

use thiserror::Error;

use mqtt3_packet::ConnectReturnCode;

/// A specialized `Result` type for client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Status codes returned by every client operation.
///
/// Each value is a distinct diagnostic; callers usually only branch on the
/// handful that drive control flow (`NotConnected`, `AckTableFull`,
/// `BufferTooShort`).
#[derive(Debug, Error)]
pub enum Error {
    /// The operation failed for an unspecific reason.
    #[error("operation failed")]
    Failed,

    /// A packet does not fit the configured read or write buffer.
    #[error("packet does not fit the buffer")]
    BufferTooShort,

    /// No packet arrived within the command timeout.
    #[error("nothing to read within the command timeout")]
    NothingToRead,

    /// The transport rejected the outgoing bytes.
    #[error("failed to send packet: {0}")]
    SendFailed(#[source] io::Error),

    /// The in-flight acknowledgment table is at capacity.
    #[error("in-flight ack table is full")]
    AckTableFull,

    /// An in-flight record with the same type and packet id already exists.
    #[error("ack record already exists")]
    AckNodeExists,

    /// The session is not connected to the broker.
    #[error("client is not connected")]
    NotConnected,

    /// The session is tearing down after a disconnect.
    #[error("clean session pending")]
    CleanSessionPending,

    /// The CONNECT handshake failed; carries the CONNACK return code when
    /// the broker answered at all.
    #[error("connect failed: {0:?}")]
    ConnectFailed(Option<ConnectReturnCode>),

    /// A reconnect attempt did not succeed within the retry pause.
    #[error("reconnect timed out")]
    ReconnectTimeout,

    /// Re-issuing subscriptions after a reconnect failed.
    #[error("resubscribe failed")]
    Resubscribe,

    /// A QoS continuation was requested for a packet type that has none.
    #[error("invalid publish ack type")]
    PublishAckTypeInvalid,

    /// Building a PUBREL/PUBCOMP continuation packet failed.
    #[error("failed to build publish ack packet")]
    PublishAckBuildFailed,

    /// An incoming SUBACK could not be decoded.
    #[error("failed to parse subscribe ack")]
    SubscribeAckParseFailed,

    /// The broker refused the subscription (granted QoS 0x80).
    #[error("broker rejected the subscription")]
    SubscribeNack,

    /// An incoming UNSUBACK could not be decoded.
    #[error("failed to parse unsubscribe ack")]
    UnsubscribeAckParseFailed,

    /// An incoming PUBLISH could not be decoded.
    #[error("failed to parse publish")]
    PublishParseFailed,

    /// Serializing the PUBACK/PUBREC answer to an incoming PUBLISH failed.
    #[error("failed to serialize publish ack")]
    PublishAckSerializeFailed,

    /// Flipping the DUP bit on a buffered PUBLISH failed.
    #[error("failed to set publish dup flag")]
    SetPublishDupFailed,
}
