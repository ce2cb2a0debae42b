//! AVCTP API Functions
//!
//! Async wrappers that hand requests to the processor task through static
//! channels and wait for its answer. They can be called from any task running
//! on the same executor as [`crate::processor::run`].
//!
//! Connection outcomes (connected, disconnected, congestion) and inbound
//! messages are not returned here; they arrive through the
//! [`ConnectionCallbacks`](crate::avct::ConnectionCallbacks) of each
//! connection.
//!
//! # Usage
//!
//! ```rust,ignore
//! use avctp::api;
//! use avctp::avct::{CommandResponse, ConnectionConfig, ControlFlags, Message, Role};
//! use avctp::l2cap::SecurityRequirements;
//!
//! api::register(672, SecurityRequirements::AUTHENTICATE).await?;
//!
//! let config = ConnectionConfig {
//!     pid: 0x110E,
//!     role: Role::Initiator,
//!     control: ControlFlags::CONTROLLER,
//!     callbacks: &AVRCP_CALLBACKS,
//! };
//! let handle = api::create_connection(config, peer).await?;
//!
//! // Once the connect confirm arrived
//! let message = Message::from_slice(&[0x48, 0x00, 0x00, 0x19, 0x58, 0x31])?;
//! api::send_message(handle, 0, CommandResponse::Command, message).await?;
//! ```

use crate::avct::{AvctError, CommandResponse, ConnectionConfig, ConnectionHandle, Message};
use crate::l2cap::SecurityRequirements;
use crate::{BluetoothAddress, REQUEST_CHANNEL, RESPONSE_CHANNEL, Request, Response};

async fn request(request: Request) -> Response {
    REQUEST_CHANNEL.sender().send(request).await;
    RESPONSE_CHANNEL.receiver().receive().await
}

/// Register AVCTP with the L2CAP layer.
///
/// # Errors
///
/// Returns an error if already registered or the transport refuses the PSM.
pub async fn register(local_mtu: u16, security: SecurityRequirements) -> Result<(), AvctError> {
    match request(Request::Register {
        local_mtu,
        security,
    })
    .await
    {
        Response::Registered => Ok(()),
        Response::Error(e) => Err(e),
        _ => Err(AvctError::UnexpectedResponse),
    }
}

/// Remove the AVCTP registration.
///
/// # Errors
///
/// Returns an error if not registered or connections are still allocated.
pub async fn deregister() -> Result<(), AvctError> {
    match request(Request::Deregister).await {
        Response::Deregistered => Ok(()),
        Response::Error(e) => Err(e),
        _ => Err(AvctError::UnexpectedResponse),
    }
}

/// Create a profile connection to `peer`.
///
/// # Errors
///
/// Returns an error if no control block is free or the PID is already
/// connected to `peer`.
pub async fn create_connection(
    config: ConnectionConfig<'static>,
    peer: BluetoothAddress,
) -> Result<ConnectionHandle, AvctError> {
    match request(Request::CreateConnection { config, peer }).await {
        Response::ConnectionCreated(handle) => Ok(handle),
        Response::Error(e) => Err(e),
        _ => Err(AvctError::UnexpectedResponse),
    }
}

/// Remove a profile connection.
///
/// # Errors
///
/// Returns an error if the handle is unknown.
pub async fn remove_connection(handle: ConnectionHandle) -> Result<(), AvctError> {
    match request(Request::RemoveConnection(handle)).await {
        Response::ConnectionRemoved => Ok(()),
        Response::Error(e) => Err(e),
        _ => Err(AvctError::UnexpectedResponse),
    }
}

/// Send a message on a connection.
///
/// # Errors
///
/// Returns an error if the handle is unknown or the connection is not open.
pub async fn send_message(
    handle: ConnectionHandle,
    label: u8,
    cr: CommandResponse,
    message: Message,
) -> Result<(), AvctError> {
    match request(Request::SendMessage {
        handle,
        label,
        cr,
        message,
    })
    .await
    {
        Response::MessageSent => Ok(()),
        Response::Error(e) => Err(e),
        _ => Err(AvctError::UnexpectedResponse),
    }
}

/// Get the MTU of the peer a connection is bound to.
///
/// # Errors
///
/// Returns an error if the handle is unknown.
pub async fn get_peer_mtu(handle: ConnectionHandle) -> Result<u16, AvctError> {
    match request(Request::GetPeerMtu(handle)).await {
        Response::PeerMtu(mtu) => Ok(mtu),
        Response::Error(e) => Err(e),
        _ => Err(AvctError::UnexpectedResponse),
    }
}
