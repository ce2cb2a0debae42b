//! Processor Task - API request and L2CAP event processing
//!
//! The processor owns the [`Avct`] instance together with its L2CAP transport
//! and serializes everything that touches it: API requests arriving through
//! [`crate::api`] and L2CAP events posted by the transport glue. Each request
//! or event runs to completion before the next one is taken, and pending L2CAP
//! events are always drained before the next API request.
//!
//! # Usage
//!
//! ```rust,ignore
//! use avctp::processor;
//!
//! // In your Embassy spawner
//! #[embassy_executor::task]
//! async fn avctp_task(transport: MyL2cap) -> ! {
//!     processor::run(transport).await
//! }
//!
//! // In the L2CAP glue, for every channel event on the AVCTP PSM
//! processor::post_l2cap_event(event).await;
//! ```

use crate::avct::Avct;
use crate::l2cap::{L2capEvent, L2capTransport};
use crate::{L2CAP_EVENT_CHANNEL, REQUEST_CHANNEL, RESPONSE_CHANNEL, Request, Response};
use embassy_futures::select::{Either, select};
use embassy_sync::channel::TrySendError;

/// Run the AVCTP processor task
///
/// Takes ownership of `transport`; the instance starts unregistered until
/// [`crate::api::register`] is called.
pub async fn run<T: L2capTransport>(transport: T) -> ! {
    let mut avct = Avct::new(transport);
    let events = L2CAP_EVENT_CHANNEL.receiver();
    let requests = REQUEST_CHANNEL.receiver();
    let responses = RESPONSE_CHANNEL.sender();

    info!("[PROCESSOR] Running");
    loop {
        match select(events.receive(), requests.receive()).await {
            Either::First(event) => {
                trace!("[PROCESSOR] L2CAP event: {:?}", event);
                avct.handle_l2cap_event(&event);
            }
            Either::Second(request) => {
                debug!("[PROCESSOR] API request: {:?}", request);
                let response = process_request(&mut avct, request);
                debug!("[PROCESSOR] API response: {:?}", response);
                responses.send(response).await;
            }
        }
    }
}

/// Hand an L2CAP event to the processor, waiting for room in the queue
pub async fn post_l2cap_event(event: L2capEvent) {
    L2CAP_EVENT_CHANNEL.sender().send(event).await;
}

/// Hand an L2CAP event to the processor without waiting
///
/// # Errors
///
/// Gives the event back if the queue is full.
pub fn try_post_l2cap_event(event: L2capEvent) -> Result<(), L2capEvent> {
    L2CAP_EVENT_CHANNEL
        .try_send(event)
        .map_err(|TrySendError::Full(event)| {
            warn!("[PROCESSOR] L2CAP event queue full");
            event
        })
}

/// Execute one API request against the owned instance
pub(crate) fn process_request<T: L2capTransport>(
    avct: &mut Avct<'static, T>,
    request: Request,
) -> Response {
    let result = match request {
        Request::Register {
            local_mtu,
            security,
        } => avct
            .register(local_mtu, security)
            .map(|()| Response::Registered),
        Request::Deregister => avct.deregister().map(|()| Response::Deregistered),
        Request::CreateConnection { config, peer } => avct
            .create_connection(config, peer)
            .map(Response::ConnectionCreated),
        Request::RemoveConnection(handle) => avct
            .remove_connection(handle)
            .map(|()| Response::ConnectionRemoved),
        Request::SendMessage {
            handle,
            label,
            cr,
            message,
        } => avct
            .send_message(handle, label, cr, message)
            .map(|()| Response::MessageSent),
        Request::GetPeerMtu(handle) => avct.get_peer_mtu(handle).map(Response::PeerMtu),
    };

    result.unwrap_or_else(Response::Error)
}
