//! Transport dispatcher: the per-connection read loop.
//!
//! Reads frames, applies connection-level state (positions, receive
//! deadline, keepalive replies, lease admission), reassembles FOLLOWS
//! chains and routes stream frames to their slots. User handlers never run
//! on this task: responder work is spawned per stream, which is what keeps
//! per-stream callbacks serialized without a global lock.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::duplex::{DuplexSocket, SetupInfo, SocketRole, SocketShared};
use super::keepalive::spawn_keepalive;
use super::registry::{StreamKind, StreamRole, StreamSignal, StreamSlot};
use crate::error::{ErrorCode, RSocketError, Result};
use crate::frame::{Frame, FrameBody, Reassembled, Reassembler};
use crate::payload::Payload;
use crate::reactive::{CreditWindow, PayloadStream, ProducerSink};
use crate::responder::Responder;
use crate::transport::ConnectionReader;

/// Drive one transport's read side until it ends or the connection closes.
pub(crate) async fn run(shared: Arc<SocketShared>, mut reader: ConnectionReader) {
    let mut reassembler = Reassembler::with_max_size(shared.config.max_reassembly_size);
    let mut closed = shared.subscribe_close();
    let mut deadline = Instant::now() + shared.max_lifetime();

    loop {
        tokio::select! {
            changed = closed.changed() => {
                if changed.is_err() || *closed.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                let _ = shared.sender.try_send(Frame::error(
                    0,
                    ErrorCode::ConnectionError,
                    "keepalive timeout",
                ));
                shared.close(Some(RSocketError::KeepaliveTimeout));
                break;
            }
            read = reader.read_frame() => match read {
                Ok(Some(frame)) => {
                    shared.positions.record_received(frame.len());
                    deadline = Instant::now() + shared.max_lifetime();
                    if let Err(e) = handle_frame(&shared, &mut reassembler, frame).await {
                        let _ = shared.sender.try_send(Frame::error(
                            0,
                            ErrorCode::ConnectionError,
                            &e.to_string(),
                        ));
                        shared.close(Some(e));
                        break;
                    }
                    if shared.is_closed() {
                        break;
                    }
                }
                Ok(None) => {
                    transport_down(&shared, None);
                    break;
                }
                Err(e) => {
                    match &e {
                        RSocketError::MalformedFrame(_) | RSocketError::Protocol(_) => {
                            let _ = shared.sender.try_send(Frame::error(
                                0,
                                ErrorCode::ConnectionError,
                                &e.to_string(),
                            ));
                            shared.close(Some(e));
                        }
                        _ => transport_down(&shared, Some(e)),
                    }
                    break;
                }
            }
        }
    }
}

/// The byte transport died underneath us. With resume enabled the session
/// parks and waits for a reattach; otherwise this is the end.
fn transport_down(shared: &Arc<SocketShared>, reason: Option<RSocketError>) {
    if shared.resume_enabled() && !shared.is_closed() {
        tracing::info!("Transport lost; session parked for resumption");
        return;
    }
    shared.close(reason);
}

async fn handle_frame(
    shared: &Arc<SocketShared>,
    reassembler: &mut Reassembler,
    frame: Frame,
) -> Result<()> {
    if frame.stream_id == 0 {
        return handle_connection_frame(shared, frame).await;
    }

    let frame = match reassembler.offer(frame)? {
        Reassembled::Buffered => return Ok(()),
        Reassembled::Complete(frame) => frame,
    };
    let stream_id = frame.stream_id;

    match frame.body {
        FrameBody::RequestFnf { payload, .. } => {
            on_fire_and_forget(shared, stream_id, payload).await
        }
        FrameBody::RequestResponse { payload, .. } => {
            on_request_response(shared, stream_id, payload).await
        }
        FrameBody::RequestStream {
            initial_request_n,
            payload,
            ..
        } => on_request_stream(shared, stream_id, initial_request_n, payload).await,
        FrameBody::RequestChannel {
            complete,
            initial_request_n,
            payload,
            ..
        } => on_request_channel(shared, stream_id, initial_request_n, complete, payload).await,
        FrameBody::RequestN { n } => {
            match shared.registry.get(stream_id) {
                Some(slot) => slot.window.grant(n),
                None => tracing::debug!(stream_id, "REQUEST_N for unknown stream dropped"),
            }
            Ok(())
        }
        FrameBody::Payload {
            complete,
            next,
            payload,
            ..
        } => on_payload(shared, reassembler, stream_id, next, complete, payload),
        FrameBody::Cancel => {
            if let Some(slot) = shared.registry.remove(stream_id) {
                tracing::debug!(stream_id, "Stream canceled by peer");
                slot.cancel();
            } else {
                tracing::debug!(stream_id, "CANCEL for unknown stream dropped");
            }
            reassembler.clear(stream_id);
            Ok(())
        }
        FrameBody::Error { code, data } => {
            if let Some(slot) = shared.registry.remove(stream_id) {
                slot.deliver(StreamSignal::Error(RSocketError::remote(code, &data)));
                slot.cancel();
            } else {
                tracing::debug!(stream_id, %code, "ERROR for unknown stream dropped");
            }
            reassembler.clear(stream_id);
            Ok(())
        }
        FrameBody::Setup { .. }
        | FrameBody::Lease { .. }
        | FrameBody::Keepalive { .. }
        | FrameBody::MetadataPush { .. }
        | FrameBody::Resume { .. }
        | FrameBody::ResumeOk { .. } => Err(RSocketError::Protocol(format!(
            "connection-level frame on stream {}",
            stream_id
        ))),
    }
}

async fn handle_connection_frame(shared: &Arc<SocketShared>, frame: Frame) -> Result<()> {
    match frame.body {
        FrameBody::Setup {
            version,
            keepalive_millis,
            max_lifetime_millis,
            lease,
            resume_token,
            metadata_mime,
            data_mime,
            payload,
        } => {
            if shared.role != SocketRole::Server {
                return Err(RSocketError::Protocol(
                    "SETUP received by the connecting side".to_string(),
                ));
            }
            if shared.setup_received.swap(true, Ordering::AcqRel) {
                shared
                    .sender
                    .send(Frame::error(
                        0,
                        ErrorCode::RejectedSetup,
                        "duplicate SETUP on one connection",
                    ))
                    .await?;
                return Err(RSocketError::Protocol("duplicate SETUP".to_string()));
            }
            if version.0 != 1 {
                shared
                    .sender
                    .send(Frame::error(
                        0,
                        ErrorCode::UnsupportedSetup,
                        &format!("unsupported version {}.{}", version.0, version.1),
                    ))
                    .await?;
                return Err(RSocketError::Protocol(format!(
                    "unsupported protocol version {}.{}",
                    version.0, version.1
                )));
            }

            let keepalive = Duration::from_millis(u64::from(keepalive_millis));
            let max_lifetime = Duration::from_millis(u64::from(max_lifetime_millis));
            shared.install_timings(keepalive, max_lifetime);
            shared.lease_enabled.store(lease, Ordering::Release);

            let info = SetupInfo {
                keepalive_interval: keepalive,
                max_lifetime,
                lease,
                resume_token,
                metadata_mime,
                data_mime,
                payload,
            };
            tracing::debug!(
                keepalive_ms = keepalive_millis,
                max_lifetime_ms = max_lifetime_millis,
                lease,
                "SETUP accepted"
            );

            if let Some(acceptor) = &shared.acceptor {
                match acceptor(info, DuplexSocket::new(shared.clone())) {
                    Ok(responder) => {
                        *shared.responder.lock().expect("responder lock") = Arc::new(responder);
                    }
                    Err(e) => {
                        shared
                            .sender
                            .send(Frame::error(0, ErrorCode::RejectedSetup, &e.to_string()))
                            .await?;
                        return Err(RSocketError::Protocol(format!("SETUP rejected: {}", e)));
                    }
                }
            }

            if !shared.keepalive_started.swap(true, Ordering::AcqRel) {
                spawn_keepalive(
                    shared.sender.clone(),
                    shared.positions.clone(),
                    shared.keepalive_interval(),
                    shared.subscribe_close(),
                );
            }
            Ok(())
        }
        FrameBody::Lease {
            ttl_millis,
            number_of_requests,
            ..
        } => {
            shared
                .received_lease
                .arm(Duration::from_millis(u64::from(ttl_millis)), number_of_requests);
            tracing::debug!(ttl_millis, number_of_requests, "Lease received");
            Ok(())
        }
        FrameBody::Keepalive {
            respond,
            last_received_position,
            data,
        } => {
            shared.positions.set_peer_received(last_received_position);
            if let Some(replay) = &shared.replay {
                replay.prune_to(last_received_position);
            }
            if respond {
                shared
                    .sender
                    .send(Frame::keepalive(false, shared.positions.received(), data))
                    .await?;
            }
            Ok(())
        }
        FrameBody::Error { code, data } => {
            shared.close(Some(RSocketError::remote(code, &data)));
            Ok(())
        }
        FrameBody::MetadataPush { metadata } => {
            let responder = current_responder(shared);
            if responder.metadata_push.is_some() {
                tokio::spawn(async move {
                    if let Some(handler) = &responder.metadata_push {
                        handler(metadata).await;
                    }
                });
            } else {
                tracing::trace!("METADATA_PUSH dropped: no handler installed");
            }
            Ok(())
        }
        FrameBody::Resume { .. } => match shared.role {
            SocketRole::Server => {
                shared
                    .sender
                    .send(Frame::error(
                        0,
                        ErrorCode::RejectedResume,
                        "resumption is not available on this server",
                    ))
                    .await?;
                shared.close(Some(RSocketError::Remote {
                    code: ErrorCode::RejectedResume,
                    message: "resumption is not available on this server".to_string(),
                }));
                Ok(())
            }
            SocketRole::Client => Err(RSocketError::Protocol(
                "RESUME received by the connecting side".to_string(),
            )),
        },
        FrameBody::ResumeOk { .. } => {
            tracing::debug!("RESUME_OK outside a resume handshake dropped");
            Ok(())
        }
        FrameBody::RequestFnf { .. }
        | FrameBody::RequestResponse { .. }
        | FrameBody::RequestStream { .. }
        | FrameBody::RequestChannel { .. }
        | FrameBody::RequestN { .. }
        | FrameBody::Cancel
        | FrameBody::Payload { .. } => Err(RSocketError::Protocol(
            "stream frame on connection stream id 0".to_string(),
        )),
    }
}

fn current_responder(shared: &Arc<SocketShared>) -> Arc<Responder> {
    shared.responder.lock().expect("responder lock").clone()
}

/// Error text for the wire: unwrap remote/application messages, otherwise
/// render the whole error.
fn error_message(e: &RSocketError) -> String {
    match e {
        RSocketError::Remote { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

/// Common admission for incoming requests: id parity, id reuse, lease.
///
/// `Ok(false)` means the request was rejected on the wire and routing should
/// stop without failing the connection.
async fn admit_request(shared: &Arc<SocketShared>, stream_id: u32) -> Result<bool> {
    let peer_uses_odd = shared.role == SocketRole::Server;
    if (stream_id % 2 == 1) != peer_uses_odd {
        return Err(RSocketError::Protocol(format!(
            "request stream id {} has wrong parity for the peer",
            stream_id
        )));
    }
    if shared.registry.get(stream_id).is_some() {
        return Err(RSocketError::Protocol(format!(
            "request reuses live stream id {}",
            stream_id
        )));
    }
    if shared.leasing() && !shared.issued_lease.try_use() {
        tracing::debug!(stream_id, "Request rejected: lease exhausted or expired");
        shared
            .sender
            .send(Frame::error(
                stream_id,
                ErrorCode::Rejected,
                "lease expired or exhausted",
            ))
            .await?;
        return Ok(false);
    }
    Ok(true)
}

async fn on_fire_and_forget(
    shared: &Arc<SocketShared>,
    stream_id: u32,
    payload: Payload,
) -> Result<()> {
    if !admit_request(shared, stream_id).await? {
        return Ok(());
    }
    let responder = current_responder(shared);
    if responder.fire_and_forget.is_none() {
        tracing::debug!(stream_id, "Fire-and-forget dropped: no handler installed");
        return Ok(());
    }
    tokio::spawn(async move {
        if let Some(handler) = &responder.fire_and_forget {
            handler(payload).await;
        }
    });
    Ok(())
}

async fn on_request_response(
    shared: &Arc<SocketShared>,
    stream_id: u32,
    payload: Payload,
) -> Result<()> {
    if !admit_request(shared, stream_id).await? {
        return Ok(());
    }
    let (slot, _rx) = StreamSlot::new(
        stream_id,
        StreamKind::RequestResponse,
        StreamRole::Responder,
        Arc::new(CreditWindow::new(1)),
    );
    shared.registry.register(slot.clone());

    let responder = current_responder(shared);
    let shared = shared.clone();
    let task_slot = slot.clone();
    let task = tokio::spawn(async move {
        let result = match &responder.request_response {
            Some(handler) => handler(payload).await,
            None => Err(RSocketError::Remote {
                code: ErrorCode::ApplicationError,
                message: "request_response unsupported".to_string(),
            }),
        };
        if task_slot.is_canceled() {
            return;
        }
        match result {
            Ok(reply) => {
                task_slot.complete_local();
                let frame = Frame::payload_next_complete(task_slot.id, reply);
                if let Err(e) = shared
                    .sender
                    .send_with_mtu(frame, shared.config.fragment_mtu)
                    .await
                {
                    tracing::debug!("Response not sent: {}", e);
                }
            }
            Err(e) => {
                task_slot.fail_local();
                let _ = shared
                    .sender
                    .send(Frame::error(
                        task_slot.id,
                        ErrorCode::ApplicationError,
                        &error_message(&e),
                    ))
                    .await;
            }
        }
        shared.registry.remove(task_slot.id);
    });
    slot.set_abort(task.abort_handle());
    Ok(())
}

async fn on_request_stream(
    shared: &Arc<SocketShared>,
    stream_id: u32,
    initial_request_n: u32,
    payload: Payload,
) -> Result<()> {
    if !admit_request(shared, stream_id).await? {
        return Ok(());
    }
    let (slot, _rx) = StreamSlot::new(
        stream_id,
        StreamKind::RequestStream,
        StreamRole::Responder,
        Arc::new(CreditWindow::new(initial_request_n)),
    );
    shared.registry.register(slot.clone());

    let sink = ProducerSink::new(
        slot.clone(),
        shared.registry.clone(),
        shared.sender.clone(),
        shared.config.fragment_mtu,
    );
    let responder = current_responder(shared);
    // No abort handle here: a canceled producer observes `Canceled` from
    // its sink and winds down on its own.
    tokio::spawn(async move {
        match &responder.request_stream {
            Some(handler) => match handler(payload, sink.clone()).await {
                Ok(()) => {
                    let _ = sink.complete().await;
                }
                Err(e) => {
                    let _ = sink.error(&error_message(&e)).await;
                }
            },
            None => {
                let _ = sink.error("request_stream unsupported").await;
            }
        }
    });
    Ok(())
}

async fn on_request_channel(
    shared: &Arc<SocketShared>,
    stream_id: u32,
    initial_request_n: u32,
    remote_complete: bool,
    payload: Payload,
) -> Result<()> {
    if !admit_request(shared, stream_id).await? {
        return Ok(());
    }
    let (slot, rx) = StreamSlot::new(
        stream_id,
        StreamKind::RequestChannel,
        StreamRole::Responder,
        Arc::new(CreditWindow::new(initial_request_n)),
    );
    shared.registry.register(slot.clone());

    // The channel request carries the requester's first payload.
    slot.deliver(StreamSignal::Next(payload));
    if remote_complete && slot.complete_remote().is_some() {
        slot.deliver(StreamSignal::Complete);
    }

    // Credit for the requester's further payloads.
    shared
        .sender
        .send(Frame::request_n(
            stream_id,
            shared.config.channel_initial_credit,
        ))
        .await?;

    let sink = ProducerSink::new(
        slot.clone(),
        shared.registry.clone(),
        shared.sender.clone(),
        shared.config.fragment_mtu,
    );
    let incoming = PayloadStream::new(
        slot.clone(),
        shared.registry.clone(),
        shared.sender.clone(),
        rx,
    );
    let responder = current_responder(shared);
    tokio::spawn(async move {
        match &responder.request_channel {
            Some(handler) => match handler(incoming, sink.clone()).await {
                Ok(()) => {
                    let _ = sink.complete().await;
                }
                Err(e) => {
                    let _ = sink.error(&error_message(&e)).await;
                }
            },
            None => {
                let _ = sink.error("request_channel unsupported").await;
                drop(incoming);
            }
        }
    });
    Ok(())
}

fn on_payload(
    shared: &Arc<SocketShared>,
    reassembler: &mut Reassembler,
    stream_id: u32,
    next: bool,
    complete: bool,
    payload: Payload,
) -> Result<()> {
    let Some(slot) = shared.registry.get(stream_id) else {
        tracing::debug!(stream_id, "PAYLOAD for unknown stream dropped");
        return Ok(());
    };
    if next {
        if slot.remote_completed() {
            tracing::warn!(stream_id, "PAYLOAD after terminal dropped");
        } else {
            slot.deliver(StreamSignal::Next(payload));
        }
    }
    if complete {
        match slot.complete_remote() {
            None => {
                return Err(RSocketError::Protocol(format!(
                    "duplicate terminal on stream {}",
                    stream_id
                )));
            }
            Some(fully) => {
                slot.deliver(StreamSignal::Complete);
                if fully {
                    shared.registry.remove(stream_id);
                    reassembler.clear(stream_id);
                }
            }
        }
    }
    Ok(())
}
