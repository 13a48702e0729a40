//! Per-owner realtime stream over Server-Sent Events.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};

use axum::{
    extract::Extension,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
};
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
use tokio_stream::Stream;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use dirpack_core::OwnerId;
use dirpack_events::{ChannelEvent, OwnerScoped, Subscription};

use crate::app::services::AppServices;
use crate::context::OwnerContext;

const HEARTBEAT_EVERY: Duration = Duration::from_secs(15);

/// GET /events
///
/// Every job notification for the calling owner. The SSE event name is the
/// topic (`compression:<kind>:<ownerId>`) and the data is the JSON body.
pub async fn stream_events(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(owner): Extension<OwnerContext>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let (tx, rx) = unbounded_channel::<Result<SseEvent, Infallible>>();

    // Subscribe before returning so nothing published after the response
    // starts is missed.
    let subscription = services.realtime.subscribe();
    let owner_id = owner.owner_id();
    tokio::task::spawn_blocking(move || forward(subscription, owner_id, tx));

    Sse::new(UnboundedReceiverStream::new(rx)).keep_alive(KeepAlive::new().interval(HEARTBEAT_EVERY))
}

fn forward(
    subscription: Subscription<ChannelEvent>,
    owner: OwnerId,
    tx: UnboundedSender<Result<SseEvent, Infallible>>,
) {
    let mut last_sent = Instant::now();
    loop {
        match subscription.recv_timeout(Duration::from_secs(1)) {
            Ok(message) => {
                if OwnerScoped::owner_id(&message) != owner {
                    continue;
                }
                if tx.send(Ok(to_sse(&message))).is_err() {
                    break;
                }
                last_sent = Instant::now();
            }
            Err(RecvTimeoutError::Timeout) => {
                if tx.is_closed() {
                    break;
                }
                if last_sent.elapsed() > HEARTBEAT_EVERY {
                    if tx.send(Ok(SseEvent::default().event("heartbeat").data("{}"))).is_err() {
                        break;
                    }
                    last_sent = Instant::now();
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                warn!(owner_id = %owner, "realtime channel closed");
                break;
            }
        }
    }
    debug!(owner_id = %owner, "event stream closed");
}

fn to_sse(message: &ChannelEvent) -> SseEvent {
    SseEvent::default()
        .event(message.topic())
        .id(message.event_id().to_string())
        .data(message.event().body().to_string())
}
