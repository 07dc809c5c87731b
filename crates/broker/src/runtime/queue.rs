//! Single-slot next-turn message queue.
//!
//! While a turn is running, one message may wait for the next turn.  Only
//! its author may update or cancel it, and the bridge auto-sends it the
//! moment the session goes idle, clearing the slot before dispatch so no
//! observer ever sees a sent message still occupying it.

use bc_domain::consumer::{ConsumerMessage, InboundImage};
use bc_domain::message::{MessageType, Role, UnifiedMessage};
use bc_domain::state::SessionStatus;

use crate::runtime::bridge::SessionBridge;
use crate::runtime::normalize::user_content;
use crate::runtime::session::{QueuedMessage, Session};

pub(crate) fn handle_queue_message(
    bridge: &SessionBridge,
    session: &mut Session,
    consumer_id: u64,
    content: String,
    images: Option<Vec<InboundImage>>,
) {
    let Some(handle) = session.consumers.get(&consumer_id) else {
        // No registered identity: reject silently.
        return;
    };
    let identity = handle.identity.clone();

    // Idle session: skip the queue entirely.
    if matches!(session.last_status, None | Some(SessionStatus::Idle)) {
        let unified = UnifiedMessage::new(MessageType::UserMessage, Role::User)
            .with_content(user_content(&content, images.as_deref()));
        bridge.send_to_backend(session, unified);
        session.last_status = Some(SessionStatus::Running);
        return;
    }

    if session.queued_message.is_some() {
        bridge.send_to_consumer(
            session,
            consumer_id,
            ConsumerMessage::error("a message is already queued for the next turn"),
        );
        return;
    }

    session.queued_message = Some(QueuedMessage {
        content: content.clone(),
        images,
        consumer_id: identity.user_id.clone(),
        display_name: identity.display_name.clone(),
        queued_at: chrono::Utc::now().timestamp_millis(),
    });
    let msg = ConsumerMessage::MessageQueued {
        content,
        queued_by: identity.user_id,
        display_name: identity.display_name,
    };
    bridge.broadcast(session, msg);
}

pub(crate) fn handle_update_queued_message(
    bridge: &SessionBridge,
    session: &mut Session,
    consumer_id: u64,
    content: String,
    images: Option<Vec<InboundImage>>,
) {
    let Some(handle) = session.consumers.get(&consumer_id) else {
        return;
    };
    let user_id = handle.identity.user_id.clone();

    let authorized = session
        .queued_message
        .as_ref()
        .map(|q| q.consumer_id == user_id)
        .unwrap_or(false);
    if !authorized {
        bridge.send_to_consumer(
            session,
            consumer_id,
            ConsumerMessage::error("Only the message author can update the queued message"),
        );
        return;
    }

    if let Some(slot) = session.queued_message.as_mut() {
        slot.content = content.clone();
        slot.images = images;
    }
    let msg = ConsumerMessage::QueuedMessageUpdated {
        content,
        queued_by: user_id,
    };
    bridge.broadcast(session, msg);
}

pub(crate) fn handle_cancel_queued_message(
    bridge: &SessionBridge,
    session: &mut Session,
    consumer_id: u64,
) {
    let Some(handle) = session.consumers.get(&consumer_id) else {
        return;
    };
    let user_id = handle.identity.user_id.clone();

    let authorized = session
        .queued_message
        .as_ref()
        .map(|q| q.consumer_id == user_id)
        .unwrap_or(false);
    if !authorized {
        bridge.send_to_consumer(
            session,
            consumer_id,
            ConsumerMessage::error("Only the message author can cancel the queued message"),
        );
        return;
    }

    session.queued_message = None;
    let msg = ConsumerMessage::QueuedMessageCancelled {
        cancelled_by: user_id,
    };
    bridge.broadcast(session, msg);
}

/// Send the queued message when the session just went idle.  The slot is
/// cleared before dispatch.
pub(crate) fn maybe_auto_send_queued(bridge: &SessionBridge, session: &mut Session) {
    if session.last_status != Some(SessionStatus::Idle) {
        return;
    }
    let Some(queued) = session.queued_message.take() else {
        return;
    };

    let unified = UnifiedMessage::new(MessageType::UserMessage, Role::User)
        .with_content(user_content(&queued.content, queued.images.as_deref()));
    bridge.send_to_backend(session, unified);
    session.last_status = Some(SessionStatus::Running);

    let msg = ConsumerMessage::QueuedMessageSent {
        content: queued.content,
        queued_by: queued.consumer_id,
    };
    bridge.broadcast(session, msg);
}
