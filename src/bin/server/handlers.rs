//! Message routing: broadcast, unicast, multicast, group creation, and
//! file transfer.

use bytes::BytesMut;
use chatrelay::ClientMessage;
use chatrelay::frame::frame_text;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::state::SharedState;
use crate::store::Stores;

/// Queue a notice on a connection, ignoring a gone writer task.
fn notify(tx: &mpsc::UnboundedSender<BytesMut>, text: &str) {
    let _ = tx.send(frame_text(text));
}

/// Route one message from an authenticated client. `sender` is bound from
/// the session, never taken from the wire. Returns false when the session
/// should end.
pub async fn handle_client_message(
    message: ClientMessage,
    sender: &str,
    tx: &mpsc::UnboundedSender<BytesMut>,
    state: &SharedState,
    stores: &Stores,
) -> bool {
    match message {
        ClientMessage::Broadcast { content } => {
            handle_broadcast(sender, &content, state, stores).await;
        }
        ClientMessage::Unicast { target, content } => {
            handle_unicast(sender, &target, &content, tx, state, stores).await;
        }
        ClientMessage::Multicast { group, content } => {
            handle_multicast(sender, &group, &content, tx, state, stores).await;
        }
        ClientMessage::CreateGroup { name, members } => {
            handle_create_group(sender, &name, members, tx, stores);
        }
        ClientMessage::FileTransfer {
            target, filename, ..
        } => {
            handle_file_transfer(sender, &target, &filename, tx, state, stores).await;
        }
        ClientMessage::Logout => return false,
    }
    true
}

/// Deliver to every live session except the sender's own, against a
/// point-in-time snapshot of the registry.
async fn handle_broadcast(sender: &str, content: &str, state: &SharedState, stores: &Stores) {
    let entry = format!("[{sender} -> All]: {content}");
    stores.log.append(&entry);

    let targets = state.read().await.snapshot();
    debug!(sender, recipients = targets.len().saturating_sub(1), "broadcast");

    let frame = frame_text(&entry);
    for (username, peer) in targets {
        if username != sender {
            let _ = peer.send(frame.clone());
        }
    }
}

/// Deliver to one named user. The target is resolved against the
/// credential store, not just the registry, to tell "no such user" apart
/// from "known but offline".
async fn handle_unicast(
    sender: &str,
    target: &str,
    content: &str,
    tx: &mpsc::UnboundedSender<BytesMut>,
    state: &SharedState,
    stores: &Stores,
) {
    if stores.credentials.lookup(target).is_none() {
        notify(tx, &format!("[Server] User '{target}' does not exist."));
        return;
    }

    let Some(peer) = state.read().await.sender(target) else {
        notify(
            tx,
            &format!("[Server] User '{target}' exists but is not online."),
        );
        return;
    };

    let delivery = format!("[{sender} -> You]: {content}");
    if peer.send(frame_text(&delivery)).is_ok() {
        stores.log.append(&format!("[{sender} -> {target}]: {content}"));
    } else {
        notify(
            tx,
            &format!("[Server] Failed to send message to '{target}'."),
        );
    }
}

/// Deliver to the online members of a group, skipping offline members.
/// Membership is re-read from the store so a stale cache is never acted on.
async fn handle_multicast(
    sender: &str,
    group: &str,
    content: &str,
    tx: &mpsc::UnboundedSender<BytesMut>,
    state: &SharedState,
    stores: &Stores,
) {
    let groups = match stores.groups.reload_all() {
        Ok(groups) => groups,
        Err(e) => {
            warn!(error = %e, "group store reload failed");
            notify(tx, &format!("[Server] Failed to look up group '{group}'."));
            return;
        }
    };

    let Some(members) = groups.get(group) else {
        notify(tx, &format!("[Server] Group '{group}' not found."));
        return;
    };
    if !members.iter().any(|m| m == sender) {
        notify(
            tx,
            &format!("[Server] You are not a member of group '{group}'."),
        );
        return;
    }

    let entry = format!("[{sender} -> {group}]: {content}");
    stores.log.append(&entry);

    let peers: Vec<_> = {
        let state = state.read().await;
        members
            .iter()
            .filter(|m| m.as_str() != sender)
            .filter_map(|m| state.sender(m))
            .collect()
    };
    debug!(sender, group, recipients = peers.len(), "multicast");

    let frame = frame_text(&entry);
    for peer in peers {
        let _ = peer.send(frame.clone());
    }
}

/// Create or overwrite a group. The sender always ends up in the
/// membership, added at most once.
fn handle_create_group(
    sender: &str,
    name: &str,
    members: Vec<String>,
    tx: &mpsc::UnboundedSender<BytesMut>,
    stores: &Stores,
) {
    let mut resolved: Vec<String> = Vec::with_capacity(members.len() + 1);
    for member in members {
        if !resolved.contains(&member) {
            resolved.push(member);
        }
    }
    if !resolved.iter().any(|m| m == sender) {
        resolved.push(sender.to_string());
    }

    if let Err(e) = stores.groups.upsert(name, &resolved) {
        warn!(error = %e, group = name, "failed to persist group");
        notify(tx, &format!("[Server] Failed to create group '{name}'."));
        return;
    }

    let list = resolved.join(", ");
    notify(
        tx,
        &format!("[Server] Group '{name}' created with members: {list}."),
    );
    stores.log.append(&format!(
        "[Server] Group '{name}' created by {sender} with members: {list}"
    ));
}

/// Same resolution as unicast; the delivery names the filename rather than
/// echoing the payload, which stays opaque to the router.
async fn handle_file_transfer(
    sender: &str,
    target: &str,
    filename: &str,
    tx: &mpsc::UnboundedSender<BytesMut>,
    state: &SharedState,
    stores: &Stores,
) {
    if stores.credentials.lookup(target).is_none() {
        notify(tx, &format!("[Server] User '{target}' does not exist."));
        return;
    }

    let Some(peer) = state.read().await.sender(target) else {
        notify(
            tx,
            &format!("[Server] User '{target}' exists but is not online."),
        );
        return;
    };

    let delivery = format!("[{sender} -> You]: File received: {filename}");
    if peer.send(frame_text(&delivery)).is_ok() {
        stores.log.append(&format!(
            "[{sender} -> {target}]: File received: {filename}"
        ));
    } else {
        notify(tx, &format!("[Server] Failed to send file to '{target}'."));
    }
}
