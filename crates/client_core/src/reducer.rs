use chrono::{DateTime, Utc};
use shared::{
    domain::RoomId,
    protocol::{MessagePayload, RoomSummary, ServerEvent},
};

use crate::dedup::DedupWindow;

/// Client-side state for one mounted inbox view: the conversation list with
/// last-message previews, plus the message list of the currently open
/// conversation.
///
/// The list is owned by the server; it is rebuilt from a full reload
/// ([`InboxState::load_rooms`]) and then kept current by applying live
/// events. Rooms are never removed here, and events for rooms that are not
/// in the loaded list are ignored.
#[derive(Debug)]
pub struct InboxState {
    rooms: Vec<RoomSummary>,
    open_room: Option<RoomId>,
    open_messages: Vec<MessagePayload>,
    dedup: DedupWindow,
    dedup_capacity: usize,
}

impl InboxState {
    pub fn new(dedup_capacity: usize) -> Self {
        Self {
            rooms: Vec::new(),
            open_room: None,
            open_messages: Vec::new(),
            dedup: DedupWindow::new(dedup_capacity),
            dedup_capacity,
        }
    }

    pub fn rooms(&self) -> &[RoomSummary] {
        &self.rooms
    }

    pub fn open_room(&self) -> Option<RoomId> {
        self.open_room
    }

    pub fn open_messages(&self) -> &[MessagePayload] {
        &self.open_messages
    }

    /// Replaces the conversation list from a full reload. The open
    /// conversation (and its dedup window) is left untouched.
    pub fn load_rooms(&mut self, rooms: Vec<RoomSummary>) {
        self.rooms = rooms;
    }

    /// Switches the detail view to `room_id`. The message list is cleared and
    /// the dedup window is rebuilt: deduplication is scoped to one open
    /// conversation, not persistent across switches.
    pub fn open_conversation(&mut self, room_id: RoomId) {
        self.open_room = Some(room_id);
        self.open_messages.clear();
        self.dedup = DedupWindow::new(self.dedup_capacity);
    }

    pub fn close_conversation(&mut self) {
        self.open_room = None;
        self.open_messages.clear();
        self.dedup = DedupWindow::new(self.dedup_capacity);
    }

    /// Seeds the open conversation with fetched history. Every id is recorded
    /// in the dedup window so a direct socket event racing the fetch cannot
    /// append the same message twice.
    pub fn load_history(&mut self, messages: Vec<MessagePayload>) {
        let Some(open_room) = self.open_room else {
            return;
        };
        for message in messages {
            if message.room_id != open_room || self.dedup.seen(message.message_id) {
                continue;
            }
            self.dedup.record(message.message_id);
            self.open_messages.push(message);
        }
    }

    pub fn apply(&mut self, event: &ServerEvent) {
        match event {
            ServerEvent::MessageNew { message } => self.apply_message(message),
            ServerEvent::RoomUpdated {
                room_id,
                last_message,
            } => {
                if let Some(preview) = last_message {
                    self.update_preview(*room_id, &preview.content, preview.created_at);
                }
            }
            ServerEvent::Error(_) => {}
        }
    }

    fn apply_message(&mut self, message: &MessagePayload) {
        self.update_preview(message.room_id, &message.content, message.created_at);

        if self.open_room != Some(message.room_id) {
            return;
        }
        if self.dedup.seen(message.message_id) {
            return;
        }
        self.dedup.record(message.message_id);
        self.open_messages.push(message.clone());
    }

    fn update_preview(&mut self, room_id: RoomId, content: &str, at: DateTime<Utc>) {
        if let Some(room) = self.rooms.iter_mut().find(|room| room.room_id == room_id) {
            room.last_message = Some(content.to_string());
            room.last_message_at = Some(at);
        }
    }
}

#[cfg(test)]
#[path = "tests/reducer_tests.rs"]
mod tests;
