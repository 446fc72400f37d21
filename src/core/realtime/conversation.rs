//! Ordered conversation history.
//!
//! Items are applied in arrival order and identified by their `id`. An item
//! whose identity is already present is not appended a second time, so the
//! server echo of a locally created item leaves the list unchanged.

use tracing::debug;
use uuid::Uuid;

use super::messages::{ContentPart, ConversationItem, ItemKind, ItemRole, ItemStatus};

/// Generate a client-side item identity.
///
/// The service caps item ids at 32 characters.
pub fn new_item_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("item_{}", &id[..24])
}

impl ConversationItem {
    /// A user text message with a fresh local identity.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            id: Some(new_item_id()),
            kind: ItemKind::Message,
            status: Some(ItemStatus::Completed),
            role: Some(ItemRole::User),
            content: vec![ContentPart::input_text(text)],
            call_id: None,
            name: None,
            arguments: None,
            output: None,
        }
    }

    /// The result of a function call, tagged with the call identity.
    pub fn function_call_output(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            id: Some(new_item_id()),
            kind: ItemKind::FunctionCallOutput,
            status: None,
            role: None,
            content: Vec::new(),
            call_id: Some(call_id.into()),
            name: None,
            arguments: None,
            output: Some(output.into()),
        }
    }

    /// Concatenated text and transcripts of all content parts.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| part.text.as_deref().or(part.transcript.as_deref()))
            .collect::<Vec<_>>()
            .join("")
    }
}

/// The session's ordered list of conversation items.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    items: Vec<ConversationItem>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> &[ConversationItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, item_id: &str) -> bool {
        self.position(item_id).is_some()
    }

    pub fn get(&self, item_id: &str) -> Option<&ConversationItem> {
        self.position(item_id).map(|idx| &self.items[idx])
    }

    fn position(&self, item_id: &str) -> Option<usize> {
        self.items
            .iter()
            .position(|item| item.id.as_deref() == Some(item_id))
    }

    /// Append an item unless its identity is already present.
    ///
    /// Returns `false` when the item was a duplicate.
    pub fn append(&mut self, item: ConversationItem) -> bool {
        if let Some(id) = item.id.as_deref()
            && self.contains(id)
        {
            debug!(item_id = %id, "Ignoring duplicate conversation item");
            return false;
        }
        self.items.push(item);
        true
    }

    /// Replace an item in place with its completed snapshot, appending it if
    /// the identity was never seen.
    pub fn complete(&mut self, item: ConversationItem) {
        match item.id.as_deref().and_then(|id| self.position(id)) {
            Some(idx) => self.items[idx] = item,
            None => self.items.push(item),
        }
    }

    /// Drop every content part after `content_index`.
    ///
    /// Returns `false` if the item is unknown.
    pub fn truncate(&mut self, item_id: &str, content_index: u32) -> bool {
        let Some(idx) = self.position(item_id) else {
            return false;
        };
        let keep = content_index as usize + 1;
        self.items[idx].content.truncate(keep);
        true
    }

    /// Remove an item by identity.
    pub fn delete(&mut self, item_id: &str) -> Option<ConversationItem> {
        self.position(item_id).map(|idx| self.items.remove(idx))
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assistant_item(id: &str, parts: usize) -> ConversationItem {
        ConversationItem {
            id: Some(id.to_string()),
            kind: ItemKind::Message,
            status: Some(ItemStatus::InProgress),
            role: Some(ItemRole::Assistant),
            content: (0..parts)
                .map(|i| ContentPart::text(format!("part{i}")))
                .collect(),
            call_id: None,
            name: None,
            arguments: None,
            output: None,
        }
    }

    #[test]
    fn test_new_item_id_fits_server_limit() {
        let id = new_item_id();
        assert!(id.starts_with("item_"));
        assert!(id.len() <= 32);
        assert_ne!(id, new_item_id());
    }

    #[test]
    fn test_append_deduplicates_by_identity() {
        let mut conversation = Conversation::new();
        let item = ConversationItem::user_text("Hello");
        assert!(conversation.append(item.clone()));
        assert!(!conversation.append(item));
        assert_eq!(conversation.len(), 1);
        assert_eq!(conversation.items()[0].text(), "Hello");
    }

    #[test]
    fn test_complete_replaces_in_place() {
        let mut conversation = Conversation::new();
        conversation.append(ConversationItem::user_text("first"));
        conversation.append(assistant_item("item_a", 1));
        conversation.append(ConversationItem::user_text("last"));

        let mut done = assistant_item("item_a", 2);
        done.status = Some(ItemStatus::Completed);
        conversation.complete(done);

        assert_eq!(conversation.len(), 3);
        let item = &conversation.items()[1];
        assert_eq!(item.status, Some(ItemStatus::Completed));
        assert_eq!(item.content.len(), 2);

        conversation.complete(assistant_item("item_b", 1));
        assert_eq!(conversation.len(), 4);
    }

    #[test]
    fn test_truncate_drops_content_suffix() {
        let mut conversation = Conversation::new();
        conversation.append(assistant_item("item_a", 3));
        assert!(conversation.truncate("item_a", 0));
        assert_eq!(conversation.get("item_a").unwrap().content.len(), 1);
        assert!(!conversation.truncate("missing", 0));
    }

    #[test]
    fn test_delete_removes_by_identity() {
        let mut conversation = Conversation::new();
        conversation.append(assistant_item("item_a", 1));
        conversation.append(assistant_item("item_b", 1));
        let removed = conversation.delete("item_a").unwrap();
        assert_eq!(removed.id.as_deref(), Some("item_a"));
        assert_eq!(conversation.len(), 1);
        assert!(conversation.delete("item_a").is_none());
    }

    #[test]
    fn test_function_call_output_item() {
        let item = ConversationItem::function_call_output("call_1", "{\"ok\":true}");
        assert_eq!(item.kind, ItemKind::FunctionCallOutput);
        assert_eq!(item.call_id.as_deref(), Some("call_1"));
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["type"], "function_call_output");
        assert!(json.get("content").is_none());
    }
}
