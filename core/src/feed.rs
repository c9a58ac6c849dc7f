/// Message feed: paginated history and live messages merged into one ordered list
use crate::error::Result;
use crate::messenger_types::{FeedPage, Message, MessageStatus};
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Pagination state machine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PageState {
    #[default]
    Idle,
    Loading {
        page: u32,
    },
    /// Last fetch failed; the feed is untouched and the page can be retried
    Errored {
        page: u32,
        error: String,
    },
}

/// A fetch the caller has to perform, produced by [`MessageFeed::begin_load`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub conversation_id: String,
    pub page: u32,
    pub limit: usize,
}

/// Sort key: newest first, ties broken by id descending
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct FeedKey {
    created_at: Reverse<DateTime<Utc>>,
    id: Reverse<String>,
}

impl FeedKey {
    fn of(message: &Message) -> Self {
        Self {
            created_at: Reverse(message.created_at),
            id: Reverse(message.id.clone()),
        }
    }
}

/// Ordered, de-duplicated message list of one conversation
#[derive(Debug, Clone)]
pub struct MessageFeed {
    conversation_id: String,
    page_size: usize,
    entries: BTreeMap<FeedKey, Message>,
    index: HashMap<String, FeedKey>,
    state: PageState,
    next_page: u32,
    has_more: bool,
}

impl MessageFeed {
    pub fn new(conversation_id: impl Into<String>, page_size: usize) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            page_size: page_size.max(1),
            entries: BTreeMap::new(),
            index: HashMap::new(),
            state: PageState::Idle,
            next_page: 1,
            has_more: true,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Start loading `page`.
    ///
    /// Page 1 is a refresh. Any other page must be the next expected one and
    /// requires more history to exist. Returns `None` (no fetch) while a load
    /// is already running or when the request does not apply.
    pub fn begin_load(&mut self, page: u32) -> Option<PageRequest> {
        if let PageState::Loading { page: running } = self.state {
            debug!(
                "Page {} requested while page {} is loading, skipping",
                page, running
            );
            return None;
        }
        if page != 1 && (page != self.next_page || !self.has_more) {
            debug!(
                "Page {} not loadable (next {}, has_more {})",
                page, self.next_page, self.has_more
            );
            return None;
        }

        self.state = PageState::Loading { page };
        Some(PageRequest {
            conversation_id: self.conversation_id.clone(),
            page,
            limit: self.page_size,
        })
    }

    pub fn begin_load_more(&mut self) -> Option<PageRequest> {
        self.begin_load(self.next_page)
    }

    pub fn begin_refresh(&mut self) -> Option<PageRequest> {
        self.begin_load(1)
    }

    /// Apply the outcome of the fetch started by `begin_load(page)`.
    ///
    /// Returns how many messages were new and whether more history remains.
    /// Results for a page that is not the one loading are ignored. On error
    /// the feed is kept and the state becomes `Errored`.
    pub fn finish_load(&mut self, page: u32, result: Result<FeedPage>) -> Result<(usize, bool)> {
        if self.state != (PageState::Loading { page }) {
            debug!("Ignoring result for page {} (state {:?})", page, self.state);
            return Ok((0, self.has_more));
        }

        let fetched = match result {
            Ok(fetched) => fetched,
            Err(e) => {
                self.state = PageState::Errored {
                    page,
                    error: e.to_string(),
                };
                return Err(e);
            }
        };

        if page == 1 {
            // server history supersedes everything except local sends it has not seen yet
            let pending: Vec<Message> = self
                .entries
                .values()
                .filter(|m| matches!(m.status, MessageStatus::Sending | MessageStatus::Failed))
                .cloned()
                .collect();
            self.entries.clear();
            self.index.clear();
            for message in pending {
                self.insert(message);
            }
        }

        let mut added = 0;
        for message in fetched.messages {
            if message.conversation_id != self.conversation_id {
                debug!(
                    "Skipping message {} of conversation {} in page for {}",
                    message.id, message.conversation_id, self.conversation_id
                );
                continue;
            }
            if self.insert(message) {
                added += 1;
            }
        }

        self.next_page = page + 1;
        self.has_more = fetched.has_more;
        self.state = PageState::Idle;
        Ok((added, self.has_more))
    }

    /// Insert a live-pushed message; false if its id is already present
    pub fn apply_incoming(&mut self, message: Message) -> bool {
        self.insert(message)
    }

    /// Insert a message we sent, or advance the status of the copy already present
    pub fn apply_sent(&mut self, message: Message) -> bool {
        if self.index.contains_key(&message.id) {
            self.set_status(&message.id, message.status);
            return false;
        }
        self.insert(message)
    }

    /// Move a message to `status` if the transition is allowed
    pub fn set_status(&mut self, id: &str, status: MessageStatus) -> bool {
        let Some(key) = self.index.get(id) else {
            return false;
        };
        match self.entries.get_mut(key) {
            Some(message) if message.status.can_advance_to(status) => {
                message.status = status;
                true
            }
            _ => false,
        }
    }

    fn insert(&mut self, message: Message) -> bool {
        if message.conversation_id != self.conversation_id || self.index.contains_key(&message.id) {
            return false;
        }
        let key = FeedKey::of(&message);
        self.index.insert(message.id.clone(), key.clone());
        self.entries.insert(key, message);
        true
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.index.get(id).and_then(|key| self.entries.get(key))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Messages in display order (newest first)
    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.entries.values()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.entries.values().cloned().collect()
    }

    pub fn newest(&self) -> Option<&Message> {
        self.entries.values().next()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn state(&self) -> &PageState {
        &self.state
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.state, PageState::Loading { .. })
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn next_page(&self) -> u32 {
        self.next_page
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChatError;
    use chrono::TimeZone;

    fn msg(id: &str, secs: i64) -> Message {
        Message {
            id: id.to_string(),
            conversation_id: "c1".to_string(),
            sender_id: "peer".to_string(),
            body: format!("body {}", id),
            created_at: Utc.timestamp_opt(secs, 0).unwrap(),
            status: MessageStatus::Delivered,
        }
    }

    fn page(n: u32, messages: Vec<Message>, has_more: bool) -> FeedPage {
        FeedPage {
            page: n,
            messages,
            has_more,
        }
    }

    fn ids(feed: &MessageFeed) -> Vec<String> {
        feed.iter().map(|m| m.id.clone()).collect()
    }

    #[test]
    fn test_feed_is_ordered_newest_first() {
        let mut feed = MessageFeed::new("c1", 20);
        feed.apply_incoming(msg("a", 1));
        feed.apply_incoming(msg("c", 3));
        feed.apply_incoming(msg("b", 3));
        assert_eq!(ids(&feed), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_sent_then_echoed_keeps_one_copy() {
        let mut feed = MessageFeed::new("c1", 20);
        let mut x = msg("x", 10);
        x.status = MessageStatus::Sent;

        assert!(feed.apply_sent(x.clone()));
        assert!(!feed.apply_incoming(x));
        assert_eq!(feed.len(), 1);
    }

    #[test]
    fn test_page_overlap_dropped_by_id() {
        let mut feed = MessageFeed::new("c1", 2);
        let req = feed.begin_load(1).unwrap();
        assert_eq!(req.limit, 2);
        feed.finish_load(1, Ok(page(1, vec![msg("m4", 4), msg("m3", 3)], true)))
            .unwrap();

        // a live insert shifts the server's offset by one
        feed.apply_incoming(msg("m5", 5));

        feed.begin_load_more().unwrap();
        let (added, has_more) = feed
            .finish_load(2, Ok(page(2, vec![msg("m3", 3), msg("m2", 2)], false)))
            .unwrap();
        assert_eq!(added, 1);
        assert!(!has_more);
        assert_eq!(ids(&feed), vec!["m5", "m4", "m3", "m2"]);
    }

    #[test]
    fn test_no_second_load_while_loading() {
        let mut feed = MessageFeed::new("c1", 20);
        assert!(feed.begin_load_more().is_some());
        assert!(feed.begin_load_more().is_none());
        assert!(feed.begin_refresh().is_none());
    }

    #[test]
    fn test_no_load_more_without_more_history() {
        let mut feed = MessageFeed::new("c1", 20);
        feed.begin_load(1).unwrap();
        feed.finish_load(1, Ok(page(1, vec![msg("a", 1)], false))).unwrap();
        assert!(feed.begin_load_more().is_none());
        // refresh is always allowed
        assert!(feed.begin_refresh().is_some());
    }

    #[test]
    fn test_out_of_order_page_is_refused() {
        let mut feed = MessageFeed::new("c1", 20);
        assert!(feed.begin_load(3).is_none());
        assert_eq!(feed.state(), &PageState::Idle);
    }

    #[test]
    fn test_fetch_error_preserves_feed() {
        let mut feed = MessageFeed::new("c1", 20);
        feed.begin_load(1).unwrap();
        feed.finish_load(1, Ok(page(1, vec![msg("a", 1)], true))).unwrap();

        feed.begin_load_more().unwrap();
        let err = feed.finish_load(2, Err(ChatError::Fetch("boom".to_string())));
        assert!(err.is_err());
        assert_eq!(feed.len(), 1);
        assert!(matches!(feed.state(), PageState::Errored { page: 2, .. }));

        // retry targets the same page
        assert_eq!(feed.begin_load_more().unwrap().page, 2);
    }

    #[test]
    fn test_refresh_replaces_history_but_keeps_pending_sends() {
        let mut feed = MessageFeed::new("c1", 20);
        feed.begin_load(1).unwrap();
        feed.finish_load(1, Ok(page(1, vec![msg("old", 1)], false))).unwrap();

        let mut pending = msg("local", 5);
        pending.status = MessageStatus::Sending;
        feed.apply_sent(pending);

        feed.begin_refresh().unwrap();
        feed.finish_load(1, Ok(page(1, vec![msg("new", 3)], false))).unwrap();
        assert_eq!(ids(&feed), vec!["local", "new"]);
        assert_eq!(feed.next_page(), 2);
    }

    #[test]
    fn test_stale_result_is_ignored() {
        let mut feed = MessageFeed::new("c1", 20);
        let (added, _) = feed
            .finish_load(1, Ok(page(1, vec![msg("a", 1)], true)))
            .unwrap();
        assert_eq!(added, 0);
        assert!(feed.is_empty());
    }

    #[test]
    fn test_foreign_messages_are_rejected() {
        let mut feed = MessageFeed::new("c1", 20);
        let mut other = msg("z", 1);
        other.conversation_id = "c2".to_string();
        assert!(!feed.apply_incoming(other));
        assert!(feed.is_empty());
    }

    #[test]
    fn test_status_advances_but_never_regresses() {
        let mut feed = MessageFeed::new("c1", 20);
        let mut m = msg("m", 1);
        m.status = MessageStatus::Sending;
        feed.apply_sent(m.clone());

        m.status = MessageStatus::Sent;
        assert!(!feed.apply_sent(m));
        assert_eq!(feed.get("m").unwrap().status, MessageStatus::Sent);

        assert!(feed.set_status("m", MessageStatus::Read));
        assert!(!feed.set_status("m", MessageStatus::Delivered));
        assert_eq!(feed.get("m").unwrap().status, MessageStatus::Read);
    }
}
