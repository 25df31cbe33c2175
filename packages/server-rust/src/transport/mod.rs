//! The data-layer transport runtime.
//!
//! One persistent connection per peer node, the length-prefixed NDB
//! message protocol over those connections, and a per-application-thread
//! submission/polling interface with adaptive send batching, heartbeat
//! liveness, and receive-side fanout.

pub mod adaptive;
pub mod apid;
pub mod handlers;
pub mod heartbeat;
pub mod listen;
pub mod pool;
pub mod query;
pub mod receive;
pub mod send_node;

pub use adaptive::AdaptiveSendState;
pub use apid::{ApidConnection, ApidGlobal, NdbMessage, TransportOptions};
pub use handlers::{MessageHandler, MessageHandlerTable};
pub use pool::{PagePool, RecvPage};
pub use query::{QueryId, QueryState, QueryTracker};
pub use send_node::{SendNode, SendNodeState};

/// Reads one word out of a page at a word offset, in the page's native
/// byte order (the framing layer handles foreign byte orders).
#[must_use]
pub fn page_word(page: &[u8], word_index: usize) -> u32 {
    let offset = word_index * 4;
    u32::from_ne_bytes([
        page[offset],
        page[offset + 1],
        page[offset + 2],
        page[offset + 3],
    ])
}

/// Writes one word into a page at a word offset.
pub fn set_page_word(page: &mut [u8], word_index: usize, word: u32) {
    let offset = word_index * 4;
    page[offset..offset + 4].copy_from_slice(&word.to_ne_bytes());
}

/// Appends framed words to a page in native byte order.
pub fn push_words(page: &mut Vec<u8>, words: &[u32]) {
    page.reserve(words.len() * 4);
    for word in words {
        page.extend_from_slice(&word.to_ne_bytes());
    }
}

/// Copies a word range out of a page.
#[must_use]
pub fn page_words(page: &[u8], word_offset: usize, len_words: usize) -> Vec<u32> {
    (word_offset..word_offset + len_words)
        .map(|index| page_word(page, index))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_word_helpers_round_trip() {
        let mut page = Vec::new();
        push_words(&mut page, &[1, 0xDEAD_BEEF, 3]);
        assert_eq!(page.len(), 12);
        assert_eq!(page_word(&page, 1), 0xDEAD_BEEF);
        set_page_word(&mut page, 1, 7);
        assert_eq!(page_words(&page, 0, 3), vec![1, 7, 3]);
    }
}
