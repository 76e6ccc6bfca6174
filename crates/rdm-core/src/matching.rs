//! Receive matching.
//!
//! Posted receives wait in a FIFO until a message matches them; messages
//! that arrive with no matching receive wait in the unexpected FIFO. Tagged
//! and untagged traffic never match each other. A claiming peek reserves an
//! unexpected message so only a later claimed receive can take it.

use std::collections::VecDeque;

use crate::op::{OpHandle, TagMatch};
use crate::peer::PeerAddr;
use crate::seqnum::MsgId;

/// Identifies a message by sender and message id.
pub type MsgKey = (PeerAddr, MsgId);

/// Token returned by a claiming peek.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClaimToken(u64);

/// A receive waiting for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostedRecv {
    /// Receive operation.
    pub op: OpHandle,
    /// Only match messages from this peer.
    pub src: Option<PeerAddr>,
    /// Tag matcher; `None` for untagged receives.
    pub tag: Option<TagMatch>,
}

/// A message waiting for a receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unexpected {
    /// Message.
    pub key: MsgKey,
    /// User tag; `None` for untagged messages.
    pub tag: Option<u64>,
    /// Message length.
    pub len: usize,
    claim: Option<ClaimToken>,
}

impl Unexpected {
    /// New unclaimed entry.
    pub fn new(key: MsgKey, tag: Option<u64>, len: usize) -> Self {
        Self {
            key,
            tag,
            len,
            claim: None,
        }
    }

    /// Sender.
    pub fn peer(&self) -> PeerAddr {
        self.key.0
    }
}

fn admits(src: Option<PeerAddr>, matcher: Option<TagMatch>, peer: PeerAddr, tag: Option<u64>) -> bool {
    if src.is_some_and(|s| s != peer) {
        return false;
    }
    match (matcher, tag) {
        (None, None) => true,
        (Some(m), Some(t)) => m.matches(t),
        _ => false,
    }
}

/// Posted and unexpected queues.
#[derive(Debug, Default)]
pub struct Matcher {
    posted: VecDeque<PostedRecv>,
    unexpected: VecDeque<Unexpected>,
    next_claim: u64,
}

impl Matcher {
    /// Empty matcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Finds and removes the first posted receive accepting a message.
    pub fn match_message(&mut self, peer: PeerAddr, tag: Option<u64>) -> Option<OpHandle> {
        let pos = self
            .posted
            .iter()
            .position(|r| admits(r.src, r.tag, peer, tag))?;
        self.posted.remove(pos).map(|r| r.op)
    }

    /// Parks a message nobody was waiting for.
    pub fn push_unexpected(&mut self, msg: Unexpected) {
        self.unexpected.push_back(msg);
    }

    /// Takes the first unclaimed unexpected message a receive for `src` and `tag` accepts.
    pub fn take_unexpected(&mut self, src: Option<PeerAddr>, tag: Option<TagMatch>) -> Option<Unexpected> {
        let pos = self
            .unexpected
            .iter()
            .position(|m| m.claim.is_none() && admits(src, tag, m.peer(), m.tag))?;
        self.unexpected.remove(pos)
    }

    /// Queues a receive.
    pub fn post(&mut self, recv: PostedRecv) {
        self.posted.push_back(recv);
    }

    /// First unclaimed unexpected message a tagged peek would see.
    pub fn peek(&self, src: Option<PeerAddr>, tag: TagMatch) -> Option<&Unexpected> {
        self.unexpected
            .iter()
            .find(|m| m.claim.is_none() && admits(src, Some(tag), m.peer(), m.tag))
    }

    /// Reserves the message for a claimed receive.
    pub fn claim(&mut self, key: MsgKey) -> Option<ClaimToken> {
        let token = ClaimToken(self.next_claim);
        let msg = self
            .unexpected
            .iter_mut()
            .find(|m| m.key == key && m.claim.is_none())?;
        msg.claim = Some(token);
        self.next_claim += 1;
        Some(token)
    }

    /// Takes a claimed message.
    pub fn take_claimed(&mut self, token: ClaimToken) -> Option<Unexpected> {
        let pos = self.unexpected.iter().position(|m| m.claim == Some(token))?;
        self.unexpected.remove(pos)
    }

    /// Removes an unexpected message by key.
    pub fn remove_unexpected(&mut self, key: MsgKey) -> Option<Unexpected> {
        let pos = self.unexpected.iter().position(|m| m.key == key)?;
        self.unexpected.remove(pos)
    }

    /// Removes a posted receive. Returns false if it was not queued.
    pub fn cancel(&mut self, op: OpHandle) -> bool {
        let before = self.posted.len();
        self.posted.retain(|r| r.op != op);
        before != self.posted.len()
    }

    /// Drops unexpected messages from `peer` and returns their keys.
    pub fn purge_peer(&mut self, peer: PeerAddr) -> Vec<MsgKey> {
        let mut purged = Vec::new();
        self.unexpected.retain(|m| {
            if m.peer() == peer {
                purged.push(m.key);
                false
            } else {
                true
            }
        });
        purged
    }

    /// Posted receives waiting.
    pub fn posted_len(&self) -> usize {
        self.posted.len()
    }

    /// Unexpected messages waiting.
    pub fn unexpected_len(&self) -> usize {
        self.unexpected.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;

    fn ops(n: usize) -> Vec<OpHandle> {
        let mut arena = Arena::with_capacity(n);
        (0..n).map(|i| OpHandle(arena.insert(i).unwrap())).collect()
    }

    fn key(peer: u64, id: u32) -> MsgKey {
        (PeerAddr(peer), MsgId(id))
    }

    #[test]
    fn test_untagged_matches_in_post_order() {
        let h = ops(2);
        let mut m = Matcher::new();
        m.post(PostedRecv { op: h[0], src: None, tag: None });
        m.post(PostedRecv { op: h[1], src: None, tag: None });
        assert_eq!(m.match_message(PeerAddr(1), None), Some(h[0]));
        assert_eq!(m.match_message(PeerAddr(1), None), Some(h[1]));
        assert_eq!(m.match_message(PeerAddr(1), None), None);
    }

    #[test]
    fn test_tagged_and_untagged_do_not_mix() {
        let h = ops(1);
        let mut m = Matcher::new();
        m.post(PostedRecv {
            op: h[0],
            src: None,
            tag: Some(TagMatch::exact(5)),
        });
        assert_eq!(m.match_message(PeerAddr(1), None), None);
        assert_eq!(m.match_message(PeerAddr(1), Some(6)), None);
        assert_eq!(m.match_message(PeerAddr(1), Some(5)), Some(h[0]));
    }

    #[test]
    fn test_source_filter() {
        let h = ops(1);
        let mut m = Matcher::new();
        m.post(PostedRecv {
            op: h[0],
            src: Some(PeerAddr(2)),
            tag: None,
        });
        assert_eq!(m.match_message(PeerAddr(1), None), None);
        assert_eq!(m.match_message(PeerAddr(2), None), Some(h[0]));
    }

    #[test]
    fn test_unexpected_taken_by_later_recv() {
        let mut m = Matcher::new();
        m.push_unexpected(Unexpected::new(key(1, 0), Some(0x10), 64));
        m.push_unexpected(Unexpected::new(key(1, 1), Some(0x20), 32));
        let got = m
            .take_unexpected(None, Some(TagMatch {
                tag: 0x20,
                ignore: 0,
            }))
            .unwrap();
        assert_eq!(got.key, key(1, 1));
        assert_eq!(m.unexpected_len(), 1);
    }

    #[test]
    fn test_peek_claim_hides_message() {
        let mut m = Matcher::new();
        m.push_unexpected(Unexpected::new(key(3, 0), Some(9), 8));
        let found = *m.peek(None, TagMatch::exact(9)).unwrap();
        assert_eq!(found.len, 8);
        let token = m.claim(found.key).unwrap();
        assert!(m.peek(None, TagMatch::exact(9)).is_none());
        assert!(m.take_unexpected(None, Some(TagMatch::exact(9))).is_none());
        assert_eq!(m.take_claimed(token).unwrap().key, key(3, 0));
        assert!(m.take_claimed(token).is_none());
    }

    #[test]
    fn test_peek_with_ignore_mask() {
        let mut m = Matcher::new();
        m.push_unexpected(Unexpected::new(key(1, 0), Some(0xAB), 4));
        let matcher = TagMatch {
            tag: 0xA0,
            ignore: 0x0F,
        };
        assert!(m.peek(None, matcher).is_some());
        assert!(m.peek(None, TagMatch::exact(0xA0)).is_none());
    }

    #[test]
    fn test_cancel_and_purge() {
        let h = ops(1);
        let mut m = Matcher::new();
        m.post(PostedRecv { op: h[0], src: None, tag: None });
        assert!(m.cancel(h[0]));
        assert!(!m.cancel(h[0]));
        m.push_unexpected(Unexpected::new(key(1, 0), None, 1));
        m.push_unexpected(Unexpected::new(key(2, 0), None, 1));
        assert_eq!(m.purge_peer(PeerAddr(1)), vec![key(1, 0)]);
        assert_eq!(m.unexpected_len(), 1);
    }
}
