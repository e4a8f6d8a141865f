use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use log::debug;

use crate::chunk::chunk_payload_data::{ChunkPayloadData, PayloadProtocolIdentifier};
use crate::util::*;

/// Default bound on simultaneously buffered fragment groups.
pub(crate) const DEFAULT_MAX_FRAGMENT_GROUPS: usize = 1000;

/// A group is evicted once its newest fragment falls this far behind the
/// newest TSN seen on the association.
const STALE_TSN_DISTANCE: u32 = 1 << 17;

/// One message delivered up from the association.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub stream_id: u16,
    pub ppi: PayloadProtocolIdentifier,
    pub data: Bytes,
}

/// Fragments of one message, kept sorted by TSN. Ordered groups are
/// keyed by (stream, ssn); unordered groups by (stream, first TSN),
/// since every unordered message travels with the same sequence number.
#[derive(Debug)]
struct FragmentGroup {
    ssn: u16,
    unordered: bool,
    /// TSN of the lowest fragment held. Once the Begin fragment is in,
    /// this is the first TSN of the message.
    first_tsn: u32,
    chunks: Vec<ChunkPayloadData>,
    /// Insertion tick, for oldest-first eviction.
    born: u64,
}

impl FragmentGroup {
    fn stream_id(&self) -> u16 {
        self.chunks[0].stream_identifier
    }

    fn push(&mut self, chunk: ChunkPayloadData) -> bool {
        if self.chunks.iter().any(|c| c.tsn == chunk.tsn) {
            return false;
        }
        let at = self
            .chunks
            .partition_point(|c| sna32lt(c.tsn, chunk.tsn));
        self.chunks.insert(at, chunk);
        self.first_tsn = self.chunks[0].tsn;
        true
    }

    /// Complete when the lowest fragment carries B, the highest carries E,
    /// the TSNs in between are strictly sequential, and no interior
    /// fragment restarts or terminates the message.
    fn is_complete(&self) -> bool {
        let n = self.chunks.len();
        if n == 0 || !self.chunks[0].beginning_fragment || !self.chunks[n - 1].ending_fragment {
            return false;
        }
        if self.chunks[1..].iter().any(|c| c.beginning_fragment)
            || self.chunks[..n - 1].iter().any(|c| c.ending_fragment)
        {
            return false;
        }
        self.chunks
            .windows(2)
            .all(|w| w[1].tsn == w[0].tsn.wrapping_add(1))
    }

    fn assemble(&self, ppi: PayloadProtocolIdentifier) -> ReceivedMessage {
        let mut data = BytesMut::new();
        for c in &self.chunks {
            data.extend_from_slice(&c.user_data);
        }
        ReceivedMessage {
            stream_id: self.chunks[0].stream_identifier,
            ppi,
            data: data.freeze(),
        }
    }

    fn newest_tsn(&self) -> u32 {
        self.chunks.last().map(|c| c.tsn).unwrap_or(0)
    }

    /// The lowest fragment is a Begin: nothing can attach below.
    fn begins_message(&self) -> bool {
        self.chunks[0].beginning_fragment
    }

    /// The highest fragment is an End: nothing can attach above.
    fn ends_message(&self) -> bool {
        self.chunks[self.chunks.len() - 1].ending_fragment
    }
}

/// Per-stream ordered delivery state: the next expected SSN and complete
/// messages buffered ahead of it.
#[derive(Debug, Default)]
struct OrderedStream {
    expected_ssn: u16,
    pending: HashMap<u16, ReceivedMessage>,
}

/// FragmentAssembler turns DATA chunks back into user messages:
/// single-chunk messages pass straight through, ordered fragments group
/// by (stream, ssn) until contiguous from B to E, unordered fragments
/// group by (stream, first TSN) with message boundaries decided by the
/// B and E flags, and ordered streams buffer completed messages until
/// their sequence number comes up. Groups are bounded and evicted
/// oldest-first; groups left behind by the peer's TSN progress are
/// dropped.
#[derive(Debug)]
pub(crate) struct FragmentAssembler {
    groups: Vec<FragmentGroup>,
    streams: HashMap<u16, OrderedStream>,
    max_groups: usize,
    ticks: u64,
    newest_tsn: u32,
}

impl FragmentAssembler {
    pub(crate) fn new(max_groups: usize) -> Self {
        FragmentAssembler {
            groups: Vec::new(),
            streams: HashMap::new(),
            max_groups,
            ticks: 0,
            newest_tsn: 0,
        }
    }

    /// Feeds one accepted DATA chunk; returns every message that became
    /// deliverable.
    pub(crate) fn push(&mut self, chunk: ChunkPayloadData) -> Vec<ReceivedMessage> {
        self.ticks += 1;
        if self.ticks == 1 || sna32gt(chunk.tsn, self.newest_tsn) {
            self.newest_tsn = chunk.tsn;
        }

        let ppi = chunk.payload_type;
        let stream_id = chunk.stream_identifier;
        let ssn = chunk.stream_sequence_number;
        let unordered = chunk.unordered;

        let completed = if chunk.is_single() {
            Some(ReceivedMessage {
                stream_id,
                ppi,
                data: chunk.user_data.clone(),
            })
        } else if unordered {
            self.push_unordered(chunk)
        } else {
            self.push_ordered(chunk)
        };

        let mut out = Vec::new();
        if let Some(msg) = completed {
            if unordered {
                out.push(msg);
            } else {
                self.deliver_ordered(stream_id, ssn, msg, &mut out);
            }
        }

        self.evict();
        out
    }

    fn push_ordered(&mut self, chunk: ChunkPayloadData) -> Option<ReceivedMessage> {
        let ppi = chunk.payload_type;
        let idx = match self.groups.iter().position(|g| {
            !g.unordered
                && g.ssn == chunk.stream_sequence_number
                && g.stream_id() == chunk.stream_identifier
        }) {
            Some(idx) => idx,
            None => {
                self.groups.push(FragmentGroup {
                    ssn: chunk.stream_sequence_number,
                    unordered: false,
                    first_tsn: chunk.tsn,
                    chunks: Vec::new(),
                    born: self.ticks,
                });
                self.groups.len() - 1
            }
        };

        self.groups[idx].push(chunk);
        if !self.groups[idx].is_complete() {
            return None;
        }

        let group = self.groups.swap_remove(idx);
        Some(group.assemble(ppi))
    }

    /// Every unordered fragment starts as a run of its own, keyed by
    /// (stream, first TSN). Adjacent runs coalesce only while no message
    /// boundary separates them: a run ending in E never extends upward, a
    /// run starting with B never extends downward. Two messages sent
    /// back to back therefore stay apart however their fragments
    /// interleave on arrival.
    fn push_unordered(&mut self, chunk: ChunkPayloadData) -> Option<ReceivedMessage> {
        let ppi = chunk.payload_type;
        let stream_id = chunk.stream_identifier;

        if self.groups.iter().any(|g| {
            g.unordered
                && g.stream_id() == stream_id
                && g.chunks.iter().any(|c| c.tsn == chunk.tsn)
        }) {
            return None;
        }

        self.groups.push(FragmentGroup {
            ssn: chunk.stream_sequence_number,
            unordered: true,
            first_tsn: chunk.tsn,
            chunks: vec![chunk],
            born: self.ticks,
        });
        self.merge_unordered_runs(stream_id);

        let idx = self
            .groups
            .iter()
            .position(|g| g.unordered && g.stream_id() == stream_id && g.is_complete())?;
        let group = self.groups.swap_remove(idx);
        Some(group.assemble(ppi))
    }

    /// Coalesces unordered runs on `stream_id` until no pair is left
    /// whose TSNs are adjacent without a B/E boundary between them.
    fn merge_unordered_runs(&mut self, stream_id: u16) {
        loop {
            let mut pair = None;
            'search: for i in 0..self.groups.len() {
                let lower = &self.groups[i];
                if !lower.unordered || lower.stream_id() != stream_id || lower.ends_message() {
                    continue;
                }
                for j in 0..self.groups.len() {
                    if i == j {
                        continue;
                    }
                    let upper = &self.groups[j];
                    if !upper.unordered
                        || upper.stream_id() != stream_id
                        || upper.begins_message()
                    {
                        continue;
                    }
                    if lower.newest_tsn().wrapping_add(1) == upper.first_tsn {
                        pair = Some((i, j));
                        break 'search;
                    }
                }
            }

            let (i, j) = match pair {
                Some(pair) => pair,
                None => return,
            };
            let upper = self.groups.remove(j);
            let i = if j < i { i - 1 } else { i };
            let lower = &mut self.groups[i];
            // Runs are contiguous, so appending keeps the TSN order.
            lower.chunks.extend(upper.chunks);
            lower.born = lower.born.min(upper.born);
        }
    }

    /// Buffers out-of-sequence messages and drains greedily as the
    /// expected sequence number advances, wrapping at 65535.
    fn deliver_ordered(
        &mut self,
        stream_id: u16,
        ssn: u16,
        msg: ReceivedMessage,
        out: &mut Vec<ReceivedMessage>,
    ) {
        let stream = self.streams.entry(stream_id).or_default();
        if sna16lt(ssn, stream.expected_ssn) {
            debug!("[sctp] dropping stale ordered message stream={stream_id} ssn={ssn}");
            return;
        }

        stream.pending.insert(ssn, msg);
        while let Some(ready) = stream.pending.remove(&stream.expected_ssn) {
            out.push(ready);
            stream.expected_ssn = stream.expected_ssn.wrapping_add(1);
        }
    }

    fn evict(&mut self) {
        let newest = self.newest_tsn;
        self.groups.retain(|g| {
            let lag = newest.wrapping_sub(g.newest_tsn());
            let keep = lag < STALE_TSN_DISTANCE;
            if !keep {
                debug!(
                    "[sctp] evicting stale fragment group first_tsn={} ({} fragments)",
                    g.first_tsn,
                    g.chunks.len()
                );
            }
            keep
        });

        while self.groups.len() > self.max_groups {
            let oldest = self
                .groups
                .iter()
                .enumerate()
                .min_by_key(|(_, g)| g.born)
                .map(|(i, _)| i)
                .unwrap();
            let g = self.groups.swap_remove(oldest);
            debug!(
                "[sctp] fragment group cap reached, evicting first_tsn={} ({} fragments)",
                g.first_tsn,
                g.chunks.len()
            );
        }
    }

    #[cfg(test)]
    fn group_count(&self) -> usize {
        self.groups.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn data(
        tsn: u32,
        stream: u16,
        ssn: u16,
        flags: (bool, bool),
        unordered: bool,
        payload: &'static [u8],
    ) -> ChunkPayloadData {
        ChunkPayloadData {
            unordered,
            beginning_fragment: flags.0,
            ending_fragment: flags.1,
            tsn,
            stream_identifier: stream,
            stream_sequence_number: ssn,
            payload_type: PayloadProtocolIdentifier::Binary,
            user_data: Bytes::from_static(payload),
        }
    }

    #[test]
    fn test_single_chunk_passthrough() {
        let mut a = FragmentAssembler::new(DEFAULT_MAX_FRAGMENT_GROUPS);
        let out = a.push(data(1000, 0, 0, (true, true), false, b"hello"));
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0].data[..], b"hello");
        assert_eq!(out[0].stream_id, 0);
    }

    #[test]
    fn test_out_of_order_fragments_reassemble() {
        // B, mid, mid, E delivered in the order 1003, 1001, 1000, 1002:
        // exactly one message, bytes in TSN order.
        let mut a = FragmentAssembler::new(DEFAULT_MAX_FRAGMENT_GROUPS);
        assert!(a.push(data(1003, 0, 0, (false, true), false, b"mnop")).is_empty());
        assert!(a.push(data(1001, 0, 0, (false, false), false, b"efgh")).is_empty());
        assert!(a.push(data(1000, 0, 0, (true, false), false, b"abcd")).is_empty());
        let out = a.push(data(1002, 0, 0, (false, false), false, b"ijkl"));
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0].data[..], b"abcdefghijklmnop");
    }

    #[test]
    fn test_duplicate_fragments_ignored() {
        let mut a = FragmentAssembler::new(DEFAULT_MAX_FRAGMENT_GROUPS);
        assert!(a.push(data(1000, 0, 0, (true, false), false, b"ab")).is_empty());
        assert!(a.push(data(1000, 0, 0, (true, false), false, b"ab")).is_empty());
        let out = a.push(data(1001, 0, 0, (false, true), false, b"cd"));
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0].data[..], b"abcd");
    }

    #[test]
    fn test_duplicate_unordered_fragments_ignored() {
        let mut a = FragmentAssembler::new(DEFAULT_MAX_FRAGMENT_GROUPS);
        assert!(a.push(data(2000, 0, 0, (true, false), true, b"uv")).is_empty());
        assert!(a.push(data(2000, 0, 0, (true, false), true, b"uv")).is_empty());
        let out = a.push(data(2001, 0, 0, (false, true), true, b"wx"));
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0].data[..], b"uvwx");
    }

    #[test]
    fn test_ordered_buffering() {
        // Sequences 0, 2, 1: deliver 0, hold 2, then deliver 1 and 2.
        let mut a = FragmentAssembler::new(DEFAULT_MAX_FRAGMENT_GROUPS);
        let out = a.push(data(1000, 0, 0, (true, true), false, b"s0"));
        assert_eq!(out.len(), 1);

        let out = a.push(data(1002, 0, 2, (true, true), false, b"s2"));
        assert!(out.is_empty());

        let out = a.push(data(1001, 0, 1, (true, true), false, b"s1"));
        assert_eq!(out.len(), 2);
        assert_eq!(&out[0].data[..], b"s1");
        assert_eq!(&out[1].data[..], b"s2");
    }

    #[test]
    fn test_unordered_delivers_immediately() {
        let mut a = FragmentAssembler::new(DEFAULT_MAX_FRAGMENT_GROUPS);
        let out = a.push(data(1005, 0, 9, (true, true), true, b"later"));
        assert_eq!(out.len(), 1, "unordered skips sequence buffering");
    }

    #[test]
    fn test_unordered_fragments_keyed_apart_from_ordered() {
        let mut a = FragmentAssembler::new(DEFAULT_MAX_FRAGMENT_GROUPS);
        // Same stream and ssn, one ordered and one unordered group.
        assert!(a.push(data(1000, 0, 0, (true, false), false, b"o1")).is_empty());
        assert!(a.push(data(2000, 0, 0, (true, false), true, b"u1")).is_empty());
        assert_eq!(a.group_count(), 2);

        let out = a.push(data(2001, 0, 0, (false, true), true, b"u2"));
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0].data[..], b"u1u2");
    }

    #[test]
    fn test_interleaved_unordered_messages_stay_separate() {
        // Two two-fragment unordered messages on one stream share the
        // sequence number; the Begin-fragment TSN keys them apart even
        // when their fragments interleave on arrival.
        let mut a = FragmentAssembler::new(DEFAULT_MAX_FRAGMENT_GROUPS);
        assert!(a.push(data(100, 0, 0, (true, false), true, b"a1")).is_empty());
        assert!(a.push(data(102, 0, 0, (true, false), true, b"b1")).is_empty());
        assert_eq!(a.group_count(), 2);

        let out = a.push(data(101, 0, 0, (false, true), true, b"a2"));
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0].data[..], b"a1a2");

        let out = a.push(data(103, 0, 0, (false, true), true, b"b2"));
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0].data[..], b"b1b2");
        assert_eq!(a.group_count(), 0);
    }

    #[test]
    fn test_unordered_messages_complete_out_of_order() {
        // Arrival order 102(B) 100(B) 103(E) 101(E): the second message
        // completes before the first, and neither leaks into the other.
        let mut a = FragmentAssembler::new(DEFAULT_MAX_FRAGMENT_GROUPS);
        assert!(a.push(data(102, 0, 0, (true, false), true, b"b1")).is_empty());
        assert!(a.push(data(100, 0, 0, (true, false), true, b"a1")).is_empty());

        let out = a.push(data(103, 0, 0, (false, true), true, b"b2"));
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0].data[..], b"b1b2");

        let out = a.push(data(101, 0, 0, (false, true), true, b"a2"));
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0].data[..], b"a1a2");
    }

    #[test]
    fn test_unordered_middle_fragment_bridges_runs() {
        // Three fragments arriving E, B, mid: the middle one joins the
        // two runs into a complete message.
        let mut a = FragmentAssembler::new(DEFAULT_MAX_FRAGMENT_GROUPS);
        assert!(a.push(data(202, 0, 0, (false, true), true, b"m3")).is_empty());
        assert!(a.push(data(200, 0, 0, (true, false), true, b"m1")).is_empty());
        assert_eq!(a.group_count(), 2);

        let out = a.push(data(201, 0, 0, (false, false), true, b"m2"));
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0].data[..], b"m1m2m3");
        assert_eq!(a.group_count(), 0);
    }

    #[test]
    fn test_ordered_sequence_wraps() {
        let mut a = FragmentAssembler::new(DEFAULT_MAX_FRAGMENT_GROUPS);
        // Walk expected_ssn up to 65535 via explicit pending drain.
        let stream = a.streams.entry(3).or_default();
        stream.expected_ssn = 65_535;

        let out = a.push(data(1000, 3, 65_535, (true, true), false, b"last"));
        assert_eq!(out.len(), 1);
        let out = a.push(data(1001, 3, 0, (true, true), false, b"wrapped"));
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0].data[..], b"wrapped");
    }

    #[test]
    fn test_group_cap_evicts_oldest() {
        let mut a = FragmentAssembler::new(2);
        assert!(a.push(data(1000, 0, 0, (true, false), false, b"x")).is_empty());
        assert!(a.push(data(1100, 0, 1, (true, false), false, b"y")).is_empty());
        assert!(a.push(data(1200, 0, 2, (true, false), false, b"z")).is_empty());
        assert_eq!(a.group_count(), 2);

        // The oldest group (ssn 0) is gone; completing it now goes nowhere.
        assert!(a.push(data(1001, 0, 0, (false, true), false, b"x2")).is_empty());
    }

    #[test]
    fn test_stale_groups_evicted_by_tsn_distance() {
        let mut a = FragmentAssembler::new(DEFAULT_MAX_FRAGMENT_GROUPS);
        assert!(a.push(data(1000, 0, 0, (true, false), false, b"x")).is_empty());
        // A chunk far ahead pushes the stale group out.
        a.push(data(1000 + STALE_TSN_DISTANCE, 0, 7, (true, true), true, b"jump"));
        assert_eq!(a.group_count(), 0);
    }
}
