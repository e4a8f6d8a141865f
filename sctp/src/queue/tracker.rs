use std::collections::HashSet;

use crate::chunk::chunk_selective_ack::GapAckBlock;

/// Receive window above the cumulative TSN: only TSNs within
/// (cumulative, cumulative + 65535] are accepted.
const RECEIVE_WINDOW: u32 = 65_535;

/// Duplicates reported per SACK, at most.
const MAX_DUPLICATES: usize = 16;

/// TsnTracker follows the peer's transmission sequence numbers: the
/// highest contiguous TSN received (cumulative), the set received above
/// it, and recent duplicates. All comparisons are RFC 1982 serial-number
/// arithmetic.
#[derive(Debug)]
pub(crate) struct TsnTracker {
    cumulative_tsn: u32,
    received_above: HashSet<u32>,
    duplicates: Vec<u32>,
}

impl TsnTracker {
    /// Starts one short of the peer's initial TSN so the first DATA chunk
    /// advances the cumulative ack.
    pub(crate) fn new(peer_initial_tsn: u32) -> Self {
        TsnTracker {
            cumulative_tsn: peer_initial_tsn.wrapping_sub(1),
            received_above: HashSet::new(),
            duplicates: Vec::new(),
        }
    }

    pub(crate) fn cumulative_tsn(&self) -> u32 {
        self.cumulative_tsn
    }

    /// Records a received TSN. Returns true when the TSN is new; anything
    /// already seen or outside the window is noted as a duplicate for the
    /// next SACK and returns false.
    pub(crate) fn receive(&mut self, tsn: u32) -> bool {
        let distance = tsn.wrapping_sub(self.cumulative_tsn);
        let in_window = distance > 0 && distance <= RECEIVE_WINDOW;
        if !in_window || self.received_above.contains(&tsn) {
            if self.duplicates.len() < MAX_DUPLICATES {
                self.duplicates.push(tsn);
            }
            return false;
        }

        if distance == 1 {
            self.cumulative_tsn = tsn;
            // Drain whatever became contiguous.
            while self
                .received_above
                .remove(&self.cumulative_tsn.wrapping_add(1))
            {
                self.cumulative_tsn = self.cumulative_tsn.wrapping_add(1);
            }
        } else {
            self.received_above.insert(tsn);
        }
        true
    }

    /// Coalesces the received-above set into (start, end) offset pairs
    /// from the cumulative TSN, in serial-number order. Offsets saturate
    /// at u16::MAX.
    pub(crate) fn gap_blocks(&self) -> Vec<GapAckBlock> {
        let mut offsets: Vec<u32> = self
            .received_above
            .iter()
            .map(|tsn| tsn.wrapping_sub(self.cumulative_tsn))
            .collect();
        offsets.sort_unstable();

        let mut blocks: Vec<GapAckBlock> = vec![];
        for off in offsets {
            let off = off.min(u16::MAX as u32) as u16;
            match blocks.last_mut() {
                Some(last) if (last.end as u32) + 1 >= off as u32 => last.end = last.end.max(off),
                _ => blocks.push(GapAckBlock {
                    start: off,
                    end: off,
                }),
            }
        }
        blocks
    }

    /// Hands out the duplicates collected since the last SACK.
    pub(crate) fn take_duplicates(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.duplicates)
    }
}
