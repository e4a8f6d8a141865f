use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::chunk::chunk_payload_data::ChunkPayloadData;
use crate::chunk::chunk_selective_ack::GapAckBlock;
use crate::error::{Error, Result};
use crate::util::*;

pub(crate) const RTO_INITIAL: Duration = Duration::from_secs(3);
pub(crate) const RTO_MIN: Duration = Duration::from_secs(1);
pub(crate) const RTO_MAX: Duration = Duration::from_secs(60);

/// cwnd and ssthresh never exceed the receiver window bound.
const MAX_CWND: u32 = 65_535;

/// Gap reports before a chunk is marked for fast retransmit.
const FAST_RETRANSMIT_THRESHOLD: u8 = 3;

pub(crate) const DEFAULT_MAX_RETRANSMITS: u32 = 10;

#[derive(Debug)]
struct PendingChunk {
    chunk: ChunkPayloadData,
    first_sent: Instant,
    last_sent: Instant,
    retransmit_count: u32,
    marked: bool,
    miss_reports: u8,
}

/// RetransmissionQueue holds every DATA chunk in flight, keyed by TSN,
/// together with the RTT estimator (RFC 4960 §6.3.1) and the slow-start /
/// congestion-avoidance window.
#[derive(Debug)]
pub(crate) struct RetransmissionQueue {
    entries: HashMap<u32, PendingChunk>,
    bytes_in_flight: usize,
    highest_sent_tsn: u32,

    cwnd: u32,
    ssthresh: u32,
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,

    mtu: u32,
    max_retransmits: u32,
}

impl RetransmissionQueue {
    pub(crate) fn new(mtu: u32) -> Self {
        RetransmissionQueue {
            entries: HashMap::new(),
            bytes_in_flight: 0,
            highest_sent_tsn: 0,
            // Initial cwnd per RFC 4960 §7.2.1.
            cwnd: (4 * mtu).min(4380.max(2 * mtu)),
            ssthresh: MAX_CWND,
            srtt: None,
            rttvar: Duration::ZERO,
            rto: RTO_INITIAL,
            mtu,
            max_retransmits: DEFAULT_MAX_RETRANSMITS,
        }
    }

    pub(crate) fn enqueue(&mut self, chunk: ChunkPayloadData, now: Instant) {
        self.bytes_in_flight += chunk.user_data.len();
        if self.entries.is_empty() || sna32gt(chunk.tsn, self.highest_sent_tsn) {
            self.highest_sent_tsn = chunk.tsn;
        }
        self.entries.insert(
            chunk.tsn,
            PendingChunk {
                chunk,
                first_sent: now,
                last_sent: now,
                retransmit_count: 0,
                marked: false,
                miss_reports: 0,
            },
        );
    }

    /// Processes a SACK: drops everything at or below the cumulative TSN,
    /// feeds the RTT estimator from never-retransmitted chunks (Karn's
    /// rule), grows the congestion window, and turns gap reports into
    /// fast-retransmit marks. Gap-covered chunks stay queued.
    pub(crate) fn acknowledge(&mut self, cumulative_tsn: u32, gaps: &[GapAckBlock], now: Instant) {
        let acked: Vec<u32> = self
            .entries
            .keys()
            .copied()
            .filter(|tsn| sna32lte(*tsn, cumulative_tsn))
            .collect();

        let mut acked_bytes = 0usize;
        for tsn in acked {
            if let Some(entry) = self.entries.remove(&tsn) {
                acked_bytes += entry.chunk.user_data.len();
                self.bytes_in_flight -= entry.chunk.user_data.len();
                if entry.retransmit_count == 0 {
                    self.update_rtt(now.saturating_duration_since(entry.first_sent));
                }
            }
        }

        if acked_bytes > 0 {
            if self.bytes_in_flight < self.ssthresh as usize {
                // Slow start.
                self.cwnd = (self.cwnd + (acked_bytes as u32).min(self.mtu)).min(MAX_CWND);
            } else {
                // Congestion avoidance: roughly one MTU per round trip.
                self.cwnd = (self.cwnd + self.mtu).min(MAX_CWND);
            }
            trace!(
                "[sctp] sack advanced to {cumulative_tsn}, cwnd={} ssthresh={}",
                self.cwnd,
                self.ssthresh
            );
        }

        if !gaps.is_empty() {
            self.mark_missing(cumulative_tsn, gaps);
        }
    }

    /// Chunks below the highest gap-acked TSN that no gap block covers
    /// collect miss reports; the third report marks them.
    fn mark_missing(&mut self, cumulative_tsn: u32, gaps: &[GapAckBlock]) {
        let highest_gapped =
            cumulative_tsn.wrapping_add(gaps.iter().map(|g| g.end as u32).max().unwrap_or(0));

        for (tsn, entry) in self.entries.iter_mut() {
            if !sna32lt(*tsn, highest_gapped) {
                continue;
            }
            let offset = tsn.wrapping_sub(cumulative_tsn);
            let covered = gaps
                .iter()
                .any(|g| offset >= g.start as u32 && offset <= g.end as u32);
            if covered {
                continue;
            }
            entry.miss_reports = entry.miss_reports.saturating_add(1);
            if entry.miss_reports >= FAST_RETRANSMIT_THRESHOLD && !entry.marked {
                debug!("[sctp] marking TSN {tsn} for fast retransmit");
                entry.marked = true;
            }
        }
    }

    /// Returns the chunks due for retransmission: everything marked for
    /// fast retransmit plus everything unacknowledged past the RTO. A
    /// timeout backs the RTO off, halves ssthresh and collapses cwnd to
    /// one MTU. A chunk past its retransmit budget is a fatal association
    /// error.
    pub(crate) fn pending_retransmissions(
        &mut self,
        now: Instant,
    ) -> Result<Vec<ChunkPayloadData>> {
        let mut due: Vec<u32> = self
            .entries
            .iter()
            .filter(|(_, e)| e.marked || now.saturating_duration_since(e.last_sent) >= self.rto)
            .map(|(tsn, _)| *tsn)
            .collect();
        if due.is_empty() {
            return Ok(vec![]);
        }
        due.sort_unstable_by(|a, b| {
            if sna32lt(*a, *b) {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Greater
            }
        });

        let timed_out = due.iter().any(|tsn| !self.entries[tsn].marked);

        let mut chunks = Vec::with_capacity(due.len());
        for tsn in due {
            let entry = self.entries.get_mut(&tsn).unwrap();
            entry.retransmit_count += 1;
            if entry.retransmit_count > self.max_retransmits {
                return Err(Error::ErrMaxRetransmitsExceeded { tsn });
            }
            entry.last_sent = now;
            entry.marked = false;
            entry.miss_reports = 0;
            chunks.push(entry.chunk.clone());
        }

        if timed_out {
            self.rto = (self.rto * 2).min(RTO_MAX);
            self.ssthresh = (self.ssthresh / 2).max(2 * self.mtu);
            self.cwnd = self.mtu;
            debug!(
                "[sctp] retransmission timeout, rto={:?} ssthresh={} cwnd={}",
                self.rto, self.ssthresh, self.cwnd
            );
        }

        Ok(chunks)
    }

    /// RFC 4960 §6.3.1. First measurement seeds srtt and rttvar; later
    /// ones are folded in with alpha 1/8 and beta 1/4.
    fn update_rtt(&mut self, sample: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(sample);
                self.rttvar = sample / 2;
            }
            Some(srtt) => {
                let diff = if srtt > sample {
                    srtt - sample
                } else {
                    sample - srtt
                };
                self.rttvar = self.rttvar * 3 / 4 + diff / 4;
                self.srtt = Some(srtt * 7 / 8 + sample / 8);
            }
        }
        let srtt = self.srtt.unwrap();
        self.rto = (srtt + 4 * self.rttvar).clamp(RTO_MIN, RTO_MAX);
    }

    pub(crate) fn bytes_in_flight(&self) -> usize {
        self.bytes_in_flight
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn rto(&self) -> Duration {
        self.rto
    }

    pub(crate) fn cwnd(&self) -> u32 {
        self.cwnd
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::chunk::chunk_payload_data::PayloadProtocolIdentifier;
    use bytes::Bytes;

    fn chunk(tsn: u32, payload: &'static [u8]) -> ChunkPayloadData {
        ChunkPayloadData {
            beginning_fragment: true,
            ending_fragment: true,
            tsn,
            stream_identifier: 0,
            stream_sequence_number: 0,
            payload_type: PayloadProtocolIdentifier::Binary,
            user_data: Bytes::from_static(payload),
            ..Default::default()
        }
    }

    #[test]
    fn test_bytes_in_flight_accounting() {
        let now = Instant::now();
        let mut q = RetransmissionQueue::new(1200);
        q.enqueue(chunk(1, b"abcd"), now);
        q.enqueue(chunk(2, b"efgh"), now);
        q.enqueue(chunk(3, b"ij"), now);
        assert_eq!(q.bytes_in_flight(), 10);

        q.acknowledge(2, &[], now);
        assert_eq!(q.len(), 1);
        assert_eq!(q.bytes_in_flight(), 2);

        q.acknowledge(3, &[], now);
        assert!(q.is_empty());
        assert_eq!(q.bytes_in_flight(), 0);
    }

    #[test]
    fn test_acknowledge_is_serial_number_aware() {
        let now = Instant::now();
        let mut q = RetransmissionQueue::new(1200);
        q.enqueue(chunk(u32::MAX, b"a"), now);
        q.enqueue(chunk(0, b"b"), now);
        // Cumulative 0 covers u32::MAX (its serial predecessor).
        q.acknowledge(0, &[], now);
        assert!(q.is_empty());
    }

    #[test]
    fn test_rtt_estimation_first_sample() {
        let start = Instant::now();
        let mut q = RetransmissionQueue::new(1200);
        q.enqueue(chunk(1, b"x"), start);
        q.acknowledge(1, &[], start + Duration::from_millis(200));

        // First sample: srtt = R, rttvar = R/2, rto = srtt + 4*rttvar
        // clamped to at least one second.
        assert_eq!(q.srtt, Some(Duration::from_millis(200)));
        assert_eq!(q.rttvar, Duration::from_millis(100));
        assert_eq!(q.rto(), RTO_MIN);
    }

    #[test]
    fn test_rtt_estimation_smoothing() {
        let start = Instant::now();
        let mut q = RetransmissionQueue::new(1200);
        q.enqueue(chunk(1, b"x"), start);
        q.acknowledge(1, &[], start + Duration::from_secs(2));
        q.enqueue(chunk(2, b"y"), start);
        q.acknowledge(2, &[], start + Duration::from_secs(1));

        // srtt = 7/8*2s + 1/8*1s = 1.875s, rttvar = 3/4*1s + 1/4*1s = 1s.
        assert_eq!(q.srtt, Some(Duration::from_millis(1875)));
        assert_eq!(q.rttvar, Duration::from_secs(1));
        assert_eq!(q.rto(), Duration::from_millis(5875));
    }

    #[test]
    fn test_retransmit_after_timeout() {
        let start = Instant::now();
        let mut q = RetransmissionQueue::new(1200);
        q.enqueue(chunk(1, b"x"), start);

        assert!(q.pending_retransmissions(start).unwrap().is_empty());

        let later = start + RTO_INITIAL;
        let due = q.pending_retransmissions(later).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].tsn, 1);

        // Backoff doubled the RTO, ssthresh halved, cwnd collapsed.
        assert_eq!(q.rto(), RTO_INITIAL * 2);
        assert_eq!(q.ssthresh, MAX_CWND / 2);
        assert_eq!(q.cwnd(), 1200);

        // Not due again until the backed-off RTO elapses.
        assert!(q.pending_retransmissions(later).unwrap().is_empty());
    }

    #[test]
    fn test_rto_backoff_is_capped() {
        let start = Instant::now();
        let mut q = RetransmissionQueue::new(1200);
        q.enqueue(chunk(1, b"x"), start);

        let mut now = start;
        for _ in 0..7 {
            now += RTO_MAX;
            q.pending_retransmissions(now).unwrap();
        }
        assert_eq!(q.rto(), RTO_MAX);
    }

    #[test]
    fn test_max_retransmits_exceeded() {
        let start = Instant::now();
        let mut q = RetransmissionQueue::new(1200);
        q.enqueue(chunk(7, b"x"), start);

        let mut now = start;
        let mut result = Ok(vec![]);
        for _ in 0..=DEFAULT_MAX_RETRANSMITS {
            now += RTO_MAX;
            result = q.pending_retransmissions(now);
            if result.is_err() {
                break;
            }
        }
        assert_eq!(result, Err(Error::ErrMaxRetransmitsExceeded { tsn: 7 }));
    }

    #[test]
    fn test_fast_retransmit_after_three_reports() {
        let start = Instant::now();
        let mut q = RetransmissionQueue::new(1200);
        q.enqueue(chunk(1, b"a"), start);
        q.enqueue(chunk(2, b"b"), start);
        q.enqueue(chunk(3, b"c"), start);

        // TSN 1 is missing; gaps report 2..3 three times.
        let gaps = [GapAckBlock { start: 2, end: 3 }];
        q.acknowledge(0, &gaps, start);
        q.acknowledge(0, &gaps, start);
        assert!(q.pending_retransmissions(start).unwrap().is_empty());

        q.acknowledge(0, &gaps, start);
        let due = q.pending_retransmissions(start).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].tsn, 1);

        // A fast retransmit alone does not back off the RTO.
        assert_eq!(q.rto(), RTO_INITIAL);
    }

    #[test]
    fn test_gap_blocks_do_not_remove_entries() {
        let start = Instant::now();
        let mut q = RetransmissionQueue::new(1200);
        q.enqueue(chunk(1, b"a"), start);
        q.enqueue(chunk(2, b"b"), start);

        q.acknowledge(0, &[GapAckBlock { start: 2, end: 2 }], start);
        assert_eq!(q.len(), 2, "gap-covered chunks stay until cumulatively acked");
    }

    #[test]
    fn test_slow_start_growth() {
        let start = Instant::now();
        let mut q = RetransmissionQueue::new(1200);
        let initial = q.cwnd();
        q.enqueue(chunk(1, b"abcd"), start);
        q.acknowledge(1, &[], start);
        assert_eq!(q.cwnd(), initial + 4);
    }
}
