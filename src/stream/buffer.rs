//! Per-direction reassembly buffer.
//!
//! Holds the out-of-order fragments of one direction of a flow, resolves
//! overlaps against the configured policy, and hands contiguous bytes to the
//! inspector as soon as they line up with `next_expected`.
//!
//! Retained fragments are sorted by start, never overlap, never touch (adjacent
//! runs are coalesced), and all lie strictly after `next_expected`.

use serde::Serialize;
use tracing::{debug, trace};

use crate::config::StreamConfig;
use crate::packet::SeqNum;

use super::event::{EventKind, SequenceContext, TcpEventLogger};
use super::policy::{self, ReassemblyPolicy, Winner};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Fragment {
    start: SeqNum,
    data: Vec<u8>,
}

impl Fragment {
    fn end(&self) -> SeqNum {
        self.start + len_u32(&self.data)
    }
}

fn len_u32(bytes: &[u8]) -> u32 {
    // segment payloads are bounded by the 16-bit IP length
    u32::try_from(bytes.len()).unwrap_or(u32::MAX)
}

fn offset(from: SeqNum, to: SeqNum) -> usize {
    from.distance_to(to) as usize
}

/// Budget for out-of-order data. Zero disables a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLimits {
    pub max_bytes: usize,
    pub max_segments: usize,
}

impl From<&StreamConfig> for BufferLimits {
    fn from(config: &StreamConfig) -> Self {
        Self {
            max_bytes: config.max_queued_bytes,
            max_segments: config.max_queued_segments,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    pub segments_queued: u64,
    pub bytes_flushed: u64,
    pub overlaps: u64,
    pub retransmissions: u64,
    pub rejected: u64,
    pub forced_flushes: u64,
    pub gap_bytes_skipped: u64,
}

/// What happened to one inserted payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insertion {
    /// No payload bytes.
    Empty,
    /// Every byte was already delivered or already queued with the same content.
    Duplicate,
    /// Contiguous bytes were delivered.
    Flushed(usize),
    /// Retained out of order; nothing became contiguous.
    Queued,
    /// The budget was exceeded and data was delivered across a gap.
    ForcedFlush(usize),
}

impl Insertion {
    /// Bytes handed to the inspector by this insertion.
    #[must_use]
    pub fn delivered(self) -> usize {
        match self {
            Insertion::Flushed(n) | Insertion::ForcedFlush(n) => n,
            Insertion::Empty | Insertion::Duplicate | Insertion::Queued => 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReassemblyBuffer {
    fragments: Vec<Fragment>,
    next_expected: Option<SeqNum>,
    queued_bytes: usize,
    policy: ReassemblyPolicy,
    limits: BufferLimits,
    stats: BufferStats,
}

impl ReassemblyBuffer {
    #[must_use]
    pub fn new(policy: ReassemblyPolicy, limits: BufferLimits) -> Self {
        Self {
            fragments: Vec::new(),
            next_expected: None,
            queued_bytes: 0,
            policy,
            limits,
            stats: BufferStats::default(),
        }
    }

    #[must_use]
    pub fn from_config(config: &StreamConfig) -> Self {
        Self::new(config.policy, BufferLimits::from(config))
    }

    /// Sequence number up to which bytes have been delivered.
    #[must_use]
    pub fn next_expected(&self) -> Option<SeqNum> {
        self.next_expected
    }

    /// Set where the stream starts. Queued data that now lies before the
    /// anchor is dropped.
    pub fn anchor(&mut self, seq: SeqNum) {
        self.next_expected = Some(seq);
        self.drop_before(seq);
    }

    #[must_use]
    pub fn policy(&self) -> ReassemblyPolicy {
        self.policy
    }

    #[must_use]
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    #[must_use]
    pub fn queued_segments(&self) -> usize {
        self.fragments.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    #[must_use]
    pub fn stats(&self) -> &BufferStats {
        &self.stats
    }

    /// End of the furthest retained byte, if anything is queued.
    #[must_use]
    pub fn queued_end(&self) -> Option<SeqNum> {
        self.fragments.last().map(Fragment::end)
    }

    /// Drop every retained fragment without delivering it.
    pub fn clear(&mut self) {
        self.fragments.clear();
        self.queued_bytes = 0;
    }

    /// Drop retained bytes at or after `seq`, returning how many were dropped.
    pub fn discard_from(&mut self, seq: SeqNum) -> usize {
        let before = self.queued_bytes;
        let mut kept = Vec::with_capacity(self.fragments.len());
        for mut fragment in self.fragments.drain(..) {
            if seq.is_before_or_eq(fragment.start) {
                continue;
            }
            if seq.is_before(fragment.end()) {
                fragment.data.truncate(offset(fragment.start, seq));
            }
            kept.push(fragment);
        }
        self.fragments = kept;
        self.queued_bytes = self.fragments.iter().map(|f| f.data.len()).sum();
        before - self.queued_bytes
    }

    /// Record a segment the state machine refused because it lies outside the
    /// receive window.
    pub fn reject(&mut self, context: SequenceContext, logger: &TcpEventLogger<'_>) {
        self.stats.rejected += 1;
        logger.log(EventKind::OutOfWindow, context);
    }

    /// Insert `data` starting at `seq`, resolving overlaps and delivering
    /// whatever becomes contiguous through `deliver`.
    pub fn insert(
        &mut self,
        seq: SeqNum,
        data: &[u8],
        logger: &TcpEventLogger<'_>,
        deliver: &mut dyn FnMut(SeqNum, &[u8]),
    ) -> Insertion {
        if data.is_empty() {
            return Insertion::Empty;
        }

        let expected = *self.next_expected.get_or_insert(seq);
        let end = seq + len_u32(data);
        let context = SequenceContext::new(seq, end, Some(expected));

        if end.is_before_or_eq(expected) {
            self.stats.retransmissions += 1;
            trace!(%seq, %end, %expected, "Retransmission of delivered data");
            logger.log(EventKind::Retransmission, context);
            return Insertion::Duplicate;
        }

        // bytes before `expected` were already inspected
        let (seq, data) = if seq.is_before(expected) {
            (expected, &data[offset(seq, expected)..])
        } else {
            (seq, data)
        };

        if seq == expected && self.fragments.is_empty() {
            deliver(seq, data);
            self.next_expected = Some(end);
            self.stats.bytes_flushed += data.len() as u64;
            return Insertion::Flushed(data.len());
        }

        if !self.place(seq, data, logger) {
            return Insertion::Duplicate;
        }

        let mut flushed = self.flush_contiguous(deliver);
        if self.over_budget() {
            self.stats.forced_flushes += 1;
            debug!(
                queued_segments = self.fragments.len(),
                queued_bytes = self.queued_bytes,
                "Reassembly buffer exhausted, forcing flush"
            );
            logger.log(EventKind::BufferExhausted, context);
            flushed += self.flush_while(logger, deliver, Self::over_budget);
            return Insertion::ForcedFlush(flushed);
        }

        if flushed > 0 {
            Insertion::Flushed(flushed)
        } else {
            Insertion::Queued
        }
    }

    /// Deliver everything retained, skipping over holes. Used when the sender
    /// finishes (FIN or RST) and when a flush is requested externally.
    pub fn flush_all(
        &mut self,
        logger: &TcpEventLogger<'_>,
        deliver: &mut dyn FnMut(SeqNum, &[u8]),
    ) -> usize {
        self.flush_while(logger, deliver, |buffer| !buffer.is_empty())
    }

    /// Resolve `data` against the overlapping retained fragments and splice the
    /// survivors in. Returns false when nothing new was retained because the
    /// payload repeated queued bytes exactly.
    fn place(&mut self, seq: SeqNum, data: &[u8], logger: &TcpEventLogger<'_>) -> bool {
        let end = seq + len_u32(data);
        let first = self
            .fragments
            .partition_point(|f| f.end().is_before_or_eq(seq));

        let mut keep = vec![(seq, end)];
        let mut survivors = Vec::new();
        let mut removed_bytes = 0;
        let mut duplicate = false;
        let mut last = first;

        while let Some(old) = self.fragments.get(last)
            && old.start.is_before(end)
        {
            last += 1;
            removed_bytes += old.data.len();
            let Some(res) = policy::resolve(self.policy, old.start, &old.data, seq, data) else {
                survivors.push(old.clone());
                continue;
            };

            let context = SequenceContext::new(res.start, res.end, self.next_expected);
            if res.conflicting {
                self.stats.overlaps += 1;
                debug!(
                    policy = %self.policy,
                    rule = %res.rule(),
                    start = %res.start,
                    end = %res.end,
                    "Overlap resolved"
                );
                logger.log(EventKind::Overlap { tag: res.tag() }, context);
            } else if res.kind == policy::OverlapKind::Inside {
                self.stats.retransmissions += 1;
                logger.log(EventKind::Retransmission, context);
                duplicate = true;
            }

            match res.winner {
                Winner::Old => {
                    keep = subtract(&keep, res.start, res.end);
                    survivors.push(old.clone());
                }
                Winner::New => {
                    if old.start.is_before(res.start) {
                        survivors.push(Fragment {
                            start: old.start,
                            data: old.data[..offset(old.start, res.start)].to_vec(),
                        });
                    }
                    if res.end.is_before(old.end()) {
                        survivors.push(Fragment {
                            start: res.end,
                            data: old.data[offset(old.start, res.end)..].to_vec(),
                        });
                    }
                }
            }
        }

        let added: Vec<Fragment> = keep
            .into_iter()
            .filter(|(s, e)| s != e)
            .map(|(s, e)| Fragment {
                start: s,
                data: data[offset(seq, s)..offset(seq, e)].to_vec(),
            })
            .collect();

        if added.is_empty() && duplicate && last == first + 1 {
            return false;
        }
        if !added.is_empty() {
            self.stats.segments_queued += 1;
        }

        let mut merged = survivors;
        merged.extend(added);
        merged.sort_by(|a, b| a.start.cmp(&b.start));
        let added_bytes: usize = merged.iter().map(|f| f.data.len()).sum();

        self.fragments.splice(first..last, merged);
        self.queued_bytes = self.queued_bytes - removed_bytes + added_bytes;
        self.coalesce();
        debug_assert!(self.is_well_formed(), "fragments out of order after splice");
        true
    }

    /// Fragments are sorted, separated by holes, start at or after
    /// `next_expected` and add up to `queued_bytes`.
    fn is_well_formed(&self) -> bool {
        let separated = self
            .fragments
            .windows(2)
            .all(|pair| pair[0].end().is_before(pair[1].start));
        let anchored = match (self.fragments.first(), self.next_expected) {
            (Some(first), Some(expected)) => !first.start.is_before(expected),
            _ => true,
        };
        let total: usize = self.fragments.iter().map(|f| f.data.len()).sum();
        separated && anchored && total == self.queued_bytes
    }

    fn coalesce(&mut self) {
        let mut runs: Vec<Fragment> = Vec::with_capacity(self.fragments.len());
        for fragment in self.fragments.drain(..) {
            match runs.last_mut() {
                Some(prev) if prev.end() == fragment.start => {
                    prev.data.extend_from_slice(&fragment.data);
                }
                _ => runs.push(fragment),
            }
        }
        self.fragments = runs;
    }

    fn flush_contiguous(&mut self, deliver: &mut dyn FnMut(SeqNum, &[u8])) -> usize {
        let Some(expected) = self.next_expected else {
            return 0;
        };
        match self.fragments.first() {
            Some(first) if first.start == expected => {}
            _ => return 0,
        }
        // coalesced, so at most one fragment can touch `expected`
        let run = self.fragments.remove(0);
        self.deliver_run(run, deliver)
    }

    fn flush_while(
        &mut self,
        logger: &TcpEventLogger<'_>,
        deliver: &mut dyn FnMut(SeqNum, &[u8]),
        mut keep_going: impl FnMut(&Self) -> bool,
    ) -> usize {
        let mut flushed = 0;
        while keep_going(self) && !self.fragments.is_empty() {
            let run = self.fragments.remove(0);
            if let Some(expected) = self.next_expected
                && expected != run.start
            {
                self.stats.gap_bytes_skipped += u64::from(expected.distance_to(run.start));
                logger.log(
                    EventKind::SequenceGap,
                    SequenceContext::new(expected, run.start, Some(expected)),
                );
            }
            flushed += self.deliver_run(run, deliver);
        }
        flushed
    }

    fn deliver_run(&mut self, run: Fragment, deliver: &mut dyn FnMut(SeqNum, &[u8])) -> usize {
        let len = run.data.len();
        trace!(start = %run.start, len, "Flushing contiguous run");
        deliver(run.start, &run.data);
        self.next_expected = Some(run.end());
        self.queued_bytes -= len;
        self.stats.bytes_flushed += len as u64;
        len
    }

    fn over_budget(&self) -> bool {
        (self.limits.max_segments != 0 && self.fragments.len() > self.limits.max_segments)
            || (self.limits.max_bytes != 0 && self.queued_bytes > self.limits.max_bytes)
    }

    fn drop_before(&mut self, seq: SeqNum) {
        let mut kept = Vec::with_capacity(self.fragments.len());
        for fragment in self.fragments.drain(..) {
            if fragment.end().is_before_or_eq(seq) {
                continue;
            }
            if fragment.start.is_before(seq) {
                kept.push(Fragment {
                    start: seq,
                    data: fragment.data[offset(fragment.start, seq)..].to_vec(),
                });
            } else {
                kept.push(fragment);
            }
        }
        self.fragments = kept;
        self.queued_bytes = self.fragments.iter().map(|f| f.data.len()).sum();
    }
}

/// Remove `[start, end)` from a sorted list of disjoint half-open ranges.
fn subtract(ranges: &[(SeqNum, SeqNum)], start: SeqNum, end: SeqNum) -> Vec<(SeqNum, SeqNum)> {
    let mut out = Vec::with_capacity(ranges.len() + 1);
    for &(s, e) in ranges {
        if e.is_before_or_eq(start) || end.is_before_or_eq(s) {
            out.push((s, e));
            continue;
        }
        if s.is_before(start) {
            out.push((s, start));
        }
        if end.is_before(e) {
            out.push((end, e));
        }
    }
    out
}
