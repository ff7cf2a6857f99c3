//! Overlap resolution policies.
//!
//! Endpoints disagree on which copy of a byte wins when two segments claim the
//! same sequence range. An inspector that resolves overlaps differently from the
//! protected host sees a different stream, so each policy reproduces one family
//! of stacks. A policy is three rules, chosen by how the newly arrived fragment
//! sits against a retained one:
//!
//! * left: the new fragment starts inside the old one and runs past its end
//! * right: the new fragment starts before the old one and ends inside it
//! * covers: the new fragment spans the old one completely
//!
//! A new fragment lying inside an old one keeps the old bytes, except under the
//! last-wins stacks.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::packet::SeqNum;

/// Target-stack overlap policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReassemblyPolicy {
    First,
    Last,
    Linux,
    OldLinux,
    #[default]
    Bsd,
    #[serde(rename = "macos")]
    MacOs,
    Solaris,
    Irix,
    Hpux11,
    Hpux10,
    Windows,
    #[serde(rename = "win-2003")]
    Win2003,
    Vista,
    Proxy,
}

pub const ALL_POLICIES: [ReassemblyPolicy; 14] = [
    ReassemblyPolicy::First,
    ReassemblyPolicy::Last,
    ReassemblyPolicy::Linux,
    ReassemblyPolicy::OldLinux,
    ReassemblyPolicy::Bsd,
    ReassemblyPolicy::MacOs,
    ReassemblyPolicy::Solaris,
    ReassemblyPolicy::Irix,
    ReassemblyPolicy::Hpux11,
    ReassemblyPolicy::Hpux10,
    ReassemblyPolicy::Windows,
    ReassemblyPolicy::Win2003,
    ReassemblyPolicy::Vista,
    ReassemblyPolicy::Proxy,
];

/// How the new fragment sits against a retained one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapKind {
    Left,
    Right,
    Covers,
    Inside,
}

/// Whose bytes are kept in the overlapped range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Winner {
    Old,
    New,
}

/// Tag attached to overlap events: which geometry was seen and who won.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OverlapRule {
    pub kind: OverlapKind,
    pub winner: Winner,
}

impl fmt::Display for OverlapRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            OverlapKind::Left => "left",
            OverlapKind::Right => "right",
            OverlapKind::Covers => "covers",
            OverlapKind::Inside => "inside",
        };
        let winner = match self.winner {
            Winner::Old => "keep-old",
            Winner::New => "keep-new",
        };
        write!(f, "{kind}/{winner}")
    }
}

/// How two overlapping ranges sit against each other, regardless of which
/// arrived first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapShape {
    /// Each range sticks out on one side of the other.
    Staggered,
    /// One range contains the other.
    Nested,
    /// Both fragments claim exactly the same range.
    SameRange,
}

/// Whose bytes survived, named by sequence position where the shape allows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Survivor {
    LowerStart,
    HigherStart,
    Outer,
    Inner,
    FirstArrival,
    LastArrival,
}

/// Tag attached to overlap events. Two fragments resolved the same way give
/// the same tag in either arrival order; only same-range conflicts fall back
/// to arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OverlapTag {
    pub shape: OverlapShape,
    pub survivor: Survivor,
}

#[derive(Clone, Copy)]
enum CoverRule {
    KeepOld,
    KeepNew,
    NewIfStartsBefore,
    NewIfEndsAfter,
}

struct Rules {
    left: Winner,
    right: Winner,
    covers: CoverRule,
    inside: Winner,
}

impl ReassemblyPolicy {
    const fn rules(self) -> Rules {
        use CoverRule::{KeepNew, KeepOld, NewIfEndsAfter, NewIfStartsBefore};
        use Winner::{New, Old};
        match self {
            ReassemblyPolicy::First | ReassemblyPolicy::Vista | ReassemblyPolicy::Proxy => Rules {
                left: Old,
                right: Old,
                covers: KeepOld,
                inside: Old,
            },
            ReassemblyPolicy::Last | ReassemblyPolicy::Solaris | ReassemblyPolicy::Hpux11 => {
                Rules {
                    left: New,
                    right: New,
                    covers: KeepNew,
                    inside: New,
                }
            }
            ReassemblyPolicy::Linux | ReassemblyPolicy::Irix | ReassemblyPolicy::Hpux10 => Rules {
                left: Old,
                right: New,
                covers: KeepNew,
                inside: Old,
            },
            ReassemblyPolicy::OldLinux => Rules {
                left: Old,
                right: Old,
                covers: NewIfEndsAfter,
                inside: Old,
            },
            ReassemblyPolicy::Bsd
            | ReassemblyPolicy::MacOs
            | ReassemblyPolicy::Windows
            | ReassemblyPolicy::Win2003 => Rules {
                left: Old,
                right: Old,
                covers: NewIfStartsBefore,
                inside: Old,
            },
        }
    }

    /// Conventional lowercase name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            ReassemblyPolicy::First => "first",
            ReassemblyPolicy::Last => "last",
            ReassemblyPolicy::Linux => "linux",
            ReassemblyPolicy::OldLinux => "old-linux",
            ReassemblyPolicy::Bsd => "bsd",
            ReassemblyPolicy::MacOs => "macos",
            ReassemblyPolicy::Solaris => "solaris",
            ReassemblyPolicy::Irix => "irix",
            ReassemblyPolicy::Hpux11 => "hpux11",
            ReassemblyPolicy::Hpux10 => "hpux10",
            ReassemblyPolicy::Windows => "windows",
            ReassemblyPolicy::Win2003 => "win-2003",
            ReassemblyPolicy::Vista => "vista",
            ReassemblyPolicy::Proxy => "proxy",
        }
    }
}

impl fmt::Display for ReassemblyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ReassemblyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_POLICIES
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown reassembly policy: {s}"))
    }
}

/// Outcome of comparing a new fragment against one retained fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub kind: OverlapKind,
    pub start: SeqNum,
    pub end: SeqNum,
    pub winner: Winner,
    /// The two copies disagree somewhere in `[start, end)`.
    pub conflicting: bool,
    /// Both fragments span the same range.
    pub same_range: bool,
}

impl Resolution {
    #[must_use]
    pub fn rule(&self) -> OverlapRule {
        OverlapRule {
            kind: self.kind,
            winner: self.winner,
        }
    }

    #[must_use]
    pub fn tag(&self) -> OverlapTag {
        let old_won = self.winner == Winner::Old;
        let (shape, survivor) = match self.kind {
            OverlapKind::Inside if self.same_range => (
                OverlapShape::SameRange,
                if old_won {
                    Survivor::FirstArrival
                } else {
                    Survivor::LastArrival
                },
            ),
            OverlapKind::Inside => (
                OverlapShape::Nested,
                if old_won { Survivor::Outer } else { Survivor::Inner },
            ),
            OverlapKind::Covers => (
                OverlapShape::Nested,
                if old_won { Survivor::Inner } else { Survivor::Outer },
            ),
            OverlapKind::Left => (
                OverlapShape::Staggered,
                if old_won {
                    Survivor::LowerStart
                } else {
                    Survivor::HigherStart
                },
            ),
            OverlapKind::Right => (
                OverlapShape::Staggered,
                if old_won {
                    Survivor::HigherStart
                } else {
                    Survivor::LowerStart
                },
            ),
        };
        OverlapTag { shape, survivor }
    }

    #[must_use]
    pub fn len(&self) -> u32 {
        self.start.distance_to(self.end)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

fn end_of(start: SeqNum, bytes: &[u8]) -> SeqNum {
    // fragments are bounded by the 16-bit IP length, far below u32::MAX
    start + u32::try_from(bytes.len()).unwrap_or(u32::MAX)
}

fn offset(from: SeqNum, to: SeqNum) -> usize {
    from.distance_to(to) as usize
}

/// Decide who wins where `new` overlaps `old`. `None` if the ranges are disjoint.
///
/// Identical overlapped bytes never discard anything; the winner is then
/// reported as `Old` so callers keep what they already hold.
#[must_use]
pub fn resolve(
    policy: ReassemblyPolicy,
    old_start: SeqNum,
    old: &[u8],
    new_start: SeqNum,
    new: &[u8],
) -> Option<Resolution> {
    let old_end = end_of(old_start, old);
    let new_end = end_of(new_start, new);

    let start = old_start.max(new_start);
    let end = old_end.min(new_end);
    if !start.is_before(end) {
        return None;
    }

    let kind = if old_start.is_before_or_eq(new_start) && new_end.is_before_or_eq(old_end) {
        OverlapKind::Inside
    } else if new_start.is_before_or_eq(old_start) && old_end.is_before_or_eq(new_end) {
        OverlapKind::Covers
    } else if old_start.is_before(new_start) {
        OverlapKind::Left
    } else {
        OverlapKind::Right
    };

    let old_bytes = &old[offset(old_start, start)..offset(old_start, end)];
    let new_bytes = &new[offset(new_start, start)..offset(new_start, end)];
    let conflicting = old_bytes != new_bytes;

    let winner = if conflicting {
        let rules = policy.rules();
        match kind {
            OverlapKind::Left => rules.left,
            OverlapKind::Right => rules.right,
            OverlapKind::Inside => rules.inside,
            OverlapKind::Covers => match rules.covers {
                CoverRule::KeepOld => Winner::Old,
                CoverRule::KeepNew => Winner::New,
                CoverRule::NewIfStartsBefore if new_start.is_before(old_start) => Winner::New,
                CoverRule::NewIfEndsAfter if old_end.is_before(new_end) => Winner::New,
                CoverRule::NewIfStartsBefore | CoverRule::NewIfEndsAfter => Winner::Old,
            },
        }
    } else {
        Winner::Old
    };

    Some(Resolution {
        kind,
        start,
        end,
        winner,
        conflicting,
        same_range: old_start == new_start && old_end == new_end,
    })
}

/// Merge two overlapping fragments into one run covering both ranges.
///
/// Returns the start of the merged run, its bytes, and the resolution applied,
/// or `None` if the fragments do not overlap.
#[must_use]
pub fn merge(
    policy: ReassemblyPolicy,
    old_start: SeqNum,
    old: &[u8],
    new_start: SeqNum,
    new: &[u8],
) -> Option<(SeqNum, Vec<u8>, Resolution)> {
    let resolution = resolve(policy, old_start, old, new_start, new)?;

    let start = old_start.min(new_start);
    let end = end_of(old_start, old).max(end_of(new_start, new));
    let mut merged = vec![0u8; offset(start, end)];

    let (under, under_start, over, over_start) = match resolution.winner {
        Winner::Old => (new, new_start, old, old_start),
        Winner::New => (old, old_start, new, new_start),
    };
    let at = offset(start, under_start);
    merged[at..at + under.len()].copy_from_slice(under);
    let at = offset(start, over_start);
    merged[at..at + over.len()].copy_from_slice(over);

    Some((start, merged, resolution))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn s(n: u32) -> SeqNum {
        SeqNum::new(n)
    }

    #[test]
    fn test_disjoint_and_adjacent_do_not_overlap() {
        assert!(resolve(ReassemblyPolicy::Bsd, s(0), b"aaaa", s(4), b"bbbb").is_none());
        assert!(resolve(ReassemblyPolicy::Bsd, s(0), b"aaaa", s(10), b"bbbb").is_none());
    }

    #[rstest]
    #[case(s(5), b"xxxxxx".as_slice(), OverlapKind::Left)]
    #[case(s(0), b"xxxxxx".as_slice(), OverlapKind::Right)]
    #[case(s(1), b"xxxxxxxxxx".as_slice(), OverlapKind::Covers)]
    #[case(s(4), b"xx".as_slice(), OverlapKind::Inside)]
    #[case(s(3), b"xxxxx".as_slice(), OverlapKind::Inside)]
    fn test_geometry(#[case] new_start: SeqNum, #[case] new: &[u8], #[case] kind: OverlapKind) {
        let res = resolve(ReassemblyPolicy::Bsd, s(3), b"aaaaa", new_start, new).unwrap();
        assert_eq!(res.kind, kind);
        assert!(res.conflicting);
    }

    #[test]
    fn test_identical_bytes_keep_old_without_conflict() {
        let res = resolve(ReassemblyPolicy::Last, s(10), b"hello", s(12), b"llo!!").unwrap();
        assert!(!res.conflicting);
        assert_eq!(res.winner, Winner::Old);
        assert_eq!((res.start, res.end), (s(12), s(15)));
        assert_eq!(res.len(), 3);
    }

    #[rstest]
    #[case(ReassemblyPolicy::First, b"AAAAAAA".as_slice())]
    #[case(ReassemblyPolicy::Last, b"AABBBBB".as_slice())]
    #[case(ReassemblyPolicy::Linux, b"AAAAAAA".as_slice())]
    #[case(ReassemblyPolicy::Solaris, b"AABBBBB".as_slice())]
    #[case(ReassemblyPolicy::Bsd, b"AAAAAAA".as_slice())]
    fn test_left_overlap_merge(#[case] policy: ReassemblyPolicy, #[case] expected: &[u8]) {
        // old [0,5) "AAAAA", new [2,7) "BBBBB"
        let (start, merged, res) = merge(policy, s(0), b"AAAAA", s(2), b"BBBBB").unwrap();
        assert_eq!(start, s(0));
        assert_eq!(res.kind, OverlapKind::Left);
        // outside the overlap the new fragment's own tail always survives
        assert_eq!(&merged[..5], &expected[..5]);
        assert_eq!(&merged[5..], b"BB");
    }

    #[rstest]
    #[case(ReassemblyPolicy::Bsd, s(0), Winner::New)]
    #[case(ReassemblyPolicy::Bsd, s(2), Winner::Old)]
    #[case(ReassemblyPolicy::OldLinux, s(0), Winner::Old)]
    #[case(ReassemblyPolicy::OldLinux, s(2), Winner::New)]
    #[case(ReassemblyPolicy::Linux, s(2), Winner::New)]
    #[case(ReassemblyPolicy::Vista, s(0), Winner::Old)]
    fn test_cover_rules(
        #[case] policy: ReassemblyPolicy,
        #[case] new_start: SeqNum,
        #[case] winner: Winner,
    ) {
        // old [2,6); new either [0,6) (starts before) or [2,9) (ends after)
        let new: &[u8] = if new_start == s(0) { b"BBBBBB" } else { b"BBBBBBB" };
        let res = resolve(policy, s(2), b"AAAA", new_start, new).unwrap();
        assert_eq!(res.kind, OverlapKind::Covers);
        assert_eq!(res.winner, winner);
    }

    #[test]
    fn test_linux_partial_overlap_is_arrival_independent() {
        let a = (s(100), b"AAAAAAAA".as_slice());
        let b = (s(104), b"BBBBBBBB".as_slice());

        let (start_ab, ab, res_ab) = merge(ReassemblyPolicy::Linux, a.0, a.1, b.0, b.1).unwrap();
        let (start_ba, ba, res_ba) = merge(ReassemblyPolicy::Linux, b.0, b.1, a.0, a.1).unwrap();

        assert_eq!(start_ab, start_ba);
        assert_eq!(ab, ba);
        assert_eq!(ab, b"AAAAAAAABBBB");
        assert_eq!((res_ab.start, res_ab.end), (res_ba.start, res_ba.end));
    }

    #[rstest]
    #[case(s(104), b"BBBBBBBB".as_slice(), OverlapShape::Staggered, Survivor::LowerStart)]
    #[case(s(98), b"BBBBBBBBBBBB".as_slice(), OverlapShape::Nested, Survivor::Outer)]
    #[case(s(102), b"BB".as_slice(), OverlapShape::Nested, Survivor::Outer)]
    fn test_linux_tag_is_arrival_independent(
        #[case] b_start: SeqNum,
        #[case] b: &[u8],
        #[case] shape: OverlapShape,
        #[case] survivor: Survivor,
    ) {
        let a = (s(100), b"AAAAAAAA".as_slice());
        let ab = resolve(ReassemblyPolicy::Linux, a.0, a.1, b_start, b).unwrap();
        let ba = resolve(ReassemblyPolicy::Linux, b_start, b, a.0, a.1).unwrap();

        assert_ne!(ab.rule(), ba.rule());
        assert_eq!(ab.tag(), ba.tag());
        assert_eq!(ab.tag(), OverlapTag { shape, survivor });
    }

    #[test]
    fn test_same_range_tag_follows_arrival() {
        let first = resolve(ReassemblyPolicy::First, s(0), b"AAAA", s(0), b"BBBB").unwrap();
        let last = resolve(ReassemblyPolicy::Last, s(0), b"AAAA", s(0), b"BBBB").unwrap();
        assert_eq!(first.tag().shape, OverlapShape::SameRange);
        assert_eq!(first.tag().survivor, Survivor::FirstArrival);
        assert_eq!(last.tag().survivor, Survivor::LastArrival);
    }

    #[test]
    fn test_overlap_across_sequence_wrap() {
        let old_start = SeqNum::new(u32::MAX - 1);
        let res = resolve(ReassemblyPolicy::Last, old_start, b"AAAA", s(0), b"BBBB").unwrap();
        assert_eq!(res.kind, OverlapKind::Left);
        assert_eq!((res.start, res.end), (s(0), s(2)));
        assert_eq!(res.winner, Winner::New);
    }

    #[test]
    fn test_policy_names_round_trip() {
        for policy in ALL_POLICIES {
            assert_eq!(policy.name().parse::<ReassemblyPolicy>(), Ok(policy));
            let json = serde_json::to_string(&policy).unwrap();
            assert_eq!(json, format!("\"{}\"", policy.name()));
        }
        assert!("plan9".parse::<ReassemblyPolicy>().is_err());
    }

    #[test]
    fn test_rule_display() {
        let rule = OverlapRule {
            kind: OverlapKind::Covers,
            winner: Winner::New,
        };
        assert_eq!(rule.to_string(), "covers/keep-new");
    }
}
