// SPDX-License-Identifier: GPL-2.0-or-later

// Selection of fragments to move or delete for one (camera, tier)
// sweep. Pure over in-memory projections of the index rows so every
// edge case is testable without a database.
//
// Continuous and event retention coexist: a fragment may be required
// by an event while the continuous policy no longer wants it, and the
// other way around. Fragments are labelled with the recordings they
// participate in first, then each policy computes its candidate set,
// then a per-fragment decision merges the two.

use crate::config::RetentionParams;
use common::time::{Duration, UnixNano};
use std::collections::{HashMap, HashSet};

/// Projection of a fragment row for selection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FragmentInfo {
    pub file_id: i64,
    pub size: u64,
    pub orig_ctime: UnixNano,

    /// Recordings this fragment participates in, empty for
    /// continuous-only footage.
    pub recording_ids: Vec<i64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordingMeta {
    pub id: i64,
    pub created_at: UnixNano,
}

/// Where a fragment interval lands relative to a recording window.
/// The window is `[start - lookback - segment_length, end + segment_length]`
/// with an open end while the recording is active.
#[must_use]
pub fn fragment_in_window(
    orig_ctime: UnixNano,
    window_start: UnixNano,
    window_end: UnixNano,
) -> bool {
    !orig_ctime.before(window_start) && !orig_ctime.after(window_end)
}

/// Labels each fragment with the ids of the recordings it belongs to.
#[must_use]
pub fn label_fragments(
    fragments: &mut [FragmentInfo],
    recordings: &[(RecordingMeta, UnixNano, UnixNano)],
) {
    for fragment in fragments {
        fragment.recording_ids = recordings
            .iter()
            .filter(|(_, start, end)| fragment_in_window(fragment.orig_ctime, *start, *end))
            .map(|(meta, _, _)| meta.id)
            .collect();
    }
}

/// Continuous candidate set, oldest forward. A fragment is included
/// when the tier is over its byte budget and the fragment is old
/// enough, or the fragment exceeded max age and the tier stays above
/// its size floor. The trailing `lookback` seconds are always
/// preserved so events keep their pre-roll.
#[must_use]
pub fn continuous_candidates(
    fragments: &[FragmentInfo],
    params: &RetentionParams,
    lookback: Duration,
    now: UnixNano,
) -> HashSet<i64> {
    let mut remaining: u64 = fragments.iter().map(|f| f.size).sum();
    let mut out = HashSet::new();

    let lookback_cut = now.sub_duration(lookback).unwrap_or(UnixNano::new(0));
    let min_age_cut = now.sub_duration(params.min_age).unwrap_or(now);
    let max_age_cut = params
        .max_age
        .and_then(|max_age| now.sub_duration(max_age));

    for fragment in fragments {
        if fragment.orig_ctime.after(lookback_cut) {
            continue;
        }

        let over_size = params.max_bytes > 0
            && remaining > params.max_bytes
            && !fragment.orig_ctime.after(min_age_cut);
        let over_age = max_age_cut
            .is_some_and(|cut| !fragment.orig_ctime.after(cut))
            && remaining >= params.min_bytes;

        if over_size || over_age {
            out.insert(fragment.file_id);
            remaining = remaining.saturating_sub(fragment.size);
        }
    }
    out
}

/// Event candidate set: whole recordings, oldest first by creation
/// time. Either the cumulative event bytes exceed the budget and the
/// recording is old enough, or the recording exceeded max age and the
/// remaining event bytes stay above the floor.
#[must_use]
pub fn event_candidates(
    fragments: &[FragmentInfo],
    recordings: &[RecordingMeta],
    params: &RetentionParams,
    now: UnixNano,
) -> HashSet<i64> {
    let mut recording_sizes: HashMap<i64, u64> = HashMap::new();
    for fragment in fragments {
        for id in &fragment.recording_ids {
            *recording_sizes.entry(*id).or_insert(0) += fragment.size;
        }
    }

    let mut remaining: u64 = recording_sizes.values().sum();
    let min_age_cut = now.sub_duration(params.min_age).unwrap_or(now);
    let max_age_cut = params
        .max_age
        .and_then(|max_age| now.sub_duration(max_age));

    let mut ordered: Vec<&RecordingMeta> = recordings.iter().collect();
    ordered.sort_by_key(|r| r.created_at);

    let mut selected_recordings = HashSet::new();
    for recording in ordered {
        let size = recording_sizes.get(&recording.id).copied().unwrap_or(0);

        let over_size = params.max_bytes > 0
            && remaining > params.max_bytes
            && !recording.created_at.after(min_age_cut);
        let over_age = max_age_cut
            .is_some_and(|cut| !recording.created_at.after(cut))
            && remaining >= params.min_bytes;

        if over_size || over_age {
            selected_recordings.insert(recording.id);
            remaining = remaining.saturating_sub(size);
        }
    }

    fragments
        .iter()
        .filter(|f| {
            !f.recording_ids.is_empty()
                && f.recording_ids
                    .iter()
                    .all(|id| selected_recordings.contains(id))
        })
        .map(|f| f.file_id)
        .collect()
}

/// Selects every fragment, used by the shutdown drain.
#[must_use]
pub fn drain_candidates(fragments: &[FragmentInfo]) -> HashSet<i64> {
    fragments.iter().map(|f| f.file_id).collect()
}

/// On a camera without continuous recording, footage outside every
/// event has no retention role at all. It is dropped once it can no
/// longer become the pre-roll of a future event.
#[must_use]
pub fn orphan_candidates(
    fragments: &[FragmentInfo],
    horizon: Duration,
    now: UnixNano,
) -> HashSet<i64> {
    let Some(cut) = now.sub_duration(horizon) else {
        return HashSet::new();
    };
    fragments
        .iter()
        .filter(|f| f.recording_ids.is_empty() && !f.orig_ctime.after(cut))
        .map(|f| f.file_id)
        .collect()
}

/// The next tier a fragment moves to, by role.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NextTiers {
    pub events: Option<usize>,
    pub continuous: Option<usize>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileAction {
    Keep,
    MoveTo(usize),
    Delete,
}

/// Per-fragment decision. Event footage follows the events chain,
/// continuous footage the continuous chain, a fragment wanted by both
/// goes to whichever next tier has the lower index. No next tier for
/// the fragment's role means deletion.
#[must_use]
pub fn decide(
    fragment: &FragmentInfo,
    in_events: bool,
    in_continuous: bool,
    next: NextTiers,
) -> FileAction {
    let in_recording = !fragment.recording_ids.is_empty();

    if in_recording {
        if !in_events {
            return FileAction::Keep;
        }
        return match (next.events, in_continuous.then_some(next.continuous).flatten()) {
            (Some(e), Some(c)) => FileAction::MoveTo(e.min(c)),
            (Some(e), None) => FileAction::MoveTo(e),
            (None, Some(c)) => FileAction::MoveTo(c),
            (None, None) => FileAction::Delete,
        };
    }

    if !in_continuous {
        return FileAction::Keep;
    }
    match next.continuous {
        Some(c) => FileAction::MoveTo(c),
        None => FileAction::Delete,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use common::time::SECOND;
    use pretty_assertions::assert_eq;

    fn frag(file_id: i64, secs: i64, size: u64, recording_ids: &[i64]) -> FragmentInfo {
        FragmentInfo {
            file_id,
            size,
            orig_ctime: UnixNano::from_secs(secs),
            recording_ids: recording_ids.to_vec(),
        }
    }

    fn params(max_bytes: u64, max_age_secs: Option<i64>) -> RetentionParams {
        RetentionParams {
            max_bytes,
            min_bytes: 0,
            max_age: max_age_secs.map(|s| Duration::new(s * SECOND)),
            min_age: Duration::default(),
        }
    }

    #[test]
    fn test_label_fragments() {
        let mut fragments = vec![frag(1, 100, 10, &[]), frag(2, 200, 10, &[])];
        let recordings = vec![(
            RecordingMeta {
                id: 7,
                created_at: UnixNano::from_secs(195),
            },
            UnixNano::from_secs(190),
            UnixNano::from_secs(210),
        )];
        label_fragments(&mut fragments, &recordings);
        assert!(fragments[0].recording_ids.is_empty());
        assert_eq!(vec![7], fragments[1].recording_ids);
    }

    #[test]
    fn test_continuous_size_limit_oldest_first() {
        // Six 10-byte fragments, budget 40 bytes.
        let fragments: Vec<FragmentInfo> =
            (0..6).map(|i| frag(i, i * 10, 10, &[])).collect();
        let got = continuous_candidates(
            &fragments,
            &params(40, None),
            Duration::default(),
            UnixNano::from_secs(100),
        );
        assert_eq!(HashSet::from([0, 1]), got);
    }

    #[test]
    fn test_continuous_max_age() {
        let fragments = vec![frag(0, 0, 10, &[]), frag(1, 90, 10, &[])];
        let got = continuous_candidates(
            &fragments,
            &params(0, Some(50)),
            Duration::default(),
            UnixNano::from_secs(100),
        );
        assert_eq!(HashSet::from([0]), got);
    }

    #[test]
    fn test_continuous_preserves_lookback() {
        // Everything is over age but the trailing five seconds stay.
        let fragments = vec![frag(0, 90, 10, &[]), frag(1, 97, 10, &[])];
        let got = continuous_candidates(
            &fragments,
            &params(0, Some(1)),
            Duration::new(5 * SECOND),
            UnixNano::from_secs(100),
        );
        assert_eq!(HashSet::from([0]), got);
    }

    #[test]
    fn test_continuous_min_bytes_floor() {
        let fragments = vec![frag(0, 0, 10, &[]), frag(1, 10, 10, &[])];
        let p = RetentionParams {
            max_bytes: 0,
            min_bytes: 20,
            max_age: Some(Duration::new(SECOND)),
            min_age: Duration::default(),
        };
        let got = continuous_candidates(
            &fragments,
            &p,
            Duration::default(),
            UnixNano::from_secs(100),
        );
        // Deleting the first fragment would drop below the floor
        // afterwards, so only it is selected.
        assert_eq!(HashSet::from([0]), got);
    }

    // Two events of three and two fragments, byte budget forces the
    // oldest event out wholesale.
    #[test]
    fn test_event_size_limit_drops_oldest_event() {
        let fragments = vec![
            frag(0, 0, 10, &[1]),
            frag(1, 10, 10, &[1]),
            frag(2, 20, 10, &[1]),
            frag(3, 100, 10, &[2]),
            frag(4, 110, 10, &[2]),
        ];
        let recordings = vec![
            RecordingMeta {
                id: 1,
                created_at: UnixNano::from_secs(0),
            },
            RecordingMeta {
                id: 2,
                created_at: UnixNano::from_secs(100),
            },
        ];
        let got = event_candidates(
            &fragments,
            &recordings,
            &params(30, None),
            UnixNano::from_secs(200),
        );
        assert_eq!(HashSet::from([0, 1, 2]), got);
    }

    #[test]
    fn test_event_candidates_shared_fragment_not_selected() {
        // Fragment 1 belongs to both events, only event 1 expired.
        let fragments = vec![
            frag(0, 0, 10, &[1]),
            frag(1, 10, 10, &[1, 2]),
            frag(2, 100, 10, &[2]),
        ];
        let recordings = vec![
            RecordingMeta {
                id: 1,
                created_at: UnixNano::from_secs(0),
            },
            RecordingMeta {
                id: 2,
                created_at: UnixNano::from_secs(100),
            },
        ];
        let got = event_candidates(
            &fragments,
            &recordings,
            &params(0, Some(150)),
            UnixNano::from_secs(200),
        );
        assert_eq!(HashSet::from([0]), got);
    }

    #[test]
    fn test_decide_event_fragment() {
        let f = frag(0, 0, 10, &[1]);
        let next = NextTiers {
            events: Some(1),
            continuous: None,
        };
        assert_eq!(FileAction::MoveTo(1), decide(&f, true, false, next));
        assert_eq!(FileAction::Keep, decide(&f, false, true, next));
        assert_eq!(
            FileAction::Delete,
            decide(&f, true, false, NextTiers::default())
        );
    }

    #[test]
    fn test_decide_continuous_fragment() {
        let f = frag(0, 0, 10, &[]);
        let next = NextTiers {
            events: Some(1),
            continuous: Some(2),
        };
        assert_eq!(FileAction::MoveTo(2), decide(&f, false, true, next));
        assert_eq!(FileAction::Keep, decide(&f, true, false, next));
        assert_eq!(
            FileAction::Delete,
            decide(&f, false, true, NextTiers::default())
        );
    }

    #[test]
    fn test_decide_both_sets_lower_tier_wins() {
        let f = frag(0, 0, 10, &[1]);
        let next = NextTiers {
            events: Some(3),
            continuous: Some(1),
        };
        assert_eq!(FileAction::MoveTo(1), decide(&f, true, true, next));
    }

    #[test]
    fn test_drain_selects_everything() {
        let fragments = vec![frag(0, 0, 10, &[]), frag(1, 99, 10, &[7])];
        assert_eq!(HashSet::from([0, 1]), drain_candidates(&fragments));
    }

    #[test]
    fn test_orphan_candidates() {
        let fragments = vec![
            frag(0, 0, 10, &[]),
            frag(1, 10, 10, &[7]),
            frag(2, 95, 10, &[]),
        ];
        let got = orphan_candidates(
            &fragments,
            Duration::new(10 * SECOND),
            UnixNano::from_secs(100),
        );
        // Event footage and anything inside the lookback horizon stays.
        assert_eq!(HashSet::from([0]), got);
    }
}
