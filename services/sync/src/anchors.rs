//! services/sync/src/anchors.rs
//!
//! Turns raw aligner output into a monotone sync curve: greedy thinning of
//! crowded anchors, synthetic endpoints, time→position interpolation (and
//! its inverse, used to seed progressive audio extraction), and the merge
//! applied when progressive chunks commit new anchors.

use audiosync_core::domain::SyncAnchor;

use crate::config::SyncConfig;

/// Confidence recorded on synthetic endpoint anchors.
const SYNTHETIC_CONFIDENCE: f64 = 1.0;
/// A leading anchor later than this gets a `(0, 0)` prepended.
const LEAD_IN_SEC: f64 = 5.0;
/// A trailing anchor earlier than `duration - TAIL_SEC` gets an endpoint
/// appended.
const TAIL_SEC: f64 = 30.0;

//=========================================================================================
// Anchor selection
//=========================================================================================

/// Reduces a raw anchor set to a well-spaced, time-ordered curve covering
/// the whole audio.
///
/// Highest-confidence anchors win; an anchor is only accepted when it is at
/// least `anchor_min_gap_sec` and `anchor_min_gap_chars` away from every
/// anchor already accepted. Synthetic `(0, 0)` and
/// `(total_duration, total_text_len)` endpoints are added when the observed
/// anchors do not reach the edges — including when there are no observed
/// anchors at all.
pub fn select_anchors(
    raw: &[SyncAnchor],
    total_duration: f64,
    total_text_len: usize,
    config: &SyncConfig,
) -> Vec<SyncAnchor> {
    let mut by_confidence: Vec<SyncAnchor> = raw.to_vec();
    by_confidence.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then(a.audio_time.total_cmp(&b.audio_time))
    });

    let mut accepted: Vec<SyncAnchor> = Vec::new();
    for candidate in by_confidence {
        let far_enough = accepted.iter().all(|kept| {
            (candidate.audio_time - kept.audio_time).abs() >= config.anchor_min_gap_sec
                && candidate.char_index.abs_diff(kept.char_index) >= config.anchor_min_gap_chars
        });
        if far_enough {
            accepted.push(candidate);
        }
    }

    accepted.sort_by(|a, b| a.audio_time.total_cmp(&b.audio_time));

    let needs_lead_in = accepted.first().map_or(true, |a| a.audio_time > LEAD_IN_SEC);
    if needs_lead_in {
        accepted.insert(
            0,
            SyncAnchor {
                audio_time: 0.0,
                char_index: 0,
                confidence: SYNTHETIC_CONFIDENCE,
            },
        );
    }
    let needs_tail = accepted
        .last()
        .map_or(true, |a| a.audio_time < total_duration - TAIL_SEC);
    if needs_tail {
        accepted.push(SyncAnchor {
            audio_time: total_duration,
            char_index: total_text_len,
            confidence: SYNTHETIC_CONFIDENCE,
        });
    }

    accepted
}

//=========================================================================================
// Merge
//=========================================================================================

/// Merges two anchor sets into one time-ordered set with no two anchors
/// inside the `(merge_window_sec, merge_window_chars)` collapse window.
///
/// When anchors collide, the higher confidence wins; at equal confidence the
/// earlier `audio_time` wins. The operation treats both inputs uniformly, so
/// it is insensitive to argument order and to merging with an empty set.
pub fn merge_anchors(
    existing: &[SyncAnchor],
    incoming: &[SyncAnchor],
    config: &SyncConfig,
) -> Vec<SyncAnchor> {
    let mut all: Vec<SyncAnchor> = existing.iter().chain(incoming.iter()).copied().collect();
    all.sort_by(|a, b| {
        a.audio_time
            .total_cmp(&b.audio_time)
            .then(b.confidence.total_cmp(&a.confidence))
            .then(a.char_index.cmp(&b.char_index))
    });

    let mut kept: Vec<SyncAnchor> = Vec::new();
    for candidate in all {
        // Only anchors in the trailing time window can collide.
        let mut conflicts: Vec<usize> = Vec::new();
        for (idx, anchor) in kept.iter().enumerate().rev() {
            if candidate.audio_time - anchor.audio_time >= config.anchor_merge_window_sec {
                break;
            }
            if candidate.char_index.abs_diff(anchor.char_index) < config.anchor_merge_window_chars {
                conflicts.push(idx);
            }
        }

        if conflicts.is_empty() {
            kept.push(candidate);
            continue;
        }

        let best_existing = conflicts
            .iter()
            .map(|&idx| kept[idx].confidence)
            .fold(f64::MIN, f64::max);
        // Earlier anchors win ties, and `kept` holds the earlier ones.
        if candidate.confidence > best_existing {
            for &idx in &conflicts {
                kept.remove(idx);
            }
            kept.push(candidate);
        }
    }

    kept.sort_by(|a, b| a.audio_time.total_cmp(&b.audio_time));
    kept
}

//=========================================================================================
// Interpolation
//=========================================================================================

/// A time-ordered anchor set answering "given audio time t, what text
/// position?" and the inverse.
#[derive(Debug, Clone, Default)]
pub struct AnchorCurve {
    anchors: Vec<SyncAnchor>,
}

impl AnchorCurve {
    pub fn new(mut anchors: Vec<SyncAnchor>) -> Self {
        anchors.sort_by(|a, b| a.audio_time.total_cmp(&b.audio_time));
        Self { anchors }
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    /// Linear interpolation between the bracketing anchors. Times outside
    /// the anchored range clamp to the nearest anchor's position.
    pub fn position_for(&self, t: f64) -> usize {
        let anchors = &self.anchors;
        match anchors.len() {
            0 => return 0,
            1 => return anchors[0].char_index,
            _ => {}
        }
        if t <= anchors[0].audio_time {
            return anchors[0].char_index;
        }
        if t >= anchors[anchors.len() - 1].audio_time {
            return anchors[anchors.len() - 1].char_index;
        }

        let upper = anchors.partition_point(|a| a.audio_time <= t);
        let a = anchors[upper - 1];
        let b = anchors[upper.min(anchors.len() - 1)];
        let span = b.audio_time - a.audio_time;
        if span <= f64::EPSILON {
            return a.char_index;
        }
        let fraction = (t - a.audio_time) / span;
        let delta = b.char_index as f64 - a.char_index as f64;
        (a.char_index as f64 + fraction * delta).round().max(0.0) as usize
    }

    /// Inverse interpolation: the audio time at which the narrator reaches
    /// `char_index`. Positions outside the anchored range clamp to the
    /// nearest anchor's time.
    pub fn time_for(&self, char_index: usize) -> f64 {
        let anchors = &self.anchors;
        match anchors.len() {
            0 => return 0.0,
            1 => return anchors[0].audio_time,
            _ => {}
        }
        if char_index <= anchors[0].char_index {
            return anchors[0].audio_time;
        }
        if char_index >= anchors[anchors.len() - 1].char_index {
            return anchors[anchors.len() - 1].audio_time;
        }

        for pair in anchors.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            if a.char_index <= char_index && char_index <= b.char_index {
                let span = b.char_index as f64 - a.char_index as f64;
                if span <= f64::EPSILON {
                    return a.audio_time;
                }
                let fraction = (char_index - a.char_index) as f64 / span;
                return a.audio_time + fraction * (b.audio_time - a.audio_time);
            }
        }
        anchors[anchors.len() - 1].audio_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anchor(t: f64, c: usize, conf: f64) -> SyncAnchor {
        SyncAnchor {
            audio_time: t,
            char_index: c,
            confidence: conf,
        }
    }

    fn config() -> SyncConfig {
        SyncConfig::default()
    }

    #[test]
    fn selection_prefers_confidence_and_enforces_spacing() {
        let raw = vec![
            anchor(100.0, 5000, 0.9),
            // Too close to the first in both dimensions; lower confidence.
            anchor(110.0, 5200, 0.7),
            anchor(400.0, 20000, 0.8),
        ];
        let selected = select_anchors(&raw, 3600.0, 60000, &config());

        // (0,0) lead-in + two accepted + synthetic endpoint.
        assert_eq!(selected.len(), 4);
        assert_eq!(selected[0].char_index, 0);
        assert_eq!(selected[1].char_index, 5000);
        assert_eq!(selected[2].char_index, 20000);
        assert_eq!(selected[3].char_index, 60000);
        assert!((selected[3].audio_time - 3600.0).abs() < f64::EPSILON);
    }

    #[test]
    fn no_lead_in_when_first_anchor_is_early() {
        let raw = vec![anchor(3.0, 40, 0.9)];
        let selected = select_anchors(&raw, 3600.0, 60000, &config());
        assert_eq!(selected[0].char_index, 40);
    }

    #[test]
    fn no_tail_when_last_anchor_is_near_the_end() {
        let raw = vec![anchor(3590.0, 59000, 0.9)];
        let selected = select_anchors(&raw, 3600.0, 60000, &config());
        assert_eq!(selected.last().unwrap().char_index, 59000);
        // But the lead-in was still needed.
        assert_eq!(selected[0].char_index, 0);
    }

    #[test]
    fn empty_raw_set_still_yields_endpoints() {
        let selected = select_anchors(&[], 1800.0, 30000, &config());
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].char_index, 0);
        assert_eq!(selected[1].char_index, 30000);
    }

    #[test]
    fn merge_collapses_close_pairs_keeping_higher_confidence() {
        let cfg = config();
        let a = vec![anchor(10.0, 100, 0.6)];
        let b = vec![anchor(10.5, 105, 0.9)];
        let merged = merge_anchors(&a, &b, &cfg);
        assert_eq!(merged.len(), 1);
        assert!((merged[0].confidence - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn merge_keeps_pairs_outside_the_window() {
        let cfg = config();
        // Close in time but far apart in text: both survive.
        let a = vec![anchor(10.0, 100, 0.6)];
        let b = vec![anchor(10.5, 400, 0.9)];
        assert_eq!(merge_anchors(&a, &b, &cfg).len(), 2);
    }

    #[test]
    fn merge_tie_breaks_to_earlier_time() {
        let cfg = config();
        let a = vec![anchor(10.0, 100, 0.8)];
        let b = vec![anchor(10.4, 103, 0.8)];
        let merged = merge_anchors(&a, &b, &cfg);
        assert_eq!(merged.len(), 1);
        assert!((merged[0].audio_time - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn merge_with_empty_is_identity_and_order_insensitive() {
        let cfg = config();
        let a = vec![anchor(5.0, 50, 0.7), anchor(60.0, 900, 0.8)];
        let b = vec![anchor(5.2, 55, 0.9)];

        let ab = merge_anchors(&a, &b, &cfg);
        let ba = merge_anchors(&b, &a, &cfg);
        let ab_then_empty = merge_anchors(&ab, &[], &cfg);

        assert_eq!(ab, ba);
        assert_eq!(ab, ab_then_empty);
    }

    #[test]
    fn merge_result_has_no_close_pairs() {
        let cfg = config();
        let a: Vec<SyncAnchor> = (0..20)
            .map(|i| anchor(i as f64 * 0.3, i * 3, 0.5 + (i % 5) as f64 * 0.05))
            .collect();
        let merged = merge_anchors(&a, &[], &cfg);
        for pair in merged.windows(2) {
            let close_time =
                (pair[1].audio_time - pair[0].audio_time).abs() < cfg.anchor_merge_window_sec;
            let close_chars =
                pair[1].char_index.abs_diff(pair[0].char_index) < cfg.anchor_merge_window_chars;
            assert!(!(close_time && close_chars));
        }
    }

    #[test]
    fn interpolation_edge_cases() {
        assert_eq!(AnchorCurve::new(vec![]).position_for(10.0), 0);
        assert_eq!(
            AnchorCurve::new(vec![anchor(10.0, 500, 0.9)]).position_for(99.0),
            500
        );
        // Zero-width bracket.
        let curve = AnchorCurve::new(vec![anchor(10.0, 500, 0.9), anchor(10.0, 900, 0.8)]);
        assert_eq!(curve.position_for(10.0), 500);
    }

    #[test]
    fn interpolation_is_linear_between_anchors() {
        let curve = AnchorCurve::new(vec![anchor(0.0, 0, 1.0), anchor(100.0, 1000, 1.0)]);
        assert_eq!(curve.position_for(50.0), 500);
        assert_eq!(curve.position_for(25.0), 250);
        // Clamping outside the range.
        assert_eq!(curve.position_for(-5.0), 0);
        assert_eq!(curve.position_for(500.0), 1000);
    }

    #[test]
    fn inverse_interpolation_round_trips() {
        let curve = AnchorCurve::new(vec![anchor(0.0, 0, 1.0), anchor(100.0, 1000, 1.0)]);
        assert!((curve.time_for(500) - 50.0).abs() < 1e-9);
        assert!((curve.time_for(0) - 0.0).abs() < 1e-9);
        assert!((curve.time_for(5000) - 100.0).abs() < 1e-9);
    }
}
