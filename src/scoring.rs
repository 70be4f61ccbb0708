use crate::types::{Question, ScoringVariant};

/// Submissions arriving earlier than this after question dispatch are
/// rejected outright. Guards against scripted instant answers.
pub const MIN_ANSWER_MS: u64 = 400;

/// How many of the fastest correct responders earn the speed bonus.
pub const SPEED_BONUS_RANKS: usize = 5;
pub const SPEED_BONUS_POINTS: u32 = 20;

pub const FLAT_BASE_POINTS: u32 = 50;
pub const STREAK_BONUS_POINTS: u32 = 10;
/// Streak length at which the streak bonus kicks in.
pub const STREAK_BONUS_MIN: u32 = 3;

/// Window and count for the synchronized-answer advisory.
pub const SYNC_WINDOW_MS: u64 = 1000;
pub const SYNC_THRESHOLD: usize = 3;

/// Points awarded at answer time, before any reveal-time speed bonus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointsBreakdown {
    pub base: u32,
    pub streak_bonus: u32,
}

impl PointsBreakdown {
    pub fn total(&self) -> u32 {
        self.base + self.streak_bonus
    }
}

/// Client-reported time left is advisory input: clamp it to the question's
/// budget, never trust it beyond range.
pub fn clamp_time_left(raw: f64, budget_secs: u64) -> f64 {
    if !raw.is_finite() {
        return 0.0;
    }
    raw.clamp(0.0, budget_secs as f64)
}

fn double_multiplier(question: &Question) -> u32 {
    if question.double_points { 2 } else { 1 }
}

/// Score one submission under the room's point policy. `streak_after` is
/// the player's streak including this answer.
pub fn score_answer(
    variant: ScoringVariant,
    correct: bool,
    time_left: f64,
    question: &Question,
    streak_after: u32,
) -> PointsBreakdown {
    if !correct {
        return PointsBreakdown {
            base: 0,
            streak_bonus: 0,
        };
    }
    match variant {
        ScoringVariant::TimeDecay => {
            let clamped = clamp_time_left(time_left, question.time);
            let fraction = if question.time == 0 {
                0.0
            } else {
                clamped / question.time as f64
            };
            PointsBreakdown {
                base: (500.0 + fraction * 500.0).round() as u32,
                streak_bonus: 0,
            }
        }
        ScoringVariant::FlatBonus => {
            let streak_bonus = if streak_after >= STREAK_BONUS_MIN {
                STREAK_BONUS_POINTS
            } else {
                0
            };
            PointsBreakdown {
                base: FLAT_BASE_POINTS * double_multiplier(question),
                streak_bonus,
            }
        }
    }
}

/// Speed-bonus points for one awarded rank.
pub fn speed_bonus_points(question: &Question) -> u32 {
    SPEED_BONUS_POINTS * double_multiplier(question)
}

/// Pick the indices of the fastest correct responders, ranked by elapsed
/// time. `records` is in arrival order; ties keep the earlier arrival, so
/// the ranking is stable.
pub fn speed_bonus_ranking(records: &[(u64, bool)], top_n: usize) -> Vec<usize> {
    let mut correct: Vec<(usize, u64)> = records
        .iter()
        .enumerate()
        .filter(|(_, (_, ok))| *ok)
        .map(|(i, (elapsed, _))| (i, *elapsed))
        .collect();
    // sort_by_key is stable, so arrival order breaks elapsed-time ties
    correct.sort_by_key(|&(_, elapsed)| elapsed);
    correct.into_iter().take(top_n).map(|(i, _)| i).collect()
}

/// Per-question log of `(name, receive time, correct)` receipts, watching
/// for suspiciously synchronized submissions. Informational only: the
/// advisory fires at most once per question and never blocks scoring.
#[derive(Debug, Default)]
pub struct SyncWatch {
    receipts: Vec<(String, u64, bool)>,
    flagged: bool,
}

impl SyncWatch {
    pub fn reset(&mut self) {
        self.receipts.clear();
        self.flagged = false;
    }

    /// Record one receipt. Returns the `(name, correct)` pairs inside the
    /// window the first time `SYNC_THRESHOLD` answers land within
    /// `SYNC_WINDOW_MS`, so the host can tell coordinated correct answers
    /// from a coincidental pile-up of wrong ones.
    pub fn record(&mut self, name: &str, recv_ms: u64, correct: bool) -> Option<Vec<(String, bool)>> {
        self.receipts.push((name.to_string(), recv_ms, correct));
        if self.flagged || self.receipts.len() < SYNC_THRESHOLD {
            return None;
        }
        let window_start = recv_ms.saturating_sub(SYNC_WINDOW_MS);
        let in_window: Vec<(String, bool)> = self
            .receipts
            .iter()
            .filter(|(_, t, _)| *t >= window_start)
            .map(|(n, _, c)| (n.clone(), *c))
            .collect();
        if in_window.len() >= SYNC_THRESHOLD {
            self.flagged = true;
            Some(in_window)
        } else {
            None
        }
    }
}
