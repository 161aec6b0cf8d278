//! Pure account-selection policies: sticky, hybrid, round-robin.
//!
//! `select` never touches the filesystem or the clock; callers pass the
//! account list, the current time, and (for sticky/hybrid) the mutable
//! session-affinity state. Cooldowns and leases mask accounts uniformly
//! across all policies.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::account::{AccountRecord, RotationStrategy};

/// In-memory sticky-session assignments: `sessionKey -> identityKey`, plus a
/// monotonic cursor for spreading brand-new sessions across accounts.
#[derive(Debug, Clone)]
pub struct StickySessionState {
    assignments: HashMap<String, String>,
    order: VecDeque<String>,
    cursor: u64,
    max_entries: usize,
}

impl StickySessionState {
    pub fn new(max_entries: usize) -> Self {
        Self {
            assignments: HashMap::new(),
            order: VecDeque::new(),
            cursor: 0,
            max_entries: max_entries.max(1),
        }
    }

    pub fn with_assignments(map: HashMap<String, String>, max_entries: usize) -> Self {
        let mut order: Vec<String> = map.keys().cloned().collect();
        order.sort();
        let mut state = Self {
            assignments: map,
            order: order.into(),
            cursor: 0,
            max_entries: max_entries.max(1),
        };
        state.enforce_cap();
        state
    }

    pub fn assignment(&self, session_key: &str) -> Option<&str> {
        self.assignments.get(session_key).map(String::as_str)
    }

    /// Record a binding; oldest bindings are evicted beyond the cap.
    pub fn bind(&mut self, session_key: &str, identity_key: &str) {
        if self
            .assignments
            .insert(session_key.to_string(), identity_key.to_string())
            .is_none()
        {
            self.order.push_back(session_key.to_string());
        }
        self.enforce_cap();
    }

    pub fn remove(&mut self, session_key: &str) {
        self.assignments.remove(session_key);
        self.order.retain(|k| k != session_key);
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn bump_cursor(&mut self) {
        self.cursor = self.cursor.wrapping_add(1);
    }

    pub fn assignments(&self) -> &HashMap<String, String> {
        &self.assignments
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    fn enforce_cap(&mut self) {
        while self.assignments.len() > self.max_entries {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.assignments.remove(&oldest);
                }
                None => break,
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SelectInput<'a> {
    pub accounts: &'a [AccountRecord],
    pub strategy: RotationStrategy,
    pub active_identity_key: Option<&'a str>,
    pub now_ms: i64,
    pub pid_offset: bool,
    pub pid: u32,
    pub session_key: Option<&'a str>,
    /// When false, selection may read affinity state but not mutate it
    /// (subagent requests observe stickiness without churning it).
    pub record_affinity: bool,
    /// Identities skipped this round (stale claims).
    pub excluded_identities: Option<&'a HashSet<String>>,
}

/// Why an account was (or was not) chosen; surfaced to debug hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationDecision {
    SessionAffinity {
        session_key: String,
        identity_key: String,
    },
    CursorAssigned {
        session_key: String,
        identity_key: String,
        cursor: u64,
    },
    ActiveRetained {
        identity_key: String,
    },
    FirstEligible {
        identity_key: String,
    },
    PidOffset {
        identity_key: String,
        slot: usize,
    },
    LeastRecentlyUsed {
        identity_key: String,
    },
    RoundRobinAdvanced {
        identity_key: String,
    },
    NoneEligible,
}

/// Pick an account index per the active policy, or `None` when every
/// account is masked. Total: never panics, never returns an ineligible row.
pub fn select(
    input: &SelectInput<'_>,
    mut sticky: Option<&mut StickySessionState>,
    on_decision: Option<&dyn Fn(&RotationDecision)>,
) -> Option<usize> {
    let emit = |decision: &RotationDecision| {
        if let Some(hook) = on_decision {
            hook(decision);
        }
    };

    let eligible: Vec<usize> = input
        .accounts
        .iter()
        .enumerate()
        .filter(|(_, a)| {
            a.is_eligible(input.now_ms)
                && !input
                    .excluded_identities
                    .is_some_and(|set| set.contains(&a.identity_key))
        })
        .map(|(i, _)| i)
        .collect();
    if eligible.is_empty() {
        emit(&RotationDecision::NoneEligible);
        return None;
    }

    let (idx, decision) = match input.strategy {
        RotationStrategy::Sticky => select_sticky(input, &eligible, &mut sticky),
        RotationStrategy::Hybrid => select_hybrid(input, &eligible, &mut sticky),
        RotationStrategy::RoundRobin => select_round_robin(input, &eligible),
    };

    // First request of a session binds it for sticky and hybrid.
    if input.record_affinity && input.strategy != RotationStrategy::RoundRobin {
        if let (Some(key), Some(state)) = (input.session_key, sticky.as_deref_mut()) {
            if state.assignment(key).is_none() {
                state.bind(key, &input.accounts[idx].identity_key);
            }
        }
    }

    emit(&decision);
    Some(idx)
}

fn identity_of<'a>(input: &SelectInput<'a>, idx: usize) -> &'a str {
    input.accounts[idx].identity_key.as_str()
}

fn find_eligible(input: &SelectInput<'_>, eligible: &[usize], identity_key: &str) -> Option<usize> {
    eligible
        .iter()
        .copied()
        .find(|&i| identity_of(input, i) == identity_key)
}

fn select_sticky(
    input: &SelectInput<'_>,
    eligible: &[usize],
    sticky: &mut Option<&mut StickySessionState>,
) -> (usize, RotationDecision) {
    if let Some(key) = input.session_key {
        if let Some(state) = sticky.as_deref_mut() {
            if let Some(identity) = state.assignment(key).map(str::to_string) {
                if let Some(idx) = find_eligible(input, eligible, &identity) {
                    return (
                        idx,
                        RotationDecision::SessionAffinity {
                            session_key: key.to_string(),
                            identity_key: identity,
                        },
                    );
                }
            } else if input.pid_offset {
                let slot = (state.cursor() % eligible.len() as u64) as usize;
                let idx = eligible[slot];
                if input.record_affinity {
                    state.bump_cursor();
                }
                return (
                    idx,
                    RotationDecision::CursorAssigned {
                        session_key: key.to_string(),
                        identity_key: identity_of(input, idx).to_string(),
                        cursor: state.cursor(),
                    },
                );
            }
        }
    }

    if let Some(active) = input.active_identity_key {
        if let Some(idx) = find_eligible(input, eligible, active) {
            return (
                idx,
                RotationDecision::ActiveRetained {
                    identity_key: active.to_string(),
                },
            );
        }
    }

    if input.pid_offset {
        let slot = input.pid as usize % eligible.len();
        let idx = eligible[slot];
        (
            idx,
            RotationDecision::PidOffset {
                identity_key: identity_of(input, idx).to_string(),
                slot,
            },
        )
    } else {
        let idx = eligible[0];
        (
            idx,
            RotationDecision::FirstEligible {
                identity_key: identity_of(input, idx).to_string(),
            },
        )
    }
}

fn lru_sort_key<'a>(input: &SelectInput<'a>, idx: usize) -> (i64, &'a str) {
    (
        input.accounts[idx].last_used.unwrap_or(0),
        identity_of(input, idx),
    )
}

fn select_hybrid(
    input: &SelectInput<'_>,
    eligible: &[usize],
    sticky: &mut Option<&mut StickySessionState>,
) -> (usize, RotationDecision) {
    if let Some(key) = input.session_key {
        if let Some(state) = sticky.as_deref_mut() {
            if let Some(identity) = state.assignment(key).map(str::to_string) {
                if let Some(idx) = find_eligible(input, eligible, &identity) {
                    return (
                        idx,
                        RotationDecision::SessionAffinity {
                            session_key: key.to_string(),
                            identity_key: identity,
                        },
                    );
                }
            } else if input.pid_offset {
                // Round-assign new sessions across accounts, coldest first.
                let mut sorted = eligible.to_vec();
                sorted.sort_by(|&a, &b| lru_sort_key(input, a).cmp(&lru_sort_key(input, b)));
                let slot = (state.cursor() % sorted.len() as u64) as usize;
                let idx = sorted[slot];
                if input.record_affinity {
                    state.bump_cursor();
                }
                return (
                    idx,
                    RotationDecision::CursorAssigned {
                        session_key: key.to_string(),
                        identity_key: identity_of(input, idx).to_string(),
                        cursor: state.cursor(),
                    },
                );
            }
        }
    }

    if let Some(active) = input.active_identity_key {
        if let Some(idx) = find_eligible(input, eligible, active) {
            return (
                idx,
                RotationDecision::ActiveRetained {
                    identity_key: active.to_string(),
                },
            );
        }
    }

    let idx = eligible
        .iter()
        .copied()
        .min_by(|&a, &b| lru_sort_key(input, a).cmp(&lru_sort_key(input, b)))
        .unwrap_or(eligible[0]);
    (
        idx,
        RotationDecision::LeastRecentlyUsed {
            identity_key: identity_of(input, idx).to_string(),
        },
    )
}

fn select_round_robin(input: &SelectInput<'_>, eligible: &[usize]) -> (usize, RotationDecision) {
    if let Some(active) = input.active_identity_key {
        if let Some(pos) = eligible
            .iter()
            .position(|&i| identity_of(input, i) == active)
        {
            let idx = eligible[(pos + 1) % eligible.len()];
            return (
                idx,
                RotationDecision::RoundRobinAdvanced {
                    identity_key: identity_of(input, idx).to_string(),
                },
            );
        }
    }

    if input.pid_offset {
        let slot = input.pid as usize % eligible.len();
        let idx = eligible[slot];
        (
            idx,
            RotationDecision::PidOffset {
                identity_key: identity_of(input, idx).to_string(),
                slot,
            },
        )
    } else {
        let idx = eligible[0];
        (
            idx,
            RotationDecision::FirstEligible {
                identity_key: identity_of(input, idx).to_string(),
            },
        )
    }
}
