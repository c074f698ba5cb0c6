//! Section negotiation state machine — statuses, transitions, contest history.
//!
//! ```text
//! unclaimed ──claim──▶ claimed ──second claimant──▶ contested ◀──┐
//!                         ▲                             │  new round
//!                         └────────── resolve ──────────┴─────────┘
//! claimed / contested ──freeze──▶ frozen (terminal)
//! ```
//!
//! Transitions are driven by negotiation events applied by the projection;
//! every transition returns a new record.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Negotiation status of a section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionStatus {
    /// Nobody has claimed the section.
    Unclaimed,
    /// Exactly one claimant, or a contest was settled.
    Claimed,
    /// Two or more competing claims.
    Contested,
    /// Locked; no further negotiation.
    Frozen,
}

impl SectionStatus {
    /// Whether this is a terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Frozen)
    }

    /// Valid transitions from this status.
    pub fn valid_transitions(self) -> &'static [SectionStatus] {
        match self {
            Self::Unclaimed => &[Self::Claimed, Self::Contested],
            Self::Claimed => &[Self::Contested, Self::Frozen],
            Self::Contested => &[Self::Contested, Self::Claimed, Self::Frozen],
            Self::Frozen => &[],
        }
    }

    pub fn can_transition_to(self, next: SectionStatus) -> bool {
        self.valid_transitions().contains(&next)
    }
}

impl std::fmt::Display for SectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unclaimed => write!(f, "unclaimed"),
            Self::Claimed => write!(f, "claimed"),
            Self::Contested => write!(f, "contested"),
            Self::Frozen => write!(f, "frozen"),
        }
    }
}

/// One contest round on a section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContestEvent {
    /// Global round number.
    pub round: u32,
    /// Claimants competing in this round.
    pub claimants: Vec<String>,
    /// How the round was settled, once it is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    /// Who won the round, once settled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner: Option<String>,
}

impl ContestEvent {
    pub fn open(round: u32, claimants: Vec<String>) -> Self {
        Self {
            round,
            claimants,
            resolution: None,
            winner: None,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.winner.is_some()
    }
}

/// Externally visible negotiation record for one section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionNegotiationState {
    pub section_name: String,
    pub status: SectionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Distinct participant ids, in first-claim order.
    pub claimants: Vec<String>,
    /// Append-only; only the last entry's resolution is ever filled in.
    pub contest_history: Vec<ContestEvent>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub proposals: BTreeMap<String, String>,
}

/// Remove repeated ids, keeping first occurrences in order.
fn dedup_claimants(claimants: Vec<String>) -> Vec<String> {
    let mut unique: Vec<String> = Vec::with_capacity(claimants.len());
    for claimant in claimants {
        if !unique.contains(&claimant) {
            unique.push(claimant);
        }
    }
    unique
}

impl SectionNegotiationState {
    /// A section nobody has claimed yet.
    pub fn unclaimed(section_name: impl Into<String>) -> Self {
        Self {
            section_name: section_name.into(),
            status: SectionStatus::Unclaimed,
            owner: None,
            claimants: Vec::new(),
            contest_history: Vec::new(),
            proposals: BTreeMap::new(),
        }
    }

    /// A section seen for the first time through a claim.
    pub fn first_claim(section_name: impl Into<String>, claimant: impl Into<String>) -> Self {
        Self {
            status: SectionStatus::Claimed,
            claimants: vec![claimant.into()],
            ..Self::unclaimed(section_name)
        }
    }

    /// Register a claim. A second distinct claimant makes the section contested.
    pub fn with_claim(&self, claimant: &str) -> Self {
        if self.status.is_terminal() {
            return self.clone();
        }

        let mut next = self.clone();
        if !next.claimants.iter().any(|c| c == claimant) {
            next.claimants.push(claimant.to_string());
        }
        if next.claimants.len() > 1 {
            next.status = SectionStatus::Contested;
        } else if next.status == SectionStatus::Unclaimed {
            next.status = SectionStatus::Claimed;
        }
        next
    }

    /// Open a contest round. Claimants are replaced by the round's claimants.
    pub fn with_contest(&self, round: u32, claimants: Vec<String>) -> Self {
        if self.status.is_terminal() {
            return self.clone();
        }

        let claimants = dedup_claimants(claimants);
        let mut next = self.clone();
        next.status = SectionStatus::Contested;
        next.contest_history
            .push(ContestEvent::open(round, claimants.clone()));
        next.claimants = claimants;
        next
    }

    /// Settle the current contest in favour of `winner`.
    ///
    /// The outcome is written onto the latest contest round. When the
    /// section has no rounds yet (the contest came from competing claims
    /// alone), `round` numbers a new entry recording the settlement.
    /// Losing claimants stay in `claimants`.
    pub fn with_resolution(&self, winner: &str, resolution: &str, round: u32) -> Self {
        if self.status.is_terminal() {
            return self.clone();
        }

        let mut next = self.clone();
        next.status = SectionStatus::Claimed;
        next.owner = Some(winner.to_string());

        if next.contest_history.is_empty() {
            next.contest_history
                .push(ContestEvent::open(round, next.claimants.clone()));
        }
        if let Some(latest) = next.contest_history.last_mut() {
            latest.resolution = Some(resolution.to_string());
            latest.winner = Some(winner.to_string());
        }
        next
    }

    /// Record a participant's proposal text.
    pub fn with_proposal(&self, participant: &str, text: &str) -> Self {
        let mut next = self.clone();
        next.proposals
            .insert(participant.to_string(), text.to_string());
        next
    }

    /// Lock the section against further negotiation.
    pub fn freeze(&self) -> Self {
        Self {
            status: SectionStatus::Frozen,
            ..self.clone()
        }
    }

    pub fn is_contested(&self) -> bool {
        self.status == SectionStatus::Contested
    }

    pub fn latest_contest(&self) -> Option<&ContestEvent> {
        self.contest_history.last()
    }
}
