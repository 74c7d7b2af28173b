//! # Dispute Lifecycle
//!
//! A dispute is opened from a trade that missed a deadline, failed
//! verification, or that a user escalated. It records the agent it was
//! assigned to and a snapshot of the trade's signed evidence, accepts
//! evidence items from both parties while open, and ends when the assigned
//! agent's signed decision is applied.
//!
//! ```text
//! OPEN ──apply_resolution()──▶ RESOLVED
//! ```
//!
//! Applying the same decision twice is a no-op; a different decision on a
//! resolved dispute is rejected. A resolution that does not verify against
//! the assigned agent's key changes nothing.

use dex_agents::{AgentKind, DisputeAgent};
use dex_core::{ContentDigest, DisputeId, NodeAddress, OfferId, Timestamp, TradeId, TxId};
use dex_crypto::{payload_digest, Ed25519PublicKey};
use serde::{Deserialize, Serialize};

use crate::error::ArbitrationError;
use crate::resolution::SignedResolution;

// ── Dispute State ────────────────────────────────────────────────────

/// The lifecycle state of a dispute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisputeState {
    /// Assigned and awaiting a decision.
    Open,
    /// A signed decision was applied. Terminal state.
    Resolved,
}

impl DisputeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Resolved => "RESOLVED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved)
    }

    /// Valid target states from this state.
    pub fn valid_transitions(&self) -> &'static [DisputeState] {
        match self {
            Self::Open => &[Self::Resolved],
            Self::Resolved => &[],
        }
    }
}

impl std::fmt::Display for DisputeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Reasons and Parties ──────────────────────────────────────────────

/// Why a dispute was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeReason {
    /// A protocol deadline expired.
    Timeout,
    /// A party escalated explicitly.
    UserRequested,
    /// A counterparty message or signature failed verification.
    VerificationFailure,
    /// The wallet rejected a fund-moving step.
    WalletFailure,
}

impl DisputeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::UserRequested => "user_requested",
            Self::VerificationFailure => "verification_failure",
            Self::WalletFailure => "wallet_failure",
        }
    }
}

impl std::fmt::Display for DisputeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A trade party.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartyRole {
    Maker,
    Taker,
}

impl PartyRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Maker => "MAKER",
            Self::Taker => "TAKER",
        }
    }

    pub fn counterparty(&self) -> Self {
        match self {
            Self::Maker => Self::Taker,
            Self::Taker => Self::Maker,
        }
    }
}

impl std::fmt::Display for PartyRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Assignment and Evidence ──────────────────────────────────────────

/// The agent a dispute is assigned to, with the key its decision must verify
/// against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignedAgent {
    pub address: NodeAddress,
    pub kind: AgentKind,
    pub signing_key: Ed25519PublicKey,
}

impl From<&DisputeAgent> for AssignedAgent {
    fn from(agent: &DisputeAgent) -> Self {
        Self {
            address: agent.address.clone(),
            kind: agent.kind(),
            signing_key: *agent.signing_key(),
        }
    }
}

/// The trade as it stood when the dispute was opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceSnapshot {
    pub trade_id: TradeId,
    pub offer_id: OfferId,
    pub trade_state: String,
    pub amount: u64,
    pub deposit_tx_id: Option<TxId>,
    pub payout_tx_id: Option<TxId>,
    /// Digests of every signed protocol message the trade processed, in order.
    pub message_digests: Vec<ContentDigest>,
    pub taken_at: Timestamp,
}

impl EvidenceSnapshot {
    pub fn digest(&self) -> Result<ContentDigest, ArbitrationError> {
        Ok(payload_digest(self)?)
    }
}

/// A statement or document reference a party adds to an open dispute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub submitted_by: PartyRole,
    pub description: String,
    /// Digest of the referenced document.
    pub content_digest: ContentDigest,
    pub submitted_at: Timestamp,
}

/// A recorded state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisputeTransition {
    pub from: DisputeState,
    pub to: DisputeState,
    pub at: Timestamp,
    pub note: String,
}

/// Result of applying a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionOutcome {
    /// The decision was applied now.
    Applied,
    /// The same decision was already applied; nothing changed.
    AlreadyApplied,
}

// ── The Dispute ──────────────────────────────────────────────────────

/// An escalation record linking a trade to its assigned agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dispute {
    pub id: DisputeId,
    pub trade_id: TradeId,
    pub reason: DisputeReason,
    pub opened_by: PartyRole,
    pub opened_at: Timestamp,
    pub agent: AssignedAgent,
    /// Set when no agent in the escalation chain could be notified.
    pub notification_pending: bool,
    pub evidence: EvidenceSnapshot,
    evidence_items: Vec<EvidenceItem>,
    state: DisputeState,
    resolution: Option<SignedResolution>,
    transition_log: Vec<DisputeTransition>,
}

impl Dispute {
    /// Open a dispute in state `OPEN`, under the id both trade parties derive
    /// from the trade id.
    pub fn open(
        reason: DisputeReason,
        opened_by: PartyRole,
        agent: AssignedAgent,
        evidence: EvidenceSnapshot,
    ) -> Self {
        let id = DisputeId::for_trade(&evidence.trade_id);
        Self::open_with_id(id, reason, opened_by, agent, evidence)
    }

    /// Open with an explicit id.
    pub fn open_with_id(
        id: DisputeId,
        reason: DisputeReason,
        opened_by: PartyRole,
        agent: AssignedAgent,
        evidence: EvidenceSnapshot,
    ) -> Self {
        tracing::info!(
            dispute_id = %id,
            trade_id = %evidence.trade_id,
            reason = %reason,
            agent = %agent.address,
            "dispute opened"
        );
        Self {
            id,
            trade_id: evidence.trade_id,
            reason,
            opened_by,
            opened_at: Timestamp::now(),
            agent,
            notification_pending: false,
            evidence,
            evidence_items: Vec::new(),
            state: DisputeState::Open,
            resolution: None,
            transition_log: Vec::new(),
        }
    }

    pub fn state(&self) -> DisputeState {
        self.state
    }

    pub fn is_resolved(&self) -> bool {
        self.state == DisputeState::Resolved
    }

    pub fn resolution(&self) -> Option<&SignedResolution> {
        self.resolution.as_ref()
    }

    pub fn evidence_items(&self) -> &[EvidenceItem] {
        &self.evidence_items
    }

    pub fn transition_log(&self) -> &[DisputeTransition] {
        &self.transition_log
    }

    /// Add an evidence item. Only open disputes accept evidence.
    pub fn add_evidence(&mut self, item: EvidenceItem) -> Result<(), ArbitrationError> {
        if self.state != DisputeState::Open {
            return Err(ArbitrationError::InvalidTransition {
                dispute_id: self.id,
                from: self.state.as_str().to_string(),
                to: "ADD_EVIDENCE".to_string(),
            });
        }
        self.evidence_items.push(item);
        Ok(())
    }

    /// Apply the assigned agent's signed decision.
    ///
    /// # Errors
    ///
    /// - `ResolutionMismatch` if it names another dispute, trade, or agent.
    /// - `UnauthorizedResolution` if the signature does not verify against
    ///   the assigned agent's key.
    /// - `ConflictingResolution` if a different decision is already applied.
    ///
    /// No error leaves the dispute changed.
    pub fn apply_resolution(
        &mut self,
        signed: SignedResolution,
    ) -> Result<ResolutionOutcome, ArbitrationError> {
        let resolution = &signed.resolution;
        if resolution.dispute_id != self.id {
            return Err(self.mismatch("resolution names another dispute"));
        }
        if resolution.trade_id != self.trade_id {
            return Err(self.mismatch("resolution names another trade"));
        }
        if resolution.agent != self.agent.address || !signed.verify(&self.agent.signing_key) {
            tracing::warn!(
                dispute_id = %self.id,
                signer = %resolution.agent,
                "rejected unauthorized resolution"
            );
            return Err(ArbitrationError::UnauthorizedResolution {
                dispute_id: self.id,
                signer: resolution.agent.clone(),
            });
        }
        resolution.decision.validate()?;

        if let Some(applied) = &self.resolution {
            if applied.decision() == signed.decision() {
                return Ok(ResolutionOutcome::AlreadyApplied);
            }
            return Err(ArbitrationError::ConflictingResolution {
                dispute_id: self.id,
                applied: applied.decision().to_string(),
                offered: signed.decision().to_string(),
            });
        }

        let note = format!("{} by {}", signed.decision(), self.agent.address);
        self.transition_log.push(DisputeTransition {
            from: self.state,
            to: DisputeState::Resolved,
            at: Timestamp::now(),
            note,
        });
        self.state = DisputeState::Resolved;
        tracing::info!(dispute_id = %self.id, decision = %signed.decision(), "dispute resolved");
        self.resolution = Some(signed);
        Ok(ResolutionOutcome::Applied)
    }

    fn mismatch(&self, reason: &str) -> ArbitrationError {
        ArbitrationError::ResolutionMismatch {
            dispute_id: self.id,
            reason: reason.to_string(),
        }
    }
}
