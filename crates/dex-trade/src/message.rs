//! # Trade Protocol Messages
//!
//! Every message between trade parties is a [`TradeMessage`] signed by its
//! sender. Messages that advance the trade carry a step number:
//!
//! | step | message | sender |
//! |------|---------|--------|
//! | 0 | `TAKE_OFFER_REQUEST` | taker |
//! | 1 | `TAKE_OFFER_ACCEPTED` / `TAKE_OFFER_REJECTED` | maker |
//! | 2 | `DEPOSIT_PUBLISHED` | taker |
//! | 3 | `PAYOUT_REQUEST` | buyer |
//! | 4 | `PAYOUT_PUBLISHED` | seller |
//! | 5 | `PAYOUT_ACKNOWLEDGED` | buyer |
//!
//! `DISPUTE_OPENED` has no step; it is accepted in any non-terminal state.

use dex_agents::AgentKind;
use dex_arbitration::{DisputeReason, EvidenceSnapshot, SignedResolution};
use dex_core::{ContentDigest, DisputeId, MessageId, NodeAddress, Timestamp, TradeId, TxId};
use dex_crypto::{payload_digest, sign_payload, verify_payload, Ed25519PublicKey, Ed25519Signature, KeyRing, PubKeyRing};
use dex_offer::OfferPayload;
use serde::{Deserialize, Serialize};

use crate::error::TradeError;

/// Message content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageBody {
    TakeOfferRequest {
        /// The signed offer as the taker received it.
        offer: OfferPayload,
        amount: u64,
        taker_pub_key_ring: PubKeyRing,
    },
    TakeOfferAccepted,
    TakeOfferRejected {
        reason: String,
    },
    DepositPublished {
        tx_id: TxId,
    },
    /// The buyer saw the deposit confirmed and asks the seller to release.
    PayoutRequest,
    PayoutPublished {
        tx_id: TxId,
    },
    PayoutAcknowledged,
    DisputeOpened {
        dispute_id: DisputeId,
        reason: DisputeReason,
        agent: NodeAddress,
        agent_kind: AgentKind,
        evidence: EvidenceSnapshot,
    },
}

impl MessageBody {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TakeOfferRequest { .. } => "TAKE_OFFER_REQUEST",
            Self::TakeOfferAccepted => "TAKE_OFFER_ACCEPTED",
            Self::TakeOfferRejected { .. } => "TAKE_OFFER_REJECTED",
            Self::DepositPublished { .. } => "DEPOSIT_PUBLISHED",
            Self::PayoutRequest => "PAYOUT_REQUEST",
            Self::PayoutPublished { .. } => "PAYOUT_PUBLISHED",
            Self::PayoutAcknowledged => "PAYOUT_ACKNOWLEDGED",
            Self::DisputeOpened { .. } => "DISPUTE_OPENED",
        }
    }

    /// Position in the trade sequence; `None` for dispute notices.
    pub fn step(&self) -> Option<u8> {
        match self {
            Self::TakeOfferRequest { .. } => Some(0),
            Self::TakeOfferAccepted | Self::TakeOfferRejected { .. } => Some(1),
            Self::DepositPublished { .. } => Some(2),
            Self::PayoutRequest => Some(3),
            Self::PayoutPublished { .. } => Some(4),
            Self::PayoutAcknowledged => Some(5),
            Self::DisputeOpened { .. } => None,
        }
    }
}

/// An unsigned protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeMessage {
    pub id: MessageId,
    pub trade_id: TradeId,
    pub sender: NodeAddress,
    pub sent_at: Timestamp,
    pub body: MessageBody,
}

impl TradeMessage {
    pub fn new(trade_id: TradeId, sender: NodeAddress, body: MessageBody) -> Self {
        Self {
            id: MessageId::new(),
            trade_id,
            sender,
            sent_at: Timestamp::now(),
            body,
        }
    }

    pub fn sign(self, keys: &KeyRing) -> Result<SignedTradeMessage, TradeError> {
        let signature = sign_payload(keys.signing_key(), &self)?;
        Ok(SignedTradeMessage {
            message: self,
            signature,
        })
    }
}

/// A message with its sender's signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTradeMessage {
    pub message: TradeMessage,
    pub signature: Ed25519Signature,
}

impl SignedTradeMessage {
    pub fn verify(&self, key: &Ed25519PublicKey) -> bool {
        verify_payload(&self.message, &self.signature, key)
    }

    /// Digest kept as dispute evidence.
    pub fn digest(&self) -> Result<ContentDigest, TradeError> {
        Ok(payload_digest(self)?)
    }

    pub fn id(&self) -> MessageId {
        self.message.id
    }

    pub fn kind(&self) -> &'static str {
        self.message.body.kind()
    }

    pub fn step(&self) -> Option<u8> {
        self.message.body.step()
    }
}

/// Everything a node sends over the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "envelope", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NetworkEnvelope {
    Trade(SignedTradeMessage),
    /// A co-signed offer published to the network.
    OfferBroadcast(OfferPayload),
    /// A dispute agent's decision.
    Resolution(SignedResolution),
}

impl NetworkEnvelope {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Trade(m) => m.kind(),
            Self::OfferBroadcast(_) => "OFFER_BROADCAST",
            Self::Resolution(_) => "RESOLUTION",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(body: MessageBody) -> TradeMessage {
        TradeMessage::new(
            TradeId::new(),
            NodeAddress::new("taker.onion:9999").unwrap(),
            body,
        )
    }

    fn tx() -> TxId {
        TxId::new("cd".repeat(32)).unwrap()
    }

    #[test]
    fn steps_follow_sequence() {
        let steps: Vec<Option<u8>> = [
            MessageBody::TakeOfferAccepted,
            MessageBody::DepositPublished { tx_id: tx() },
            MessageBody::PayoutRequest,
            MessageBody::PayoutPublished { tx_id: tx() },
            MessageBody::PayoutAcknowledged,
        ]
        .iter()
        .map(MessageBody::step)
        .collect();
        assert_eq!(steps, vec![Some(1), Some(2), Some(3), Some(4), Some(5)]);
    }

    #[test]
    fn signed_message_verifies_only_for_sender() {
        let keys = KeyRing::from_seed(&[1u8; 32]);
        let signed = message(MessageBody::DepositPublished { tx_id: tx() })
            .sign(&keys)
            .unwrap();
        assert!(signed.verify(&keys.pub_key_ring().signing_key));
        assert!(!signed.verify(&KeyRing::generate().pub_key_ring().signing_key));

        let mut forged = signed.clone();
        forged.message.body = MessageBody::PayoutAcknowledged;
        assert!(!forged.verify(&keys.pub_key_ring().signing_key));
    }

    #[test]
    fn digest_changes_with_content() {
        let keys = KeyRing::from_seed(&[1u8; 32]);
        let a = message(MessageBody::PayoutRequest).sign(&keys).unwrap();
        let b = message(MessageBody::PayoutRequest).sign(&keys).unwrap();
        assert_ne!(a.digest().unwrap(), b.digest().unwrap());
        assert_eq!(a.digest().unwrap(), a.clone().digest().unwrap());
    }

    #[test]
    fn envelope_json_is_tagged() {
        let keys = KeyRing::from_seed(&[1u8; 32]);
        let signed = message(MessageBody::PayoutRequest).sign(&keys).unwrap();
        let json = serde_json::to_value(NetworkEnvelope::Trade(signed)).unwrap();
        assert_eq!(json["envelope"], "TRADE");
        assert_eq!(json["payload"]["message"]["body"]["type"], "PAYOUT_REQUEST");
    }
}
