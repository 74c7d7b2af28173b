//! # Offer Co-Signing
//!
//! A maker's offer becomes tradeable only once the arbitrator named in it has
//! signed the payload. The maker side runs as a task pipeline:
//!
//! 1. `resolve_arbitrator`: the signer must be in the maker's accepted set.
//! 2. `request_signature`: ask the arbitrator through [`ArbitratorClient`].
//! 3. `verify_arbitrator_signature`: the returned signature must verify over
//!    the payload the arbitrator returned, and that payload must be the one
//!    sent.
//! 4. `apply_signature`: attach the signature to the local payload and verify
//!    the complete local payload against the same key.
//! 5. `mark_available`: `PENDING → AVAILABLE`.
//!
//! Every failure is recorded on the offer by the pipeline's failure handler.
//! Signature failures move the offer to `INVALID`; an unknown or unreachable
//! arbitrator leaves it `PENDING`.
//!
//! The arbitrator side is [`arbitrator_sign_offer`].

use std::sync::Arc;

use async_trait::async_trait;
use dex_agents::{AgentKind, DisputeAgent, DisputeAgentRegistry};
use dex_core::{NodeAddress, OfferId, Timestamp};
use dex_crypto::{Ed25519Signature, KeyRing};
use dex_task::{RetryPolicy, RunReport, Task, TaskFailure, TaskRunner};
use serde::{Deserialize, Serialize};

use crate::error::OfferError;
use crate::offer::{Offer, OfferPayload, OfferState};

// ── Wire types ───────────────────────────────────────────────────────

/// Maker → arbitrator: please co-sign this payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignOfferRequest {
    /// The unsigned payload.
    pub payload: OfferPayload,
    pub requested_at: Timestamp,
}

impl SignOfferRequest {
    pub fn new(offer: &Offer) -> Self {
        Self {
            payload: offer.payload().unsigned(),
            requested_at: Timestamp::now(),
        }
    }
}

/// Arbitrator → maker: the signed payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignOfferResponse {
    pub offer_id: OfferId,
    pub arbitrator: NodeAddress,
    /// The payload as the arbitrator signed it, signature attached.
    pub signed_payload: OfferPayload,
    pub signature: Ed25519Signature,
}

/// Transport to an arbitrator for signing requests.
#[async_trait]
pub trait ArbitratorClient: Send + Sync {
    /// Deliver `request` to `arbitrator` and wait for its response.
    ///
    /// Transport failures are reported as
    /// [`OfferError::ArbitratorUnreachable`].
    async fn request_signature(
        &self,
        arbitrator: &DisputeAgent,
        request: SignOfferRequest,
    ) -> Result<SignOfferResponse, OfferError>;
}

/// Arbitrator-side handler: validate the request and sign the payload.
pub fn arbitrator_sign_offer(
    keys: &KeyRing,
    own_address: &NodeAddress,
    request: &SignOfferRequest,
) -> Result<SignOfferResponse, OfferError> {
    let payload = &request.payload;
    payload.terms.validate()?;
    if &payload.arbitrator_signer != own_address {
        return Err(OfferError::InvalidTerms {
            reason: format!(
                "offer names arbitrator {}, not {own_address}",
                payload.arbitrator_signer
            ),
        });
    }
    if payload.arbitrator_signature.is_some() {
        return Err(OfferError::InvalidTerms {
            reason: "payload is already signed".into(),
        });
    }

    let signature = keys.signing_key().sign(&payload.signable_bytes()?);
    let mut signed_payload = payload.clone();
    signed_payload.arbitrator_signature = Some(signature);
    tracing::info!(offer_id = %payload.id, arbitrator = %own_address, "co-signed offer");

    Ok(SignOfferResponse {
        offer_id: payload.id,
        arbitrator: own_address.clone(),
        signed_payload,
        signature,
    })
}

// ── Pipeline ─────────────────────────────────────────────────────────

/// Working state of one signing run.
#[derive(Debug)]
pub struct SigningModel {
    pub offer: Offer,
    pub arbitrator: Option<DisputeAgent>,
    pub response: Option<SignOfferResponse>,
}

impl SigningModel {
    pub fn new(offer: Offer) -> Self {
        Self {
            offer,
            arbitrator: None,
            response: None,
        }
    }

    fn arbitrator(&self) -> Result<&DisputeAgent, OfferError> {
        self.arbitrator
            .as_ref()
            .ok_or_else(|| OfferError::UnknownArbitrator {
                address: self.offer.payload().arbitrator_signer.clone(),
            })
    }

    fn response(&self) -> Result<&SignOfferResponse, OfferError> {
        self.response
            .as_ref()
            .ok_or_else(|| OfferError::ResponseMismatch {
                offer_id: self.offer.id(),
                reason: "no signing response received".into(),
            })
    }
}

struct RequestSignature {
    client: Arc<dyn ArbitratorClient>,
}

#[async_trait]
impl Task<SigningModel, OfferError> for RequestSignature {
    fn name(&self) -> &str {
        "request_signature"
    }

    async fn execute(&self, model: &mut SigningModel) -> Result<(), OfferError> {
        let request = SignOfferRequest::new(&model.offer);
        let response = self
            .client
            .request_signature(model.arbitrator()?, request)
            .await?;
        model.response = Some(response);
        Ok(())
    }
}

fn resolve_arbitrator(
    registry: Arc<DisputeAgentRegistry>,
) -> impl Fn(&mut SigningModel) -> Result<(), OfferError> + Send + Sync + 'static {
    move |model: &mut SigningModel| {
        if model.offer.state() != OfferState::Pending {
            return Err(OfferError::InvalidTransition {
                offer_id: model.offer.id(),
                from: model.offer.state().as_str().to_string(),
                to: OfferState::Available.as_str().to_string(),
            });
        }
        let signer = &model.offer.payload().arbitrator_signer;
        let agent = registry
            .accepted_agent(signer, AgentKind::Arbitrator)
            .ok_or_else(|| OfferError::UnknownArbitrator {
                address: signer.clone(),
            })?;
        model.arbitrator = Some(agent);
        Ok(())
    }
}

fn verify_arbitrator_signature(model: &mut SigningModel) -> Result<(), OfferError> {
    let offer_id = model.offer.id();
    let arbitrator = model.arbitrator()?;
    let response = model.response()?;

    let mismatch = |reason: &str| OfferError::ResponseMismatch {
        offer_id,
        reason: reason.to_string(),
    };
    if response.offer_id != offer_id {
        return Err(mismatch("response is for another offer"));
    }
    if response.arbitrator != arbitrator.address {
        return Err(mismatch("response is from another arbitrator"));
    }
    if response.signed_payload.unsigned() != model.offer.payload().unsigned() {
        return Err(mismatch("arbitrator signed a different payload"));
    }
    if !response
        .signed_payload
        .verify_with(&response.signature, arbitrator.signing_key())
    {
        return Err(OfferError::InvalidArbitratorSignature {
            offer_id,
            arbitrator: arbitrator.address.clone(),
        });
    }
    Ok(())
}

fn apply_signature(model: &mut SigningModel) -> Result<(), OfferError> {
    let signature = model.response()?.signature;
    let key = *model.arbitrator()?.signing_key();

    let mut candidate = model.offer.payload().clone();
    candidate.arbitrator_signature = Some(signature);
    if !candidate.has_valid_arbitrator_signature(&key) {
        return Err(OfferError::InvalidOfferSignature {
            offer_id: model.offer.id(),
            arbitrator: candidate.arbitrator_signer,
        });
    }
    model.offer.apply_signature(signature)
}

fn mark_available(model: &mut SigningModel) -> Result<(), OfferError> {
    let key = *model.arbitrator()?.signing_key();
    model.offer.mark_available(&key)
}

fn record_failure(error: &OfferError, model: &mut SigningModel) {
    model.offer.set_error_message(error.to_string());
    if error.is_trust_failure() {
        tracing::warn!(offer_id = %model.offer.id(), %error, "offer co-signing rejected");
        if let Err(e) = model
            .offer
            .transition(OfferState::Invalid, Some(&error.to_string()))
        {
            tracing::warn!(offer_id = %model.offer.id(), error = %e, "could not invalidate offer");
        }
    } else {
        tracing::warn!(offer_id = %model.offer.id(), %error, "offer co-signing incomplete");
    }
}

/// The maker's co-signing protocol.
///
/// Holds the maker's agent directory and arbitrator transport; one instance
/// serves every offer the maker places. Callers serialize runs per offer.
pub struct OfferSigningProtocol {
    runner: TaskRunner<SigningModel, OfferError>,
}

impl OfferSigningProtocol {
    pub fn new(registry: Arc<DisputeAgentRegistry>, client: Arc<dyn ArbitratorClient>) -> Self {
        let runner = TaskRunner::new("offer_signing")
            .with_fn("resolve_arbitrator", resolve_arbitrator(registry))
            .with_task(RequestSignature { client })
            .with_fn("verify_arbitrator_signature", verify_arbitrator_signature)
            .with_fn("apply_signature", apply_signature)
            .with_fn("mark_available", mark_available)
            .on_failure(record_failure);
        Self { runner }
    }

    pub fn task_names(&self) -> Vec<&str> {
        self.runner.task_names()
    }

    /// Run the pipeline once over `offer`, writing the outcome back.
    pub async fn sign(&self, offer: &mut Offer) -> Result<RunReport, TaskFailure<OfferError>> {
        let mut model = SigningModel::new(offer.clone());
        let result = self.runner.run(&mut model).await;
        *offer = model.offer;
        result
    }

    /// As [`OfferSigningProtocol::sign`], resuming at the failed step while
    /// the arbitrator is unreachable and `policy` allows.
    pub async fn sign_with_retry(
        &self,
        offer: &mut Offer,
        policy: &RetryPolicy,
    ) -> Result<RunReport, TaskFailure<OfferError>> {
        let mut model = SigningModel::new(offer.clone());
        let result = policy
            .run(&self.runner, &mut model, OfferError::is_transient)
            .await;
        *offer = model.offer;
        result
    }
}

impl std::fmt::Debug for OfferSigningProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfferSigningProtocol")
            .field("runner", &self.runner)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offer::tests::payload;
    use dex_agents::{AgentRegistration, AgentRole};
    use dex_core::LanguageCode;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    const ARB: &str = "arb.onion:9999";

    enum Behaviour {
        Honest,
        WrongKey,
        OtherPayload,
        Unreachable { failures: u32 },
    }

    struct TestArbitrator {
        keys: KeyRing,
        behaviour: Behaviour,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ArbitratorClient for TestArbitrator {
        async fn request_signature(
            &self,
            arbitrator: &DisputeAgent,
            mut request: SignOfferRequest,
        ) -> Result<SignOfferResponse, OfferError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::Honest => arbitrator_sign_offer(&self.keys, &arbitrator.address, &request),
                Behaviour::WrongKey => {
                    arbitrator_sign_offer(&KeyRing::generate(), &arbitrator.address, &request)
                }
                Behaviour::OtherPayload => {
                    request.payload.terms.price *= 2;
                    arbitrator_sign_offer(&self.keys, &arbitrator.address, &request)
                }
                Behaviour::Unreachable { failures } if call < failures => {
                    Err(OfferError::ArbitratorUnreachable {
                        address: arbitrator.address.clone(),
                        reason: "connection refused".into(),
                    })
                }
                Behaviour::Unreachable { .. } => {
                    arbitrator_sign_offer(&self.keys, &arbitrator.address, &request)
                }
            }
        }
    }

    fn setup(behaviour: Behaviour, accept: bool) -> (OfferSigningProtocol, Arc<TestArbitrator>, KeyRing) {
        let keys = KeyRing::from_seed(&[9u8; 32]);
        let registry = Arc::new(DisputeAgentRegistry::new());
        let agent = AgentRegistration::new(
            NodeAddress::new(ARB).unwrap(),
            AgentRole::Arbitrator {
                fee_basis_points: 30,
            },
            [LanguageCode::new("en").unwrap()],
        )
        .sign(&keys)
        .unwrap();
        registry.register(agent).unwrap();
        if accept {
            registry.accept(&NodeAddress::new(ARB).unwrap()).unwrap();
        }
        let client = Arc::new(TestArbitrator {
            keys: KeyRing::from_seed(&[9u8; 32]),
            behaviour,
            calls: AtomicU32::new(0),
        });
        (
            OfferSigningProtocol::new(registry, client.clone()),
            client,
            keys,
        )
    }

    #[tokio::test]
    async fn honest_arbitrator_makes_offer_available() {
        let (protocol, _, keys) = setup(Behaviour::Honest, true);
        let mut offer = Offer::new(payload(ARB));
        let report = protocol.sign(&mut offer).await.unwrap();
        assert_eq!(report.completed.len(), 5);
        assert_eq!(offer.state(), OfferState::Available);
        assert!(offer
            .payload()
            .has_valid_arbitrator_signature(&keys.pub_key_ring().signing_key));
        assert!(offer.error_message().is_none());
    }

    #[tokio::test]
    async fn unaccepted_arbitrator_leaves_offer_pending() {
        let (protocol, client, _) = setup(Behaviour::Honest, false);
        let mut offer = Offer::new(payload(ARB));
        let failure = protocol.sign(&mut offer).await.unwrap_err();
        assert_eq!(failure.task, "resolve_arbitrator");
        assert!(matches!(failure.error, OfferError::UnknownArbitrator { .. }));
        assert_eq!(offer.state(), OfferState::Pending);
        assert!(offer.error_message().is_some());
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn wrong_key_invalidates_offer() {
        let (protocol, _, _) = setup(Behaviour::WrongKey, true);
        let mut offer = Offer::new(payload(ARB));
        let failure = protocol.sign(&mut offer).await.unwrap_err();
        assert_eq!(failure.task, "verify_arbitrator_signature");
        assert!(matches!(
            failure.error,
            OfferError::InvalidArbitratorSignature { .. }
        ));
        assert_eq!(offer.state(), OfferState::Invalid);
        assert!(offer.payload().arbitrator_signature.is_none());
    }

    #[tokio::test]
    async fn signature_over_other_payload_is_rejected() {
        let (protocol, _, _) = setup(Behaviour::OtherPayload, true);
        let mut offer = Offer::new(payload(ARB));
        let failure = protocol.sign(&mut offer).await.unwrap_err();
        assert!(matches!(failure.error, OfferError::ResponseMismatch { .. }));
        assert_eq!(offer.state(), OfferState::Invalid);
    }

    #[tokio::test]
    async fn unreachable_arbitrator_is_retried_from_failed_step() {
        let (protocol, client, _) = setup(Behaviour::Unreachable { failures: 2 }, true);
        let mut offer = Offer::new(payload(ARB));
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let report = protocol.sign_with_retry(&mut offer, &policy).await.unwrap();
        assert_eq!(offer.state(), OfferState::Available);
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            report.completed.iter().filter(|t| *t == "resolve_arbitrator").count(),
            1
        );
    }

    #[tokio::test]
    async fn unreachable_without_retry_stays_pending() {
        let (protocol, _, _) = setup(Behaviour::Unreachable { failures: 1 }, true);
        let mut offer = Offer::new(payload(ARB));
        let failure = protocol.sign(&mut offer).await.unwrap_err();
        assert!(failure.error.is_transient());
        assert_eq!(offer.state(), OfferState::Pending);
        assert!(offer.error_message().unwrap().contains("unreachable"));
    }

    #[tokio::test]
    async fn available_offer_is_not_signed_again() {
        let (protocol, client, _) = setup(Behaviour::Honest, true);
        let mut offer = Offer::new(payload(ARB));
        protocol.sign(&mut offer).await.unwrap();
        let failure = protocol.sign(&mut offer).await.unwrap_err();
        assert!(matches!(failure.error, OfferError::InvalidTransition { .. }));
        assert_eq!(offer.state(), OfferState::Available);
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn arbitrator_refuses_offers_naming_someone_else() {
        let keys = KeyRing::from_seed(&[9u8; 32]);
        let offer = Offer::new(payload("other.onion:1"));
        let err = arbitrator_sign_offer(
            &keys,
            &NodeAddress::new(ARB).unwrap(),
            &SignOfferRequest::new(&offer),
        )
        .unwrap_err();
        assert!(matches!(err, OfferError::InvalidTerms { .. }));
    }

    #[test]
    fn pipeline_step_order() {
        let (protocol, _, _) = setup(Behaviour::Honest, true);
        assert_eq!(
            protocol.task_names(),
            vec![
                "resolve_arbitrator",
                "request_signature",
                "verify_arbitrator_signature",
                "apply_signature",
                "mark_available",
            ]
        );
    }
}
