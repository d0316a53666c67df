//! The 402 payment protocol engine.
//!
//! Runs the challenge/verify/settle exchange for a single call. The
//! server holds no session between the 402 challenge and the retry: the
//! requirements embedded in the challenge (price, payTo, network, nonce)
//! are the only state needed to validate the resubmission, which keeps
//! the exchange concurrent and restart-tolerant.
//!
//! Settlement strictly precedes dispatch — the paid work never executes
//! before the transfer completed, so a provider is never left
//! uncompensated.

mod facilitator;

pub use facilitator::{Facilitator, FacilitatorError, HttpFacilitator};

use std::sync::Arc;

use dashmap::DashMap;
use stoa_proto::{
    EXACT_SCHEME, PaymentPayload, PaymentRequired, PaymentRequirements, ResourceInfo,
    SettleRequest, SupportedResponse, UsdcAmount, VerifyRequest,
};
use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::catalog::{Service, now_millis};

/// Protocol state for one call's payment exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentPhase {
    /// No payment assertion attached yet.
    Unpaid,
    /// A 402 challenge has been issued for this call.
    ChallengeIssued,
    /// The assertion is being verified with the facilitator.
    Verifying,
    /// The facilitator accepted the assertion.
    Verified,
    /// Settlement is executing.
    Settling,
    /// Settlement completed; dispatch may proceed.
    Settled,
    /// Terminal: the facilitator declined the assertion.
    Rejected,
    /// Terminal: verification or settlement failed out of protocol.
    VerificationError,
}

impl PaymentPhase {
    /// Whether `next` is a legal successor of this phase.
    #[must_use]
    pub const fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Unpaid, Self::ChallengeIssued)
                | (Self::ChallengeIssued, Self::Verifying)
                | (Self::Verifying, Self::Verified)
                | (Self::Verifying, Self::Rejected)
                | (Self::Verifying, Self::VerificationError)
                | (Self::Verified, Self::Settling)
                | (Self::Settling, Self::Settled)
                | (Self::Settling, Self::VerificationError)
        )
    }
}

/// Tracks one call's phase and enforces transition legality.
#[derive(Debug)]
pub struct PaymentFlow {
    phase: PaymentPhase,
}

impl PaymentFlow {
    /// A flow for a call that arrived without an assertion.
    #[must_use]
    pub const fn unpaid() -> Self {
        Self {
            phase: PaymentPhase::Unpaid,
        }
    }

    /// A flow for a resubmission: the challenge was issued on a previous
    /// (stateless) request.
    #[must_use]
    pub const fn challenged() -> Self {
        Self {
            phase: PaymentPhase::ChallengeIssued,
        }
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> PaymentPhase {
        self.phase
    }

    /// Advances to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`PaymentError::IllegalTransition`] when `next` is not a
    /// legal successor.
    pub fn advance(&mut self, next: PaymentPhase) -> Result<(), PaymentError> {
        if !self.phase.can_advance_to(next) {
            return Err(PaymentError::IllegalTransition {
                from: self.phase,
                to: next,
            });
        }
        self.phase = next;
        Ok(())
    }
}

/// Proof that settlement completed for one call.
///
/// Only the payment gate constructs this, and the dispatcher path requires
/// it — dispatch cannot be attempted for a paid service without reaching
/// [`PaymentPhase::Settled`].
#[derive(Debug, Clone)]
pub struct SettledPayment {
    /// The address that paid.
    pub payer: String,
    /// On-chain settlement reference.
    pub tx_hash: String,
    /// Network settlement occurred on.
    pub network: String,
    /// Amount transferred.
    pub amount: UsdcAmount,
    /// The call nonce the assertion was bound to.
    pub nonce: String,
}

/// Errors from the payment exchange.
#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    /// The facilitator declined the assertion, or it did not match the
    /// service's current requirements, or its nonce was already spent.
    #[error("payment rejected: {reason}")]
    Rejected {
        /// Machine-readable reason.
        reason: String,
        /// Payer address, if identified.
        payer: Option<String>,
    },

    /// Verification passed but settlement failed. Money did not move, but
    /// the attempt is logged for reconciliation.
    #[error("settlement failed: {reason}")]
    Settlement {
        /// Machine-readable reason.
        reason: String,
        /// Human-readable detail.
        message: Option<String>,
    },

    /// The facilitator could not be reached or answered out of protocol.
    /// When `step` is `"settle"`, the settlement outcome is unknown and the
    /// call must be logged for manual reconciliation.
    #[error("facilitator unavailable during {step}")]
    Transport {
        /// Which exchange step failed: `"verify"` or `"settle"`.
        step: &'static str,
        /// The underlying client error.
        #[source]
        source: FacilitatorError,
    },

    /// Internal: a phase transition outside the state machine was
    /// attempted.
    #[error("illegal payment phase transition: {from:?} -> {to:?}")]
    IllegalTransition {
        /// Phase the flow was in.
        from: PaymentPhase,
        /// Phase that was requested.
        to: PaymentPhase,
    },
}

/// Remembers settled (service, nonce) pairs so an assertion cannot be
/// replayed for a second call.
///
/// Entries outlive their usefulness once the challenge validity window
/// has passed (a stale assertion fails verification anyway), so the sweep
/// drops them after `ttl_ms`.
#[derive(Debug, Default)]
pub struct ReplayGuard {
    settled: DashMap<String, u64>,
}

impl ReplayGuard {
    fn key(service_id: Uuid, nonce: &str) -> String {
        format!("{service_id}:{nonce}")
    }

    /// Whether this (service, nonce) pair has already settled.
    #[must_use]
    pub fn is_spent(&self, service_id: Uuid, nonce: &str) -> bool {
        self.settled.contains_key(&Self::key(service_id, nonce))
    }

    /// Marks a pair as settled at `now_ms`.
    pub fn mark_settled(&self, service_id: Uuid, nonce: &str, now_ms: u64) {
        self.settled.insert(Self::key(service_id, nonce), now_ms);
    }

    /// Drops entries older than `ttl_ms`. Returns how many were removed.
    pub fn sweep(&self, now_ms: u64, ttl_ms: u64) -> usize {
        let before = self.settled.len();
        self.settled
            .retain(|_, settled_at| now_ms.saturating_sub(*settled_at) < ttl_ms);
        before - self.settled.len()
    }
}

/// The payment gate: builds challenges and collects payment for calls.
pub struct PaymentGate {
    facilitator: Arc<dyn Facilitator>,
    network: String,
    asset: String,
    challenge_timeout_secs: u64,
    replay: ReplayGuard,
    /// Single-flight initialization: the first successful `supported`
    /// probe is cached; failures are retried on next use instead of
    /// poisoning the process.
    capabilities: OnceCell<SupportedResponse>,
}

impl std::fmt::Debug for PaymentGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentGate")
            .field("network", &self.network)
            .field("ready", &self.ready())
            .finish()
    }
}

impl PaymentGate {
    /// Creates a gate settling on `network` with the given USDC asset.
    pub fn new(
        facilitator: Arc<dyn Facilitator>,
        network: impl Into<String>,
        asset: impl Into<String>,
        challenge_timeout_secs: u64,
    ) -> Self {
        Self {
            facilitator,
            network: network.into(),
            asset: asset.into(),
            challenge_timeout_secs,
            replay: ReplayGuard::default(),
            capabilities: OnceCell::new(),
        }
    }

    /// Whether the one-time facilitator probe has completed.
    #[must_use]
    pub fn ready(&self) -> bool {
        self.capabilities.initialized()
    }

    /// The replay guard, exposed for maintenance sweeps.
    #[must_use]
    pub const fn replay_guard(&self) -> &ReplayGuard {
        &self.replay
    }

    /// Challenge validity window in milliseconds; replay entries older
    /// than this are sweepable.
    #[must_use]
    pub const fn replay_ttl_ms(&self) -> u64 {
        // Entries are kept for several windows to stay safely behind any
        // clock skew between gateway and facilitator.
        self.challenge_timeout_secs * 1000 * 10
    }

    /// Runs the one-time facilitator probe if it has not completed yet.
    ///
    /// Failure is logged and leaves the gate uninitialized; the next call
    /// retries. The exchange itself proceeds regardless — initialization
    /// is advisory, not a gate on verification.
    pub async fn ensure_ready(&self) {
        let result = self
            .capabilities
            .get_or_try_init(|| async {
                let supported = self.facilitator.supported().await?;
                if !supported.supports(EXACT_SCHEME, &self.network) {
                    tracing::warn!(
                        network = %self.network,
                        "facilitator does not advertise the exact scheme for the configured network"
                    );
                }
                Ok::<_, FacilitatorError>(supported)
            })
            .await;
        if let Err(err) = result {
            tracing::warn!(error = %err, "facilitator initialization failed; will retry on next call");
        }
    }

    /// Builds the payment requirements for one call to `service`, with a
    /// fresh single-use nonce.
    #[must_use]
    pub fn requirements_for(&self, service: &Service, resource_url: &str) -> PaymentRequirements {
        PaymentRequirements {
            scheme: EXACT_SCHEME.to_owned(),
            network: self.network.clone(),
            asset: self.asset.clone(),
            amount: service.price,
            pay_to: service.owner_address.clone(),
            max_timeout_seconds: self.challenge_timeout_secs,
            resource: resource_url.to_owned(),
            nonce: Uuid::new_v4().to_string(),
            extra: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    /// Builds the 402 challenge body for one call to `service`.
    #[must_use]
    pub fn challenge(&self, service: &Service, resource_url: &str) -> PaymentRequired {
        PaymentRequired {
            x402_version: stoa_proto::X402_VERSION,
            error: Some("Payment required".to_owned()),
            resource: ResourceInfo {
                url: resource_url.to_owned(),
                description: Some(service.name.clone()),
                mime_type: Some("application/json".to_owned()),
            },
            accepts: vec![self.requirements_for(service, resource_url)],
        }
    }

    /// Collects payment for one call: verifies the assertion, settles it,
    /// and returns the settlement proof dispatch requires.
    ///
    /// # Errors
    ///
    /// - [`PaymentError::Rejected`] when the assertion does not match the
    ///   service's requirements, reuses a spent nonce, or the facilitator
    ///   declines it.
    /// - [`PaymentError::Settlement`] when settlement fails after a
    ///   successful verification.
    /// - [`PaymentError::Transport`] on facilitator transport failures.
    pub async fn collect(
        &self,
        service: &Service,
        payload: PaymentPayload,
    ) -> Result<SettledPayment, PaymentError> {
        let mut flow = PaymentFlow::challenged();

        // The assertion must match what a challenge for this service would
        // currently demand. The nonce is caller-chosen state from the
        // challenge; everything else is validated against the catalog row.
        let accepted = &payload.accepted;
        if accepted.scheme != EXACT_SCHEME
            || accepted.network != self.network
            || accepted.asset != self.asset
            || accepted.amount != service.price
            || accepted.pay_to != service.owner_address
        {
            return Err(PaymentError::Rejected {
                reason: "requirements_mismatch".to_owned(),
                payer: None,
            });
        }

        let nonce = accepted.nonce.clone();
        if self.replay.is_spent(service.id, &nonce) {
            tracing::warn!(service = %service.id, nonce = %nonce, "replayed payment nonce");
            return Err(PaymentError::Rejected {
                reason: "nonce_already_settled".to_owned(),
                payer: None,
            });
        }

        self.ensure_ready().await;

        let requirements = accepted.clone();
        let verify_request = VerifyRequest {
            payment_payload: payload,
            payment_requirements: requirements,
        };

        flow.advance(PaymentPhase::Verifying)?;
        let verdict = match self.facilitator.verify(&verify_request).await {
            Ok(verdict) => verdict,
            Err(err) => {
                flow.advance(PaymentPhase::VerificationError)?;
                return Err(PaymentError::Transport {
                    step: "verify",
                    source: err,
                });
            }
        };

        if !verdict.is_valid {
            flow.advance(PaymentPhase::Rejected)?;
            return Err(PaymentError::Rejected {
                reason: verdict
                    .invalid_reason
                    .unwrap_or_else(|| "verification_failed".to_owned()),
                payer: verdict.payer,
            });
        }
        flow.advance(PaymentPhase::Verified)?;

        flow.advance(PaymentPhase::Settling)?;
        let settle_request = SettleRequest::from(verify_request);
        let settlement = match self.facilitator.settle(&settle_request).await {
            Ok(settlement) => settlement,
            Err(err) => {
                flow.advance(PaymentPhase::VerificationError)?;
                return Err(PaymentError::Transport {
                    step: "settle",
                    source: err,
                });
            }
        };

        if !settlement.success {
            flow.advance(PaymentPhase::VerificationError)?;
            return Err(PaymentError::Settlement {
                reason: settlement
                    .error_reason
                    .unwrap_or_else(|| "settlement_failed".to_owned()),
                message: settlement.error_message,
            });
        }

        self.replay.mark_settled(service.id, &nonce, now_millis());
        flow.advance(PaymentPhase::Settled)?;

        tracing::info!(
            service = %service.id,
            tx = %settlement.transaction,
            amount = %service.price,
            "payment settled"
        );

        Ok(SettledPayment {
            payer: settlement.payer.unwrap_or_else(|| "unknown".to_owned()),
            tx_hash: settlement.transaction,
            network: settlement.network,
            amount: service.price,
            nonce,
        })
    }
}
