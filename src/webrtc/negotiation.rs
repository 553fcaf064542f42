//! Offer/answer and ICE exchange against the peer connection
//!
//! Remote candidates are best effort. A candidate that arrives before the
//! remote description, or after the connection has failed or closed, is
//! dropped and logged; so is one the engine refuses. None of these fail the
//! call.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info, warn};

use super::signaling::{IceCandidate, OfferOptions, SdpDescription};
use crate::engine::PeerConnectionBackend;
use crate::error::{AppError, Result};

/// What happened to a remote candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    Applied,
    /// No remote description yet
    TooEarly,
    /// Connection already failed or closed
    TooLate,
    /// The engine refused it
    Rejected,
}

/// Negotiation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NegotiationStats {
    pub candidates_applied: u64,
    pub candidates_dropped: u64,
}

/// Drives SDP and ICE exchange for one session
#[derive(Default)]
pub struct NegotiationEngine {
    options: OfferOptions,
    applied: AtomicU64,
    dropped: AtomicU64,
}

impl NegotiationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> NegotiationStats {
        NegotiationStats {
            candidates_applied: self.applied.load(Ordering::Relaxed),
            candidates_dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    pub async fn set_remote_description(
        &self,
        peer: &dyn PeerConnectionBackend,
        desc: SdpDescription,
    ) -> Result<()> {
        require_sdp(&desc)?;
        let sdp_type = desc.sdp_type;
        peer.set_remote_description(desc).await?;
        info!("Remote {} applied", sdp_type);
        Ok(())
    }

    pub async fn set_local_description(
        &self,
        peer: &dyn PeerConnectionBackend,
        desc: SdpDescription,
    ) -> Result<()> {
        require_sdp(&desc)?;
        let sdp_type = desc.sdp_type;
        peer.set_local_description(desc).await?;
        info!("Local {} applied", sdp_type);
        Ok(())
    }

    /// Create an offer and install it as the local description
    pub async fn create_offer(&self, peer: &dyn PeerConnectionBackend) -> Result<SdpDescription> {
        let offer = peer.create_offer(&self.options).await?;
        peer.set_local_description(offer.clone()).await?;
        debug!("Created offer ({} bytes)", offer.sdp.len());
        Ok(offer)
    }

    /// Create an answer and install it as the local description
    pub async fn create_answer(&self, peer: &dyn PeerConnectionBackend) -> Result<SdpDescription> {
        let answer = peer.create_answer(&self.options).await?;
        peer.set_local_description(answer.clone()).await?;
        debug!("Created answer ({} bytes)", answer.sdp.len());
        Ok(answer)
    }

    /// Apply a remote candidate, dropping it when it cannot be used
    pub async fn add_ice_candidate(
        &self,
        peer: &dyn PeerConnectionBackend,
        candidate: IceCandidate,
    ) -> Result<CandidateOutcome> {
        if candidate.candidate.trim().is_empty() {
            return Err(AppError::MissingArgument("candidate"));
        }

        let state = peer.connection_state();
        let outcome = if state.is_terminal() {
            warn!("Dropping ICE candidate: connection is {}", state);
            CandidateOutcome::TooLate
        } else if !peer.has_remote_description().await {
            warn!("Dropping ICE candidate received before remote description");
            CandidateOutcome::TooEarly
        } else {
            match peer.add_ice_candidate(normalize_candidate(candidate)).await {
                Ok(()) => CandidateOutcome::Applied,
                Err(e) => {
                    debug!("Dropping ICE candidate refused by engine: {}", e);
                    CandidateOutcome::Rejected
                }
            }
        };

        let counter = match outcome {
            CandidateOutcome::Applied => &self.applied,
            _ => &self.dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(outcome)
    }
}

fn require_sdp(desc: &SdpDescription) -> Result<()> {
    if desc.sdp.trim().is_empty() {
        return Err(AppError::MissingArgument("sdp"));
    }
    Ok(())
}

/// Pick the media association passed to the engine
///
/// The m-line index wins when present; the mid rides along only when it
/// is purely numeric. Without an index the mid is used as given.
pub fn normalize_candidate(candidate: IceCandidate) -> IceCandidate {
    let IceCandidate {
        candidate,
        sdp_mid,
        sdp_mline_index,
    } = candidate;

    let sdp_mid = match sdp_mline_index {
        Some(_) => sdp_mid.filter(|mid| !mid.is_empty() && mid.bytes().all(|b| b.is_ascii_digit())),
        None => sdp_mid,
    };

    IceCandidate {
        candidate,
        sdp_mid,
        sdp_mline_index,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::MemoryEngine;
    use crate::engine::{PeerConfig, PeerEventSlots, RtcEngine};
    use crate::webrtc::signaling::{ConnectionState, SdpType};

    const CANDIDATE: &str = "candidate:842163049 1 udp 1677729535 203.0.113.7 46154 typ srflx";

    #[test]
    fn test_mline_index_preferred() {
        let c = normalize_candidate(IceCandidate::new(CANDIDATE).with_mid("audio").with_mline_index(0));
        assert_eq!(c.sdp_mid, None);
        assert_eq!(c.sdp_mline_index, Some(0));

        let c = normalize_candidate(IceCandidate::new(CANDIDATE).with_mid("1").with_mline_index(1));
        assert_eq!(c.sdp_mid.as_deref(), Some("1"));
    }

    #[test]
    fn test_mid_alone_passes_through() {
        let c = normalize_candidate(IceCandidate::new(CANDIDATE).with_mid("video"));
        assert_eq!(c.sdp_mid.as_deref(), Some("video"));
        assert_eq!(c.sdp_mline_index, None);
    }

    #[tokio::test]
    async fn test_candidate_before_remote_description_is_dropped() {
        let engine = MemoryEngine::new();
        let peer = engine
            .create_peer_connection(&PeerConfig::default(), PeerEventSlots::empty())
            .await
            .unwrap();
        let negotiation = NegotiationEngine::new();

        let outcome = negotiation
            .add_ice_candidate(peer.as_ref(), IceCandidate::new(CANDIDATE).with_mline_index(0))
            .await
            .unwrap();

        assert_eq!(outcome, CandidateOutcome::TooEarly);
        assert_eq!(engine.peer(0).unwrap().applied_candidate_count(), 0);
        assert_eq!(negotiation.stats().candidates_dropped, 1);
    }

    #[tokio::test]
    async fn test_offer_installs_local_description() {
        let engine = MemoryEngine::new();
        let offerer = engine
            .create_peer_connection(&PeerConfig::default(), PeerEventSlots::empty())
            .await
            .unwrap();
        let answerer = engine
            .create_peer_connection(&PeerConfig::default(), PeerEventSlots::empty())
            .await
            .unwrap();
        let negotiation = NegotiationEngine::new();

        let offer = negotiation.create_offer(offerer.as_ref()).await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.contains("m=audio") && offer.sdp.contains("m=video"));

        negotiation
            .set_remote_description(answerer.as_ref(), offer)
            .await
            .unwrap();
        let answer = negotiation.create_answer(answerer.as_ref()).await.unwrap();
        assert_eq!(answer.sdp_type, SdpType::Answer);
        negotiation
            .set_remote_description(offerer.as_ref(), answer)
            .await
            .unwrap();
        assert_eq!(offerer.connection_state(), ConnectionState::Connected);

        let outcome = negotiation
            .add_ice_candidate(offerer.as_ref(), IceCandidate::new(CANDIDATE).with_mline_index(0))
            .await
            .unwrap();
        assert_eq!(outcome, CandidateOutcome::Applied);

        let outcome = negotiation
            .add_ice_candidate(offerer.as_ref(), IceCandidate::new("garbage"))
            .await
            .unwrap();
        assert_eq!(outcome, CandidateOutcome::Rejected);
    }

    #[tokio::test]
    async fn test_candidate_after_failure_is_dropped() {
        let engine = MemoryEngine::new();
        let peer = engine
            .create_peer_connection(&PeerConfig::default(), PeerEventSlots::empty())
            .await
            .unwrap();
        engine.peer(0).unwrap().set_connection_state(ConnectionState::Failed);

        let outcome = NegotiationEngine::new()
            .add_ice_candidate(peer.as_ref(), IceCandidate::new(CANDIDATE))
            .await
            .unwrap();
        assert_eq!(outcome, CandidateOutcome::TooLate);
    }

    #[tokio::test]
    async fn test_empty_inputs_rejected() {
        let engine = MemoryEngine::new();
        let peer = engine
            .create_peer_connection(&PeerConfig::default(), PeerEventSlots::empty())
            .await
            .unwrap();
        let negotiation = NegotiationEngine::new();

        assert!(matches!(
            negotiation
                .set_remote_description(peer.as_ref(), SdpDescription::offer(""))
                .await,
            Err(AppError::MissingArgument("sdp"))
        ));
        assert!(matches!(
            negotiation.add_ice_candidate(peer.as_ref(), IceCandidate::new(" ")).await,
            Err(AppError::MissingArgument("candidate"))
        ));
        assert!(matches!(
            negotiation
                .set_remote_description(peer.as_ref(), SdpDescription::offer("bogus"))
                .await,
            Err(AppError::NegotiationRejected(_))
        ));
    }
}
