//! DKG protocol driver

use super::{CeremonySlot, DkgCeremony, DkgParams, DkgStatus, Outbound};
use crate::mpc::{broadcast, ProtocolMessage, Transport};
use crate::{Error, KeyShare, ParticipantId, Result};
use rand::rngs::OsRng;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Run the distributed key generation protocol over a transport
///
/// Each round is bounded by `round_timeout`; a round that does not
/// complete in time aborts the ceremony.
///
/// # Arguments
/// * `params` - Ceremony parameters
/// * `slot` - This node's ceremony slot
/// * `transport` - Authenticated transport to the other participants
///
/// # Returns
/// The participant's key share after successful DKG
#[instrument(skip(slot, transport), fields(participant_id = params.participant_id))]
pub async fn run_dkg<T: Transport + ?Sized>(
    params: &DkgParams,
    slot: &CeremonySlot,
    transport: &T,
    round_timeout: Duration,
) -> Result<KeyShare> {
    info!(
        participant_id = params.participant_id,
        threshold = params.threshold,
        total = params.total,
        ceremony_id = %hex::encode(&params.ceremony_id[..8]),
        "Starting DKG"
    );

    let mut rng = OsRng;
    let mut ceremony = DkgCeremony::new(params.clone(), slot, &mut rng)?;
    let everyone = params.participants();

    debug!("DKG Round 1: Commitments");
    dispatch(transport, &everyone, ceremony.start()).await?;

    let mut status = ceremony.status();
    let mut deadline = Instant::now() + round_timeout;

    while ceremony.status() != DkgStatus::Complete {
        let envelope = match tokio::time::timeout_at(deadline, transport.recv()).await {
            Ok(envelope) => envelope?,
            Err(_) => {
                let err = Error::Timeout(format!("DKG stalled in {:?}", ceremony.status()));
                return Err(ceremony.abort(err));
            }
        };

        let message = match ProtocolMessage::decode(&envelope.payload) {
            Ok(ProtocolMessage::Dkg(message)) => message,
            Ok(ProtocolMessage::Signing(_)) => {
                debug!(from = envelope.from, "Ignoring signing message during DKG");
                continue;
            }
            Err(e) => {
                warn!(from = envelope.from, error = %e, "Dropping undecodable message");
                continue;
            }
        };

        let outbound = ceremony.handle(envelope.from, message)?;
        dispatch(transport, &everyone, outbound).await?;

        if ceremony.status() != status {
            status = ceremony.status();
            deadline = Instant::now() + round_timeout;
            debug!(?status, "DKG advanced");
        }
    }

    let key_share = ceremony.key_share()?;

    info!(
        participant_id = params.participant_id,
        group_public_key = %hex::encode(key_share.group_public_key),
        "DKG completed successfully"
    );

    Ok(key_share)
}

async fn dispatch<T: Transport + ?Sized>(
    transport: &T,
    everyone: &[ParticipantId],
    outbound: Vec<Outbound>,
) -> Result<()> {
    for item in outbound {
        match item {
            Outbound::Broadcast(message) => {
                let bytes = ProtocolMessage::Dkg(message).encode()?;
                broadcast(transport, everyone, &bytes).await?;
            }
            Outbound::Direct(to, message) => {
                let bytes = ProtocolMessage::Dkg(message).encode()?;
                transport.send(to, bytes).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpc::MemoryNetwork;
    use std::sync::Arc;

    async fn run_group(
        network: &MemoryNetwork,
        threshold: usize,
        total: usize,
        timeout: Duration,
    ) -> Vec<Result<KeyShare>> {
        let ceremony_id = [3u8; 32];
        let mut handles = Vec::new();
        for id in 1..=total as ParticipantId {
            let transport = Arc::new(network.endpoint(id));
            let params = DkgParams::new(ceremony_id, id, threshold, total).unwrap();
            handles.push(tokio::spawn(async move {
                let slot = CeremonySlot::new();
                run_dkg(&params, &slot, transport.as_ref(), timeout).await
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        results
    }

    #[tokio::test]
    async fn test_dkg_over_memory_network() {
        let network = MemoryNetwork::new();
        network.set_duplicate(true);

        let results = run_group(&network, 2, 3, Duration::from_secs(5)).await;
        let shares: Vec<KeyShare> = results.into_iter().map(|r| r.unwrap()).collect();

        assert!(shares
            .iter()
            .all(|s| s.group_public_key == shares[0].group_public_key));
    }

    #[tokio::test]
    async fn test_dkg_times_out_with_offline_participant() {
        let network = MemoryNetwork::new();
        let results = {
            // Endpoint 3 is attached but never runs
            let _silent = network.endpoint(3);
            let ceremony_id = [4u8; 32];
            let mut handles = Vec::new();
            for id in 1..=2 {
                let transport = network.endpoint(id);
                let params = DkgParams::new(ceremony_id, id, 2, 3).unwrap();
                handles.push(tokio::spawn(async move {
                    let slot = CeremonySlot::new();
                    run_dkg(&params, &slot, &transport, Duration::from_millis(200)).await
                }));
            }
            let mut results = Vec::new();
            for handle in handles {
                results.push(handle.await.unwrap());
            }
            results
        };

        for result in results {
            assert!(matches!(result, Err(Error::Timeout(_))));
        }
    }
}
