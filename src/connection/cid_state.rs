//! Maintain the state of locally issued connection IDs

use std::collections::VecDeque;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::{
    cid_generator::ConnectionIdGenerator,
    crypto::HmacKey,
    shared::{ConnectionId, EndpointEvent, IssuedCid},
    token::ResetToken,
    transport_error::TransportError,
};

/// Most connection IDs permitted to be active at once, regardless of what the peer's
/// `active_connection_id_limit` allows
pub(crate) const MAX_ACTIVE_CIDS: u64 = 4;

/// Hard cap on connection IDs ever outstanding simultaneously
const MAX_ISSUED_CIDS: u64 = 6;

/// Lifecycle manager for the connection IDs this endpoint has handed to its peer
///
/// Issues fresh CIDs up to the peer's active limit, pairs each with a stateless reset
/// token, processes RETIRE_CONNECTION_ID frames, and tears everything down when the
/// connection closes. Routing changes are surfaced to the endpoint as
/// [`EndpointEvent`]s; NEW_CONNECTION_ID frames to transmit are returned to the caller
/// for queueing.
pub(crate) struct CidState {
    /// Sequence number → CID, for every issued CID the peer has not retired
    active: FxHashMap<u64, ConnectionId>,
    /// The connection ID the client addressed its very first Initial to (server only);
    /// usable by the peer until the handshake completes
    initial_client_dest_cid: Option<ConnectionId>,
    /// Highest sequence number issued so far; sequence 0 is the handshake CID
    highest_seq: u64,
    /// Number of CIDs the peer is willing to keep active
    active_limit: u64,
    generator: Box<dyn ConnectionIdGenerator>,
    reset_key: Arc<dyn HmacKey>,
    /// Tolerate peers retiring the CID their RETIRE_CONNECTION_ID frame arrived on
    allow_retirement_of_current_cid: bool,
    events: VecDeque<EndpointEvent>,
}

impl CidState {
    pub(crate) fn new(
        initial_cid: ConnectionId,
        initial_client_dest_cid: Option<ConnectionId>,
        generator: Box<dyn ConnectionIdGenerator>,
        reset_key: Arc<dyn HmacKey>,
        allow_retirement_of_current_cid: bool,
    ) -> Self {
        let mut active = FxHashMap::default();
        // The CID used during the handshake was issued implicitly with sequence 0
        active.insert(0, initial_cid);
        Self {
            active,
            initial_client_dest_cid,
            highest_seq: 0,
            active_limit: 1,
            generator,
            reset_key,
            allow_retirement_of_current_cid,
            events: VecDeque::new(),
        }
    }

    /// Routing instructions for the endpoint
    pub(crate) fn poll_event(&mut self) -> Option<EndpointEvent> {
        self.events.pop_front()
    }

    /// Install the peer's `active_connection_id_limit` and issue CIDs up to it
    ///
    /// The initial CID counts against the limit. Returns the NEW_CONNECTION_ID frames to
    /// transmit.
    pub(crate) fn set_max_active_cids(&mut self, limit: u64) -> Vec<IssuedCid> {
        self.active_limit = limit.min(MAX_ISSUED_CIDS);
        let mut issued = Vec::new();
        while (self.active.len() as u64) < self.active_limit {
            issued.push(self.issue_cid());
        }
        issued
    }

    /// Process a RETIRE_CONNECTION_ID frame
    ///
    /// `packet_dest_cid` is the destination CID of the packet the frame arrived in.
    /// Returns replacement NEW_CONNECTION_ID frames to transmit, if any.
    pub(crate) fn retire(
        &mut self,
        sequence: u64,
        packet_dest_cid: &ConnectionId,
    ) -> Result<Vec<IssuedCid>, TransportError> {
        if sequence > self.highest_seq {
            return Err(TransportError::PROTOCOL_VIOLATION(format!(
                "retired connection ID {sequence}, but highest issued is {}",
                self.highest_seq
            )));
        }
        let cid = match self.active.get(&sequence) {
            // Duplicate retirement of an already-retired CID is benign
            None => return Ok(Vec::new()),
            Some(cid) => *cid,
        };
        if cid == *packet_dest_cid && !self.allow_retirement_of_current_cid {
            return Err(TransportError::PROTOCOL_VIOLATION(format!(
                "retired connection ID {sequence} ({cid}), which was used as the destination connection ID on this packet",
            )));
        }
        trace!(sequence, %cid, "peer retired connection ID");
        self.active.remove(&sequence);
        self.events.push_back(EndpointEvent::RetireCid(cid));

        // Keep the peer supplied with unlinkable CIDs
        let mut issued = Vec::new();
        while (self.active.len() as u64) < self.active_limit {
            issued.push(self.issue_cid());
        }
        Ok(issued)
    }

    fn issue_cid(&mut self) -> IssuedCid {
        self.highest_seq += 1;
        let id = self.generator.generate_cid();
        let reset_token = ResetToken::new(&*self.reset_key, id);
        self.active.insert(self.highest_seq, id);
        self.events
            .push_back(EndpointEvent::AddCid { id, reset_token });
        IssuedCid {
            sequence: self.highest_seq,
            retire_prior_to: 0,
            id,
            reset_token,
        }
    }

    /// The client's initial destination CID is not needed once the handshake completes
    /// (server only)
    pub(crate) fn set_handshake_complete(&mut self) {
        if let Some(cid) = self.initial_client_dest_cid.take() {
            self.events.push_back(EndpointEvent::RetireCid(cid));
        }
    }

    /// Drop routing state for every CID associated with this connection
    pub(crate) fn remove_all(&mut self) {
        for cid in self.all_cids() {
            self.events.push_back(EndpointEvent::RemoveCid(cid));
        }
    }

    /// Bind every active CID to a closed-connection responder replaying `packet` for the
    /// drain period
    pub(crate) fn replace_with_closed(&mut self, packet: Vec<u8>) {
        let ids = self.all_cids();
        self.events
            .push_back(EndpointEvent::ReplaceWithClosed { ids, packet });
    }

    fn all_cids(&self) -> Vec<ConnectionId> {
        self.active
            .values()
            .copied()
            .chain(self.initial_client_dest_cid)
            .collect()
    }

    /// Number of CIDs the peer can currently route to us
    #[cfg(test)]
    fn active_count(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cid_generator::RandomConnectionIdGenerator;
    use assert_matches::assert_matches;

    fn state(allow_retirement_of_current_cid: bool) -> CidState {
        let key = Arc::new(TestKey);
        CidState::new(
            ConnectionId::new(&[1, 2, 3, 4, 5, 6, 7]),
            Some(ConnectionId::new(&[0xa, 0xb, 0xc, 0xd, 0xe])),
            Box::new(RandomConnectionIdGenerator::new(7)),
            key,
            allow_retirement_of_current_cid,
        )
    }

    struct TestKey;

    impl HmacKey for TestKey {
        fn sign(&self, data: &[u8], signature_out: &mut [u8]) {
            for (i, byte) in signature_out.iter_mut().enumerate() {
                *byte = data.first().copied().unwrap_or(0) ^ i as u8;
            }
        }
        fn signature_len(&self) -> usize {
            32
        }
        fn verify(&self, _: &[u8], _: &[u8]) -> Result<(), crate::crypto::CryptoError> {
            Ok(())
        }
    }

    fn drain(state: &mut CidState) -> Vec<EndpointEvent> {
        std::iter::from_fn(|| state.poll_event()).collect()
    }

    #[test]
    fn issues_new_connection_ids() {
        let mut state = state(false);
        let issued = state.set_max_active_cids(4);
        assert_eq!(issued.len(), 3);
        for (i, frame) in issued.iter().enumerate() {
            assert_eq!(frame.sequence, i as u64 + 1);
            assert_eq!(frame.id.len(), 7);
            assert_eq!(frame.reset_token, ResetToken::new(&TestKey, frame.id));
        }
        // All distinct
        for window in issued.windows(2) {
            assert_ne!(window[0].id, window[1].id);
        }
        let events = drain(&mut state);
        assert_eq!(events.len(), 3);
        for event in events {
            assert_matches!(event, EndpointEvent::AddCid { .. });
        }
    }

    #[test]
    fn limits_the_number_of_issued_cids() {
        let mut state = state(false);
        let issued = state.set_max_active_cids(9_999_999);
        assert_eq!(issued.len(), MAX_ISSUED_CIDS as usize - 1);
    }

    #[test]
    fn rejects_retirement_of_unissued_sequence() {
        let mut state = state(false);
        let err = state
            .retire(1, &ConnectionId::new(&[]))
            .unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::PROTOCOL_VIOLATION);
    }

    #[test]
    fn rejects_retirement_via_the_retired_cid() {
        let mut state = state(false);
        let issued = state.set_max_active_cids(4);
        let frame = &issued[0];
        let err = state.retire(frame.sequence, &frame.id).unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::PROTOCOL_VIOLATION);
    }

    #[test]
    fn compat_mode_tolerates_retirement_via_the_retired_cid() {
        let mut state = state(true);
        let issued = state.set_max_active_cids(4);
        let frame = &issued[0];
        assert!(state.retire(frame.sequence, &frame.id).is_ok());
    }

    #[test]
    fn issues_a_replacement_when_a_cid_is_retired() {
        let mut state = state(false);
        state.set_max_active_cids(5);
        let replacements = state.retire(3, &ConnectionId::new(&[])).unwrap();
        assert_eq!(replacements.len(), 1);
        assert_eq!(replacements[0].sequence, 5);
        assert_eq!(replacements[0].id.len(), 7);
        assert_eq!(state.active_count(), 5);
    }

    #[test]
    fn duplicate_retirements_are_idempotent() {
        let mut state = state(false);
        state.set_max_active_cids(6);
        drain(&mut state);
        let replacements = state.retire(5, &ConnectionId::new(&[])).unwrap();
        assert_eq!(replacements.len(), 1);
        let events = drain(&mut state);
        assert!(events
            .iter()
            .any(|e| matches!(e, EndpointEvent::RetireCid(_))));

        let replacements = state.retire(5, &ConnectionId::new(&[])).unwrap();
        assert!(replacements.is_empty());
        assert!(drain(&mut state).is_empty());
    }

    #[test]
    fn retiring_the_initial_cid_works() {
        let mut state = state(false);
        let replacements = state.retire(0, &ConnectionId::new(&[])).unwrap();
        // No additional CIDs were requested yet, so no replacement is due beyond the
        // active limit of one
        assert_eq!(replacements.len(), 1);
        let events = drain(&mut state);
        assert_matches!(
            events[0],
            EndpointEvent::RetireCid(cid) if cid == ConnectionId::new(&[1, 2, 3, 4, 5, 6, 7])
        );
    }

    #[test]
    fn handshake_completion_retires_the_initial_client_destination_cid() {
        let mut state = state(false);
        state.set_handshake_complete();
        let events = drain(&mut state);
        assert_eq!(events.len(), 1);
        assert_matches!(
            events[0],
            EndpointEvent::RetireCid(cid) if cid == ConnectionId::new(&[0xa, 0xb, 0xc, 0xd, 0xe])
        );
    }

    #[test]
    fn removes_all_cids() {
        let mut state = state(false);
        let issued = state.set_max_active_cids(5);
        assert_eq!(issued.len(), 4);
        drain(&mut state);
        state.remove_all();
        let events = drain(&mut state);
        // Initial CID, initial client destination CID, and the four newly issued ones
        assert_eq!(events.len(), 6);
        let removed: Vec<ConnectionId> = events
            .iter()
            .map(|e| match e {
                EndpointEvent::RemoveCid(cid) => *cid,
                x => panic!("unexpected event {x:?}"),
            })
            .collect();
        assert!(removed.contains(&ConnectionId::new(&[1, 2, 3, 4, 5, 6, 7])));
        assert!(removed.contains(&ConnectionId::new(&[0xa, 0xb, 0xc, 0xd, 0xe])));
        for frame in issued {
            assert!(removed.contains(&frame.id));
        }
    }

    #[test]
    fn replaces_all_cids_with_a_closed_responder() {
        let mut state = state(false);
        let issued = state.set_max_active_cids(5);
        drain(&mut state);
        state.replace_with_closed(vec![0xca, 0xfe]);
        let events = drain(&mut state);
        assert_eq!(events.len(), 1);
        match &events[0] {
            EndpointEvent::ReplaceWithClosed { ids, packet } => {
                assert_eq!(ids.len(), 6);
                assert_eq!(packet, &[0xca, 0xfe]);
                for frame in issued {
                    assert!(ids.contains(&frame.id));
                }
            }
            x => panic!("unexpected event {x:?}"),
        }
    }
}
