//! Relay-cell digest protocol tests
//!
//! Exercises the documented zero-then-digest procedure through paired
//! client/relay crypto states: a cell built and encrypted on one side must
//! be recognized and digest-verified on the other, and any single-byte
//! corruption must be rejected.

use tor_circuit::crypto::{compute_legacy_kdf, TorCryptoState};
use tor_circuit::protocol::relay::{RelayCellPlain, RelayCommand};
use tor_circuit::protocol::FIXED_PAYLOAD_LEN;

/// Client send procedure: digest with the destination hop, then add every
/// layer from farthest to nearest.
fn client_send(hops: &mut [TorCryptoState], mut cell: RelayCellPlain) -> Vec<u8> {
    let destination = hops.len() - 1;
    let zeroed = cell.encode(true);
    hops[destination].forward_digest.update(&zeroed);
    let digest = hops[destination].forward_digest.current_digest();
    cell.digest.copy_from_slice(&digest[..4]);

    let mut body = cell.encode(false);
    for hop in hops.iter_mut().rev() {
        hop.forward_cipher.apply(&mut body);
    }
    body
}

/// Relay-side receive: peel one layer per hop until some hop recognizes
/// the cell and its digest verifies.
fn relay_receive(
    hops: &mut [TorCryptoState],
    mut body: Vec<u8>,
) -> Option<(usize, RelayCellPlain)> {
    for (hop_index, hop) in hops.iter_mut().enumerate() {
        hop.forward_cipher.apply(&mut body);
        if body[1] != 0 || body[2] != 0 {
            continue;
        }
        let mut claimed = [0u8; 4];
        claimed.copy_from_slice(&body[5..9]);
        let mut zeroed = body.clone();
        zeroed[5..9].fill(0);
        let peeked = hop.forward_digest.peek_digest(&zeroed);
        if peeked[..4] == claimed {
            hop.forward_digest.update(&zeroed);
            return Some((hop_index, RelayCellPlain::decode(&body).unwrap()));
        }
    }
    None
}

fn paired_states(seed: &[u8]) -> (TorCryptoState, TorCryptoState) {
    let kdf = compute_legacy_kdf(seed);
    (
        TorCryptoState::from_kdf_result(&kdf).unwrap(),
        TorCryptoState::from_kdf_result(&kdf).unwrap(),
    )
}

#[test]
fn one_hop_begin_dir_is_recognized_and_verified() {
    let (client, relay) = paired_states(b"hop zero shared secret");
    let mut client_hops = vec![client];
    let mut relay_hops = vec![relay];

    let cell = RelayCellPlain::begin_dir(7).unwrap();
    let body = client_send(&mut client_hops, cell);
    assert_eq!(body.len(), FIXED_PAYLOAD_LEN);

    let (origin, plain) = relay_receive(&mut relay_hops, body).expect("cell must be recognized");
    assert_eq!(origin, 0);
    assert_eq!(plain.command, RelayCommand::BeginDir);
    assert_eq!(plain.stream_id, 7);
    assert!(plain.is_recognized());
    assert!(plain.data.is_empty());
}

#[test]
fn running_digest_chains_across_cells() {
    let (client, relay) = paired_states(b"chained digests");
    let mut client_hops = vec![client];
    let mut relay_hops = vec![relay];

    // Three cells in a row; each digest depends on everything before it,
    // so any replay or reorder would break verification.
    for sequence in 0u8..3 {
        let cell = RelayCellPlain::data(9, vec![sequence; 32]).unwrap();
        let body = client_send(&mut client_hops, cell);
        let (_, plain) = relay_receive(&mut relay_hops, body).expect("in-order cell verifies");
        assert_eq!(plain.data, vec![sequence; 32]);
    }
}

#[test]
fn two_hop_cell_is_recognized_only_at_terminal_hop() {
    let (client0, relay0) = paired_states(b"hop zero");
    let (client1, relay1) = paired_states(b"hop one");
    let mut client_hops = vec![client0, client1];
    let mut relay_hops = vec![relay0, relay1];

    let cell = RelayCellPlain::data(3, b"through two layers".to_vec()).unwrap();
    let body = client_send(&mut client_hops, cell);

    let (origin, plain) = relay_receive(&mut relay_hops, body).expect("terminal hop verifies");
    assert_eq!(origin, 1);
    assert_eq!(plain.data, b"through two layers");
}

#[test]
fn single_byte_corruption_is_rejected() {
    // One fresh state pair per flipped position: corruption must not be
    // able to poison the running digest for later probes.
    for position in [0usize, 1, 5, 8, 10, 11, 100, 508] {
        let (client, relay) = paired_states(b"corruption probe");
        let mut client_hops = vec![client];
        let mut relay_hops = vec![relay];

        let cell = RelayCellPlain::data(5, b"payload under test".to_vec()).unwrap();
        let mut body = client_send(&mut client_hops, cell);
        body[position] ^= 0x01;

        assert!(
            relay_receive(&mut relay_hops, body).is_none(),
            "flipped byte {} must cause non-recognition or digest mismatch",
            position
        );
    }
}

#[test]
fn backward_direction_verifies_with_backward_state() {
    let (mut client, mut relay) = paired_states(b"backward path");

    // Relay-to-client uses the backward digest and cipher.
    let mut cell = RelayCellPlain::new(RelayCommand::Connected, 7, Vec::new()).unwrap();
    let zeroed = cell.encode(true);
    relay.backward_digest.update(&zeroed);
    let digest = relay.backward_digest.current_digest();
    cell.digest.copy_from_slice(&digest[..4]);
    let mut body = cell.encode(false);
    relay.backward_cipher.apply(&mut body);

    // Client side peels and verifies.
    client.backward_cipher.apply(&mut body);
    assert_eq!(&body[1..3], &[0, 0]);
    let mut claimed = [0u8; 4];
    claimed.copy_from_slice(&body[5..9]);
    let mut zeroed = body.clone();
    zeroed[5..9].fill(0);
    let peeked = client.backward_digest.peek_digest(&zeroed);
    assert_eq!(&peeked[..4], &claimed);

    let plain = RelayCellPlain::decode(&body).unwrap();
    assert_eq!(plain.command, RelayCommand::Connected);
}
