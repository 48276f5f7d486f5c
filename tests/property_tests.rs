//! Property-based tests for the messaging core.
//!
//! Verifies the quantified protocol laws across random inputs: encrypt/
//! decrypt round-trips, permutation tolerance, tamper rejection, codec
//! round-trips, session-id determinism and X3DH agreement.

use proptest::prelude::*;
use rand_core::OsRng;

use peerseal::crypto::derive_session_id;
use peerseal::envelope::Envelope;
use peerseal::x3dh::{initiate, respond, PreKeyState};
use peerseal::{Error, IdentityKeyPair, Ratchet};

fn pair_with_root(root: [u8; 32]) -> (Ratchet, Ratchet) {
    let session_id = derive_session_id("alice", "bob", &root);
    let mut alice = Ratchet::new(&mut OsRng);
    let mut bob = Ratchet::new(&mut OsRng);
    alice.initialize(&root, &session_id);
    bob.initialize(&root, &session_id);
    (alice, bob)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_encrypt_decrypt_roundtrip(
        root in any::<[u8; 32]>(),
        message in prop::collection::vec(any::<u8>(), 0..2048)
    ) {
        let (mut alice, mut bob) = pair_with_root(root);
        let envelope = alice.encrypt(&message).unwrap();
        prop_assert_eq!(bob.decrypt(&envelope).unwrap(), message);
    }

    #[test]
    fn prop_any_delivery_order_decrypts(
        order in Just((0..30u32).collect::<Vec<_>>()).prop_shuffle()
    ) {
        let (mut alice, mut bob) = pair_with_root([11u8; 32]);

        let mut envelopes = Vec::new();
        for i in 0..30u32 {
            envelopes.push(alice.encrypt(format!("message {i}").as_bytes()).unwrap());
        }

        for &i in &order {
            let plaintext = bob.decrypt(&envelopes[i as usize]).unwrap();
            prop_assert_eq!(plaintext, format!("message {i}").into_bytes());
        }

        prop_assert_eq!(bob.recv_counter(), 30);
        prop_assert_eq!(bob.skipped_key_count(), 0);
    }

    #[test]
    fn prop_ciphertext_flip_fails_auth(
        message in prop::collection::vec(any::<u8>(), 1..512),
        position in any::<prop::sample::Index>(),
        mask in 1u8..=255
    ) {
        let (mut alice, mut bob) = pair_with_root([13u8; 32]);

        let mut envelope = alice.encrypt(&message).unwrap();
        let at = position.index(envelope.ciphertext.len());
        envelope.ciphertext[at] ^= mask;

        prop_assert_eq!(bob.decrypt(&envelope).unwrap_err(), Error::Authentication);
        prop_assert_eq!(bob.recv_counter(), 0);
        prop_assert_eq!(bob.skipped_key_count(), 0);

        // the channel survives the forgery attempt
        let envelope = alice.encrypt(b"valid").unwrap();
        prop_assert_eq!(bob.decrypt(&envelope).unwrap(), b"valid".to_vec());
    }

    #[test]
    fn prop_header_flip_never_mutates_state(
        message in prop::collection::vec(any::<u8>(), 1..512),
        position in any::<prop::sample::Index>(),
        mask in 1u8..=255
    ) {
        let (mut alice, mut bob) = pair_with_root([17u8; 32]);

        let mut envelope = alice.encrypt(&message).unwrap();
        let at = position.index(envelope.associated_data.len());
        envelope.associated_data[at] ^= mask;

        // a flip inside the counter field can push the claimed index past
        // the skip bound (FLOOD) or land on a low-order point (BAD_KEY);
        // whatever the classification, state must be untouched
        let error = bob.decrypt(&envelope).unwrap_err();
        prop_assert!(matches!(
            error,
            Error::Authentication | Error::Flood | Error::BadKey
        ));
        prop_assert_eq!(bob.recv_counter(), 0);
        prop_assert_eq!(bob.skipped_key_count(), 0);

        let envelope = alice.encrypt(b"valid").unwrap();
        prop_assert_eq!(bob.decrypt(&envelope).unwrap(), b"valid".to_vec());
    }

    #[test]
    fn prop_envelope_codec_roundtrip(
        session_id in prop::collection::vec(any::<u8>(), 0..64),
        message_index in any::<u32>(),
        previous_counter in any::<u32>(),
        timestamp in any::<u64>(),
        sender_device_id in "[a-zA-Z0-9_.-]{0,32}",
        associated_data in prop::collection::vec(any::<u8>(), 0..128),
        ciphertext in prop::collection::vec(any::<u8>(), 0..1024)
    ) {
        let envelope = Envelope {
            session_id,
            message_index,
            previous_counter,
            timestamp,
            sender_device_id,
            associated_data,
            ciphertext,
        };

        let bytes = envelope.to_bytes();
        prop_assert_eq!(Envelope::from_bytes(&bytes).unwrap(), envelope);
    }

    #[test]
    fn prop_session_id_deterministic(
        local in "[a-z0-9-]{1,24}",
        remote in "[a-z0-9-]{1,24}",
        root in any::<[u8; 32]>()
    ) {
        let here = derive_session_id(&local, &remote, &root);
        let there = derive_session_id(&remote, &local, &root);
        prop_assert_eq!(here, there);
    }

    #[test]
    fn prop_x3dh_peers_agree(seed in any::<u64>(), with_opk in any::<bool>()) {
        use rand::rngs::StdRng;
        use rand::SeedableRng;

        let mut rng = StdRng::seed_from_u64(seed);

        let responder_identity = IdentityKeyPair::generate(&mut rng);
        let mut responder_state = PreKeyState::generate_with_count(
            &mut rng,
            &responder_identity,
            u32::from(with_opk),
        );
        let bundle = responder_state.public_bundle();
        prop_assert_eq!(bundle.one_time_prekey.is_some(), with_opk);

        let initiator_identity = IdentityKeyPair::generate(&mut rng);
        let init = initiate(&mut rng, &initiator_identity, &bundle).unwrap();
        let resp = respond(&mut responder_state, &responder_identity, &init.handshake).unwrap();

        prop_assert_eq!(init.root_key.as_bytes(), resp.root_key.as_bytes());
        prop_assert_eq!(init.root_key.as_bytes().len(), 32);
    }
}
