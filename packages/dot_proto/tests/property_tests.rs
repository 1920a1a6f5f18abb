use proptest::prelude::*;

use dot_proto::{DecodeError, ErrorCode, Packet, PacketType, Request, Response};

fn arb_known_type() -> impl Strategy<Value = u32> {
    prop::sample::select(PacketType::ALL.to_vec()).prop_map(PacketType::code)
}

fn arb_type() -> impl Strategy<Value = u32> {
    prop_oneof![arb_known_type(), any::<u32>()]
}

// --- Hostile input never panics the decoders ---

proptest! {
    #[test]
    fn request_decode_total(ptype in arb_type(), payload in prop::collection::vec(any::<u8>(), 0..96)) {
        let packet = Packet { ptype, payload };
        match Request::decode(&packet) {
            Ok(request) => prop_assert_eq!(request.packet_type().code(), ptype),
            Err(err) => {
                let code = err.error_code();
                prop_assert!(matches!(
                    code,
                    ErrorCode::UnknownInstruction | ErrorCode::IllegalInstruction | ErrorCode::InvalidPacket
                ));
            }
        }
    }

    #[test]
    fn response_decode_total(ptype in arb_type(), payload in prop::collection::vec(any::<u8>(), 0..96)) {
        let packet = Packet { ptype, payload };
        let _ = Response::decode(&packet);
    }

    #[test]
    fn decoded_requests_reencode_to_the_same_bytes(ptype in arb_known_type(), payload in prop::collection::vec(any::<u8>(), 0..64)) {
        let packet = Packet { ptype, payload };
        if let Ok(request) = Request::decode(&packet) {
            // ParamFlags drops unknown bits, so only compare when none were set.
            if !matches!(request, Request::ParamValue { .. } | Request::ParamRequest { .. }) {
                prop_assert_eq!(request.to_packet(), packet);
            }
        }
    }

    #[test]
    fn unknown_codes_are_unknown_instructions(ptype in any::<u32>()) {
        prop_assume!(PacketType::from_code(ptype).is_none());
        let packet = Packet { ptype, payload: vec![] };
        prop_assert_eq!(Request::decode(&packet), Err(DecodeError::UnknownType(ptype)));
    }
}

// --- Framing ---

proptest! {
    #[test]
    fn frames_split_anywhere_reassemble(payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..40), 1..6)) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(async {
            let mut wire = Vec::new();
            for p in &payloads {
                wire.extend(Packet::new(PacketType::Packet, p.clone()).encode());
            }
            let mut input: &[u8] = &wire;
            for p in &payloads {
                let frame = dot_proto::read_frame(&mut input, 64).await.unwrap().unwrap();
                assert_eq!(frame, dot_proto::Frame::Packet(Packet::new(PacketType::Packet, p.clone())));
            }
            assert!(dot_proto::read_frame(&mut input, 64).await.unwrap().is_none());
        });
    }
}
