use nv_rs::thunk::queues::{Opcode, PacketHeader};
use proptest::prelude::*;

fn opcode() -> impl Strategy<Value = Opcode> {
    prop_oneof![Just(Opcode::Incrementing), Just(Opcode::OneIncrement)]
}

proptest! {
    #[test]
    fn encode_then_decode_is_identity(
        opcode in opcode(),
        count in 0u32..=0x1FFF,
        subchannel in 0u32..=7,
        method_word in 0u32..=0xFFF,
    ) {
        let header = PacketHeader::new(opcode, count, subchannel, method_word << 2).unwrap();
        prop_assert_eq!(PacketHeader::decode(header.encode()), Some(header));
    }

    #[test]
    fn decode_then_encode_is_identity(word in any::<u32>()) {
        if let Some(header) = PacketHeader::decode(word) {
            prop_assert_eq!(header.encode(), word);
        }
    }

    #[test]
    fn misaligned_methods_are_rejected(method in 0u32..=0x3FFF) {
        prop_assume!(method % 4 != 0);
        prop_assert!(PacketHeader::new(Opcode::Incrementing, 1, 1, method).is_err());
    }
}
