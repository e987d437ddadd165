//! Super-block codec scenarios: the bit-exact version 12.0 envelope and
//! the legacy 67.0 upgrade path.

use quarry::ComponentStates;

#[test]
fn version_12_0_encoding_is_bit_exact() {
    let states = ComponentStates {
        journal_start: 0,
        logical_blocks: 0,
        physical_blocks: 0,
        nonce: 0,
        block_map_root_count: 0,
        physical_zone_count: 0,
    };
    let encoded = states.encode();

    // {id | major 12 | minor 0 | size 34} little-endian, then the
    // payload, then the checksum.
    let expected_prefix: [u8; 20] = [
        0x00, 0x00, 0x00, 0x00, //
        0x0c, 0x00, 0x00, 0x00, //
        0x00, 0x00, 0x00, 0x00, //
        0x22, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    ];
    assert_eq!(&encoded[..20], &expected_prefix);
    assert_eq!(encoded.len(), 20 + 0x22 + 4);
    assert!(encoded[20..20 + 0x22].iter().all(|&b| b == 0));

    let checksum = crc32fast::hash(&encoded[..20 + 0x22]);
    assert_eq!(&encoded[20 + 0x22..], &checksum.to_le_bytes());
}

#[test]
fn component_round_trip_and_promotion() {
    let states = ComponentStates {
        journal_start: 8191,
        logical_blocks: 1 << 30,
        physical_blocks: 1 << 26,
        nonce: 0x0123_4567_89ab_cdef,
        block_map_root_count: 60,
        physical_zone_count: 3,
    };
    assert_eq!(ComponentStates::decode(&states.encode()).unwrap(), states);
    assert_eq!(
        ComponentStates::decode(&states.encode_legacy()).unwrap(),
        states,
        "legacy 67.0 fields must promote into the current structure"
    );
}

#[test]
fn corruption_fails_the_checksum() {
    let states = ComponentStates {
        journal_start: 1,
        logical_blocks: 2,
        physical_blocks: 3,
        nonce: 4,
        block_map_root_count: 5,
        physical_zone_count: 6,
    };
    let mut encoded = states.encode();
    let last = encoded.len() - 10;
    encoded[last] ^= 0x01;
    assert!(ComponentStates::decode(&encoded).is_err());
}
