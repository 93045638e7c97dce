use dns_types::protocol::types::test_util::*;
use dns_types::protocol::types::*;

#[test]
fn roundtrip_message() {
    for _ in 0..100 {
        let original = arbitrary_message();
        let octets = original.to_octets().unwrap();

        assert_eq!(Ok(original), Message::from_octets(&octets));
    }
}

#[test]
fn roundtrip_cache_file_records() {
    for _ in 0..100 {
        let original = arbitrary_resourcerecord();
        let json = serde_json::to_vec(&original).unwrap();

        assert_eq!(original, serde_json::from_slice(&json).unwrap());
    }
}
