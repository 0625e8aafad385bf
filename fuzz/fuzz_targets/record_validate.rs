#![no_main]

use libfuzzer_sys::fuzz_target;
use streamfeed_client::{Record, RecordLimits, ValidationError};

fuzz_target!(|data: &[u8]| {
    // Fuzz record validation with arbitrary partition and hash keys.
    // Tests handling of:
    // - Non-ASCII and multi-byte partition keys
    // - Hash keys with signs, whitespace, or more than 39 digits
    // - Empty keys
    let text = String::from_utf8_lossy(data);
    let (key, hash_key) = match text.split_once('|') {
        Some((key, hash_key)) => (key.to_string(), Some(hash_key.to_string())),
        None => (text.to_string(), None),
    };

    let mut record = Record::new(key.clone(), data.to_vec());
    if let Some(hash_key) = &hash_key {
        record = record.with_explicit_hash_key(hash_key.clone());
    }

    match record.validate(&RecordLimits::default()) {
        Ok(()) => {
            assert!(!key.is_empty());
            assert!(key.chars().count() <= 256);
            if let Some(hash_key) = hash_key {
                assert!(hash_key.parse::<u128>().is_ok());
                assert!(hash_key.bytes().all(|b| b.is_ascii_digit()));
            }
        }
        Err(ValidationError::EmptyPartitionKey) => assert!(key.is_empty()),
        Err(ValidationError::PartitionKeyTooLong { len, .. }) => assert!(len > 256),
        Err(_) => {}
    }
});
