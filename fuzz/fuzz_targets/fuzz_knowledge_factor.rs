#![no_main]

use applock_core::{KnowledgeFactor, LockType};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(candidate) = std::str::from_utf8(data) else {
        return;
    };

    for lock_type in [LockType::Pin, LockType::Pattern] {
        if let Ok(factor) = KnowledgeFactor::parse(lock_type, candidate) {
            assert_eq!(factor.lock_type(), lock_type);

            // The canonical form parses back to itself
            let canonical = factor.canonical_bytes();
            let text = std::str::from_utf8(&canonical).unwrap();
            let again = KnowledgeFactor::parse(lock_type, text).unwrap();
            assert_eq!(again.canonical_bytes().as_slice(), canonical.as_slice());
        }
    }
});
