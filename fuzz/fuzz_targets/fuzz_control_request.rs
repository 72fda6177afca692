#![no_main]

use applock_daemon::ipc::IpcRequest;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Parsing arbitrary bytes must never panic
    if let Ok(request) = serde_json::from_slice::<IpcRequest>(data) {
        // Round-trip
        let json = serde_json::to_string(&request).unwrap();
        let reparsed: IpcRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            serde_json::to_value(&reparsed).unwrap()
        );
    }
});
