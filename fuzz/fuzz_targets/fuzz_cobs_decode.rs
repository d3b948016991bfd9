#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(decoded) = goster_gateway::cobs_decode(data) {
        let encoded = goster_gateway::cobs_encode(&decoded);
        assert_eq!(goster_gateway::cobs_decode(&encoded).unwrap(), decoded);
    }
});
