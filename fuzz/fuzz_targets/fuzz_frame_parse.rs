#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(parts) = goster_gateway::parse_frame(data) {
        let _ = parts.header.aad();
    }
});
