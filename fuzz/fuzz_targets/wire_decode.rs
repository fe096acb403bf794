#![no_main]

use libfuzzer_sys::fuzz_target;
use telemetry::{SignedDecision, SignedEvent};

fuzz_target!(|data: &[u8]| {
    let Ok(raw) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(event) = SignedEvent::from_json(raw) {
        let _ = event.signing_payload();
        let _ = event.to_json();
    }
    if let Ok(decision) = SignedDecision::from_json(raw) {
        let _ = decision.signing_payload();
        let _ = decision.to_json();
    }
});
