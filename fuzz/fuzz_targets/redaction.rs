#![no_main]

use instrument::PiiRedactor;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    let redactor = PiiRedactor::new();
    let redacted = redactor.redact(text);
    // Redaction must be idempotent.
    assert_eq!(redactor.redact(&redacted), redacted);
});
