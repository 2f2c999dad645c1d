//! Fuzz target: `TestConfig::validate_and_normalize`
//!
//! Decodes a config from the fuzz input the same way the persisted body
//! does, then validates it.  Accepted configs must be idempotent under a
//! second normalisation and start-able by the sequencer.
//!
//! cargo fuzz run fuzz_test_config

#![no_main]

use blowerdoor::adapters::flash::MemFlash;
use blowerdoor::config::TestConfig;
use blowerdoor::sequencer::TestService;
use blowerdoor::sequencer::report::TestMode;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(cfg) = postcard::from_bytes::<TestConfig>(data) else {
        return;
    };
    let Ok(normalized) = cfg.validate_and_normalize() else {
        return;
    };
    assert_eq!(normalized.validate_and_normalize().as_ref(), Ok(&normalized));

    let svc = TestService::new(MemFlash::default());
    svc.set_config(&normalized).expect("valid config accepted");
    let _ = svc.start(TestMode::Both, 0, &()).expect("valid config starts");
});
