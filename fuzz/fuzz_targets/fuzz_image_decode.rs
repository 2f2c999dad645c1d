//! Fuzz target: `decode_image`
//!
//! Feeds arbitrary flash contents to the image decoder.  It must never
//! panic, and anything it accepts must re-encode to a stable image.
//!
//! cargo fuzz run fuzz_image_decode

#![no_main]

use blowerdoor::persistence::{decode_image, encode_image};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(state) = decode_image(data) else {
        return;
    };
    let region = data.len().max(8192);
    let image = encode_image(&state, region).expect("decoded state re-encodes");
    let again = decode_image(&image).expect("re-encoded image decodes");
    // Bytes, not values: a stored config may hold NaN.
    assert_eq!(encode_image(&again, region).expect("stable re-encode"), image);
});
