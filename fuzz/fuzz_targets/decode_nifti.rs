#![no_main]
use cff::NiftiImage;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(image) = NiftiImage::from_bytes(data) {
        let _ = image.dim();
        let _ = image.data_type();
        let _ = image.to_bytes(false);
    }
});
