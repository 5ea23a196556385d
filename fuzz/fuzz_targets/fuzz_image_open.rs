#![no_main]
use libfuzzer_sys::fuzz_target;
use qcow_rs::{MemorySource, QcowFile};

// Arbitrary bytes must either open cleanly or fail with an error, never panic.
fuzz_target!(|data: &[u8]| {
    let Ok(mut file) = QcowFile::open_source(MemorySource::new(data.to_vec())) else {
        return;
    };

    let media_size = file.media_size().unwrap_or(0);
    let _ = file.read_at(0, media_size.min(1 << 20));
    let _ = file.close();
});
