#![no_main]
use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use qcow_rs::{MemorySource, QcowFile, Whence};

#[derive(Arbitrary, Debug)]
enum Op {
    Seek { offset: i64, whence: u8 },
    Read { size: u16 },
    ReadAt { offset: u64, size: u16 },
}

#[derive(Arbitrary, Debug)]
struct Input {
    /// Table and payload bytes appended after a fixed version 2 header
    body: Vec<u8>,
    media_size: u32,
    l1_entries: u8,
    ops: Vec<Op>,
}

fuzz_target!(|input: Input| {
    // 512 byte clusters, L1 table at offset 512
    let mut image = vec![0u8; 512];
    image[0..4].copy_from_slice(b"QFI\xfb");
    image[4..8].copy_from_slice(&2u32.to_be_bytes());
    image[20..24].copy_from_slice(&9u32.to_be_bytes());
    image[24..32].copy_from_slice(&u64::from(input.media_size).to_be_bytes());
    image[36..40].copy_from_slice(&u32::from(input.l1_entries).to_be_bytes());
    image[40..48].copy_from_slice(&512u64.to_be_bytes());
    image.extend_from_slice(&input.body);

    let Ok(mut file) = QcowFile::open_source(MemorySource::new(image)) else {
        return;
    };

    for op in input.ops.into_iter().take(64) {
        match op {
            Op::Seek { offset, whence } => {
                let whence = match whence % 3 {
                    0 => Whence::Set,
                    1 => Whence::Current,
                    _ => Whence::End,
                };
                let _ = file.seek(offset, whence);
            }
            Op::Read { size } => {
                if let Ok(data) = file.read(u64::from(size)) {
                    assert!(data.len() <= usize::from(size));
                }
            }
            Op::ReadAt { offset, size } => {
                let before = file.tell().ok();
                let _ = file.read_at(offset, u64::from(size));
                assert_eq!(file.tell().ok(), before);
            }
        }
    }
});
