//! Fuzz target for the calibration file decoder.
//!
//! Calibration files come from disk and may be truncated or corrupted. The
//! decoder must reject bad input with an error, never panic, and anything it
//! accepts must encode back to the same payload bytes.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use rust_xray::calibration::format::HEADER_LEN;
use rust_xray::calibration::{CalibrationFile, CalibrationType};

#[derive(Debug, Arbitrary)]
struct DecodeInput {
    kind: u8,
    width: u8,
    height: u8,
    bytes: Vec<u8>,
}

fuzz_target!(|input: DecodeInput| {
    let kind = CalibrationType::ALL[(input.kind % 4) as usize];
    let width = u32::from(input.width);
    let height = u32::from(input.height);

    if let Ok(dataset) = CalibrationFile::decode(&input.bytes, kind, width, height) {
        assert!(dataset.is_valid());
        assert_eq!(dataset.kind, kind);
        assert_eq!((dataset.width, dataset.height), (width, height));
        let encoded = CalibrationFile::encode(&dataset).expect("decoded dataset re-encodes");
        // Timestamps outside chrono's range collapse to the epoch, so only
        // the length and payload are compared.
        assert_eq!(encoded.len(), input.bytes.len());
        assert_eq!(encoded[HEADER_LEN..], input.bytes[HEADER_LEN..]);
    }
});
