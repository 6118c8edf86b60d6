//! Calibration file codec.
//!
//! Every file starts with a fixed 64-byte little-endian header:
//!
//! ```text
//! offset  size  field
//!      0     4  magic "XCAL"
//!      4     2  format version (1)
//!      6     2  data type code (1 dark, 2 gain, 3 defect, 4 scatter)
//!      8     4  width
//!     12     4  height
//!     16     8  payload length in bytes
//!     24     8  acquisition time, microseconds since the Unix epoch
//!     32    32  SHA-256 of the payload
//! ```
//!
//! followed by the payload:
//!
//! - dark frame / gain map: `width * height` f32
//! - defect map: count u32, then count x {x u32, y u32, class u16, interpolation u16}
//! - scatter: {enabled u8, algorithm u16, cutoff f32, suppression ratio f32, flags u32}
//!
//! Magic and declared type are checked before any payload byte is read.

use super::dataset::{
    payload_checksum, CalibrationDataset, CalibrationPayload, CalibrationType, DefectClass,
    DefectEntry, Interpolation, ScatterAlgorithm, ScatterParameters,
};
use super::CalibrationError;
use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

/// File magic.
pub const MAGIC: [u8; 4] = *b"XCAL";
/// Current format version.
pub const FORMAT_VERSION: u16 = 1;
/// Size of the fixed header.
pub const HEADER_LEN: usize = 64;

const DEFECT_ENTRY_LEN: usize = 12;
const SCATTER_PAYLOAD_LEN: usize = 15;

/// Decoded file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalibrationHeader {
    /// Format version
    pub version: u16,
    /// Declared data type
    pub kind: CalibrationType,
    /// Declared width
    pub width: u32,
    /// Declared height
    pub height: u32,
    /// Declared payload length
    pub payload_len: u64,
    /// Acquisition time in epoch microseconds
    pub acquired_us: u64,
    /// SHA-256 of the payload
    pub checksum: [u8; 32],
}

impl CalibrationHeader {
    /// Parse and check a header against the load that was requested.
    ///
    /// Fails on bad magic, an unsupported version, a type other than
    /// `expected`, or dimensions other than `width` x `height`.
    pub fn decode(
        mut buf: &[u8],
        expected: CalibrationType,
        width: u32,
        height: u32,
    ) -> Result<Self, CalibrationError> {
        if buf.len() < HEADER_LEN {
            return Err(CalibrationError::PayloadLength {
                expected: HEADER_LEN as u64,
                actual: buf.len() as u64,
            });
        }
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != MAGIC {
            return Err(CalibrationError::BadMagic(magic));
        }
        let version = buf.get_u16_le();
        if version != FORMAT_VERSION {
            return Err(CalibrationError::UnsupportedVersion(version));
        }
        let type_code = buf.get_u16_le();
        let kind = CalibrationType::from_code(type_code)
            .filter(|kind| *kind == expected)
            .ok_or(CalibrationError::TypeMismatch {
                expected,
                found: type_code,
            })?;
        let file_width = buf.get_u32_le();
        let file_height = buf.get_u32_le();
        if file_width != width || file_height != height {
            return Err(CalibrationError::DimensionMismatch {
                expected: (width, height),
                found: (file_width, file_height),
            });
        }
        let payload_len = buf.get_u64_le();
        let acquired_us = buf.get_u64_le();
        let mut checksum = [0u8; 32];
        buf.copy_to_slice(&mut checksum);

        Ok(Self {
            version,
            kind,
            width: file_width,
            height: file_height,
            payload_len,
            acquired_us,
            checksum,
        })
    }

    fn encode(&self, out: &mut BytesMut) {
        out.put_slice(&MAGIC);
        out.put_u16_le(self.version);
        out.put_u16_le(self.kind.code());
        out.put_u32_le(self.width);
        out.put_u32_le(self.height);
        out.put_u64_le(self.payload_len);
        out.put_u64_le(self.acquired_us);
        out.put_slice(&self.checksum);
    }

    /// Payload length implied by the type and dimensions, when fixed.
    fn expected_payload_len(&self) -> Option<u64> {
        match self.kind {
            CalibrationType::DarkFrame | CalibrationType::GainMap => {
                (self.width as u64).checked_mul(self.height as u64)?.checked_mul(4)
            }
            CalibrationType::ScatterParams => Some(SCATTER_PAYLOAD_LEN as u64),
            CalibrationType::DefectMap => None,
        }
    }

    fn acquired_at(&self) -> DateTime<Utc> {
        i64::try_from(self.acquired_us)
            .ok()
            .and_then(DateTime::<Utc>::from_timestamp_micros)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}

/// Reader and writer for calibration files.
pub struct CalibrationFile;

impl CalibrationFile {
    /// Read and verify the file at `path`.
    pub fn read(
        path: &Path,
        expected: CalibrationType,
        width: u32,
        height: u32,
    ) -> Result<CalibrationDataset, CalibrationError> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut header_bytes = [0u8; HEADER_LEN];
        reader.read_exact(&mut header_bytes).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => CalibrationError::PayloadLength {
                expected: HEADER_LEN as u64,
                actual: 0,
            },
            _ => CalibrationError::Io(e),
        })?;
        let header = CalibrationHeader::decode(&header_bytes, expected, width, height)?;
        check_declared_len(&header)?;

        let declared = usize::try_from(header.payload_len).map_err(|_| {
            CalibrationError::InvalidPayload(format!("payload length {} too large", header.payload_len))
        })?;
        let mut payload = Vec::new();
        reader
            .by_ref()
            .take(header.payload_len.saturating_add(1))
            .read_to_end(&mut payload)?;
        if payload.len() != declared {
            return Err(CalibrationError::PayloadLength {
                expected: header.payload_len,
                actual: payload.len() as u64,
            });
        }

        finish(header, &payload).map(|dataset| dataset.with_source(path))
    }

    /// Verify an in-memory file image.
    pub fn decode(
        bytes: &[u8],
        expected: CalibrationType,
        width: u32,
        height: u32,
    ) -> Result<CalibrationDataset, CalibrationError> {
        let header = CalibrationHeader::decode(bytes, expected, width, height)?;
        check_declared_len(&header)?;
        let payload = &bytes[HEADER_LEN..];
        if payload.len() as u64 != header.payload_len {
            return Err(CalibrationError::PayloadLength {
                expected: header.payload_len,
                actual: payload.len() as u64,
            });
        }
        finish(header, payload)
    }

    /// Encode a valid dataset to a file image.
    pub fn encode(dataset: &CalibrationDataset) -> Result<Vec<u8>, CalibrationError> {
        let payload = dataset.payload().ok_or_else(|| {
            CalibrationError::InvalidPayload(format!("cannot encode invalid {} dataset", dataset.kind))
        })?;
        let payload_bytes = encode_payload(payload);
        let header = CalibrationHeader {
            version: FORMAT_VERSION,
            kind: dataset.kind,
            width: dataset.width,
            height: dataset.height,
            payload_len: payload_bytes.len() as u64,
            acquired_us: u64::try_from(dataset.acquired_at.timestamp_micros()).unwrap_or(0),
            checksum: payload_checksum(&payload_bytes),
        };
        let mut out = BytesMut::with_capacity(HEADER_LEN + payload_bytes.len());
        header.encode(&mut out);
        out.put_slice(&payload_bytes);
        Ok(out.to_vec())
    }

    /// Encode `dataset` and write it to `path`.
    pub fn write(path: &Path, dataset: &CalibrationDataset) -> Result<(), CalibrationError> {
        let bytes = Self::encode(dataset)?;
        let mut file = File::create(path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        Ok(())
    }
}

fn check_declared_len(header: &CalibrationHeader) -> Result<(), CalibrationError> {
    match header.expected_payload_len() {
        Some(expected) if expected != header.payload_len => Err(CalibrationError::PayloadLength {
            expected,
            actual: header.payload_len,
        }),
        None if header.payload_len < 4 => Err(CalibrationError::PayloadLength {
            expected: 4,
            actual: header.payload_len,
        }),
        _ => Ok(()),
    }
}

fn finish(header: CalibrationHeader, payload: &[u8]) -> Result<CalibrationDataset, CalibrationError> {
    if payload_checksum(payload) != header.checksum {
        return Err(CalibrationError::ChecksumMismatch);
    }
    let decoded = decode_payload(header.kind, header.width, header.height, payload)?;
    let mut dataset =
        CalibrationDataset::new(header.width, header.height, header.acquired_at(), decoded);
    dataset.checksum = header.checksum;
    Ok(dataset)
}

/// Encode a payload body.
pub fn encode_payload(payload: &CalibrationPayload) -> Vec<u8> {
    let mut out = BytesMut::new();
    match payload {
        CalibrationPayload::DarkFrame(values) | CalibrationPayload::GainMap(values) => {
            out.reserve(values.len() * 4);
            for value in values {
                out.put_f32_le(*value);
            }
        }
        CalibrationPayload::DefectMap(entries) => {
            out.reserve(4 + entries.len() * DEFECT_ENTRY_LEN);
            out.put_u32_le(entries.len() as u32);
            for entry in entries {
                out.put_u32_le(entry.x);
                out.put_u32_le(entry.y);
                out.put_u16_le(entry.class as u16);
                out.put_u16_le(entry.interpolation as u16);
            }
        }
        CalibrationPayload::ScatterParams(params) => {
            out.put_u8(u8::from(params.enabled));
            out.put_u16_le(params.algorithm as u16);
            out.put_f32_le(params.cutoff);
            out.put_f32_le(params.suppression_ratio);
            out.put_u32_le(params.flags);
        }
    }
    out.to_vec()
}

/// Decode and sanity-check a payload body.
pub fn decode_payload(
    kind: CalibrationType,
    width: u32,
    height: u32,
    mut buf: &[u8],
) -> Result<CalibrationPayload, CalibrationError> {
    match kind {
        CalibrationType::DarkFrame | CalibrationType::GainMap => {
            let pixels = width as usize * height as usize;
            if buf.len() != pixels * 4 {
                return Err(CalibrationError::PayloadLength {
                    expected: pixels as u64 * 4,
                    actual: buf.len() as u64,
                });
            }
            let mut values = Vec::with_capacity(pixels);
            while buf.has_remaining() {
                let value = buf.get_f32_le();
                if !value.is_finite() {
                    return Err(CalibrationError::InvalidPayload(format!(
                        "non-finite value at pixel {}",
                        values.len()
                    )));
                }
                if kind == CalibrationType::GainMap && value < 0.0 {
                    return Err(CalibrationError::InvalidPayload(format!(
                        "negative gain at pixel {}",
                        values.len()
                    )));
                }
                values.push(value);
            }
            Ok(if kind == CalibrationType::DarkFrame {
                CalibrationPayload::DarkFrame(values)
            } else {
                CalibrationPayload::GainMap(values)
            })
        }
        CalibrationType::DefectMap => {
            if buf.len() < 4 {
                return Err(CalibrationError::PayloadLength {
                    expected: 4,
                    actual: buf.len() as u64,
                });
            }
            let count = buf.get_u32_le() as usize;
            let expected = count as u64 * DEFECT_ENTRY_LEN as u64;
            if buf.len() as u64 != expected {
                return Err(CalibrationError::PayloadLength {
                    expected: expected + 4,
                    actual: buf.len() as u64 + 4,
                });
            }
            let mut entries = Vec::with_capacity(count);
            for index in 0..count {
                let x = buf.get_u32_le();
                let y = buf.get_u32_le();
                let class_code = buf.get_u16_le();
                let interp_code = buf.get_u16_le();
                let class = DefectClass::from_code(class_code).ok_or_else(|| {
                    CalibrationError::InvalidPayload(format!(
                        "entry {index}: unknown defect class {class_code}"
                    ))
                })?;
                let interpolation = Interpolation::from_code(interp_code).ok_or_else(|| {
                    CalibrationError::InvalidPayload(format!(
                        "entry {index}: unknown interpolation {interp_code}"
                    ))
                })?;
                entries.push(DefectEntry::new(x, y, class, interpolation));
            }
            Ok(CalibrationPayload::DefectMap(entries))
        }
        CalibrationType::ScatterParams => {
            if buf.len() != SCATTER_PAYLOAD_LEN {
                return Err(CalibrationError::PayloadLength {
                    expected: SCATTER_PAYLOAD_LEN as u64,
                    actual: buf.len() as u64,
                });
            }
            let enabled = match buf.get_u8() {
                0 => false,
                1 => true,
                other => {
                    return Err(CalibrationError::InvalidPayload(format!(
                        "enabled flag must be 0 or 1, got {other}"
                    )))
                }
            };
            let algorithm_code = buf.get_u16_le();
            let algorithm = ScatterAlgorithm::from_code(algorithm_code).ok_or_else(|| {
                CalibrationError::InvalidPayload(format!("unknown scatter algorithm {algorithm_code}"))
            })?;
            let cutoff = buf.get_f32_le();
            let suppression_ratio = buf.get_f32_le();
            let flags = buf.get_u32_le();
            if !(cutoff > 0.0 && cutoff <= 1.0) {
                return Err(CalibrationError::InvalidPayload(format!(
                    "cutoff {cutoff} outside (0, 1]"
                )));
            }
            if !(0.0..=1.0).contains(&suppression_ratio) {
                return Err(CalibrationError::InvalidPayload(format!(
                    "suppression ratio {suppression_ratio} outside [0, 1]"
                )));
            }
            Ok(CalibrationPayload::ScatterParams(ScatterParameters {
                enabled,
                algorithm,
                cutoff,
                suppression_ratio,
                flags,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dark_2x2() -> CalibrationDataset {
        CalibrationDataset::new(
            2,
            2,
            Utc::now(),
            CalibrationPayload::DarkFrame(vec![10.0, 11.0, 12.0, 13.0]),
        )
    }

    #[test]
    fn header_is_64_bytes() {
        let bytes = CalibrationFile::encode(&dark_2x2()).unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + 16);
        assert_eq!(&bytes[0..4], b"XCAL");
        assert_eq!(u16::from_le_bytes([bytes[6], bytes[7]]), 1);
    }

    #[test]
    fn decode_accepts_encoded_file() {
        let original = dark_2x2();
        let bytes = CalibrationFile::encode(&original).unwrap();
        let decoded = CalibrationFile::decode(&bytes, CalibrationType::DarkFrame, 2, 2).unwrap();
        assert!(decoded.is_valid());
        assert_eq!(decoded.dark_frame(), original.dark_frame());
        assert_eq!(decoded.checksum, original.checksum);
        assert_eq!(
            decoded.acquired_at.timestamp_micros(),
            original.acquired_at.timestamp_micros()
        );
    }

    #[test]
    fn type_is_checked_before_payload() {
        let mut bytes = CalibrationFile::encode(&dark_2x2()).unwrap();
        bytes.truncate(HEADER_LEN);
        let err = CalibrationFile::decode(&bytes, CalibrationType::GainMap, 2, 2).unwrap_err();
        assert!(matches!(err, CalibrationError::TypeMismatch { found: 1, .. }));
    }

    #[test]
    fn bad_magic_rejected() {
        let mut bytes = CalibrationFile::encode(&dark_2x2()).unwrap();
        bytes[0] = b'Y';
        assert!(matches!(
            CalibrationFile::decode(&bytes, CalibrationType::DarkFrame, 2, 2),
            Err(CalibrationError::BadMagic(_))
        ));
    }

    #[test]
    fn corrupted_payload_fails_checksum() {
        let mut bytes = CalibrationFile::encode(&dark_2x2()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert!(matches!(
            CalibrationFile::decode(&bytes, CalibrationType::DarkFrame, 2, 2),
            Err(CalibrationError::ChecksumMismatch)
        ));
    }

    #[test]
    fn dimension_mismatch_rejected() {
        let bytes = CalibrationFile::encode(&dark_2x2()).unwrap();
        assert!(matches!(
            CalibrationFile::decode(&bytes, CalibrationType::DarkFrame, 4, 1),
            Err(CalibrationError::DimensionMismatch {
                expected: (4, 1),
                found: (2, 2)
            })
        ));
    }

    #[test]
    fn defect_payload_layout() {
        let payload = CalibrationPayload::DefectMap(vec![DefectEntry::new(
            3,
            4,
            DefectClass::Hot,
            Interpolation::Median3x3,
        )]);
        let bytes = encode_payload(&payload);
        assert_eq!(bytes.len(), 4 + DEFECT_ENTRY_LEN);
        assert_eq!(&bytes[0..4], &1u32.to_le_bytes());
        assert_eq!(&bytes[12..14], &1u16.to_le_bytes());
        assert_eq!(&bytes[14..16], &2u16.to_le_bytes());
    }

    #[test]
    fn scatter_values_are_range_checked() {
        let payload = CalibrationPayload::ScatterParams(ScatterParameters {
            cutoff: 1.5,
            ..Default::default()
        });
        let bytes = encode_payload(&payload);
        assert!(matches!(
            decode_payload(CalibrationType::ScatterParams, 1, 1, &bytes),
            Err(CalibrationError::InvalidPayload(_))
        ));
    }

    #[test]
    fn oversized_defect_count_is_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            decode_payload(CalibrationType::DefectMap, 1, 1, &bytes),
            Err(CalibrationError::PayloadLength { .. })
        ));
    }
}
