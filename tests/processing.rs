//! Image processing engine scenarios on synthetic frames.

use chrono::Utc;
use rust_xray::calibration::{
    CalibrationDataset, CalibrationManager, CalibrationPayload, DefectClass, DefectEntry,
    Interpolation, ScatterParameters,
};
use rust_xray::frame::{Frame, FrameBuffer};
use rust_xray::processing::{
    EngineConfig, ErrorCode, ImageProcessingEngine, ProcessingConfig, ProcessingMode, Stage,
};
use std::sync::Arc;

const SIZE: u32 = 512;

fn dataset(payload: CalibrationPayload) -> Arc<CalibrationDataset> {
    Arc::new(CalibrationDataset::new(SIZE, SIZE, Utc::now(), payload))
}

fn pixels() -> usize {
    (SIZE * SIZE) as usize
}

fn engine() -> ImageProcessingEngine {
    let mut engine = ImageProcessingEngine::new();
    engine.initialize(EngineConfig::default()).unwrap();
    engine
}

fn calibrated(mut config: ProcessingConfig) -> ProcessingConfig {
    config.dark_frame = Some(dataset(CalibrationPayload::DarkFrame(vec![100.0; pixels()])));
    config.gain_map = Some(dataset(CalibrationPayload::GainMap(vec![1.0; pixels()])));
    config.defect_map = Some(dataset(CalibrationPayload::DefectMap(vec![DefectEntry::new(
        1000,
        1000,
        DefectClass::Dead,
        Interpolation::Bilinear,
    )])));
    config
}

#[test]
fn preview_runs_offset_gain_and_window_only() {
    let mut engine = engine();
    let mut buffer = FrameBuffer::gradient(SIZE, SIZE, 100, 4100);
    let config = calibrated(ProcessingConfig::preview(4000.0, 2000.0));

    let report = engine.process_frame(&mut buffer.as_frame(), &config).unwrap();

    assert_eq!(report.mode, ProcessingMode::Preview);
    assert_eq!(
        report.stages_run,
        [Stage::OffsetCorrection, Stage::GainCorrection, Stage::WindowLevel]
    );
    for stage in [Stage::OffsetCorrection, Stage::GainCorrection, Stage::WindowLevel] {
        assert!(!report.timings.get(stage).is_zero(), "{stage} was not timed");
    }
    for stage in [
        Stage::DefectPixelMap,
        Stage::ScatterCorrection,
        Stage::NoiseReduction,
        Stage::Flattening,
    ] {
        assert!(report.timings.get(stage).is_zero(), "{stage} should not run in preview");
    }
    assert!(report.within_budget());
    assert_eq!(engine.timings(), report.timings);
    assert!(engine.last_error().is_none());

    // Dark-subtracted gradient spans 0..4000, exactly the window
    let out = buffer.to_u16();
    assert_eq!(out[0], 0);
    assert_eq!(out[SIZE as usize - 1], u16::MAX);
    let row: Vec<u16> = out[..SIZE as usize].to_vec();
    assert!(row.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn full_pipeline_skips_out_of_bounds_defects() {
    let mut engine = engine();
    let mut buffer = FrameBuffer::gradient(SIZE, SIZE, 100, 4100);
    let config = calibrated(ProcessingConfig::default());

    let report = engine.process_frame(&mut buffer.as_frame(), &config).unwrap();

    assert_eq!(report.mode, ProcessingMode::Full);
    assert_eq!(report.defects_repaired, 0);
    assert_eq!(
        report.stages_run,
        [
            Stage::OffsetCorrection,
            Stage::GainCorrection,
            Stage::DefectPixelMap,
            Stage::NoiseReduction,
            Stage::WindowLevel
        ]
    );
    assert!(!report.timings.get(Stage::NoiseReduction).is_zero());
    assert!(report.timings.get(Stage::ScatterCorrection).is_zero());
    assert_eq!(engine.frames_processed(), 1);
}

#[test]
fn full_pipeline_with_every_stage() {
    let mut engine = engine();
    let mut buffer = FrameBuffer::gradient(SIZE, SIZE, 100, 4100);
    let mut config = calibrated(ProcessingConfig::default());
    config.enable_scatter_correction = true;
    config.enable_flattening = true;
    config.noise.filter = "median".into();
    config.scatter_params = Some(dataset(CalibrationPayload::ScatterParams(
        ScatterParameters::default(),
    )));
    config.defect_map = Some(dataset(CalibrationPayload::DefectMap(vec![DefectEntry::new(
        10,
        10,
        DefectClass::Hot,
        Interpolation::Median3x3,
    )])));

    let report = engine.process_frame(&mut buffer.as_frame(), &config).unwrap();
    assert_eq!(report.stages_run.as_slice(), Stage::CORRECTIONS.as_slice());
    assert_eq!(report.defects_repaired, 1);
    for stage in Stage::CORRECTIONS {
        assert!(!report.timings.get(stage).is_zero(), "{stage} was not timed");
    }
    assert!(report.total >= report.timings.total());
}

#[test]
fn non_positive_window_fails_before_any_stage() {
    let mut engine = engine();
    let mut buffer = FrameBuffer::gradient(SIZE, SIZE, 100, 4100);
    let before = buffer.data.clone();

    for window in [0.0, -1.0] {
        let config = calibrated(ProcessingConfig::preview(window, 2000.0));
        let err = engine.process_frame(&mut buffer.as_frame(), &config).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidParameter);
        assert_eq!(engine.last_error(), Some(&err));
    }
    assert_eq!(buffer.data, before);
    assert_eq!(engine.frames_processed(), 0);
}

#[test]
fn missing_dark_frame_fails_without_mutation() {
    let mut engine = engine();
    let mut buffer = FrameBuffer::gradient(SIZE, SIZE, 100, 4100);
    let before = buffer.data.clone();
    let mut config = calibrated(ProcessingConfig::preview(4000.0, 2000.0));
    config.dark_frame = None;

    let err = engine.process_frame(&mut buffer.as_frame(), &config).unwrap_err();
    assert_eq!(err.code, ErrorCode::CalibrationMismatch);
    assert_eq!(buffer.data, before);
}

#[test]
fn wrong_sized_calibration_is_a_mismatch() {
    let mut engine = engine();
    let mut buffer = FrameBuffer::gradient(SIZE, SIZE, 100, 4100);
    let mut config = calibrated(ProcessingConfig::preview(4000.0, 2000.0));
    config.gain_map = Some(Arc::new(CalibrationDataset::new(
        256,
        256,
        Utc::now(),
        CalibrationPayload::GainMap(vec![1.0; 256 * 256]),
    )));

    let err = engine.process_frame(&mut buffer.as_frame(), &config).unwrap_err();
    assert_eq!(err.code, ErrorCode::CalibrationMismatch);
}

#[test]
fn full_mode_requires_a_defect_map() {
    let mut engine = engine();
    let mut buffer = FrameBuffer::gradient(SIZE, SIZE, 100, 4100);
    let mut config = calibrated(ProcessingConfig::default());
    config.defect_map = None;

    let err = engine.process_frame(&mut buffer.as_frame(), &config).unwrap_err();
    assert_eq!(err.code, ErrorCode::CalibrationMismatch);

    // The same calibration is enough for preview
    config.mode = ProcessingMode::Preview;
    assert!(engine.process_frame(&mut buffer.as_frame(), &config).is_ok());
}

#[test]
fn unknown_noise_filter_is_reported() {
    let mut engine = engine();
    let mut buffer = FrameBuffer::gradient(SIZE, SIZE, 100, 4100);
    let before = buffer.data.clone();
    let mut config = calibrated(ProcessingConfig::default());
    config.noise.filter = "wavelet".into();

    let err = engine.process_frame(&mut buffer.as_frame(), &config).unwrap_err();
    assert_eq!(err.code, ErrorCode::UnknownFilter);
    assert_eq!(buffer.data, before);
}

#[test]
fn raw_pixels_are_preserved_on_request() {
    let mut engine = engine();
    let mut buffer = FrameBuffer::gradient(SIZE, SIZE, 100, 4100);
    let raw = buffer.data.clone();

    let config = calibrated(ProcessingConfig::preview(4000.0, 2000.0));
    let report = engine.process_frame(&mut buffer.as_frame(), &config).unwrap();
    assert_eq!(report.raw.as_deref(), Some(raw.as_slice()));
    assert_ne!(buffer.data, raw);

    let mut config = config;
    config.preserve_raw = false;
    let mut buffer = FrameBuffer::gradient(SIZE, SIZE, 100, 4100);
    let report = engine.process_frame(&mut buffer.as_frame(), &config).unwrap();
    assert!(report.raw.is_none());
}

#[test]
fn stage_calls_validate_their_inputs() {
    let mut engine = engine();
    let mut buffer = FrameBuffer::gradient(16, 16, 0, 1000);

    let err = engine.offset_correction(&mut buffer.as_frame(), None).unwrap_err();
    assert_eq!((err.code, err.stage), (ErrorCode::CalibrationMismatch, Stage::OffsetCorrection));

    // A gain map passed as the dark frame
    let gain = CalibrationDataset::new(16, 16, Utc::now(), CalibrationPayload::GainMap(vec![1.0; 256]));
    let err = engine.offset_correction(&mut buffer.as_frame(), Some(&gain)).unwrap_err();
    assert_eq!(err.code, ErrorCode::CalibrationMismatch);

    // Scatter disabled by its own parameters is a successful no-op
    let disabled = CalibrationDataset::new(
        16,
        16,
        Utc::now(),
        CalibrationPayload::ScatterParams(ScatterParameters {
            enabled: false,
            ..Default::default()
        }),
    );
    let before = buffer.data.clone();
    assert!(!engine.scatter_correction(&mut buffer.as_frame(), Some(&disabled)).unwrap());
    assert_eq!(buffer.data, before);
    assert!(engine.last_error().is_none());
}

#[test]
fn pipeline_reads_calibration_from_manager_snapshot() {
    let manager = CalibrationManager::new(SIZE, SIZE);
    manager
        .install(CalibrationDataset::new(
            SIZE,
            SIZE,
            Utc::now(),
            CalibrationPayload::DarkFrame(vec![100.0; pixels()]),
        ))
        .unwrap();
    manager
        .install(CalibrationDataset::new(
            SIZE,
            SIZE,
            Utc::now(),
            CalibrationPayload::GainMap(vec![1.0; pixels()]),
        ))
        .unwrap();

    let config = ProcessingConfig::preview(4000.0, 2000.0).with_calibration(&manager.snapshot());
    let mut buffer = FrameBuffer::gradient(SIZE, SIZE, 100, 4100);
    assert!(engine().process_frame(&mut buffer.as_frame(), &config).is_ok());
}

/// Copy a packed buffer into rows of `stride` bytes, padding filled with `fill`.
fn padded(buffer: &FrameBuffer, stride: usize, fill: u8) -> Vec<u8> {
    let row_bytes = buffer.width as usize * 2;
    let mut data = vec![fill; stride * buffer.height as usize];
    for (y, row) in buffer.data.chunks_exact(row_bytes).enumerate() {
        data[y * stride..y * stride + row_bytes].copy_from_slice(row);
    }
    data
}

#[test]
fn padded_rows_match_packed_result_and_keep_padding() {
    let mut config = calibrated(ProcessingConfig::default());
    config.enable_scatter_correction = true;
    config.enable_flattening = true;
    config.scatter_params = Some(dataset(CalibrationPayload::ScatterParams(
        ScatterParameters::default(),
    )));
    config.defect_map = Some(dataset(CalibrationPayload::DefectMap(vec![DefectEntry::new(
        SIZE - 1,
        3,
        DefectClass::Hot,
        Interpolation::Bilinear,
    )])));

    let mut packed = FrameBuffer::gradient(SIZE, SIZE, 100, 4100);
    let stride = SIZE as usize * 2 + 6;
    let mut data = padded(&packed, stride, 0xCD);

    let mut engine = engine();
    engine.process_frame(&mut packed.as_frame(), &config).unwrap();
    let report = engine
        .process_frame(&mut Frame::new(SIZE, SIZE, &mut data).with_stride(stride), &config)
        .unwrap();
    assert_eq!(report.defects_repaired, 1);

    let row_bytes = SIZE as usize * 2;
    for (y, row) in data.chunks_exact(stride).enumerate() {
        assert_eq!(&row[..row_bytes], &packed.data[y * row_bytes..(y + 1) * row_bytes], "row {y}");
        assert!(row[row_bytes..].iter().all(|b| *b == 0xCD), "padding of row {y} touched");
    }
    assert_eq!(report.raw.map(|raw| raw.len()), Some(row_bytes * SIZE as usize));
}

#[test]
fn padded_frame_is_untouched_when_preflight_fails() {
    let mut engine = engine();
    let mut data = padded(&FrameBuffer::gradient(SIZE, SIZE, 100, 4100), SIZE as usize * 2 + 4, 0xEE);
    let before = data.clone();

    let mut config = calibrated(ProcessingConfig::default());
    config.noise.filter = "wavelet".into();
    let mut frame = Frame::new(SIZE, SIZE, &mut data).with_stride(SIZE as usize * 2 + 4);
    assert!(engine.process_frame(&mut frame, &config).is_err());
    assert_eq!(data, before);
}

#[test]
fn overflowing_stride_is_an_invalid_parameter() {
    let mut engine = engine();
    let mut data = vec![0u8; 8];
    let mut frame = Frame::new(2, 3, &mut data).with_stride(usize::MAX / 2 + 1);

    let err = engine.window_level(&mut frame, 4000.0, 2000.0).unwrap_err();
    assert_eq!((err.code, err.stage), (ErrorCode::InvalidParameter, Stage::WindowLevel));

    let err = engine
        .process_frame(&mut frame, &ProcessingConfig::preview(4000.0, 2000.0))
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidParameter);
    assert_eq!(data, vec![0u8; 8]);
}
