//! Builders for processors, pipelines and requests

use crossbeam_channel::Receiver;
use emucam::backend::HeapBufferMapper;
use emucam::capabilities::DEFAULT_CAPABILITIES_JSON;
use emucam::{
    BufferHandle, CaptureEvent, CaptureRequest, ChannelCallback, PipelineDescriptor, PipelineId,
    PixelFormat, ProcessorConfig, RequestProcessor, SensorCapture, Settings, StreamDescriptor,
    StreamId,
};
use emucam::types::keys;
use std::sync::Arc;

pub const PREVIEW: StreamId = StreamId(0);
pub const SECONDARY: StreamId = StreamId(1);

/// Config with exposure simulation off so captures return immediately
pub fn fast_config() -> ProcessorConfig {
    let mut config = ProcessorConfig::default();
    config.sensor.simulate_exposure = false;
    config
}

/// Initialized processor backed by the simulated sensor
pub fn simulated_processor(config: ProcessorConfig) -> (RequestProcessor, Arc<HeapBufferMapper>) {
    let (mut processor, mapper) =
        RequestProcessor::with_simulated_sensor(config).expect("processor");
    processor
        .initialize(DEFAULT_CAPABILITIES_JSON)
        .expect("default capabilities");
    (processor, mapper)
}

/// Initialized processor backed by a custom sensor
pub fn processor_with(sensor: Box<dyn SensorCapture>) -> (RequestProcessor, Arc<HeapBufferMapper>) {
    let mapper = Arc::new(HeapBufferMapper::default());
    let mut processor =
        RequestProcessor::new(fast_config(), sensor, mapper.clone()).expect("processor");
    processor
        .initialize(DEFAULT_CAPABILITIES_JSON)
        .expect("default capabilities");
    (processor, mapper)
}

/// Pipeline with a 640x480 YCbCr stream and a 320x240 YCbCr stream
pub fn pipeline(id: u32) -> (PipelineDescriptor, Receiver<CaptureEvent>) {
    let (callback, events) = ChannelCallback::new();
    let descriptor = PipelineDescriptor::new(
        PipelineId(id),
        id,
        vec![
            StreamDescriptor::output(PREVIEW, 640, 480, PixelFormat::Ycbcr420),
            StreamDescriptor::output(SECONDARY, 320, 240, PixelFormat::Ycbcr420),
        ],
        Arc::new(callback),
    )
    .expect("pipeline");
    (descriptor, events)
}

pub fn settings() -> Settings {
    Settings::new().with(keys::SENSITIVITY, 100i64)
}

/// Single-output request with settings
pub fn request(pipeline: u32, handle: u64) -> CaptureRequest {
    CaptureRequest::new(PipelineId(pipeline))
        .with_settings(settings())
        .with_output(PREVIEW, BufferHandle(handle))
}
