//! Reprocess captures: a previously captured frame fed back through the
//! pipeline, reusing its original sensor timestamp.

mod common;

use camera_hal::metadata::Tag;
use camera_hal::session::buffer_import::BufferImporter;
use camera_hal::types::{
    BufferStatus, CaptureRequest, ErrorCode, NotifyMessage, PixelFormat, RequestTemplate,
    StreamBuffer,
};

use common::{build_session, input_stream, output_stream, Event};

#[tokio::test]
async fn test_reprocess_yuv_to_blob_reuses_timestamp() {
    let streams = vec![
        output_stream(0, PixelFormat::Yuv420),
        input_stream(1, PixelFormat::Yuv420),
        output_stream(2, PixelFormat::Blob),
    ];
    let (session, client, warehouse) = build_session(streams, 41).await;
    let preview = session
        .default_request_settings(RequestTemplate::Preview)
        .await
        .unwrap();

    // A normal capture first, to have a timestamp worth reusing.
    let request = CaptureRequest {
        frame_number: 0,
        settings: Some(preview),
        output_buffers: vec![client.buffer(0)],
        ..CaptureRequest::default()
    };
    session.process_capture_request(vec![request]).await.unwrap();
    client.wait_for_terminal(0).await;
    let captured_ts = client.metadata_results()[0]
        .result_metadata
        .as_ref()
        .unwrap()
        .get_i64(Tag::SensorTimestamp)
        .unwrap();

    // The reprocess request carries the original timestamp in its settings,
    // the way a zero-shutter-lag client replays result metadata.
    let mut zsl_settings = session
        .default_request_settings(RequestTemplate::StillCapture)
        .await
        .unwrap();
    zsl_settings.set_i64(Tag::SensorTimestamp, captured_ts);
    let reprocess = CaptureRequest {
        frame_number: 1,
        settings: Some(zsl_settings),
        input_buffers: vec![client.buffer(1)],
        output_buffers: vec![client.buffer(2)],
        ..CaptureRequest::default()
    };
    session.process_capture_request(vec![reprocess]).await.unwrap();
    client.wait_for_terminal(1).await;

    // The shutter replays the original timestamp instead of a fresh one.
    let shutter_ts = client
        .notifications()
        .iter()
        .find_map(|m| match m {
            NotifyMessage::Shutter {
                frame_number: 1,
                timestamp_ns,
            } => Some(*timestamp_ns),
            _ => None,
        })
        .unwrap();
    assert_eq!(shutter_ts, captured_ts);

    let results = client.metadata_results();
    let result = results.iter().find(|r| r.frame_number == 1).unwrap();
    assert_eq!(
        result
            .result_metadata
            .as_ref()
            .unwrap()
            .get_i64(Tag::SensorTimestamp),
        Some(captured_ts)
    );
    assert_eq!(result.input_buffers.len(), 1);
    assert_eq!(result.output_buffers.len(), 1);
    let blob = &result.output_buffers[0];
    assert_eq!(blob.status, BufferStatus::Ok);

    // The blob payload carries the encoded header.
    let bytes = warehouse.lock(blob.handle.unwrap()).unwrap();
    let data = bytes.lock();
    assert_eq!(&data[..4], b"SIMB");
    assert_eq!(u32::from_le_bytes([data[4], data[5], data[6], data[7]]), 640);
    assert_eq!(
        u32::from_le_bytes([data[8], data[9], data[10], data[11]]),
        480
    );

    drop(data);
    session.close().await;
}

#[tokio::test]
async fn test_reprocess_tolerates_oversized_input_buffer() {
    let streams = vec![
        output_stream(0, PixelFormat::Yuv420),
        input_stream(1, PixelFormat::Yuv420),
        output_stream(2, PixelFormat::Blob),
    ];
    let (session, client, warehouse) = build_session(streams, 44).await;
    let mut settings = session
        .default_request_settings(RequestTemplate::StillCapture)
        .await
        .unwrap();
    settings.set_i64(Tag::SensorTimestamp, 2_000_000);

    // Allocators round up; the input allocation is bigger than the nominal
    // YUV image and only the nominal bytes are the payload.
    let nominal = PixelFormat::Yuv420.buffer_size(640, 480);
    let input = StreamBuffer {
        stream_id: 1,
        buffer_id: 1,
        raw_handle: Some(warehouse.allocate(nominal + 4096)),
        ..StreamBuffer::default()
    };
    let reprocess = CaptureRequest {
        frame_number: 0,
        settings: Some(settings),
        input_buffers: vec![input],
        output_buffers: vec![client.buffer(2)],
        ..CaptureRequest::default()
    };
    session.process_capture_request(vec![reprocess]).await.unwrap();
    client.wait_for_terminal(0).await;

    let results = client.metadata_results();
    let result = results.iter().find(|r| r.frame_number == 0).unwrap();
    let blob = &result.output_buffers[0];
    assert_eq!(blob.status, BufferStatus::Ok);

    let bytes = warehouse.lock(blob.handle.unwrap()).unwrap();
    let data = bytes.lock();
    assert_eq!(&data[..4], b"SIMB");
    assert_eq!(
        u32::from_le_bytes([data[12], data[13], data[14], data[15]]) as usize,
        nominal
    );

    drop(data);
    session.close().await;
}

#[tokio::test]
async fn test_reprocess_incompatible_formats_fail_per_buffer() {
    let streams = vec![
        output_stream(0, PixelFormat::Yuv420),
        input_stream(1, PixelFormat::Raw16),
        output_stream(2, PixelFormat::Blob),
    ];
    let (session, client, _) = build_session(streams, 42).await;
    let mut settings = session
        .default_request_settings(RequestTemplate::StillCapture)
        .await
        .unwrap();
    settings.set_i64(Tag::SensorTimestamp, 1_000_000);

    // RAW16 cannot feed a BLOB output; the buffer fails and the frame ends
    // with a result error since nothing rendered.
    let reprocess = CaptureRequest {
        frame_number: 0,
        settings: Some(settings),
        input_buffers: vec![client.buffer(1)],
        output_buffers: vec![client.buffer(2)],
        ..CaptureRequest::default()
    };
    session.process_capture_request(vec![reprocess]).await.unwrap();
    client
        .wait_until(|events| {
            events.iter().any(|e| {
                matches!(
                    e,
                    Event::Notify(NotifyMessage::Error {
                        frame_number: 0,
                        code: ErrorCode::Result,
                        ..
                    })
                )
            })
        })
        .await;

    assert!(client.errors_for(0).iter().any(|m| matches!(
        m,
        NotifyMessage::Error {
            code: ErrorCode::Buffer,
            stream_id: Some(2),
            ..
        }
    )));
    let results = client.results();
    let result = results.iter().find(|r| r.frame_number == 0).unwrap();
    assert_eq!(result.output_buffers[0].status, BufferStatus::Error);

    session.close().await;
}

#[tokio::test]
async fn test_raw_reprocess_round_trip() {
    let streams = vec![
        output_stream(0, PixelFormat::Raw16),
        input_stream(1, PixelFormat::Raw16),
        output_stream(2, PixelFormat::Raw16),
    ];
    let (session, client, warehouse) = build_session(streams, 43).await;
    let mut settings = session
        .default_request_settings(RequestTemplate::StillCapture)
        .await
        .unwrap();
    settings.set_i64(Tag::SensorTimestamp, 5_000_000);

    // Fill the input with a recognizable pattern, then reprocess RAW to RAW.
    let input = client.buffer(1);
    {
        let bytes = warehouse
            .bytes(input.raw_handle.unwrap())
            .unwrap();
        let mut data = bytes.lock();
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
    }
    let reprocess = CaptureRequest {
        frame_number: 0,
        settings: Some(settings),
        input_buffers: vec![input],
        output_buffers: vec![client.buffer(2)],
        ..CaptureRequest::default()
    };
    session.process_capture_request(vec![reprocess]).await.unwrap();
    client.wait_for_terminal(0).await;

    let results = client.metadata_results();
    let result = results.iter().find(|r| r.frame_number == 0).unwrap();
    let output = &result.output_buffers[0];
    assert_eq!(output.status, BufferStatus::Ok);
    let bytes = warehouse.lock(output.handle.unwrap()).unwrap();
    let data = bytes.lock();
    assert!(data.iter().enumerate().all(|(i, b)| *b == (i % 251) as u8));

    drop(data);
    session.close().await;
}
