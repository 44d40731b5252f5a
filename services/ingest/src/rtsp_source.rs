//! RTSP frame source backed by a GStreamer pipeline.
//!
//! The pipeline decodes to raw video and hands samples to an appsink whose
//! callback forwards them over a bounded channel. Pipeline errors and EOS
//! observed on the bus close that channel, which the session sees as a read
//! failure.

use crate::config::RtspConfig;
use crate::source::{Frame, FrameSource, SourceConnector, SourceError};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub struct RtspConnector {
    config: RtspConfig,
    connect_timeout: Duration,
}

impl RtspConnector {
    pub fn new(config: RtspConfig, connect_timeout: Duration) -> Result<Self, SourceError> {
        gst::init().map_err(|e| SourceError::Unavailable(format!("GStreamer initialization failed: {e}")))?;
        Ok(Self {
            config,
            connect_timeout,
        })
    }

    /// Build the GStreamer pipeline description.
    fn pipeline_string(&self, url: &str) -> String {
        let transport = match self.config.transport.as_str() {
            "udp" => "0",
            "udp-mcast" => "1",
            _ => "2", // tcp
        };

        format!(
            "rtspsrc location={url} protocols={transport} latency={latency} \
             ! rtph264depay ! h264parse ! avdec_h264 \
             ! videoconvert ! videoscale \
             ! video/x-raw,format=RGB,width={width},height={height} \
             ! appsink name=sink emit-signals=true sync=false max-buffers=2 drop=true",
            latency = self.config.latency_ms,
            width = self.config.width,
            height = self.config.height,
        )
    }
}

#[async_trait]
impl SourceConnector for RtspConnector {
    async fn open(&self, camera_id: &str, source: &str) -> Result<Box<dyn FrameSource>, SourceError> {
        let description = self.pipeline_string(source);
        let camera_id = camera_id.to_string();
        let descriptor = source.to_string();
        let queue = self.config.frame_queue.max(1);
        let timeout = self.connect_timeout;

        // Waiting for the state change blocks, keep it off the runtime threads.
        tokio::task::spawn_blocking(move || start_pipeline(&camera_id, &descriptor, &description, queue, timeout))
            .await
            .map_err(|e| SourceError::Unavailable(format!("pipeline start task failed: {e}")))?
            .map(|source| Box::new(source) as Box<dyn FrameSource>)
    }
}

fn start_pipeline(
    camera_id: &str,
    descriptor: &str,
    description: &str,
    queue: usize,
    timeout: Duration,
) -> Result<RtspSource, SourceError> {
    debug!(camera_id, pipeline = %description, "Creating GStreamer pipeline");

    let pipeline = gst::parse::launch(description)
        .map_err(|e| SourceError::Unavailable(e.to_string()))?
        .downcast::<gst::Pipeline>()
        .map_err(|_| SourceError::Unavailable("Failed to cast to Pipeline".to_string()))?;

    let appsink = pipeline
        .by_name("sink")
        .ok_or_else(|| SourceError::Unavailable("appsink not found".to_string()))?
        .downcast::<gst_app::AppSink>()
        .map_err(|_| SourceError::Unavailable("Could not cast to AppSink".to_string()))?;

    let (tx, rx) = mpsc::channel(queue);
    let running = Arc::new(AtomicBool::new(true));
    let dropped = Arc::new(AtomicU64::new(0));
    configure_appsink(&appsink, tx.clone(), running.clone(), dropped.clone(), camera_id);

    pipeline
        .set_state(gst::State::Playing)
        .map_err(|e| SourceError::Unavailable(e.to_string()))?;

    let (result, _state, _pending) = pipeline.state(gst::ClockTime::from_mseconds(timeout.as_millis() as u64));
    if result.is_err() {
        let _ = pipeline.set_state(gst::State::Null);
        return Err(SourceError::Timeout(timeout));
    }

    watch_bus(&pipeline, tx, running.clone(), camera_id);
    info!(camera_id, url = %descriptor, "Connected to RTSP stream");

    Ok(RtspSource {
        descriptor: descriptor.to_string(),
        pipeline,
        frames: rx,
        running,
        dropped,
    })
}

type FrameResult = Result<Frame, SourceError>;

fn configure_appsink(
    appsink: &gst_app::AppSink,
    sender: mpsc::Sender<FrameResult>,
    running: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    camera_id: &str,
) {
    let sequence = AtomicU64::new(0);
    let camera_id = camera_id.to_string();

    appsink.set_callbacks(
        gst_app::AppSinkCallbacks::builder()
            .new_sample(move |sink| {
                if !running.load(Ordering::SeqCst) {
                    return Err(gst::FlowError::Eos);
                }

                let sample = sink.pull_sample().map_err(|_| gst::FlowError::Error)?;
                let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;

                let frame = Frame {
                    data: Bytes::copy_from_slice(map.as_slice()),
                    sequence: sequence.fetch_add(1, Ordering::SeqCst),
                    captured_at: Utc::now(),
                };

                match sender.try_send(Ok(frame)) {
                    Ok(()) => Ok(gst::FlowSuccess::Ok),
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        dropped.fetch_add(1, Ordering::Relaxed);
                        metrics::counter!("vigil.frames.dropped").increment(1);
                        debug!(camera_id = %camera_id, "Frame dropped due to backpressure");
                        Ok(gst::FlowSuccess::Ok)
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => Err(gst::FlowError::Eos),
                }
            })
            .build(),
    );
}

/// Forward bus errors and EOS as a terminal read result.
fn watch_bus(pipeline: &gst::Pipeline, sender: mpsc::Sender<FrameResult>, running: Arc<AtomicBool>, camera_id: &str) {
    let Some(bus) = pipeline.bus() else {
        return;
    };
    let camera_id = camera_id.to_string();

    std::thread::spawn(move || {
        while running.load(Ordering::SeqCst) {
            let Some(msg) = bus.timed_pop(gst::ClockTime::from_mseconds(100)) else {
                continue;
            };
            match msg.view() {
                gst::MessageView::Error(err) => {
                    error!(camera_id = %camera_id, error = %err.error(), debug = ?err.debug(), "GStreamer pipeline error");
                    let _ = sender.blocking_send(Err(SourceError::ReadFailed(err.error().to_string())));
                    break;
                }
                gst::MessageView::Eos(_) => {
                    info!(camera_id = %camera_id, "End of stream");
                    let _ = sender.blocking_send(Err(SourceError::Closed));
                    break;
                }
                gst::MessageView::Warning(w) => {
                    warn!(camera_id = %camera_id, warning = %w.error(), "GStreamer warning");
                }
                _ => {}
            }
        }
    });
}

pub struct RtspSource {
    descriptor: String,
    pipeline: gst::Pipeline,
    frames: mpsc::Receiver<FrameResult>,
    running: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
}

impl RtspSource {
    pub fn frames_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl FrameSource for RtspSource {
    async fn read_frame(&mut self) -> Result<Frame, SourceError> {
        self.frames.recv().await.unwrap_or(Err(SourceError::Closed))
    }

    fn describe(&self) -> String {
        self.descriptor.clone()
    }
}

impl Drop for RtspSource {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.pipeline.set_state(gst::State::Null);
        debug!(url = %self.descriptor, dropped = self.frames_dropped(), "RTSP pipeline released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connector(transport: &str) -> RtspConnector {
        RtspConnector::new(
            RtspConfig {
                transport: transport.to_string(),
                ..Default::default()
            },
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_pipeline_string_tcp() {
        let pipeline = connector("tcp").pipeline_string("rtsp://test:554/stream");
        assert!(pipeline.contains("protocols=2"));
        assert!(pipeline.contains("rtsp://test:554/stream"));
        assert!(pipeline.contains("width=640,height=480"));
    }

    #[test]
    fn test_pipeline_string_udp() {
        let pipeline = connector("udp").pipeline_string("rtsp://test:554/stream");
        assert!(pipeline.contains("protocols=0"));
    }
}
