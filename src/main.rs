use std::sync::Arc;

use futures::StreamExt;
use infer_bus::InferenceDispatcher;
use infer_bus::device::{MemoryOps, SimulatedDevice};
use infer_bus::downstream::ChannelDownstream;
use infer_bus::local_backend::LocalBackend;
use infer_bus::params::InferParams;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

mod config;
mod model;
mod source;

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("infer_bus", log::LevelFilter::Debug)
        .filter_module("lite_infer", log::LevelFilter::Debug)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let config = config::config();
    let params = InferParams::from_param_set(config.params())?;
    log::info!("starting {} on device {}", params.name, params.device_id);

    let ops: Arc<dyn MemoryOps> = Arc::new(SimulatedDevice::new(config.device_count()));
    let (min_ms, max_ms) = config.latency_ms();
    let backend = LocalBackend::new(Handle::current(), model::bright_spot_detector()).with_latency(min_ms, max_ms);
    let sink = Arc::new(ChannelDownstream::new());
    let dispatcher = InferenceDispatcher::open(params, &backend, sink.clone())?;

    let cancel = CancellationToken::new();
    let producers: Vec<_> = config
        .streams()
        .iter()
        .map(|stream| {
            source::SyntheticSource::new(stream, config.frames(), config.size(), Arc::clone(&ops))
                .start(Arc::clone(&dispatcher), cancel.clone())
        })
        .collect();

    let mut frames = ChannelDownstream::as_stream(sink);
    let mut open_streams = config.streams().len();
    while open_streams > 0 {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("interrupted, stopping producers");
                cancel.cancel();
            },
            frame = frames.next() => {
                let Some(frame) = frame else {
                    break;
                };
                if frame.is_eos() {
                    log::info!("{}: eos", frame.stream_id);
                    open_streams -= 1;
                    continue;
                }
                let objects = frame.objects()?.snapshot();
                if objects.is_empty() {
                    log::debug!("{}", frame);
                    continue;
                }
                for object in objects {
                    log::info!(
                        "{} ts {}: label {} score {:.2} at ({:.2}, {:.2}, {:.2}, {:.2})",
                        frame.stream_id,
                        frame.timestamp,
                        object.label,
                        object.score,
                        object.bbox.x,
                        object.bbox.y,
                        object.bbox.w,
                        object.bbox.h
                    );
                }
            },
        }
    }

    for producer in producers {
        producer.await??;
    }
    dispatcher.close();
    Ok(())
}
