//! Images for the LED matrix: local files at random intervals and remote
//! images (webcams, radar) at fixed offsets. Both end up as raw RGB bytes.

use crate::broker_mux::BrokerMux;
use crate::config::{JobRunnerConfig, LocalImagesConfig, RemoteImageConfig, RemoteImageSource};
use crate::job_runner::new_job_runner;
use crate::service_utils::publish_with_timeout;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use rand::seq::SliceRandom;
use reqwest::StatusCode;
use rumqttc::QoS;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("GET error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("GET bad response: {0}")]
    Status(StatusCode),
    #[error("image: {0}")]
    Image(#[from] image::ImageError),
    #[error("image worker: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// Three bytes per pixel, row by row. Alpha is dropped.
pub fn matrix_bytes(img: &DynamicImage) -> Vec<u8> {
    img.to_rgb8().into_raw()
}

/// A zero width or height keeps the aspect ratio; both zero leaves the
/// image alone.
fn resize(img: &DynamicImage, width: u32, height: u32) -> DynamicImage {
    let (src_w, src_h) = img.dimensions();
    let (width, height) = match (width, height) {
        (0, 0) => return img.clone(),
        (0, h) => (((src_w as u64 * h as u64) / src_h.max(1) as u64).max(1) as u32, h),
        (w, 0) => (w, ((src_h as u64 * w as u64) / src_w.max(1) as u64).max(1) as u32),
        (w, h) => (w, h),
    };
    img.resize_exact(width, height, FilterType::Lanczos3)
}

fn load_local(path: &Path, width: u32, height: u32) -> Result<Vec<u8>, ImageError> {
    let img = image::open(path)?;
    Ok(matrix_bytes(&resize(&img, width, height)))
}

struct CropSpec {
    resize_width: u32,
    resize_height: u32,
    start_x: u32,
    start_y: u32,
    width: u32,
    height: u32,
}

fn process_remote(raw: &[u8], crop: &CropSpec) -> Result<Vec<u8>, ImageError> {
    let decoded = image::load_from_memory(raw)?;
    let scaled = resize(&decoded, crop.resize_width, crop.resize_height);
    let cropped = scaled.crop_imm(crop.start_x, crop.start_y, crop.width, crop.height);

    // Publish whatever we have, short or not.
    if cropped.dimensions() != (crop.width, crop.height) {
        warn!(
            "remoteImage: crop is {:?}, wanted {}x{}",
            cropped.dimensions(),
            crop.width,
            crop.height
        );
    }

    Ok(matrix_bytes(&cropped))
}

pub fn init_local_images(mux: Arc<BrokerMux>, config: &LocalImagesConfig) {
    if config.topic.is_empty() || config.sources.is_empty() {
        return;
    }

    let fixed = config.fixed_delay.max(0);
    let jobs = JobRunnerConfig {
        rand_min: fixed,
        rand_max: (fixed + config.rand_delay.max(0)).max(1),
        ..Default::default()
    };

    let config = Arc::new(config.clone());
    new_job_runner("images", &jobs, move || {
        let mux = mux.clone();
        let config = config.clone();
        async move { post_local_image(&mux, &config).await }
    })
    .run();
}

fn pick_source(sources: &[PathBuf]) -> Option<PathBuf> {
    sources.choose(&mut rand::thread_rng()).cloned()
}

async fn post_local_image(mux: &BrokerMux, config: &LocalImagesConfig) {
    let Some(source) = pick_source(&config.sources) else {
        return;
    };

    let (width, height) = (config.width, config.height);
    let path = source.clone();
    let bytes = match tokio::task::spawn_blocking(move || load_local(&path, width, height)).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => {
            error!("images: {}: {}", source.display(), e);
            return;
        }
        Err(e) => {
            error!("images: {}: {}", source.display(), ImageError::from(e));
            return;
        }
    };

    info!("images: posting {} to {}", source.display(), config.topic);
    publish_with_timeout(mux, &config.topic, QoS::AtMostOnce, false, bytes).await;
}

struct RemoteImageJob {
    topic: String,
    uri: String,
    crop: CropSpec,
}

impl RemoteImageJob {
    fn new(config: &RemoteImageConfig, source: &RemoteImageSource) -> Self {
        Self {
            topic: config.topic.clone(),
            uri: source.uri.clone(),
            crop: CropSpec {
                resize_width: source.resize_width,
                resize_height: source.resize_height,
                start_x: source.start_x,
                start_y: source.start_y,
                width: config.width,
                height: config.height,
            },
        }
    }

    async fn fetch(&self, client: &reqwest::Client) -> Result<Vec<u8>, ImageError> {
        let response = client.get(&self.uri).send().await?;
        if response.status() != StatusCode::OK {
            return Err(ImageError::Status(response.status()));
        }
        Ok(response.bytes().await?.to_vec())
    }

    async fn run(self: Arc<Self>, mux: &BrokerMux, client: &reqwest::Client) {
        let raw = match self.fetch(client).await {
            Ok(raw) => raw,
            Err(e) => {
                error!("remoteImage: {}: {}", self.uri, e);
                return;
            }
        };

        let job = self.clone();
        let bytes = match tokio::task::spawn_blocking(move || process_remote(&raw, &job.crop)).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                error!("remoteImage: bad decode: {}: {}", self.uri, e);
                return;
            }
            Err(e) => {
                error!("remoteImage: {}: {}", self.uri, ImageError::from(e));
                return;
            }
        };

        info!("remoteImage: posting to {}", self.topic);
        publish_with_timeout(mux, &self.topic, QoS::AtMostOnce, false, bytes).await;
    }
}

/// Every source gets its own offset runner.
pub fn init_remote_images(mux: Arc<BrokerMux>, configs: &[RemoteImageConfig]) {
    if configs.is_empty() {
        return;
    }

    let client = match reqwest::Client::builder().timeout(HTTP_TIMEOUT).build() {
        Ok(client) => client,
        Err(e) => {
            error!("remoteImage: http client: {}", e);
            return;
        }
    };

    for (idx, config) in configs.iter().enumerate() {
        for (source_idx, source) in config.sources.iter().enumerate() {
            let job = Arc::new(RemoteImageJob::new(config, source));
            let jobs = JobRunnerConfig {
                offsets: source.offsets.clone(),
                ..Default::default()
            };
            debug!("remoteImage: {} at {:?}", source.uri, source.offsets);

            let mux = mux.clone();
            let client = client.clone();
            new_job_runner(&format!("remote{}-{}", idx, source_idx), &jobs, move || {
                let mux = mux.clone();
                let client = client.clone();
                let job = job.clone();
                async move { job.run(&mux, &client).await }
            })
            .run();
        }
    }
}
