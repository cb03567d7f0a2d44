//! Renderer capability: tweet URL in, screenshot buffers out
//!
//! The engine consumes rendering through the narrow [`Renderer`] trait; the
//! bundled implementation drives a headless Chrome session per capture via
//! chromiumoxide. Sessions are scoped so the browser is released on every
//! exit path, including cancellation and capture failure.

use crate::config::{Config, OutputFormat, RenderProfile};
use crate::error::CaptureError;
use crate::job::Item;
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use tokio::time::sleep;
use tracing::{debug, warn};

#[async_trait]
pub trait Renderer: Send + Sync {
    /// Render the item under the given profile and return its page buffers.
    ///
    /// Failures are the sole input to retry classification, so
    /// implementations must map their underlying errors onto the
    /// [`CaptureError`] render variants.
    async fn capture(
        &self,
        item: &Item,
        profile: &RenderProfile,
    ) -> Result<Vec<Vec<u8>>, CaptureError>;
}

/// Headless-Chrome renderer; one browser session per capture.
pub struct ChromiumRenderer {
    config: Config,
}

impl ChromiumRenderer {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    async fn capture_on_page(
        &self,
        page: &Page,
        profile: &RenderProfile,
    ) -> Result<Vec<u8>, CaptureError> {
        let viewport = &self.config.viewport;
        let emulation_params =
            chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams::builder()
                .width(viewport.width)
                .height(viewport.height)
                .device_scale_factor(viewport.device_scale_factor)
                .mobile(viewport.mobile)
                .build()
                .map_err(|e| CaptureError::CaptureFailed(e.to_string()))?;

        page.execute(emulation_params)
            .await
            .map_err(|e| CaptureError::CaptureFailed(e.to_string()))?;

        if profile.wait_for_network_idle {
            page.wait_for_navigation()
                .await
                .map_err(|e| CaptureError::NavigationFailed(e.to_string()))?;
        }

        if let Some(wait) = profile.wait_after_load {
            sleep(wait).await;
        }

        let screenshot_params = ScreenshotParams::builder()
            .format(chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat::Png)
            .full_page(true)
            .build();

        let png_data = page
            .screenshot(screenshot_params)
            .await
            .map_err(|e| CaptureError::CaptureFailed(e.to_string()))?;

        convert_image_format(png_data, self.config.output_format)
    }
}

#[async_trait]
impl Renderer for ChromiumRenderer {
    async fn capture(
        &self,
        item: &Item,
        profile: &RenderProfile,
    ) -> Result<Vec<Vec<u8>>, CaptureError> {
        let session = BrowserSession::launch(&self.config, profile).await?;
        debug!(
            "Rendering {} under profile '{}'",
            item.url(),
            profile.name
        );

        let result = async {
            let page = session
                .browser
                .new_page(item.url())
                .await
                .map_err(|e| CaptureError::NavigationFailed(e.to_string()))?;

            let capture = self.capture_on_page(&page, profile).await;
            let _ = page.close().await;
            capture.map(|data| vec![data])
        }
        .await;

        session.close().await;
        result
    }
}

/// A launched browser plus its CDP event pump; closed as a unit.
struct BrowserSession {
    browser: Browser,
    handler: tokio::task::JoinHandle<()>,
}

impl BrowserSession {
    async fn launch(config: &Config, profile: &RenderProfile) -> Result<Self, CaptureError> {
        let browser_config = build_browser_config(config, profile)?;
        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| CaptureError::SessionCreationFailed(e.to_string()))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        Ok(Self { browser, handler })
    }

    async fn close(mut self) {
        if let Err(e) = self.browser.close().await {
            warn!("Browser close failed: {e}");
        }
        self.handler.abort();
    }
}

fn build_browser_config(
    config: &Config,
    profile: &RenderProfile,
) -> Result<BrowserConfig, CaptureError> {
    let mut builder = BrowserConfig::builder()
        .window_size(config.viewport.width, config.viewport.height)
        .args(chrome_args(config, profile));

    if let Some(chrome_path) = &config.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder
        .build()
        .map_err(CaptureError::SessionCreationFailed)
}

/// Chrome command-line arguments for one capture session
///
/// Each session gets a unique user-data directory so concurrent workers
/// never trip over Chrome's process singleton.
pub fn chrome_args(config: &Config, profile: &RenderProfile) -> Vec<String> {
    let session_id = format!("{}-{}", std::process::id(), uuid::Uuid::new_v4());

    let mut args = vec![
        "--headless".to_string(),
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--mute-audio".to_string(),
        "--hide-scrollbars".to_string(),
        format!(
            "--window-size={},{}",
            config.viewport.width, config.viewport.height
        ),
        format!("--user-data-dir=/tmp/capture-engine-{session_id}"),
    ];

    if profile.block_images {
        args.push("--blink-settings=imagesEnabled=false".to_string());
    }

    if !profile.enable_javascript {
        args.push("--disable-javascript".to_string());
    }

    if let Some(user_agent) = &config.user_agent {
        args.push(format!("--user-agent={user_agent}"));
    }

    args
}

fn convert_image_format(png_data: Vec<u8>, format: OutputFormat) -> Result<Vec<u8>, CaptureError> {
    match format {
        OutputFormat::Png => Ok(png_data),
        OutputFormat::Jpeg => {
            let img = image::load_from_memory(&png_data)
                .map_err(|e| CaptureError::CaptureFailed(e.to_string()))?;
            let mut jpeg_data = Vec::new();
            img.write_to(
                &mut std::io::Cursor::new(&mut jpeg_data),
                image::ImageFormat::Jpeg,
            )
            .map_err(|e| CaptureError::CaptureFailed(e.to_string()))?;
            Ok(jpeg_data)
        }
        OutputFormat::Webp => {
            let img = image::load_from_memory(&png_data)
                .map_err(|e| CaptureError::CaptureFailed(e.to_string()))?;
            let mut webp_data = Vec::new();
            img.write_to(
                &mut std::io::Cursor::new(&mut webp_data),
                image::ImageFormat::WebP,
            )
            .map_err(|e| CaptureError::CaptureFailed(e.to_string()))?;
            Ok(webp_data)
        }
    }
}
