use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use youplace_shared::LevelUp;

/// Work item handed to the progression worker after a committed paint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressionJob {
    pub user_id: String,
    pub total_painted: u64,
}

/// Gamification collaborator. Runs off the paint path; never gates painting.
pub trait ProgressionHook: Send + Sync + 'static {
    fn on_pixel_accepted<'a>(
        &'a self,
        user_id: &'a str,
        total_painted: u64,
    ) -> BoxFuture<'a, Result<Option<LevelUp>, String>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgression;

impl ProgressionHook for NoopProgression {
    fn on_pixel_accepted<'a>(
        &'a self,
        _user_id: &'a str,
        _total_painted: u64,
    ) -> BoxFuture<'a, Result<Option<LevelUp>, String>> {
        Box::pin(async { Ok(None) })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PixelPaintedRequest<'a> {
    user_id: &'a str,
    total_pixels: u64,
}

#[derive(Debug, Deserialize)]
struct PixelPaintedResponse {
    #[serde(default)]
    data: Option<PixelPaintedData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PixelPaintedData {
    #[serde(default)]
    level_up: Option<LevelUp>,
}

/// Posts to `{base}/gamification/pixel-painted` and reads back an optional level-up.
#[derive(Clone)]
pub struct HttpProgressionHook {
    client: reqwest::Client,
    url: String,
}

impl HttpProgressionHook {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            url: format!("{}/gamification/pixel-painted", base_url.trim_end_matches('/')),
        }
    }
}

impl ProgressionHook for HttpProgressionHook {
    fn on_pixel_accepted<'a>(
        &'a self,
        user_id: &'a str,
        total_painted: u64,
    ) -> BoxFuture<'a, Result<Option<LevelUp>, String>> {
        Box::pin(async move {
            let response = self
                .client
                .post(&self.url)
                .json(&PixelPaintedRequest {
                    user_id,
                    total_pixels: total_painted,
                })
                .send()
                .await
                .map_err(|e| format!("progression request failed: {e}"))?;
            let status = response.status();
            if !status.is_success() {
                return Err(format!("progression service returned {status}"));
            }
            let body: PixelPaintedResponse = response
                .json()
                .await
                .map_err(|e| format!("progression response was not valid JSON: {e}"))?;
            Ok(body.data.and_then(|data| data.level_up))
        })
    }
}
