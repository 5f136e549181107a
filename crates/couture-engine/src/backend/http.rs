use std::fs;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use couture_contracts::history::{HistoryPage, HistoryRecord};
use couture_contracts::sessions::PollResponse;
use couture_contracts::versions::Dimensions;
use reqwest::blocking::{Client as HttpClient, RequestBuilder, Response as HttpResponse};
use serde_json::{json, Value};

use super::{
    GenerationBackend, GenerationRequest, HistoryBackend, ImageBackend, TransformOutput,
    TransformRequest, UploadedImage,
};
use crate::config::StudioConfig;

/// JSON-over-HTTP client for the hosted image service.
///
/// Endpoints, relative to `COUTURE_API_BASE`:
/// - `POST /uploads` with a base64 data URL
/// - `POST /transforms/{kind}`
/// - `POST /generations`, `GET /generations/{id}`
/// - `GET|PUT /history/{id}`, `GET /history?page=&per_page=`
pub struct HttpBackend {
    http: HttpClient,
    api_base: String,
    api_key: Option<String>,
}

impl HttpBackend {
    pub fn new(config: &StudioConfig) -> Result<Self> {
        let api_base = config
            .api_base
            .clone()
            .ok_or_else(|| anyhow!("COUTURE_API_BASE must be set for the http backend"))?;
        let http = HttpClient::builder()
            .timeout(config.request_timeout)
            .build()
            .context("failed building HTTP client")?;
        Ok(Self {
            http,
            api_base,
            api_key: config.api_key.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path.trim_start_matches('/'))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match self.api_key.as_deref() {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    fn get_json(&self, operation: &str, path: &str) -> Result<Value> {
        let endpoint = self.endpoint(path);
        let response = self
            .authorized(self.http.get(&endpoint))
            .send()
            .with_context(|| format!("{operation} request failed ({endpoint})"))?;
        response_json_or_error(operation, response)
    }

    fn send_json(
        &self,
        operation: &str,
        method: reqwest::Method,
        path: &str,
        payload: &Value,
    ) -> Result<Value> {
        let endpoint = self.endpoint(path);
        let response = self
            .authorized(self.http.request(method, &endpoint))
            .json(payload)
            .send()
            .with_context(|| format!("{operation} request failed ({endpoint})"))?;
        response_json_or_error(operation, response)
    }
}

impl ImageBackend for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    fn upload_and_prepare(&self, path: &Path) -> Result<UploadedImage> {
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("upload.png");
        let payload = json!({
            "filename": filename,
            "image": path_to_data_url(path)?,
        });
        let body = self.send_json("upload", reqwest::Method::POST, "uploads", &payload)?;
        parse_upload(&body)
    }

    fn transform(&self, request: &TransformRequest) -> Result<TransformOutput> {
        let mut payload = json!({
            "image_url": request.source_ref,
            "hash": request.source_hash,
        });
        if let Some(rect) = request.crop {
            payload["crop"] = json!({
                "x": rect.x,
                "y": rect.y,
                "width": rect.width,
                "height": rect.height,
            });
        }
        let path = format!("transforms/{}", request.kind.slug());
        let body = self.send_json(request.kind.slug(), reqwest::Method::POST, &path, &payload)?;
        parse_transform(&body)
    }
}

impl GenerationBackend for HttpBackend {
    fn start_generation(&self, request: &GenerationRequest) -> Result<String> {
        let payload = json!({
            "image_url": request.source_ref,
            "hash": request.source_hash,
            "prompt": request.prompt,
            "kind": request.kind.as_str(),
            "count": request.kind.slot_count(),
        });
        let body = self.send_json("generation", reqwest::Method::POST, "generations", &payload)?;
        first_str(&body, &["session_id", "id"])
            .map(str::to_string)
            .ok_or_else(|| anyhow!("generation response is missing a session id: {body}"))
    }

    fn poll_generation_status(&self, session_id: &str) -> Result<PollResponse> {
        let body = self.get_json("generation poll", &format!("generations/{session_id}"))?;
        serde_json::from_value(body).context("generation poll returned an unexpected payload")
    }
}

impl HistoryBackend for HttpBackend {
    fn load_history_record(&self, id: &str) -> Result<HistoryRecord> {
        let body = self.get_json("history load", &format!("history/{id}"))?;
        serde_json::from_value(body).with_context(|| format!("history record '{id}' is malformed"))
    }

    fn save_history_record(&self, record: &HistoryRecord) -> Result<()> {
        let payload = serde_json::to_value(record)?;
        self.send_json(
            "history save",
            reqwest::Method::PUT,
            &format!("history/{}", record.id),
            &payload,
        )?;
        Ok(())
    }

    fn list_history(&self, page: usize, per_page: usize) -> Result<HistoryPage> {
        let body = self.get_json(
            "history list",
            &format!("history?page={page}&per_page={per_page}"),
        )?;
        serde_json::from_value(body).context("history list returned an unexpected payload")
    }
}

fn path_to_data_url(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    let mime = mime_for_path(path).unwrap_or("image/png");
    Ok(format!("data:{mime};base64,{}", BASE64.encode(bytes)))
}

fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}

fn first_str<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|text| !text.is_empty())
}

fn parse_dimensions(value: &Value) -> Option<Dimensions> {
    let width = value.get("width").and_then(Value::as_u64)?;
    let height = value.get("height").and_then(Value::as_u64)?;
    let dims = Dimensions::new(u32::try_from(width).ok()?, u32::try_from(height).ok()?);
    (!dims.is_empty()).then_some(dims)
}

fn parse_upload(body: &Value) -> Result<UploadedImage> {
    let Some(image_ref) = first_str(body, &["image_url", "url"]) else {
        bail!("upload response is missing an image url: {body}");
    };
    let Some(hash) = first_str(body, &["hash", "sha256"]) else {
        bail!("upload response is missing a content hash: {body}");
    };
    let Some(dimensions) = parse_dimensions(body) else {
        bail!("upload response is missing image dimensions: {body}");
    };
    Ok(UploadedImage {
        image_ref: image_ref.to_string(),
        hash: hash.to_string(),
        dimensions,
    })
}

fn parse_transform(body: &Value) -> Result<TransformOutput> {
    let Some(result_ref) = first_str(body, &["result_url", "image_url", "url"]) else {
        bail!("transform response is missing a result url: {body}");
    };
    let Some(result_hash) = first_str(body, &["result_hash", "hash"]) else {
        bail!("transform response is missing a content hash: {body}");
    };
    Ok(TransformOutput {
        result_ref: result_ref.to_string(),
        result_hash: result_hash.to_string(),
        dimensions: parse_dimensions(body),
    })
}

fn response_json_or_error(operation: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{operation} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{operation} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&body).with_context(|| format!("{operation} returned invalid JSON payload"))
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "..."
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::config::BackendKind;

    use super::*;

    fn config(api_base: Option<&str>) -> StudioConfig {
        StudioConfig {
            backend: BackendKind::Http,
            api_base: api_base.map(str::to_string),
            api_key: Some("secret".to_string()),
            request_timeout: Duration::from_secs(5),
            ..StudioConfig::default()
        }
    }

    #[test]
    fn requires_api_base() {
        assert!(HttpBackend::new(&config(None)).is_err());
    }

    #[test]
    fn endpoints_join_cleanly() -> Result<()> {
        let backend = HttpBackend::new(&config(Some("https://studio.example.test/api")))?;
        assert_eq!(
            backend.endpoint("/generations/abc"),
            "https://studio.example.test/api/generations/abc"
        );
        Ok(())
    }

    #[test]
    fn upload_payload_fields_are_required() -> Result<()> {
        let upload = parse_upload(&json!({
            "url": "https://cdn.example.test/u/1.png",
            "sha256": "abc",
            "width": 800,
            "height": 1000,
        }))?;
        assert_eq!(upload.dimensions, Dimensions::new(800, 1000));
        assert_eq!(upload.hash, "abc");

        assert!(parse_upload(&json!({"url": "x", "hash": "h"})).is_err());
        assert!(parse_upload(&json!({"hash": "h", "width": 1, "height": 1})).is_err());
        Ok(())
    }

    #[test]
    fn transform_dimensions_are_optional() -> Result<()> {
        let output = parse_transform(&json!({"result_url": " https://cdn/r.png ", "hash": "h2"}))?;
        assert_eq!(output.result_ref, "https://cdn/r.png");
        assert!(output.dimensions.is_none());
        assert!(parse_transform(&json!({"hash": "h2"})).is_err());
        Ok(())
    }

    #[test]
    fn data_url_uses_extension_mime() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("coat.JPG");
        fs::write(&path, b"abc")?;
        assert_eq!(path_to_data_url(&path)?, "data:image/jpeg;base64,YWJj");
        Ok(())
    }

    #[test]
    fn truncate_marks_cut_text() {
        assert_eq!(truncate_text("abcdef", 3), "abc...");
        assert_eq!(truncate_text("abc", 3), "abc");
    }
}
