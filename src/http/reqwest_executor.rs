use std::collections::BTreeMap;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Method;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};

use super::{HttpExecutor, HttpResponse, RequestConfig, ResolvedBody};
use crate::config::Config;

/// Sends requests with a shared reqwest client.
#[derive(Clone)]
pub struct ReqwestExecutor {
    client: reqwest::Client,
}

impl ReqwestExecutor {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.http_timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self::new(client))
    }
}

#[async_trait]
impl HttpExecutor for ReqwestExecutor {
    async fn execute(&self, request: &RequestConfig) -> Result<HttpResponse> {
        let method = Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .with_context(|| format!("invalid HTTP method: {}", request.method))?;

        let is_multipart = matches!(request.body, ResolvedBody::FormData(_));
        let headers = build_headers(request, is_multipart)?;

        let mut builder = self.client.request(method, &request.url).headers(headers);
        builder = match &request.body {
            ResolvedBody::None => builder,
            ResolvedBody::Json(text) | ResolvedBody::Raw(text) => builder.body(text.clone()),
            ResolvedBody::Urlencoded(fields) => builder.body(crate::flows::materializer::encode_form(fields)),
            ResolvedBody::FormData(fields) => {
                let form = fields
                    .iter()
                    .fold(reqwest::multipart::Form::new(), |form, (k, v)| {
                        form.text(k.clone(), v.clone())
                    });
                builder.multipart(form)
            }
        };

        let start = Instant::now();
        let response = builder
            .send()
            .await
            .with_context(|| format!("{} {} failed", request.method, request.url))?;

        let status = response.status();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_ascii_lowercase(),
                    String::from_utf8_lossy(v.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response
            .text()
            .await
            .context("failed to read response body")?;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        tracing::debug!(
            url = %request.url,
            status = status.as_u16(),
            elapsed_ms,
            bytes = body.len(),
            "Response received",
        );

        Ok(HttpResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body,
            elapsed_ms,
        })
    }
}

fn build_headers(request: &RequestConfig, is_multipart: bool) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (name, value) in &request.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("invalid header name: {name}"))?;
        // reqwest sets the multipart boundary itself.
        if is_multipart && name == CONTENT_TYPE && value.trim() == "multipart/form-data" {
            continue;
        }
        let value = HeaderValue::from_str(value)
            .with_context(|| format!("invalid value for header {name}"))?;
        headers.append(name, value);
    }
    Ok(headers)
}
