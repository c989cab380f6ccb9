//! Plain HTTP sandbox.
//!
//! Fetches the target without rendering it. There is no DOM, so an element
//! wait is satisfied as soon as the document has loaded. Content shaping is
//! delegated to the processor context through the worker link.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use tracing::debug;

use super::worker::{Page, Sandbox, WorkerLink, WorkerOutcome, WorkerSeed};
use crate::error::{Error, Result};
use crate::model::{CompletionKind, HttpMethod};
use crate::router::DispatchEnvelope;

pub struct HttpSandbox {
    client: Client,
}

impl HttpSandbox {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("crawlnode/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Other(format!("failed to build http client: {e}")))?;
        Ok(Self { client })
    }
}

struct Fetched {
    body: String,
    pdf: bool,
}

async fn read(response: reqwest::Response) -> Result<Fetched> {
    let response = response
        .error_for_status()
        .map_err(|e| Error::Other(format!("target returned error: {e}")))?;
    let pdf = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/pdf"));
    let body = response
        .text()
        .await
        .map_err(|e| Error::Other(format!("failed to read body: {e}")))?;
    Ok(Fetched { body, pdf })
}

#[async_trait]
impl Sandbox for HttpSandbox {
    async fn open(&self, seed: &WorkerSeed) -> Result<Box<dyn Page>> {
        Ok(Box::new(HttpPage {
            client: self.client.clone(),
            url: seed.url.clone(),
        }))
    }
}

struct HttpPage {
    client: Client,
    url: String,
}

impl HttpPage {
    async fn fetch(&self, dispatch: &DispatchEnvelope) -> Result<Fetched> {
        let request = match &dispatch.passthrough {
            Some(pt) => {
                let mut request = match pt.method {
                    HttpMethod::Get => self.client.get(&self.url),
                    HttpMethod::Post => self.client.post(&self.url),
                };
                for (name, value) in &pt.headers {
                    request = request.header(name, value);
                }
                if let Some(payload) = &pt.payload {
                    request = request.body(payload.clone());
                }
                request
            }
            None => self.client.get(&self.url),
        };

        let response = request
            .send()
            .await
            .map_err(|e| Error::Other(format!("request failed: {e}")))?;
        read(response).await
    }
}

#[async_trait]
impl Page for HttpPage {
    async fn run(self: Box<Self>, dispatch: &DispatchEnvelope, link: &WorkerLink) -> Result<WorkerOutcome> {
        let fetched = self.fetch(dispatch).await?;
        debug!(bytes = fetched.body.len(), pdf = fetched.pdf, "target fetched");

        let params = &dispatch.params;
        let wants_processing = params.transform_id.is_some() || params.save_markdown || params.save_text;
        if wants_processing && !fetched.pdf {
            let result = link.process(params.transform_id.clone(), fetched.body).await;
            if !result.success {
                return Err(Error::Other(format!(
                    "processing failed: {}",
                    result.error.unwrap_or_default()
                )));
            }
        }

        let kind = if fetched.pdf {
            CompletionKind::Pdf
        } else if params.visualize {
            CompletionKind::Visualizer
        } else if params.sandbox.is_some() {
            CompletionKind::Contained
        } else {
            CompletionKind::Normal
        };
        Ok(WorkerOutcome::new(kind))
    }
}
