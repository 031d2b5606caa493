use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use super::payload::{CollectorResponse, DeliveryPayload};
use super::DeliveryError;

/// The remote end of the delivery protocol.
///
/// `Ok` means the collector answered with a well-formed response, whatever
/// its status. No answer within the timeout, or an answer of any other
/// shape, is `DeliveryError::Connection`.
pub trait Collector: Send {
    fn send(&mut self, payload: &DeliveryPayload) -> Result<CollectorResponse, DeliveryError>;
}

/// JSON over HTTP POST with a bounded timeout.
pub struct HttpCollector {
    url: String,
    agent: ureq::Agent,
}

impl HttpCollector {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let parsed = url::Url::parse(url).with_context(|| format!("invalid collector url {}", url))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(anyhow!("collector url must be http or https: {}", url));
        }
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Ok(Self {
            url: url.to_string(),
            agent,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Collector for HttpCollector {
    fn send(&mut self, payload: &DeliveryPayload) -> Result<CollectorResponse, DeliveryError> {
        let response = match self.agent.post(&self.url).send_json(payload) {
            Ok(response) => response,
            // The collector may answer `status: error` with a non-2xx code.
            Err(ureq::Error::Status(code, response)) => {
                let body = response.into_string().unwrap_or_default();
                return CollectorResponse::parse(&body).map_err(|_| {
                    DeliveryError::Connection(format!("collector returned http {}", code))
                });
            }
            Err(ureq::Error::Transport(err)) => {
                return Err(DeliveryError::Connection(err.to_string()));
            }
        };
        let body = response
            .into_string()
            .map_err(|err| DeliveryError::Connection(format!("read response: {}", err)))?;
        CollectorResponse::parse(&body)
    }
}
