//! Identification probe for a single candidate host.

use std::future::Future;
use std::net::Ipv4Addr;
use std::time::Duration;

use reqwest::StatusCode;

use super::Device;
use crate::protocol::IdentityResponse;

/// Decides whether one address hosts a peer.
///
/// Every failure mode (timeout, refusal, bad status, malformed body, wrong
/// identity) yields `None`; a probe never errors.
pub trait Probe: Send + Sync + 'static {
    /// Probe `address` and describe the device that answered, if any.
    fn probe(&self, address: Ipv4Addr) -> impl Future<Output = Option<Device>> + Send;
}

/// Probes `GET http://{address}:{port}/api/identify`.
#[derive(Debug, Clone)]
pub struct HttpProber {
    client: reqwest::Client,
    port: u16,
    timeout: Duration,
}

impl HttpProber {
    /// Create a prober for `port` with a per-probe `timeout`.
    #[must_use]
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self {
            client: crate::transport::http::lan_client(),
            port,
            timeout,
        }
    }

    /// Port being probed.
    pub const fn port(&self) -> u16 {
        self.port
    }

    async fn identify(&self, address: Ipv4Addr) -> Result<IdentityResponse, String> {
        let url = format!("http://{}:{}/api/identify", address, self.port);
        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if response.status() != StatusCode::OK {
            return Err(format!("status {}", response.status()));
        }

        response
            .json::<IdentityResponse>()
            .await
            .map_err(|e| e.to_string())
    }
}

impl Probe for HttpProber {
    async fn probe(&self, address: Ipv4Addr) -> Option<Device> {
        match self.identify(address).await {
            Ok(identity) if identity.is_anydrop() => {
                tracing::debug!("found device at {}:{}", address, self.port);
                Some(Device::from_identity(address, self.port, &identity))
            }
            Ok(identity) => {
                tracing::trace!("{} answered as '{}', ignoring", address, identity.app);
                None
            }
            Err(e) => {
                tracing::trace!("probe {} failed: {}", address, e);
                None
            }
        }
    }
}
