use anyhow::{bail, Context};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IpInfo {
    pub country: Option<String>,
    pub city: Option<String>,
    pub isp: Option<String>,
    pub is_proxy: bool,
    pub is_hosting: bool,
}

impl IpInfo {
    /// `City, Country`, or whichever part is known.
    pub fn location(&self) -> Option<String> {
        match (&self.city, &self.country) {
            (Some(city), Some(country)) => Some(format!("{city}, {country}")),
            (None, Some(country)) => Some(country.clone()),
            (Some(city), None) => Some(city.clone()),
            (None, None) => None,
        }
    }
}

#[async_trait]
pub trait GeoLocator: Send + Sync {
    /// Never fails: an unsuccessful lookup yields [`IpInfo::default`].
    async fn lookup(&self, ip: &str) -> IpInfo;
}

/// Lookups against the free ip-api.com JSON endpoint.
pub struct IpApiLocator {
    client: reqwest::Client,
    base_url: String,
}

impl IpApiLocator {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    async fn try_lookup(&self, ip: &str) -> anyhow::Result<IpInfo> {
        let response: IpApiResponse = self
            .client
            .get(format!(
                "{}/{}",
                self.base_url.trim_end_matches('/'),
                urlencoding::encode(ip)
            ))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("Error decoding ip-api response")?;
        if response.status.as_deref() == Some("fail") {
            bail!(
                "ip-api could not locate {ip}: {}",
                response.message.unwrap_or_default()
            );
        }
        Ok(IpInfo {
            country: response.country.filter(|s| !s.is_empty()),
            city: response.city.filter(|s| !s.is_empty()),
            isp: response.isp.filter(|s| !s.is_empty()),
            is_proxy: response.proxy,
            is_hosting: response.hosting,
        })
    }
}

#[async_trait]
impl GeoLocator for IpApiLocator {
    async fn lookup(&self, ip: &str) -> IpInfo {
        match self.try_lookup(ip).await {
            Ok(info) => info,
            Err(error) => {
                warn!("Error fetching IP info for {ip}: {error:#}");
                IpInfo::default()
            }
        }
    }
}

#[derive(Deserialize)]
struct IpApiResponse {
    status: Option<String>,
    message: Option<String>,
    country: Option<String>,
    city: Option<String>,
    isp: Option<String>,
    #[serde(default)]
    proxy: bool,
    #[serde(default)]
    hosting: bool,
}

#[cfg(test)]
pub mod test_support {
    use super::{GeoLocator, IpInfo};
    use async_trait::async_trait;

    pub struct FakeGeoLocator(pub IpInfo);

    #[async_trait]
    impl GeoLocator for FakeGeoLocator {
        async fn lookup(&self, _ip: &str) -> IpInfo {
            self.0.clone()
        }
    }
}
