//! Master → storage node calls
use crate::common::{http_url, ErrorBody, Result};
use crate::coordinator::heartbeat::CreateVolume;
use std::time::Duration;

#[derive(Clone)]
pub struct VolumeClient {
    client: reqwest::Client,
}

impl VolumeClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// Ask a node to provision a volume ahead of its next heartbeat
    pub async fn assign_volume(&self, node: &str, req: &CreateVolume) -> Result<()> {
        let url = format!("{}/admin/assign_volume", http_url(node));
        let resp = self.client.post(&url).json(req).send().await?;
        if !resp.status().is_success() {
            let body: ErrorBody = resp.json().await?;
            return Err(body.into());
        }
        Ok(())
    }
}
