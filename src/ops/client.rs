//! Client for the master HTTP API
//!
//! Requests go to the last-known leader first. A `NotLeader` reply with a
//! hint moves the client to the hinted master; other retryable errors walk
//! the configured masters with backoff.

use crate::common::utils::retry_with_backoff;
use crate::common::{http_url, Error, ErrorBody, Result};
use crate::coordinator::allocation::{AssignRequest, AssignResponse};
use crate::coordinator::http::{DirStatus, LookupResponse};
use crate::coordinator::raft_node::RaftStatus;
use crate::coordinator::topology::{DegradedVolume, GarbageVolume, VolumeId};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const MAX_ATTEMPTS: usize = 5;
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

pub struct MasterClient {
    client: reqwest::Client,
    masters: Vec<String>,
    target: Mutex<String>,
    next: AtomicUsize,
}

impl MasterClient {
    pub fn new(masters: Vec<String>, timeout: Duration) -> Result<Self> {
        let first = masters
            .first()
            .cloned()
            .ok_or_else(|| Error::InvalidConfig("no master address given".into()))?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            masters,
            target: Mutex::new(first),
            next: AtomicUsize::new(1),
        })
    }

    /// Master the next request goes to
    pub fn target(&self) -> String {
        self.target.lock().clone()
    }

    fn on_error(&self, err: &Error) {
        match err.leader_hint() {
            Some(leader) => {
                tracing::debug!("Redirected to leader {}", leader);
                *self.target.lock() = leader.to_string();
            }
            None => {
                let i = self.next.fetch_add(1, Ordering::Relaxed) % self.masters.len();
                *self.target.lock() = self.masters[i].clone();
            }
        }
    }

    async fn send_once<B, T>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T>
    where
        B: Serialize,
        T: DeserializeOwned,
    {
        let url = format!("{}{}", http_url(&self.target()), path);
        let mut req = self.client.request(method, &url);
        if let Some(body) = body {
            req = req.json(body);
        }
        let result = async {
            let resp = req.send().await?;
            if !resp.status().is_success() {
                let body: ErrorBody = resp.json().await?;
                return Err(Error::from(body));
            }
            Ok(resp.json::<T>().await?)
        }
        .await;
        if let Err(e) = &result {
            self.on_error(e);
        }
        result
    }

    async fn call<B, T>(&self, method: reqwest::Method, path: &str, body: Option<&B>) -> Result<T>
    where
        B: Serialize,
        T: DeserializeOwned,
    {
        retry_with_backoff(
            move || self.send_once(method.clone(), path, body),
            MAX_ATTEMPTS,
            INITIAL_BACKOFF,
        )
        .await
    }

    pub async fn assign(&self, req: &AssignRequest) -> Result<AssignResponse> {
        self.call(reqwest::Method::POST, "/vol/assign", Some(req))
            .await
    }

    pub async fn lookup(&self, vid: VolumeId) -> Result<LookupResponse> {
        self.call::<(), _>(
            reqwest::Method::GET,
            &format!("/dir/lookup?volumeId={}", vid),
            None,
        )
        .await
    }

    pub async fn cluster_status(&self) -> Result<RaftStatus> {
        self.call::<(), _>(reqwest::Method::GET, "/cluster/status", None)
            .await
    }

    pub async fn dir_status(&self) -> Result<DirStatus> {
        self.call::<(), _>(reqwest::Method::GET, "/dir/status", None)
            .await
    }

    pub async fn garbage(&self) -> Result<Vec<GarbageVolume>> {
        self.call::<(), _>(reqwest::Method::GET, "/vol/garbage", None)
            .await
    }

    pub async fn degraded(&self) -> Result<Vec<DegradedVolume>> {
        self.call::<(), _>(reqwest::Method::GET, "/vol/degraded", None)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_a_master() {
        assert!(MasterClient::new(vec![], Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_follows_leader_hint_then_rotates() {
        let client = MasterClient::new(
            vec!["m1:9333".into(), "m2:9333".into(), "m3:9333".into()],
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(client.target(), "m1:9333");

        client.on_error(&Error::NotLeader(Some("m3:9333".into())));
        assert_eq!(client.target(), "m3:9333");

        client.on_error(&Error::ConnectionFailed("refused".into()));
        assert_eq!(client.target(), "m2:9333");
        client.on_error(&Error::NoLeaderElected);
        assert_eq!(client.target(), "m3:9333");
        client.on_error(&Error::NoLeaderElected);
        assert_eq!(client.target(), "m1:9333");
    }

    #[tokio::test]
    async fn test_unreachable_master_fails_after_retries() {
        let client = MasterClient::new(vec!["127.0.0.1:1".into()], Duration::from_millis(100))
            .unwrap();
        let err = client.cluster_status().await.unwrap_err();
        assert!(err.is_retryable());
    }
}
