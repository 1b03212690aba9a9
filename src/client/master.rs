//! Master client that follows the Raft leader

use crate::client::{check_response, http_client};
use crate::common::{
    encode_query_value, normalize_url, AssignRequest, Assignment, Error, Heartbeat,
    HeartbeatResponse, LookupResponse, Result, VolumeId,
};
use parking_lot::{Mutex, RwLock};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};

const LOOKUP_TTL: Duration = Duration::from_secs(10);

pub struct MasterClient {
    client: reqwest::Client,
    masters: Vec<String>,
    leader: RwLock<Option<String>>,
    lookups: Mutex<HashMap<VolumeId, (Instant, LookupResponse)>>,
}

impl MasterClient {
    pub fn new(masters: &[String], timeout: Duration) -> Result<Self> {
        let masters: Vec<String> = masters.iter().map(|m| normalize_url(m)).collect();
        if masters.is_empty() {
            return Err(Error::InvalidConfig("no master configured".into()));
        }
        Ok(Self {
            client: http_client(timeout)?,
            masters,
            leader: RwLock::new(None),
            lookups: Mutex::new(HashMap::new()),
        })
    }

    pub fn leader(&self) -> Option<String> {
        self.leader.read().clone()
    }

    pub fn masters(&self) -> &[String] {
        &self.masters
    }

    async fn send<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        method: Method,
        base: &str,
        path: &str,
        body: Option<&B>,
    ) -> Result<T> {
        let mut req = self.client.request(method, format!("{}{}", base, path));
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = check_response(req.send().await?).await?;
        Ok(resp.json().await?)
    }

    /// Send to the leader, following `NotLeader` hints and rotating
    /// through the configured masters while no leader is reachable.
    async fn call<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T> {
        let mut rotation = 0usize;
        let mut target = self
            .leader()
            .unwrap_or_else(|| self.masters[0].clone());
        let attempts = self.masters.len() * 3 + 2;
        let mut last_err = Error::LeaderUnavailable;

        for attempt in 0..attempts {
            match self.send(method.clone(), &target, path, body).await {
                Ok(value) => {
                    *self.leader.write() = Some(target);
                    return Ok(value);
                }
                Err(Error::NotLeader(hint)) => {
                    tracing::debug!("{} redirected to leader {}", target, hint);
                    target = normalize_url(&hint);
                    last_err = Error::NotLeader(hint);
                }
                Err(e) if e.is_retryable() => {
                    tracing::debug!("Master {} unavailable: {}", target, e);
                    *self.leader.write() = None;
                    rotation += 1;
                    target = self.masters[rotation % self.masters.len()].clone();
                    tokio::time::sleep(Duration::from_millis(50 * (attempt as u64 + 1))).await;
                    last_err = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    pub async fn assign(&self, req: &AssignRequest) -> Result<Assignment> {
        self.call(Method::POST, "/dir/assign", Some(req)).await
    }

    pub async fn lookup(&self, vid: VolumeId) -> Result<LookupResponse> {
        let resp: LookupResponse = self
            .call::<(), _>(Method::GET, &format!("/dir/lookup?volume_id={}", vid), None)
            .await?;
        self.lookups.lock().insert(vid, (Instant::now(), resp.clone()));
        Ok(resp)
    }

    /// Lookup through a short-lived cache
    pub async fn lookup_cached(&self, vid: VolumeId) -> Result<LookupResponse> {
        if let Some((at, resp)) = self.lookups.lock().get(&vid) {
            if at.elapsed() < LOOKUP_TTL {
                return Ok(resp.clone());
            }
        }
        self.lookup(vid).await
    }

    pub fn invalidate(&self, vid: VolumeId) {
        self.lookups.lock().remove(&vid);
    }

    pub async fn heartbeat(&self, hb: &Heartbeat) -> Result<HeartbeatResponse> {
        self.call(Method::POST, "/heartbeat", Some(hb)).await
    }

    pub async fn grow(&self, count: usize, replication: Option<&str>) -> Result<Vec<VolumeId>> {
        let mut path = format!("/vol/grow?count={}", count);
        if let Some(rp) = replication {
            path.push_str(&format!("&replication={}", encode_query_value(rp)));
        }
        self.call::<(), _>(Method::POST, &path, None).await
    }

    /// POST an admin action and return the JSON report
    pub async fn post_json(&self, path: &str) -> Result<serde_json::Value> {
        self.call::<(), _>(Method::POST, path, None).await
    }

    pub async fn get_json(&self, path: &str) -> Result<serde_json::Value> {
        self.call::<(), _>(Method::GET, path, None).await
    }

    /// Status of one specific master, without leader following
    pub async fn master_status(&self, master: &str) -> Result<serde_json::Value> {
        self.send::<(), _>(Method::GET, &normalize_url(master), "/cluster/status", None)
            .await
    }
}
