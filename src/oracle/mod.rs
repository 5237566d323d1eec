use crate::config::OracleConfig;
use crate::error::ControlError;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Session key material handed out by the crypto oracle. The handle is an
/// opaque reference into the oracle's keystore; raw key bytes never cross
/// this boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionKeys {
    pub kem_id: String,
    pub sig_id: String,
    pub key_handle: String,
}

/// Post-quantum crypto service contract. The control plane treats it as a
/// black box: no cryptographic semantics are assumed beyond these calls.
#[async_trait::async_trait]
pub trait CryptoOracle: Send + Sync {
    async fn keygen(&self) -> Result<SessionKeys, ControlError>;
    async fn sign(&self, key_handle: &str, payload: &[u8]) -> Result<Vec<u8>, ControlError>;
    async fn verify(
        &self,
        key_handle: &str,
        payload: &[u8],
        signature: &[u8],
    ) -> Result<bool, ControlError>;
    async fn entropy(&self, bytes: usize) -> Result<Vec<u8>, ControlError>;
    async fn hash(&self, payload: &[u8]) -> Result<Vec<u8>, ControlError>;
    /// Invalidate a key handle and zeroize its material oracle-side.
    async fn destroy(&self, key_handle: &str) -> Result<(), ControlError>;
}

/// Aggregate load snapshot handed to the forecaster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkState {
    pub total_mbps: u64,
    pub allocated_mbps: u64,
    pub active_allocations: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    /// Projected allocated load at the end of the horizon.
    pub projected_load_mbps: f64,
    pub confidence: f64,
}

#[async_trait::async_trait]
pub trait Forecaster: Send + Sync {
    async fn predict(
        &self,
        state: &NetworkState,
        horizon_s: u64,
    ) -> Result<Prediction, ControlError>;
}

/// Decentralized name service (resolve/publish/watch).
#[async_trait::async_trait]
pub trait NameService: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<Option<String>, ControlError>;
    async fn publish(&self, name: &str, address: &str) -> Result<(), ControlError>;
    /// Subscribe to updates for a name. The receiver yields the latest
    /// published address.
    async fn watch(
        &self,
        name: &str,
    ) -> Result<tokio::sync::watch::Receiver<Option<String>>, ControlError>;
}

/// Opaque settlement ledger.
#[async_trait::async_trait]
pub trait Ledger: Send + Sync {
    async fn mint(&self, owner: &str, asset: &str, amount: u64) -> Result<String, ControlError>;
    async fn transfer(&self, tx_id: &str, from: &str, to: &str) -> Result<(), ControlError>;
    async fn verify(&self, tx_id: &str) -> Result<bool, ControlError>;
}

/// All external collaborators, wired once at startup. Endpoints missing
/// from the configuration get in-process implementations, which keeps a
/// single-node development deployment self-contained.
pub struct OracleSet {
    pub crypto: Arc<dyn CryptoOracle>,
    pub forecaster: Arc<dyn Forecaster>,
    pub names: Arc<dyn NameService>,
    pub ledger: Arc<dyn Ledger>,
}

impl OracleSet {
    pub fn from_config(config: &OracleConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .unwrap_or_default();

        let crypto: Arc<dyn CryptoOracle> = match &config.crypto_endpoint {
            Some(url) => {
                tracing::info!("oracle: crypto endpoint configured, url={}", url);
                Arc::new(HttpCryptoOracle::new(url, client.clone()))
            }
            None => {
                tracing::info!("oracle: crypto endpoint missing, using in-process keystore");
                Arc::new(MemoryCryptoOracle::new())
            }
        };

        let forecaster: Arc<dyn Forecaster> = match &config.forecaster_endpoint {
            Some(url) => Arc::new(HttpForecaster::new(url, client.clone())),
            None => Arc::new(TrendForecaster::default()),
        };

        let names: Arc<dyn NameService> = match &config.nameservice_endpoint {
            Some(url) => Arc::new(HttpNameService::new(url, client.clone())),
            None => Arc::new(MemoryNameService::new()),
        };

        let ledger: Arc<dyn Ledger> = match &config.ledger_endpoint {
            Some(url) => Arc::new(HttpLedger::new(url, client)),
            None => Arc::new(MemoryLedger::new()),
        };

        Self {
            crypto,
            forecaster,
            names,
            ledger,
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP-backed implementations
// ---------------------------------------------------------------------------

fn http_err(e: reqwest::Error) -> ControlError {
    if e.is_timeout() {
        ControlError::Timeout(e.to_string())
    } else {
        ControlError::Unavailable(e.to_string())
    }
}

pub struct HttpCryptoOracle {
    base_url: String,
    client: reqwest::Client,
}

impl HttpCryptoOracle {
    pub fn new(base_url: &str, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }
}

#[derive(Serialize)]
struct SignRequest<'a> {
    key_handle: &'a str,
    payload_b64: String,
}

#[async_trait::async_trait]
impl CryptoOracle for HttpCryptoOracle {
    async fn keygen(&self) -> Result<SessionKeys, ControlError> {
        self.client
            .post(format!("{}/v1/keys", self.base_url))
            .send()
            .await
            .map_err(http_err)?
            .error_for_status()
            .map_err(http_err)?
            .json::<SessionKeys>()
            .await
            .map_err(http_err)
    }

    async fn sign(&self, key_handle: &str, payload: &[u8]) -> Result<Vec<u8>, ControlError> {
        use base64::Engine;
        #[derive(Deserialize)]
        struct SignResponse {
            signature_b64: String,
        }
        let resp = self
            .client
            .post(format!("{}/v1/sign", self.base_url))
            .json(&SignRequest {
                key_handle,
                payload_b64: base64::engine::general_purpose::STANDARD.encode(payload),
            })
            .send()
            .await
            .map_err(http_err)?
            .error_for_status()
            .map_err(http_err)?
            .json::<SignResponse>()
            .await
            .map_err(http_err)?;
        base64::engine::general_purpose::STANDARD
            .decode(resp.signature_b64)
            .map_err(|e| ControlError::Internal(format!("bad signature encoding: {}", e)))
    }

    async fn verify(
        &self,
        key_handle: &str,
        payload: &[u8],
        signature: &[u8],
    ) -> Result<bool, ControlError> {
        use base64::Engine;
        #[derive(Serialize)]
        struct VerifyRequest<'a> {
            key_handle: &'a str,
            payload_b64: String,
            signature_b64: String,
        }
        #[derive(Deserialize)]
        struct VerifyResponse {
            valid: bool,
        }
        let resp = self
            .client
            .post(format!("{}/v1/verify", self.base_url))
            .json(&VerifyRequest {
                key_handle,
                payload_b64: base64::engine::general_purpose::STANDARD.encode(payload),
                signature_b64: base64::engine::general_purpose::STANDARD.encode(signature),
            })
            .send()
            .await
            .map_err(http_err)?
            .error_for_status()
            .map_err(http_err)?
            .json::<VerifyResponse>()
            .await
            .map_err(http_err)?;
        Ok(resp.valid)
    }

    async fn entropy(&self, bytes: usize) -> Result<Vec<u8>, ControlError> {
        use base64::Engine;
        #[derive(Deserialize)]
        struct EntropyResponse {
            data_b64: String,
        }
        let resp = self
            .client
            .get(format!("{}/v1/entropy", self.base_url))
            .query(&[("bytes", bytes)])
            .send()
            .await
            .map_err(http_err)?
            .error_for_status()
            .map_err(http_err)?
            .json::<EntropyResponse>()
            .await
            .map_err(http_err)?;
        base64::engine::general_purpose::STANDARD
            .decode(resp.data_b64)
            .map_err(|e| ControlError::Internal(format!("bad entropy encoding: {}", e)))
    }

    async fn hash(&self, payload: &[u8]) -> Result<Vec<u8>, ControlError> {
        self.sign("hash", payload).await
    }

    async fn destroy(&self, key_handle: &str) -> Result<(), ControlError> {
        self.client
            .delete(format!("{}/v1/keys/{}", self.base_url, key_handle))
            .send()
            .await
            .map_err(http_err)?
            .error_for_status()
            .map_err(http_err)?;
        Ok(())
    }
}

pub struct HttpForecaster {
    base_url: String,
    client: reqwest::Client,
}

impl HttpForecaster {
    pub fn new(base_url: &str, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }
}

#[async_trait::async_trait]
impl Forecaster for HttpForecaster {
    async fn predict(
        &self,
        state: &NetworkState,
        horizon_s: u64,
    ) -> Result<Prediction, ControlError> {
        #[derive(Serialize)]
        struct PredictRequest<'a> {
            state: &'a NetworkState,
            horizon_s: u64,
        }
        self.client
            .post(format!("{}/v1/predict", self.base_url))
            .json(&PredictRequest { state, horizon_s })
            .send()
            .await
            .map_err(http_err)?
            .error_for_status()
            .map_err(http_err)?
            .json::<Prediction>()
            .await
            .map_err(http_err)
    }
}

pub struct HttpNameService {
    base_url: String,
    client: reqwest::Client,
}

impl HttpNameService {
    pub fn new(base_url: &str, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }
}

#[derive(Deserialize)]
struct ResolveResponse {
    address: Option<String>,
}

#[async_trait::async_trait]
impl NameService for HttpNameService {
    async fn resolve(&self, name: &str) -> Result<Option<String>, ControlError> {
        let resp = self
            .client
            .get(format!("{}/v1/names/{}", self.base_url, name))
            .send()
            .await
            .map_err(http_err)?;
        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        let body = resp
            .error_for_status()
            .map_err(http_err)?
            .json::<ResolveResponse>()
            .await
            .map_err(http_err)?;
        Ok(body.address)
    }

    async fn publish(&self, name: &str, address: &str) -> Result<(), ControlError> {
        self.client
            .put(format!("{}/v1/names/{}", self.base_url, name))
            .json(&serde_json::json!({ "address": address }))
            .send()
            .await
            .map_err(http_err)?
            .error_for_status()
            .map_err(http_err)?;
        Ok(())
    }

    async fn watch(
        &self,
        name: &str,
    ) -> Result<tokio::sync::watch::Receiver<Option<String>>, ControlError> {
        let initial = self.resolve(name).await?;
        let (tx, rx) = tokio::sync::watch::channel(initial);

        // Poll-driven watch; the remote service exposes no push API.
        let client = self.client.clone();
        let url = format!("{}/v1/names/{}", self.base_url, name);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(10));
            loop {
                interval.tick().await;
                if tx.is_closed() {
                    return;
                }
                let resolved = match client.get(&url).send().await {
                    Ok(resp) if resp.status().as_u16() == 404 => Some(None),
                    Ok(resp) => resp
                        .json::<ResolveResponse>()
                        .await
                        .ok()
                        .map(|r| r.address),
                    Err(_) => None,
                };
                if let Some(address) = resolved {
                    tx.send_if_modified(|current| {
                        if *current != address {
                            *current = address;
                            true
                        } else {
                            false
                        }
                    });
                }
            }
        });
        Ok(rx)
    }
}

pub struct HttpLedger {
    base_url: String,
    client: reqwest::Client,
}

impl HttpLedger {
    pub fn new(base_url: &str, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }
}

#[async_trait::async_trait]
impl Ledger for HttpLedger {
    async fn mint(&self, owner: &str, asset: &str, amount: u64) -> Result<String, ControlError> {
        #[derive(Deserialize)]
        struct MintResponse {
            tx_id: String,
        }
        let resp = self
            .client
            .post(format!("{}/v1/mint", self.base_url))
            .json(&serde_json::json!({ "owner": owner, "asset": asset, "amount": amount }))
            .send()
            .await
            .map_err(http_err)?
            .error_for_status()
            .map_err(http_err)?
            .json::<MintResponse>()
            .await
            .map_err(http_err)?;
        Ok(resp.tx_id)
    }

    async fn transfer(&self, tx_id: &str, from: &str, to: &str) -> Result<(), ControlError> {
        self.client
            .post(format!("{}/v1/transfer", self.base_url))
            .json(&serde_json::json!({ "tx_id": tx_id, "from": from, "to": to }))
            .send()
            .await
            .map_err(http_err)?
            .error_for_status()
            .map_err(http_err)?;
        Ok(())
    }

    async fn verify(&self, tx_id: &str) -> Result<bool, ControlError> {
        #[derive(Deserialize)]
        struct VerifyResponse {
            confirmed: bool,
        }
        let resp = self
            .client
            .get(format!("{}/v1/tx/{}", self.base_url, tx_id))
            .send()
            .await
            .map_err(http_err)?
            .error_for_status()
            .map_err(http_err)?
            .json::<VerifyResponse>()
            .await
            .map_err(http_err)?;
        Ok(resp.confirmed)
    }
}

// ---------------------------------------------------------------------------
// In-process implementations — used when no endpoint is configured, and by
// tests to inject failures deterministically.
// ---------------------------------------------------------------------------

/// Keystore-only oracle: handles are opaque ids, signatures are keyed
/// digests. Failure injection covers the test scenarios around integrity
/// loss and oracle unreachability.
pub struct MemoryCryptoOracle {
    keys: DashMap<String, u64>,
    next_key: AtomicU64,
    /// When set, verify() reports invalid — simulates integrity loss.
    pub fail_verify: AtomicBool,
    /// When set, every call errors `Unavailable` — simulates an outage.
    pub unreachable: AtomicBool,
}

impl MemoryCryptoOracle {
    pub fn new() -> Self {
        Self {
            keys: DashMap::new(),
            next_key: AtomicU64::new(1),
            fail_verify: AtomicBool::new(false),
            unreachable: AtomicBool::new(false),
        }
    }

    fn check_reachable(&self) -> Result<(), ControlError> {
        if self.unreachable.load(Ordering::Relaxed) {
            return Err(ControlError::Unavailable("crypto oracle unreachable".into()));
        }
        Ok(())
    }

    fn digest(seed: u64, payload: &[u8]) -> Vec<u8> {
        // FNV-1a keyed by the handle seed; stable and dependency-free.
        let mut hash = 0xcbf2_9ce4_8422_2325u64 ^ seed;
        for b in payload {
            hash ^= *b as u64;
            hash = hash.wrapping_mul(0x100_0000_01b3);
        }
        hash.to_be_bytes().to_vec()
    }
}

impl Default for MemoryCryptoOracle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CryptoOracle for MemoryCryptoOracle {
    async fn keygen(&self) -> Result<SessionKeys, ControlError> {
        self.check_reachable()?;
        let seed = rand::random::<u64>();
        let id = self.next_key.fetch_add(1, Ordering::Relaxed);
        let handle = format!("key-{:08x}-{:08x}", id, seed as u32);
        self.keys.insert(handle.clone(), seed);
        Ok(SessionKeys {
            kem_id: "ml-kem-1024".to_string(),
            sig_id: "ml-dsa-87".to_string(),
            key_handle: handle,
        })
    }

    async fn sign(&self, key_handle: &str, payload: &[u8]) -> Result<Vec<u8>, ControlError> {
        self.check_reachable()?;
        let seed = self
            .keys
            .get(key_handle)
            .map(|e| *e.value())
            .ok_or_else(|| ControlError::InvalidArgument(format!("unknown key {}", key_handle)))?;
        Ok(Self::digest(seed, payload))
    }

    async fn verify(
        &self,
        key_handle: &str,
        payload: &[u8],
        signature: &[u8],
    ) -> Result<bool, ControlError> {
        self.check_reachable()?;
        if self.fail_verify.load(Ordering::Relaxed) {
            return Ok(false);
        }
        let expected = self.sign(key_handle, payload).await?;
        Ok(expected == signature)
    }

    async fn entropy(&self, bytes: usize) -> Result<Vec<u8>, ControlError> {
        self.check_reachable()?;
        let mut out = vec![0u8; bytes];
        rand::Rng::fill(&mut rand::thread_rng(), &mut out[..]);
        Ok(out)
    }

    async fn hash(&self, payload: &[u8]) -> Result<Vec<u8>, ControlError> {
        self.check_reachable()?;
        Ok(Self::digest(0, payload))
    }

    async fn destroy(&self, key_handle: &str) -> Result<(), ControlError> {
        self.check_reachable()?;
        self.keys.remove(key_handle);
        Ok(())
    }
}

/// Linear-trend forecaster: projects current utilization forward assuming
/// load stays flat, with confidence shrinking over the horizon.
#[derive(Default)]
pub struct TrendForecaster;

#[async_trait::async_trait]
impl Forecaster for TrendForecaster {
    async fn predict(
        &self,
        state: &NetworkState,
        horizon_s: u64,
    ) -> Result<Prediction, ControlError> {
        let confidence = (1.0 - horizon_s as f64 / 86_400.0).clamp(0.5, 1.0);
        Ok(Prediction {
            projected_load_mbps: state.allocated_mbps as f64,
            confidence,
        })
    }
}

/// A forecaster with a fixed answer, for tests that need the admission
/// projection to breach the safety margin.
pub struct FixedForecaster {
    pub prediction: Prediction,
}

#[async_trait::async_trait]
impl Forecaster for FixedForecaster {
    async fn predict(&self, _: &NetworkState, _: u64) -> Result<Prediction, ControlError> {
        Ok(self.prediction.clone())
    }
}

pub struct MemoryNameService {
    entries: DashMap<String, tokio::sync::watch::Sender<Option<String>>>,
}

impl MemoryNameService {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    fn sender(&self, name: &str) -> tokio::sync::watch::Sender<Option<String>> {
        self.entries
            .entry(name.to_string())
            .or_insert_with(|| tokio::sync::watch::channel(None).0)
            .clone()
    }
}

impl Default for MemoryNameService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl NameService for MemoryNameService {
    async fn resolve(&self, name: &str) -> Result<Option<String>, ControlError> {
        Ok(self
            .entries
            .get(name)
            .and_then(|tx| tx.borrow().clone()))
    }

    async fn publish(&self, name: &str, address: &str) -> Result<(), ControlError> {
        let _ = self.sender(name).send(Some(address.to_string()));
        Ok(())
    }

    async fn watch(
        &self,
        name: &str,
    ) -> Result<tokio::sync::watch::Receiver<Option<String>>, ControlError> {
        Ok(self.sender(name).subscribe())
    }
}

pub struct MemoryLedger {
    transactions: DashMap<String, bool>,
    next_tx: AtomicU64,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            transactions: DashMap::new(),
            next_tx: AtomicU64::new(1),
        }
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Ledger for MemoryLedger {
    async fn mint(&self, _owner: &str, _asset: &str, _amount: u64) -> Result<String, ControlError> {
        let tx_id = format!("tx-{:08x}", self.next_tx.fetch_add(1, Ordering::Relaxed));
        self.transactions.insert(tx_id.clone(), true);
        Ok(tx_id)
    }

    async fn transfer(&self, tx_id: &str, _from: &str, _to: &str) -> Result<(), ControlError> {
        if !self.transactions.contains_key(tx_id) {
            return Err(ControlError::InvalidArgument(format!(
                "unknown transaction {}",
                tx_id
            )));
        }
        Ok(())
    }

    async fn verify(&self, tx_id: &str) -> Result<bool, ControlError> {
        Ok(self.transactions.get(tx_id).map(|e| *e.value()).unwrap_or(false))
    }
}
