/// Upstream full-node daemon RPC client.
///
/// All calls can fail transiently; callers treat `IndexerError::Daemon` as
/// retryable after the polling delay. `cached_height` returns the last
/// height observed without another round trip.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use crate::error::{IndexerError, Result};
use crate::types::Height;

pub trait Daemon: Send + Sync + 'static {
    fn height(&self) -> impl Future<Output = Result<Height>> + Send;
    fn cached_height(&self) -> Height;
    fn block_hex_hashes(
        &self,
        first: Height,
        count: usize,
    ) -> impl Future<Output = Result<Vec<String>>> + Send;
    fn raw_blocks(
        &self,
        hex_hashes: &[String],
    ) -> impl Future<Output = Result<Vec<Vec<u8>>>> + Send;
    fn mempool_hashes(&self) -> impl Future<Output = Result<Vec<String>>> + Send;
    /// Missing transactions (evicted or confirmed mid-call) come back None.
    fn get_raw_transactions(
        &self,
        hex_hashes: &[String],
    ) -> impl Future<Output = Result<Vec<Option<Vec<u8>>>>> + Send;
}

/// JSON-RPC client with basic auth, one batched request per call.
pub struct RpcDaemon {
    client: reqwest::Client,
    url: String,
    user: Option<String>,
    pass: Option<String>,
    cached: AtomicU32,
}

impl RpcDaemon {
    pub fn new(url: String, user: Option<String>, pass: Option<String>) -> Arc<RpcDaemon> {
        Arc::new(RpcDaemon {
            client: reqwest::Client::new(),
            url,
            user,
            pass,
            cached: AtomicU32::new(0),
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let body = json!({"jsonrpc": "1.0", "id": "claimdex", "method": method, "params": params});
        self.call_raw(&body).await.map(|mut v| v["result"].take())
    }

    async fn call_batch(&self, method: &str, param_sets: Vec<Value>) -> Result<Vec<Value>> {
        let body: Vec<Value> = param_sets
            .into_iter()
            .enumerate()
            .map(|(id, params)| {
                json!({"jsonrpc": "1.0", "id": id, "method": method, "params": params})
            })
            .collect();
        let response = self.call_raw(&Value::Array(body)).await?;
        let mut results = response
            .as_array()
            .cloned()
            .ok_or_else(|| IndexerError::daemon("non-array batch response"))?;
        // Batch responses may arrive out of order.
        results.sort_by_key(|entry| entry["id"].as_u64().unwrap_or(u64::MAX));
        Ok(results
            .into_iter()
            .map(|mut entry| entry["result"].take())
            .collect())
    }

    async fn call_raw(&self, body: &impl serde::Serialize) -> Result<Value> {
        let mut request = self.client.post(&self.url).json(body);
        if let Some(ref user) = self.user {
            request = request.basic_auth(user, self.pass.as_deref());
        }
        let response = request
            .send()
            .await
            .map_err(|e| IndexerError::daemon(format!("rpc send: {e}")))?;
        debug!(url = %self.url, status = %response.status(), "daemon rpc");
        response
            .json::<Value>()
            .await
            .map_err(|e| IndexerError::daemon(format!("rpc decode: {e}")))
    }
}

impl Daemon for RpcDaemon {
    async fn height(&self) -> Result<Height> {
        let result = self.call("getblockcount", json!([])).await?;
        let height = result
            .as_u64()
            .ok_or_else(|| IndexerError::daemon("bad getblockcount result"))?
            as Height;
        self.cached.store(height, Ordering::Relaxed);
        Ok(height)
    }

    fn cached_height(&self) -> Height {
        self.cached.load(Ordering::Relaxed)
    }

    async fn block_hex_hashes(&self, first: Height, count: usize) -> Result<Vec<String>> {
        let params = (0..count).map(|n| json!([first + n as Height])).collect();
        let results = self.call_batch("getblockhash", params).await?;
        results
            .into_iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_owned)
                    .ok_or_else(|| IndexerError::daemon("bad getblockhash result"))
            })
            .collect()
    }

    async fn raw_blocks(&self, hex_hashes: &[String]) -> Result<Vec<Vec<u8>>> {
        let params = hex_hashes.iter().map(|h| json!([h, false])).collect();
        let results = self.call_batch("getblock", params).await?;
        results
            .into_iter()
            .map(|v| {
                v.as_str()
                    .and_then(|s| hex::decode(s).ok())
                    .ok_or_else(|| IndexerError::daemon("bad getblock result"))
            })
            .collect()
    }

    async fn mempool_hashes(&self) -> Result<Vec<String>> {
        let result = self.call("getrawmempool", json!([false])).await?;
        result
            .as_array()
            .ok_or_else(|| IndexerError::daemon("bad getrawmempool result"))?
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_owned)
                    .ok_or_else(|| IndexerError::daemon("bad mempool hash"))
            })
            .collect()
    }

    async fn get_raw_transactions(&self, hex_hashes: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        let params = hex_hashes.iter().map(|h| json!([h, false])).collect();
        let results = self.call_batch("getrawtransaction", params).await?;
        Ok(results
            .into_iter()
            .map(|v| v.as_str().and_then(|s| hex::decode(s).ok()))
            .collect())
    }
}

/// In-memory daemon for tests: serves a scripted chain and mempool.
#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use crate::types::Hash32;

    #[derive(Default)]
    pub struct FakeDaemon {
        inner: Mutex<FakeChain>,
    }

    #[derive(Default)]
    struct FakeChain {
        /// Raw blocks by height; hashes derived from the headers.
        blocks: Vec<Vec<u8>>,
        mempool: Vec<String>,
        raw_txs: HashMap<String, Vec<u8>>,
    }

    impl FakeDaemon {
        pub fn new() -> Arc<FakeDaemon> {
            Arc::new(FakeDaemon::default())
        }

        pub fn push_block(&self, raw: Vec<u8>) {
            self.inner.lock().unwrap().blocks.push(raw);
        }

        pub fn truncate_chain(&self, new_len: usize) {
            self.inner.lock().unwrap().blocks.truncate(new_len);
        }

        pub fn set_mempool(&self, hashes: Vec<String>) {
            self.inner.lock().unwrap().mempool = hashes;
        }

        pub fn add_raw_tx(&self, hash: Hash32, raw: Vec<u8>) {
            self.inner.lock().unwrap().raw_txs.insert(hash.rpc_hex(), raw);
        }

        fn block_hash_at(chain: &FakeChain, height: usize) -> Option<String> {
            chain
                .blocks
                .get(height)
                .map(|raw| crate::coin::header_hash(&raw[..crate::coin::HEADER_SIZE]).rpc_hex())
        }
    }

    impl Daemon for FakeDaemon {
        async fn height(&self) -> Result<Height> {
            Ok(self.cached_height())
        }

        fn cached_height(&self) -> Height {
            let chain = self.inner.lock().unwrap();
            chain.blocks.len().saturating_sub(1) as Height
        }

        async fn block_hex_hashes(&self, first: Height, count: usize) -> Result<Vec<String>> {
            let chain = self.inner.lock().unwrap();
            let mut out = Vec::new();
            for n in 0..count {
                match FakeDaemon::block_hash_at(&chain, first as usize + n) {
                    Some(hash) => out.push(hash),
                    None => break,
                }
            }
            Ok(out)
        }

        async fn raw_blocks(&self, hex_hashes: &[String]) -> Result<Vec<Vec<u8>>> {
            let chain = self.inner.lock().unwrap();
            hex_hashes
                .iter()
                .map(|wanted| {
                    chain
                        .blocks
                        .iter()
                        .find(|raw| {
                            crate::coin::header_hash(&raw[..crate::coin::HEADER_SIZE]).rpc_hex()
                                == *wanted
                        })
                        .cloned()
                        .ok_or_else(|| IndexerError::daemon(format!("unknown block {wanted}")))
                })
                .collect()
        }

        async fn mempool_hashes(&self) -> Result<Vec<String>> {
            Ok(self.inner.lock().unwrap().mempool.clone())
        }

        async fn get_raw_transactions(&self, hex_hashes: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
            let chain = self.inner.lock().unwrap();
            Ok(hex_hashes
                .iter()
                .map(|h| chain.raw_txs.get(h).cloned())
                .collect())
        }
    }
}
