//! Controller side of the daemon RPC: typed client and per-node pool

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chaos_core::{ChaosError, Result};
use chaos_daemon::proto::{
    EXEC_PATH, Empty, ExecFaultRequest, HEALTH_PATH, HealthResponse, ListProcessesRequest,
    ListProcessesResponse, PROCESSES_PATH, RpcError,
};
use log::debug;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Extra time the HTTP client waits beyond the RPC deadline, so the daemon
/// gets to report its own timeout
const DEADLINE_SLACK: Duration = Duration::from_secs(2);

/// The RPC surface of one node daemon
#[async_trait]
pub trait FaultDaemon: Send + Sync {
    async fn exec(&self, req: ExecFaultRequest) -> Result<()>;

    async fn list_processes(&self, req: ListProcessesRequest) -> Result<ListProcessesResponse>;

    async fn health(&self) -> Result<HealthResponse>;
}

/// HTTP/JSON client of a node daemon
pub struct DaemonClient {
    base_url: String,
    http: reqwest::Client,
}

impl DaemonClient {
    /// `address` is `host:port` or a full `http://` URL
    pub fn new(address: &str, rpc_timeout: Duration) -> Result<Self> {
        let base_url = if address.starts_with("http://") || address.starts_with("https://") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", address.trim_end_matches('/'))
        };

        let http = reqwest::Client::builder()
            .timeout(rpc_timeout + DEADLINE_SLACK)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| ChaosError::Connection(format!("Cannot build client: {}", e)))?;

        Ok(Self { base_url, http })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        debug!("POST {}", url);
        let resp = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;
        decode_response(resp).await
    }
}

#[async_trait]
impl FaultDaemon for DaemonClient {
    async fn exec(&self, req: ExecFaultRequest) -> Result<()> {
        let _: Empty = self.post(EXEC_PATH, &req).await?;
        Ok(())
    }

    async fn list_processes(&self, req: ListProcessesRequest) -> Result<ListProcessesResponse> {
        self.post(PROCESSES_PATH, &req).await
    }

    async fn health(&self) -> Result<HealthResponse> {
        let url = format!("{}{}", self.base_url, HEALTH_PATH);
        let resp = self.http.get(&url).send().await.map_err(transport_error)?;
        decode_response(resp).await
    }
}

fn transport_error(e: reqwest::Error) -> ChaosError {
    if e.is_timeout() {
        ChaosError::Timeout
    } else {
        ChaosError::Connection(e.to_string())
    }
}

async fn decode_response<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        return resp
            .json::<T>()
            .await
            .map_err(|e| ChaosError::Decode(format!("Invalid daemon response: {}", e)));
    }

    let body = resp.bytes().await.map_err(transport_error)?;
    match serde_json::from_slice::<RpcError>(&body) {
        Ok(rpc) => Err(rpc.into()),
        Err(_) => Err(ChaosError::Rpc {
            code: status.as_u16().to_string(),
            message: String::from_utf8_lossy(&body).into_owned(),
        }),
    }
}

/// Creates the client of one node
pub trait DaemonConnector: Send + Sync {
    fn connect(&self, node: &str, address: &str) -> Result<Arc<dyn FaultDaemon>>;
}

/// Connects with [`DaemonClient`]
pub struct HttpConnector {
    rpc_timeout: Duration,
}

impl HttpConnector {
    pub fn new(rpc_timeout: Duration) -> Self {
        Self { rpc_timeout }
    }
}

impl DaemonConnector for HttpConnector {
    fn connect(&self, _node: &str, address: &str) -> Result<Arc<dyn FaultDaemon>> {
        Ok(Arc::new(DaemonClient::new(address, self.rpc_timeout)?))
    }
}

/// One lazily created client per node, shared by every record on that node
pub struct ClientPool {
    connector: Arc<dyn DaemonConnector>,
    clients: Mutex<HashMap<String, Arc<dyn FaultDaemon>>>,
}

impl ClientPool {
    pub fn new(connector: Arc<dyn DaemonConnector>) -> Self {
        Self {
            connector,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_connect(&self, node: &str, address: &str) -> Result<Arc<dyn FaultDaemon>> {
        // Connect under the lock so a node never gets two clients
        let mut clients = self
            .clients
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());

        if let Some(client) = clients.get(node) {
            return Ok(client.clone());
        }

        let client = self.connector.connect(node, address).map_err(|e| match e {
            e @ ChaosError::Connection(_) => e,
            other => ChaosError::Connection(format!("{}: {}", node, other)),
        })?;
        debug!("Connected to daemon of node {} at {}", node, address);
        clients.insert(node.to_string(), client.clone());
        Ok(client)
    }

    pub fn len(&self) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullDaemon;

    #[async_trait]
    impl FaultDaemon for NullDaemon {
        async fn exec(&self, _req: ExecFaultRequest) -> Result<()> {
            Ok(())
        }

        async fn list_processes(
            &self,
            _req: ListProcessesRequest,
        ) -> Result<ListProcessesResponse> {
            Ok(ListProcessesResponse::default())
        }

        async fn health(&self) -> Result<HealthResponse> {
            Err(ChaosError::Connection("null".to_string()))
        }
    }

    #[derive(Default)]
    struct CountingConnector {
        connects: AtomicUsize,
    }

    impl DaemonConnector for CountingConnector {
        fn connect(&self, _node: &str, _address: &str) -> Result<Arc<dyn FaultDaemon>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(NullDaemon))
        }
    }

    #[test]
    fn test_base_url_normalization() {
        let client = DaemonClient::new("10.0.0.1:31767/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.base_url(), "http://10.0.0.1:31767");

        let client = DaemonClient::new("https://node-a:443", Duration::from_secs(1)).unwrap();
        assert_eq!(client.base_url(), "https://node-a:443");
    }

    #[test]
    fn test_pool_reuses_client_per_node() {
        let connector = Arc::new(CountingConnector::default());
        let pool = ClientPool::new(connector.clone());

        let a1 = pool.get_or_connect("node-a", "a:1").unwrap();
        let a2 = pool.get_or_connect("node-a", "a:1").unwrap();
        pool.get_or_connect("node-b", "b:1").unwrap();

        assert!(Arc::ptr_eq(&a1, &a2));
        assert_eq!(pool.len(), 2);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_pool_concurrent_access_connects_once() {
        let connector = Arc::new(CountingConnector::default());
        let pool = Arc::new(ClientPool::new(connector.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || pool.get_or_connect("node-a", "a:1").unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unreachable_daemon_is_connection_error() {
        // Nothing listens on the discard port
        let client = DaemonClient::new("127.0.0.1:9", Duration::from_secs(1)).unwrap();
        let err = client.health().await.unwrap_err();
        assert!(err.is_retryable(), "unexpected error: {:?}", err);
    }
}
