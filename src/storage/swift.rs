//! OpenStack Swift 对象存储
//!
//! Keystone v2.0 密码认证，取目标 region 的 `object-store` publicURL。
//! token 缓存在内存中，收到 401 时重新认证一次。

use super::{
    normalize_etag, ObjectInfo, ObjectMeta, ObjectStore, StorageResult, CONNECT_TIMEOUT_SECS,
    IO_TIMEOUT_SECS, OP_TIMEOUT_SECS,
};
use crate::error::StorageError;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header, Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// 单页列表的最大条目数（Swift 默认上限）
const LIST_PAGE_LIMIT: usize = 10_000;

/// 已认证的会话
#[derive(Debug, Clone)]
struct Session {
    token: String,
    storage_url: String,
}

pub struct SwiftStore {
    client: Client,
    auth_url: String,
    username: String,
    password: String,
    tenant_name: String,
    region: String,
    session: RwLock<Option<Session>>,
    name: String,
}

// ============ Keystone v2 响应 ============

#[derive(Debug, Deserialize)]
struct AuthResponse {
    access: Access,
}

#[derive(Debug, Deserialize)]
struct Access {
    token: Token,
    #[serde(rename = "serviceCatalog", default)]
    service_catalog: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct Token {
    id: String,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    typ: String,
    #[serde(default)]
    endpoints: Vec<CatalogEndpoint>,
}

#[derive(Debug, Deserialize)]
struct CatalogEndpoint {
    #[serde(default)]
    region: Option<String>,
    #[serde(rename = "publicURL")]
    public_url: String,
}

// ============ Swift 列表响应 ============

#[derive(Debug, Deserialize)]
struct ContainerEntry {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ObjectEntry {
    #[serde(default)]
    name: Option<String>,
    /// 伪目录条目（使用 delimiter 时）只有 subdir
    #[serde(default)]
    subdir: Option<String>,
    #[serde(default)]
    hash: String,
    #[serde(default)]
    bytes: u64,
}

impl SwiftStore {
    pub fn new(
        auth_url: &str,
        username: &str,
        password: &str,
        tenant_name: &str,
        region: &str,
    ) -> Result<Self> {
        Ok(Self {
            client: http_client(Duration::from_secs(IO_TIMEOUT_SECS))?,
            auth_url: auth_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
            tenant_name: tenant_name.to_string(),
            region: region.to_string(),
            session: RwLock::new(None),
            name: format!("swift://{}@{}/{}", username, tenant_name, region),
        })
    }

    /// Keystone v2.0 认证并从服务目录中选择存储端点
    async fn authenticate(&self) -> StorageResult<Session> {
        let body = serde_json::json!({
            "auth": {
                "passwordCredentials": {
                    "username": self.username,
                    "password": self.password,
                },
                "tenantName": self.tenant_name,
            }
        });

        let response = self
            .client
            .post(format!("{}/tokens", self.auth_url))
            .timeout(Duration::from_secs(OP_TIMEOUT_SECS))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(StorageError::Auth(format!(
                "keystone rejected credentials for {} ({})",
                self.username, status
            )));
        }
        let auth: AuthResponse = response.error_for_status()?.json().await?;

        let storage_url = select_endpoint(&auth.access.service_catalog, &self.region)
            .ok_or_else(|| {
                StorageError::Auth(format!(
                    "no object-store endpoint for region {} in service catalog",
                    self.region
                ))
            })?;

        info!("Swift 认证成功: {} -> {}", self.name, storage_url);
        Ok(Session {
            token: auth.access.token.id,
            storage_url,
        })
    }

    async fn session(&self) -> StorageResult<Session> {
        if let Some(session) = self.session.read().await.as_ref() {
            return Ok(session.clone());
        }
        let mut guard = self.session.write().await;
        // 可能已被其他任务刷新
        if let Some(session) = guard.as_ref() {
            return Ok(session.clone());
        }
        let session = self.authenticate().await?;
        *guard = Some(session.clone());
        Ok(session)
    }

    async fn invalidate(&self, stale_token: &str) {
        let mut guard = self.session.write().await;
        if guard.as_ref().is_some_and(|s| s.token == stale_token) {
            *guard = None;
        }
    }

    /// 发送请求；token 过期（401）时重新认证并重试一次
    async fn send<F>(&self, build: F) -> StorageResult<Response>
    where
        F: Fn(&Client, &Session) -> RequestBuilder,
    {
        let session = self.session().await?;
        let response = build(&self.client, &session)
            .header("X-Auth-Token", &session.token)
            .send()
            .await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        debug!("Swift token 已失效，重新认证: {}", self.name);
        self.invalidate(&session.token).await;
        let session = self.session().await?;
        let response = build(&self.client, &session)
            .header("X-Auth-Token", &session.token)
            .send()
            .await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(StorageError::Auth(format!("token rejected by {}", self.name)));
        }
        Ok(response)
    }

    fn container_url(session: &Session, container: &str) -> String {
        format!("{}/{}", session.storage_url, urlencoding::encode(container))
    }

    fn object_url(session: &Session, container: &str, name: &str) -> String {
        format!(
            "{}/{}",
            Self::container_url(session, container),
            encode_object_name(name)
        )
    }

    /// 分页拉取 JSON 列表
    async fn list_pages<T, F>(&self, url_of: F, target: &str) -> StorageResult<Vec<T>>
    where
        T: DeserializeOwned + Named + Send,
        F: Fn(&Session) -> String,
    {
        let mut items: Vec<T> = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let limit = LIST_PAGE_LIMIT.to_string();
            let marker_value = marker.clone();
            let response = self
                .send(|client, session| {
                    let mut query = vec![("format", "json".to_string()), ("limit", limit.clone())];
                    if let Some(m) = &marker_value {
                        query.push(("marker", m.clone()));
                    }
                    client
                        .get(url_of(session))
                        .timeout(Duration::from_secs(OP_TIMEOUT_SECS))
                        .query(&query)
                })
                .await?;

            let response = check_status(response, target)?;
            // 204 表示空列表
            if response.status() == StatusCode::NO_CONTENT {
                break;
            }
            let page: Vec<T> = response.json().await?;
            let page_len = page.len();
            marker = page.last().map(|item| item.marker().to_string());
            items.extend(page);

            if page_len < LIST_PAGE_LIMIT || marker.is_none() {
                break;
            }
        }

        Ok(items)
    }
}

/// 可作为分页 marker 的列表条目
trait Named {
    fn marker(&self) -> &str;
}

impl Named for ContainerEntry {
    fn marker(&self) -> &str {
        &self.name
    }
}

impl Named for ObjectEntry {
    fn marker(&self) -> &str {
        self.name
            .as_deref()
            .or(self.subdir.as_deref())
            .unwrap_or_default()
    }
}

/// 不设总超时：对象 body 的传输时长随大小变化，只限制单次读取的间隔。
/// 列表、HEAD 和认证请求各自设置 `OP_TIMEOUT_SECS` 总超时。
fn http_client(read_timeout: Duration) -> reqwest::Result<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .read_timeout(read_timeout)
        .build()
}

fn select_endpoint(catalog: &[CatalogEntry], region: &str) -> Option<String> {
    catalog
        .iter()
        .filter(|entry| entry.typ == "object-store")
        .flat_map(|entry| entry.endpoints.iter())
        .find(|ep| ep.region.as_deref() == Some(region))
        .map(|ep| ep.public_url.trim_end_matches('/').to_string())
}

/// 对象名按路径段分别编码，保留 `/`
fn encode_object_name(name: &str) -> String {
    name.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn check_status(response: Response, target: &str) -> StorageResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match status {
        StatusCode::NOT_FOUND => Err(StorageError::NotFound(target.to_string())),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(StorageError::Auth(format!("{} for {}", status, target)))
        }
        _ => Err(StorageError::Http {
            status: status.as_u16(),
            target: target.to_string(),
        }),
    }
}

fn header_str<'a>(response: &'a Response, name: header::HeaderName) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

#[async_trait]
impl ObjectStore for SwiftStore {
    async fn list_containers(&self) -> StorageResult<Vec<String>> {
        let entries: Vec<ContainerEntry> = self
            .list_pages(|session| session.storage_url.clone(), "account")
            .await?;
        Ok(entries.into_iter().map(|e| e.name).collect())
    }

    async fn list_objects(&self, container: &str) -> StorageResult<Vec<ObjectInfo>> {
        let entries: Vec<ObjectEntry> = self
            .list_pages(|session| Self::container_url(session, container), container)
            .await?;
        Ok(entries
            .into_iter()
            .filter_map(|e| {
                e.name.map(|name| ObjectInfo {
                    name,
                    hash: normalize_etag(&e.hash),
                    bytes: e.bytes,
                })
            })
            .collect())
    }

    async fn head_container(&self, container: &str) -> StorageResult<()> {
        let response = self
            .send(|client, session| {
                client
                    .head(Self::container_url(session, container))
                    .timeout(Duration::from_secs(OP_TIMEOUT_SECS))
            })
            .await?;
        check_status(response, container)?;
        Ok(())
    }

    async fn put_container(&self, container: &str) -> StorageResult<()> {
        let response = self
            .send(|client, session| {
                client
                    .put(Self::container_url(session, container))
                    .timeout(Duration::from_secs(OP_TIMEOUT_SECS))
                    .header(header::CONTENT_LENGTH, 0)
            })
            .await?;
        check_status(response, container)?;
        Ok(())
    }

    async fn head_object(&self, container: &str, name: &str) -> StorageResult<ObjectMeta> {
        let target = format!("{}/{}", container, name);
        let response = self
            .send(|client, session| {
                client
                    .request(Method::HEAD, Self::object_url(session, container, name))
                    .timeout(Duration::from_secs(OP_TIMEOUT_SECS))
            })
            .await?;
        let response = check_status(response, &target)?;

        // HEAD 响应没有 body，直接解析 Content-Length 头
        let size = header_str(&response, header::CONTENT_LENGTH)
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| StorageError::Other(format!("missing Content-Length for {}", target)))?;
        let hash = header_str(&response, header::ETAG).map(normalize_etag);

        Ok(ObjectMeta { size, hash })
    }

    async fn get_object(&self, container: &str, name: &str) -> StorageResult<Bytes> {
        let target = format!("{}/{}", container, name);
        let response = self
            .send(|client, session| client.get(Self::object_url(session, container, name)))
            .await?;
        let response = check_status(response, &target)?;
        Ok(response.bytes().await?)
    }

    async fn put_object(&self, container: &str, name: &str, data: Bytes) -> StorageResult<()> {
        let target = format!("{}/{}", container, name);
        let response = self
            .send(|client, session| {
                client
                    .put(Self::object_url(session, container, name))
                    .body(data.clone())
            })
            .await?;
        check_status(response, &target)?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// 已认证、指向本地服务的 store
    fn local_store(storage_url: String, read_timeout: Duration) -> SwiftStore {
        SwiftStore {
            client: http_client(read_timeout).unwrap(),
            auth_url: "http://127.0.0.1:1/v2.0".to_string(),
            username: "u".to_string(),
            password: "p".to_string(),
            tenant_name: "t".to_string(),
            region: "r".to_string(),
            session: RwLock::new(Some(Session {
                token: "token".to_string(),
                storage_url,
            })),
            name: "swift://test".to_string(),
        }
    }

    /// 只响应一次 GET：先发响应头，然后每隔 `gap` 发送 body 的一个字节
    async fn serve_slow_body(body: &'static [u8], gap: Duration) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 4096];
            let _ = socket.read(&mut request).await.unwrap();
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            for byte in body {
                tokio::time::sleep(gap).await;
                if socket.write_all(&[*byte]).await.is_err() {
                    return;
                }
                let _ = socket.flush().await;
            }
        });
        format!("http://{}/v1/AUTH_t", addr)
    }

    #[tokio::test]
    async fn test_slow_body_longer_than_read_timeout_completes() {
        let url = serve_slow_body(b"0123456789", Duration::from_millis(100)).await;
        let store = local_store(url, Duration::from_millis(500));

        let started = std::time::Instant::now();
        let data = store.get_object("c1", "big.bin").await.unwrap();

        assert_eq!(data, Bytes::from_static(b"0123456789"));
        // 总耗时超过单次读取超时
        assert!(started.elapsed() > Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_stalled_body_times_out() {
        let url = serve_slow_body(b"01", Duration::from_secs(3)).await;
        let store = local_store(url, Duration::from_millis(200));

        assert!(store.get_object("c1", "big.bin").await.is_err());
    }

    fn catalog() -> Vec<CatalogEntry> {
        serde_json::from_value(serde_json::json!([
            {
                "type": "compute",
                "endpoints": [{ "region": "RegionOne", "publicURL": "https://nova/v2" }]
            },
            {
                "type": "object-store",
                "endpoints": [
                    { "region": "DFW", "publicURL": "https://dfw.swift/v1/AUTH_x/" },
                    { "region": "ORD", "publicURL": "https://ord.swift/v1/AUTH_x" }
                ]
            }
        ]))
        .unwrap()
    }

    #[test]
    fn test_select_endpoint_by_region() {
        let catalog = catalog();
        assert_eq!(
            select_endpoint(&catalog, "DFW").as_deref(),
            Some("https://dfw.swift/v1/AUTH_x")
        );
        assert_eq!(
            select_endpoint(&catalog, "ORD").as_deref(),
            Some("https://ord.swift/v1/AUTH_x")
        );
        assert!(select_endpoint(&catalog, "RegionOne").is_none());
    }

    #[test]
    fn test_object_names_keep_slashes() {
        assert_eq!(encode_object_name("a b/c#d.txt"), "a%20b/c%23d.txt");
        assert_eq!(encode_object_name("plain"), "plain");
    }

    #[test]
    fn test_object_listing_skips_pseudo_directories() {
        let entries: Vec<ObjectEntry> = serde_json::from_value(serde_json::json!([
            { "name": "a.txt", "hash": "ABC", "bytes": 3, "content_type": "text/plain" },
            { "subdir": "logs/" }
        ]))
        .unwrap();
        assert_eq!(entries[0].marker(), "a.txt");
        assert_eq!(entries[1].marker(), "logs/");
        assert!(entries[1].name.is_none());
    }
}
