//! [`ClusterApi`] backed by the Kubernetes API server.

use super::{ClusterApi, Managed};
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, ResourceExt};
use std::future::Future;
use std::time::Duration;

/// API-server client with a deadline on every request
#[derive(Clone)]
pub struct KubeApi {
    client: Client,
    timeout: Duration,
}

impl KubeApi {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api<K: Managed>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn bounded<T, F>(&self, what: String, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, kube::Error>> + Send,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(OperatorError::from),
            Err(_) => Err(OperatorError::Timeout(format!(
                "{} did not complete within {:?}",
                what, self.timeout
            ))),
        }
    }
}

#[async_trait]
impl ClusterApi for KubeApi {
    async fn get<K: Managed>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let api = self.api::<K>(namespace);
        self.bounded(format!("get {}/{}", namespace, name), api.get_opt(name))
            .await
    }

    async fn create<K: Managed>(&self, namespace: &str, obj: &K) -> Result<K> {
        let api = self.api::<K>(namespace);
        let pp = PostParams::default();
        self.bounded(
            format!("create {}/{}", namespace, obj.name_any()),
            api.create(&pp, obj),
        )
        .await
    }

    async fn replace<K: Managed>(&self, namespace: &str, obj: &K) -> Result<K> {
        let api = self.api::<K>(namespace);
        let name = obj.name_any();
        let pp = PostParams::default();
        self.bounded(
            format!("replace {}/{}", namespace, name),
            api.replace(&name, &pp, obj),
        )
        .await
    }

    async fn replace_status<K: Managed>(&self, namespace: &str, obj: &K) -> Result<K> {
        let api = self.api::<K>(namespace);
        let name = obj.name_any();
        let data = serde_json::to_vec(obj)?;
        let pp = PostParams::default();
        self.bounded(
            format!("replace status {}/{}", namespace, name),
            api.replace_status(&name, &pp, data),
        )
        .await
    }

    async fn delete<K: Managed>(&self, namespace: &str, name: &str) -> Result<bool> {
        let api = self.api::<K>(namespace);
        let dp = DeleteParams::background();
        match self
            .bounded(format!("delete {}/{}", namespace, name), api.delete(name, &dp))
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn list<K: Managed>(&self, namespace: &str, label_selector: &str) -> Result<Vec<K>> {
        let api = self.api::<K>(namespace);
        let lp = ListParams::default().labels(label_selector);
        let list = self
            .bounded(format!("list {} [{}]", namespace, label_selector), api.list(&lp))
            .await?;
        Ok(list.items)
    }
}
