//! Static namespace pool.
//!
//! A fixed roster of namespaces handed out exclusively. The production
//! binding asks the cluster; this one is enough for development, tests and
//! single-node deployments with a pre-provisioned namespace set.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::ports::adapters::{AdapterError, NamespacePool};

pub struct StaticNamespacePool {
    available: Arc<Mutex<VecDeque<String>>>,
}

impl StaticNamespacePool {
    pub fn new(namespaces: Vec<String>) -> Self {
        Self {
            available: Arc::new(Mutex::new(namespaces.into())),
        }
    }
}

#[async_trait]
impl NamespacePool for StaticNamespacePool {
    async fn acquire(&self) -> Result<Option<String>, AdapterError> {
        let mut available = self.available.lock().await;
        Ok(available.pop_front())
    }

    async fn release(&self, namespace: &str) -> Result<(), AdapterError> {
        let mut available = self.available.lock().await;
        // Double release would inflate the pool.
        if !available.iter().any(|ns| ns == namespace) {
            available.push_back(namespace.to_string());
        }
        Ok(())
    }
}
