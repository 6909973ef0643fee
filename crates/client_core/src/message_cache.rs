//! Content-addressed cache of host messages.
//!
//! The host may send a cacheable message in full together with its hash, or a
//! bare reference to a hash it believes the client still holds. Entries age by
//! script-run generations rather than wall-clock time so that client and host
//! evict in lockstep; the fetch-by-hash path covers the window where they
//! disagree.

use std::{collections::HashMap, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use shared::{
    domain::MessageHash,
    protocol::{HostBody, HostEnvelope, HostMessage, MessageMetadata},
};
use tracing::{debug, warn};
use url::Url;

use crate::error::CacheError;

#[derive(Debug, Clone, PartialEq)]
pub struct CachedMessage {
    pub hash: MessageHash,
    pub payload: HostMessage,
    pub last_accessed_generation: u64,
}

/// A host message with any reference replaced by its payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedMessage {
    pub seq: u64,
    /// Metadata of the envelope as received; for a reference this is the
    /// reference's own metadata, not that of the original full message.
    pub metadata: MessageMetadata,
    pub hash: Option<MessageHash>,
    pub message: HostMessage,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Resolved(ResolvedMessage),
    Miss {
        seq: u64,
        hash: MessageHash,
        metadata: MessageMetadata,
    },
}

#[async_trait]
pub trait MessageFetcher: Send + Sync {
    async fn fetch_by_hash(&self, hash: &MessageHash) -> Result<HostMessage>;
}

pub struct MissingMessageFetcher;

#[async_trait]
impl MessageFetcher for MissingMessageFetcher {
    async fn fetch_by_hash(&self, hash: &MessageHash) -> Result<HostMessage> {
        Err(anyhow::anyhow!(
            "no host available to fetch cached message {hash}"
        ))
    }
}

/// Fetches message payloads from the host's HTTP message endpoint.
pub struct HttpMessageFetcher {
    http: Client,
    endpoint: Url,
}

impl HttpMessageFetcher {
    pub fn new(endpoint: Url) -> Self {
        Self {
            http: Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl MessageFetcher for HttpMessageFetcher {
    async fn fetch_by_hash(&self, hash: &MessageHash) -> Result<HostMessage> {
        let message = self
            .http
            .get(self.endpoint.clone())
            .query(&[("hash", hash.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json::<HostMessage>()
            .await?;
        Ok(message)
    }
}

#[derive(Debug, Default)]
pub struct MessageCache {
    entries: HashMap<MessageHash, CachedMessage>,
    generation: u64,
}

impl MessageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Peeks at an entry without refreshing it.
    pub fn get(&self, hash: &MessageHash) -> Option<&CachedMessage> {
        self.entries.get(hash)
    }

    pub fn contains(&self, hash: &MessageHash) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn hashes(&self) -> Vec<MessageHash> {
        let mut hashes: Vec<MessageHash> = self.entries.keys().cloned().collect();
        hashes.sort();
        hashes
    }

    pub fn insert(&mut self, hash: MessageHash, payload: HostMessage) {
        self.entries.insert(
            hash.clone(),
            CachedMessage {
                hash,
                payload,
                last_accessed_generation: self.generation,
            },
        );
    }

    /// Resolves `envelope` from local state only. Cacheable full messages are
    /// stored; references are served from the cache or reported as a miss.
    pub fn resolve(&mut self, envelope: HostEnvelope) -> Lookup {
        let HostEnvelope {
            seq,
            metadata,
            hash,
            body,
        } = envelope;

        match body {
            HostBody::Message(message) => {
                if metadata.cacheable {
                    match &hash {
                        Some(hash) => self.insert(hash.clone(), message.clone()),
                        None => warn!(seq, "cache: cacheable message arrived without a hash"),
                    }
                }
                Lookup::Resolved(ResolvedMessage {
                    seq,
                    metadata,
                    hash,
                    message,
                })
            }
            HostBody::Reference(hash) => match self.entries.get_mut(&hash) {
                Some(entry) => {
                    entry.last_accessed_generation = self.generation;
                    Lookup::Resolved(ResolvedMessage {
                        seq,
                        metadata,
                        message: entry.payload.clone(),
                        hash: Some(hash),
                    })
                }
                None => Lookup::Miss {
                    seq,
                    hash,
                    metadata,
                },
            },
        }
    }

    /// Resolves `envelope`, fetching the payload from the host when a
    /// reference misses. A fetched payload is cached like a fresh full message.
    pub async fn process(
        &mut self,
        envelope: HostEnvelope,
        fetcher: &dyn MessageFetcher,
        timeout: Duration,
    ) -> Result<ResolvedMessage, CacheError> {
        let (seq, hash, metadata) = match self.resolve(envelope) {
            Lookup::Resolved(resolved) => return Ok(resolved),
            Lookup::Miss {
                seq,
                hash,
                metadata,
            } => (seq, hash, metadata),
        };

        debug!(hash = %hash, generation = self.generation, "cache: miss, fetching from host");
        let payload = match tokio::time::timeout(timeout, fetcher.fetch_by_hash(&hash)).await {
            Ok(Ok(payload)) => payload,
            Ok(Err(err)) => {
                return Err(CacheError::FetchFailed {
                    hash,
                    reason: format!("{err:#}"),
                })
            }
            Err(_) => {
                return Err(CacheError::FetchTimeout {
                    hash,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        };

        self.insert(hash.clone(), payload.clone());
        Ok(ResolvedMessage {
            seq,
            metadata,
            hash: Some(hash),
            message: payload,
        })
    }

    /// Marks the end of a script run and evicts entries not accessed within
    /// the last `max_age` generations. Returns how many were evicted.
    pub fn advance_generation(&mut self, max_age: u32) -> usize {
        self.generation += 1;
        let generation = self.generation;
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            generation.saturating_sub(entry.last_accessed_generation) <= u64::from(max_age)
        });
        let evicted = before - self.entries.len();
        if evicted > 0 {
            debug!(generation, evicted, remaining = self.entries.len(), "cache: evicted stale messages");
        }
        evicted
    }

    /// Restarts the generation clock for a new host session. Entries are kept
    /// (hashes are content-derived) and count as accessed in generation zero.
    pub fn reset_generation(&mut self) {
        self.generation = 0;
        for entry in self.entries.values_mut() {
            entry.last_accessed_generation = 0;
        }
    }
}

#[cfg(test)]
#[path = "tests/message_cache_tests.rs"]
mod tests;
