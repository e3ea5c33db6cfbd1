//! Shared fixtures: a scripted backend and a deterministic token counter.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};

use ollama_gateway::config::BackendConfig;
use ollama_gateway::inference::backend::{
    Backend, BackendChunk, BackendRequest, BackendResult, ChunkStream,
};
use ollama_gateway::inference::engine::GenerationEngine;
use ollama_gateway::inference::tokenizer::TokenCounter;

/// One token per character.
pub struct CharCounter;

impl TokenCounter for CharCounter {
    fn count(&self, text: &str) -> usize {
        text.chars().count()
    }
}

/// A scripted stream reply. A stalling script never ends after its items.
struct StreamScript {
    items: Vec<BackendResult>,
    stall: bool,
}

/// Wraps a backend stream to count pulled items and notice when it is dropped.
struct Tracked {
    inner: ChunkStream,
    pulled: Arc<AtomicUsize>,
    dropped: Arc<AtomicBool>,
}

impl Stream for Tracked {
    type Item = BackendResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = self.inner.poll_next_unpin(cx);
        if let Poll::Ready(Some(_)) = &polled {
            self.pulled.fetch_add(1, Ordering::SeqCst);
        }
        polled
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}

/// Backend that replays queued replies and records every call.
///
/// Blocking calls pop from `replies`; an empty queue answers with a chunk
/// that has no `response` field. Streaming calls pop a whole script from
/// `streams`; an empty queue yields an empty stream.
#[derive(Default)]
pub struct ScriptedBackend {
    replies: Mutex<VecDeque<BackendResult>>,
    streams: Mutex<VecDeque<StreamScript>>,
    requests: Mutex<Vec<BackendRequest>>,
    blocking_calls: AtomicUsize,
    stream_calls: AtomicUsize,
    pulled: Arc<AtomicUsize>,
    stream_dropped: Arc<AtomicBool>,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reply(self: &Arc<Self>, reply: BackendResult) -> Arc<Self> {
        self.replies.lock().unwrap().push_back(reply);
        self.clone()
    }

    pub fn reply_text(self: &Arc<Self>, text: &str) -> Arc<Self> {
        self.reply(Ok(BackendChunk::text(text)))
    }

    pub fn stream(self: &Arc<Self>, items: Vec<BackendResult>) -> Arc<Self> {
        self.streams
            .lock()
            .unwrap()
            .push_back(StreamScript { items, stall: false });
        self.clone()
    }

    /// Stream `texts`, then stay open without producing anything.
    pub fn stream_then_stall(self: &Arc<Self>, texts: &[&str]) -> Arc<Self> {
        let items = texts.iter().map(|t| Ok(BackendChunk::text(*t))).collect();
        self.streams
            .lock()
            .unwrap()
            .push_back(StreamScript { items, stall: true });
        self.clone()
    }

    pub fn stream_texts(self: &Arc<Self>, texts: &[&str]) -> Arc<Self> {
        self.stream(texts.iter().map(|t| Ok(BackendChunk::text(*t))).collect())
    }

    pub fn blocking_calls(&self) -> usize {
        self.blocking_calls.load(Ordering::SeqCst)
    }

    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }

    /// Stream items consumed by the engine, across all streaming calls.
    pub fn items_pulled(&self) -> usize {
        self.pulled.load(Ordering::SeqCst)
    }

    /// Whether the most recent backend stream has been dropped.
    pub fn stream_dropped(&self) -> bool {
        self.stream_dropped.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<BackendRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn generate(&self, request: BackendRequest) -> BackendResult {
        self.blocking_calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(BackendChunk::default()))
    }

    async fn generate_stream(&self, request: BackendRequest) -> ChunkStream {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        let script = self.streams.lock().unwrap().pop_front();
        let (items, stall) = script.map_or((Vec::new(), false), |s| (s.items, s.stall));
        let inner = if stall {
            stream::iter(items).chain(stream::pending()).boxed()
        } else {
            stream::iter(items).boxed()
        };

        self.stream_dropped.store(false, Ordering::SeqCst);
        Tracked {
            inner,
            pulled: self.pulled.clone(),
            dropped: self.stream_dropped.clone(),
        }
        .boxed()
    }
}

pub fn backend_config() -> BackendConfig {
    BackendConfig {
        max_retries: 3,
        system_prompt: "SYS".to_string(),
        json_formatting_prompt: "Format as JSON: ".to_string(),
        ..BackendConfig::default()
    }
}

pub fn engine(backend: Arc<ScriptedBackend>) -> GenerationEngine {
    GenerationEngine::new(backend, Arc::new(CharCounter), &backend_config())
}
