//! Test doubles shared by the scenario tests

use std::collections::HashMap;
use std::future::Future;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use tokio::sync::Semaphore;

use crate::codec::{ImageCodec, RasterCodec};
use crate::error::{CacheError, Result};
use crate::transport::Transport;

#[derive(Clone)]
enum Scripted {
    Bytes(Vec<u8>),
    Fail(String),
    Hang,
}

/// In-memory transport with scripted responses
///
/// When gated, every fetch waits for a permit before answering, which
/// keeps requests in flight until the test releases them.
pub(crate) struct MockTransport {
    responses: Mutex<HashMap<String, Scripted>>,
    gate: Option<Semaphore>,
    calls: AtomicUsize,
    completed: AtomicUsize,
}

impl MockTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::build(None))
    }

    pub(crate) fn gated() -> Arc<Self> {
        Arc::new(Self::build(Some(Semaphore::new(0))))
    }

    fn build(gate: Option<Semaphore>) -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            gate,
            calls: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
        }
    }

    pub(crate) fn respond(&self, url: &str, data: Vec<u8>) {
        self.script(url, Scripted::Bytes(data));
    }

    pub(crate) fn fail(&self, url: &str, reason: &str) {
        self.script(url, Scripted::Fail(reason.to_string()));
    }

    pub(crate) fn hang(&self, url: &str) {
        self.script(url, Scripted::Hang);
    }

    fn script(&self, url: &str, response: Scripted) {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), response);
    }

    /// Let `n` gated fetches through
    pub(crate) fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    /// Fetches started
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Fetches that got past the gate and answered
    pub(crate) fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);

            if let Some(gate) = &self.gate {
                gate.acquire()
                    .await
                    .map_err(|e| CacheError::Transport(e.to_string()))?
                    .forget();
            }

            let scripted = self.responses.lock().unwrap().get(url).cloned();
            let outcome = match scripted {
                Some(Scripted::Bytes(data)) => Ok(data),
                Some(Scripted::Fail(reason)) => Err(CacheError::Transport(reason)),
                Some(Scripted::Hang) => std::future::pending().await,
                None => Err(CacheError::Transport(format!("{} returned status 404", url))),
            };
            self.completed.fetch_add(1, Ordering::SeqCst);
            outcome
        })
    }
}

/// Real codec that counts how often it is used
#[derive(Default)]
pub(crate) struct CountingCodec {
    decodes: AtomicUsize,
    renders: AtomicUsize,
}

impl CountingCodec {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn decodes(&self) -> usize {
        self.decodes.load(Ordering::SeqCst)
    }

    pub(crate) fn renders(&self) -> usize {
        self.renders.load(Ordering::SeqCst)
    }
}

impl ImageCodec for CountingCodec {
    fn decode(&self, data: &[u8]) -> Result<DynamicImage> {
        self.decodes.fetch_add(1, Ordering::SeqCst);
        RasterCodec.decode(data)
    }

    fn render_rounded(
        &self,
        image: &DynamicImage,
        radius: u32,
        width: u32,
        height: u32,
    ) -> Result<Vec<u8>> {
        self.renders.fetch_add(1, Ordering::SeqCst);
        RasterCodec.render_rounded(image, radius, width, height)
    }
}

/// A solid PNG of the given size
pub(crate) fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbaImage::from_pixel(width, height, Rgba([40, 120, 200, 255]));
    let mut out = Vec::new();
    DynamicImage::ImageRgba8(img)
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .unwrap();
    out
}

/// Poll `check` until it holds, panicking after a few seconds
pub(crate) async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}
