//! Log dispatcher
//!
//! Builds log items from caller input and routes them: `console*` calls are
//! written to the console sink immediately, `log*` calls go to the configured
//! stores, either through the buffer and a background worker or directly in
//! the calling thread.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{Config, DispatchMode, DEFAULT_BATCH_SIZE, DEFAULT_POLL_INTERVAL_MS, DEFAULT_TAG};
use crate::item::{Fields, Level, LogItem};
use crate::store::{
    ConsoleSink, DocumentClient, DocumentStore, FileStore, MemoryClient, Store, StoreError,
};

use super::buffer::Buffer;

/// Handle to the background drain task
struct Worker {
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

struct Shared {
    buffer: Buffer,
    stores: Vec<Arc<dyn Store>>,
    console: Option<ConsoleSink>,
    mode: DispatchMode,
    min_level: Level,
    tag: RwLock<String>,
    next_id: AtomicU64,
    batch_size: usize,
    poll_interval: Duration,
    notify: Notify,
    worker: Mutex<Option<Worker>>,
    /// Held by every consumer while it pops a batch and writes it
    drain_lock: Mutex<()>,
    /// Read by log calls for the whole accept step, written by `shutdown`
    gate: RwLock<()>,
    closed: AtomicBool,
    failures: AtomicU64,
}

impl Shared {
    fn dispatch(&self, item: &LogItem) {
        for store in &self.stores {
            if let Err(e) = store.store(item) {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(store = store.name(), id = item.id, error = %e, "Failed to store log item");
            }
        }
    }

    /// Pop one batch and write it; returns the number of items written
    fn drain_batch(&self) -> usize {
        let _drain = self.drain_lock.lock().unwrap_or_else(|e| e.into_inner());
        let batch = self.buffer.pop_batch(self.batch_size);
        for item in &batch {
            self.dispatch(item);
        }
        batch.len()
    }

    fn drain(&self) -> usize {
        let mut count = 0;
        loop {
            match self.drain_batch() {
                0 => return count,
                n => count += n,
            }
        }
    }

    fn close_stores(&self) -> Result<(), StoreError> {
        let mut first_error = None;
        for store in &self.stores {
            if let Err(e) = store.close() {
                warn!(store = store.name(), error = %e, "Failed to close store");
                first_error.get_or_insert(e);
            }
        }
        if let Some(console) = &self.console {
            if let Err(e) = console.close() {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Entry point for producers
///
/// Cloning is cheap; all clones share the same buffer, stores and worker.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

/// Builder for [`Dispatcher`]
pub struct DispatcherBuilder {
    tag: String,
    min_level: Level,
    mode: DispatchMode,
    buffer: Buffer,
    stores: Vec<Arc<dyn Store>>,
    console: Option<ConsoleSink>,
    batch_size: usize,
    poll_interval: Duration,
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self {
            tag: DEFAULT_TAG.to_string(),
            min_level: Level::Debug,
            mode: DispatchMode::Buffered,
            buffer: Buffer::unbounded(),
            stores: Vec::new(),
            console: None,
            batch_size: DEFAULT_BATCH_SIZE,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

impl DispatcherBuilder {
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    pub fn min_level(mut self, level: Level) -> Self {
        self.min_level = level;
        self
    }

    pub fn mode(mut self, mode: DispatchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn buffer(mut self, buffer: Buffer) -> Self {
        self.buffer = buffer;
        self
    }

    /// Add a store; items fan out to stores in the order they were added
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.stores.push(store);
        self
    }

    pub fn console(mut self, console: ConsoleSink) -> Self {
        self.console = Some(console);
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Build the dispatcher
    ///
    /// In buffered mode the drain worker is spawned on the current tokio
    /// runtime.
    pub fn build(self) -> Result<Dispatcher, StoreError> {
        let shared = Arc::new(Shared {
            buffer: self.buffer,
            stores: self.stores,
            console: self.console,
            mode: self.mode,
            min_level: self.min_level,
            tag: RwLock::new(self.tag),
            next_id: AtomicU64::new(1),
            batch_size: self.batch_size,
            poll_interval: self.poll_interval,
            notify: Notify::new(),
            worker: Mutex::new(None),
            drain_lock: Mutex::new(()),
            gate: RwLock::new(()),
            closed: AtomicBool::new(false),
            failures: AtomicU64::new(0),
        });

        if shared.mode == DispatchMode::Buffered {
            let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
                StoreError::Runtime("buffered dispatch requires a running tokio runtime".to_string())
            })?;
            let (shutdown_tx, shutdown_rx) = oneshot::channel();
            let handle = runtime.spawn(run_worker(Arc::clone(&shared), shutdown_rx));
            *shared.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(Worker {
                shutdown_tx,
                handle,
            });
        }

        debug!(
            mode = ?shared.mode,
            stores = shared.stores.len(),
            console = shared.console.is_some(),
            "Dispatcher started"
        );
        Ok(Dispatcher { shared })
    }
}

async fn run_worker(shared: Arc<Shared>, mut shutdown_rx: oneshot::Receiver<()>) {
    loop {
        if !shared.buffer.is_empty() {
            let worker_shared = Arc::clone(&shared);
            match tokio::task::spawn_blocking(move || worker_shared.drain_batch()).await {
                Ok(0) => {}
                Ok(_) => continue,
                Err(e) => {
                    warn!(error = %e, "Store batch task failed");
                    continue;
                }
            }
        }

        tokio::select! {
            _ = shared.notify.notified() => {}
            _ = tokio::time::sleep(shared.poll_interval) => {}
            _ = &mut shutdown_rx => break,
        }
    }
    debug!("Dispatcher worker stopped");
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    /// Build a dispatcher and its stores from configuration
    ///
    /// `document_client` serves the document store; without one only
    /// `memory://` URLs are supported.
    pub fn from_config(
        config: &Config,
        document_client: Option<Arc<dyn DocumentClient>>,
    ) -> Result<Self> {
        let mut builder = Dispatcher::builder()
            .tag(config.effective_tag())
            .min_level(config.min_level)
            .mode(config.buffer.mode)
            .batch_size(config.buffer.effective_batch_size())
            .poll_interval(config.buffer.poll_interval())
            .buffer(match config.buffer.capacity {
                0 => Buffer::unbounded(),
                cap => Buffer::bounded(cap),
            });

        if config.console.enabled {
            let console = ConsoleSink::stdout(config.console.options())
                .context("Failed to set up console output")?;
            builder = builder.console(console);
        }

        if config.file.enabled {
            let store =
                FileStore::open(config.file.options()).context("Failed to set up file store")?;
            builder = builder.store(Arc::new(store));
        }

        if config.document.enabled {
            let client = document_client
                .unwrap_or_else(|| Arc::new(MemoryClient::new()) as Arc<dyn DocumentClient>);
            let store = DocumentStore::connect(
                config.document.effective_url(),
                client,
                &config.document.database_template,
                &config.document.collection_template,
            )
            .context("Failed to set up document store")?;
            builder = builder.store(Arc::new(store));
        }

        let dispatcher = builder.build().context("Failed to start dispatcher")?;
        info!(
            stores = dispatcher.shared.stores.len(),
            mode = ?config.buffer.mode,
            "Log pipeline ready"
        );
        Ok(dispatcher)
    }

    /// Current default tag
    pub fn tag(&self) -> String {
        self.shared
            .tag
            .read()
            .map(|t| t.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    /// Change the default tag for subsequent calls
    pub fn set_tag(&self, tag: impl Into<String>) {
        let mut current = self.shared.tag.write().unwrap_or_else(|e| e.into_inner());
        *current = tag.into();
    }

    /// Dispatch mode the dispatcher was built with
    pub fn mode(&self) -> DispatchMode {
        self.shared.mode
    }

    /// Caller must hold the gate
    fn make_item(&self, level: Level, tag: &str, message: String, fields: Fields) -> Option<LogItem> {
        if level < self.shared.min_level || self.shared.closed.load(Ordering::Acquire) {
            return None;
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        Some(LogItem::new(id, level, tag, message).with_fields(fields))
    }

    /// Send an item to the stores; returns its id, or `None` if it was filtered
    /// out or the dispatcher is shut down
    ///
    /// In direct mode this performs blocking store I/O; async callers should
    /// use [`Dispatcher::submit`].
    pub fn log_with_fields(
        &self,
        level: Level,
        tag: &str,
        message: impl Into<String>,
        fields: Fields,
    ) -> Option<u64> {
        // Shutdown waits for accepted items to be pushed or written
        let _gate = self.shared.gate.read().unwrap_or_else(|e| e.into_inner());
        let item = self.make_item(level, tag, message.into(), fields)?;
        let id = item.id;
        match self.shared.mode {
            DispatchMode::Buffered => {
                self.shared.buffer.push(item);
                self.shared.notify.notify_one();
            }
            DispatchMode::Direct => self.shared.dispatch(&item),
        }
        Some(id)
    }

    /// [`Dispatcher::log_with_fields`] for async callers
    ///
    /// Direct-mode writes run on the blocking pool; buffered pushes happen
    /// inline.
    pub async fn submit(
        &self,
        level: Level,
        tag: String,
        message: String,
        fields: Fields,
    ) -> Option<u64> {
        if self.shared.mode == DispatchMode::Buffered {
            return self.log_with_fields(level, &tag, message, fields);
        }
        let dispatcher = self.clone();
        match tokio::task::spawn_blocking(move || {
            dispatcher.log_with_fields(level, &tag, message, fields)
        })
        .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "Direct store task failed");
                None
            }
        }
    }

    /// Send a message with an explicit tag to the stores
    pub fn log_tagged(&self, level: Level, tag: &str, message: impl Into<String>) -> Option<u64> {
        self.log_with_fields(level, tag, message, Fields::new())
    }

    /// Send a message with the default tag to the stores
    pub fn log(&self, level: Level, message: impl Into<String>) -> Option<u64> {
        let tag = self.tag();
        self.log_tagged(level, &tag, message)
    }

    /// Send a formatted message to the stores
    ///
    /// ```ignore
    /// dispatcher.log_fmt(Level::Info, "db", format_args!("{} rows", rows));
    /// ```
    pub fn log_fmt(&self, level: Level, tag: &str, args: fmt::Arguments<'_>) -> Option<u64> {
        self.log_tagged(level, tag, args.to_string())
    }

    /// Write a message to the console only
    pub fn console(&self, level: Level, tag: &str, message: impl Into<String>) -> Option<u64> {
        let console = self.shared.console.as_ref()?;
        let _gate = self.shared.gate.read().unwrap_or_else(|e| e.into_inner());
        let item = self.make_item(level, tag, message.into(), Fields::new())?;
        if let Err(e) = console.store(&item) {
            self.shared.failures.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "Failed to write to console");
        }
        Some(item.id)
    }

    /// Write a formatted message to the console only
    pub fn console_fmt(&self, level: Level, tag: &str, args: fmt::Arguments<'_>) -> Option<u64> {
        self.console(level, tag, args.to_string())
    }

    pub fn debug(&self, message: impl Into<String>) -> Option<u64> {
        self.log(Level::Debug, message)
    }

    pub fn info(&self, message: impl Into<String>) -> Option<u64> {
        self.log(Level::Info, message)
    }

    pub fn warn(&self, message: impl Into<String>) -> Option<u64> {
        self.log(Level::Warn, message)
    }

    pub fn error(&self, message: impl Into<String>) -> Option<u64> {
        self.log(Level::Error, message)
    }

    pub fn fatal(&self, message: impl Into<String>) -> Option<u64> {
        self.log(Level::Fatal, message)
    }

    pub fn debug_c(&self, message: impl Into<String>) -> Option<u64> {
        self.console(Level::Debug, &self.tag(), message)
    }

    pub fn info_c(&self, message: impl Into<String>) -> Option<u64> {
        self.console(Level::Info, &self.tag(), message)
    }

    pub fn warn_c(&self, message: impl Into<String>) -> Option<u64> {
        self.console(Level::Warn, &self.tag(), message)
    }

    pub fn error_c(&self, message: impl Into<String>) -> Option<u64> {
        self.console(Level::Error, &self.tag(), message)
    }

    pub fn fatal_c(&self, message: impl Into<String>) -> Option<u64> {
        self.console(Level::Fatal, &self.tag(), message)
    }

    /// Write every buffered item to the stores in the calling thread
    ///
    /// Returns the number of items written. Performs blocking I/O and waits
    /// for a batch the worker is already writing, so stores see items in
    /// buffer order.
    pub fn flush(&self) -> usize {
        self.shared.drain()
    }

    /// Items waiting in the buffer
    pub fn pending(&self) -> usize {
        self.shared.buffer.len()
    }

    /// Items dropped because the buffer was full
    pub fn dropped(&self) -> u64 {
        self.shared.buffer.dropped()
    }

    /// Store and console write failures so far
    pub fn failures(&self) -> u64 {
        self.shared.failures.load(Ordering::Relaxed)
    }

    /// Whether `shutdown` has been called
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Stop accepting items, drain the buffer and close every store
    ///
    /// Returns the first close error. Later calls are no-ops.
    pub async fn shutdown(&self) -> Result<(), StoreError> {
        // Waits on the blocking pool for log calls already past the closed check
        let shared = Arc::clone(&self.shared);
        let already_closed = tokio::task::spawn_blocking(move || {
            let _gate = shared.gate.write().unwrap_or_else(|e| e.into_inner());
            shared.closed.swap(true, Ordering::AcqRel)
        })
        .await
        .map_err(|e| StoreError::Runtime(format!("shutdown task failed: {}", e)))?;
        if already_closed {
            return Ok(());
        }

        let worker = self
            .shared
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(worker) = worker {
            // Ignore error if the worker already exited
            let _ = worker.shutdown_tx.send(());
            if let Err(e) = worker.handle.await {
                warn!(error = %e, "Dispatcher worker ended abnormally");
            }
        }

        let shared = Arc::clone(&self.shared);
        tokio::task::spawn_blocking(move || {
            let remaining = shared.drain();
            if remaining > 0 {
                debug!(remaining, "Wrote remaining buffered items");
            }
            shared.close_stores()
        })
        .await
        .map_err(|e| StoreError::Runtime(format!("store shutdown task failed: {}", e)))??;

        info!("Log pipeline shut down");
        Ok(())
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("mode", &self.shared.mode)
            .field("min_level", &self.shared.min_level)
            .field("stores", &self.shared.stores.len())
            .field("pending", &self.pending())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::ConsoleOptions;
    use serde_json::json;
    use std::io::{self, Write};
    use std::sync::Barrier;
    use tempfile::TempDir;

    /// Store recording every item it receives
    #[derive(Default)]
    struct RecordingStore {
        items: Mutex<Vec<LogItem>>,
        closed: AtomicBool,
    }

    impl RecordingStore {
        fn ids(&self) -> Vec<u64> {
            self.items.lock().unwrap().iter().map(|i| i.id).collect()
        }

        fn items(&self) -> Vec<LogItem> {
            self.items.lock().unwrap().clone()
        }
    }

    impl Store for RecordingStore {
        fn name(&self) -> &str {
            "recording"
        }

        fn store(&self, item: &LogItem) -> Result<(), StoreError> {
            self.items.lock().unwrap().push(item.clone());
            Ok(())
        }

        fn close(&self) -> Result<(), StoreError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingStore;

    impl Store for FailingStore {
        fn name(&self) -> &str {
            "failing"
        }

        fn store(&self, _item: &LogItem) -> Result<(), StoreError> {
            Err(StoreError::Insert("always fails".to_string()))
        }

        fn close(&self) -> Result<(), StoreError> {
            Err(StoreError::Connection("already gone".to_string()))
        }
    }

    /// Store that blocks inside its first `store` call until released
    struct GatedStore {
        entered: Barrier,
        release: Barrier,
        gated: AtomicBool,
        events: Mutex<Vec<String>>,
    }

    impl GatedStore {
        fn new() -> Self {
            Self {
                entered: Barrier::new(2),
                release: Barrier::new(2),
                gated: AtomicBool::new(false),
                events: Mutex::new(Vec::new()),
            }
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl Store for GatedStore {
        fn name(&self) -> &str {
            "gated"
        }

        fn store(&self, item: &LogItem) -> Result<(), StoreError> {
            if !self.gated.swap(true, Ordering::SeqCst) {
                self.entered.wait();
                self.release.wait();
            }
            self.events.lock().unwrap().push(format!("store {}", item.id));
            Ok(())
        }

        fn close(&self) -> Result<(), StoreError> {
            self.events.lock().unwrap().push("close".to_string());
            Ok(())
        }
    }

    async fn wait_entered(store: &Arc<GatedStore>) {
        let store = Arc::clone(store);
        tokio::task::spawn_blocking(move || {
            store.entered.wait();
        })
        .await
        .unwrap();
    }

    async fn release(store: &Arc<GatedStore>) {
        let store = Arc::clone(store);
        tokio::task::spawn_blocking(move || {
            store.release.wait();
        })
        .await
        .unwrap();
    }

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn console_into(buf: &SharedBuf) -> ConsoleSink {
        let options = ConsoleOptions {
            color: false,
            time_template: "{time:%H}".to_string(),
            template: "{level_short} [{tag}] {message}".to_string(),
        };
        ConsoleSink::with_writer(options, Box::new(buf.clone())).unwrap()
    }

    fn direct_with(store: &Arc<RecordingStore>) -> Dispatcher {
        Dispatcher::builder()
            .mode(DispatchMode::Direct)
            .store(Arc::clone(store) as Arc<dyn Store>)
            .build()
            .unwrap()
    }

    #[test]
    fn test_direct_mode_stores_in_call_order() {
        let store = Arc::new(RecordingStore::default());
        let dispatcher = direct_with(&store);

        assert_eq!(dispatcher.info("one"), Some(1));
        assert_eq!(dispatcher.warn("two"), Some(2));
        assert_eq!(dispatcher.log_tagged(Level::Error, "db", "three"), Some(3));

        let items = store.items();
        assert_eq!(store.ids(), vec![1, 2, 3]);
        assert_eq!(items[0].tag, DEFAULT_TAG);
        assert_eq!(items[1].level, Level::Warn);
        assert_eq!(items[2].tag, "db");
    }

    #[test]
    fn test_min_level_filters_items() {
        let store = Arc::new(RecordingStore::default());
        let dispatcher = Dispatcher::builder()
            .mode(DispatchMode::Direct)
            .min_level(Level::Warn)
            .store(Arc::clone(&store) as Arc<dyn Store>)
            .build()
            .unwrap();

        assert_eq!(dispatcher.debug("hidden"), None);
        assert_eq!(dispatcher.info("hidden"), None);
        assert!(dispatcher.error("shown").is_some());
        assert!(dispatcher.fatal("shown").is_some());

        let messages: Vec<String> = store.items().into_iter().map(|i| i.message).collect();
        assert_eq!(messages, vec!["shown", "shown"]);
    }

    #[test]
    fn test_set_tag_and_formatting() {
        let store = Arc::new(RecordingStore::default());
        let dispatcher = direct_with(&store);

        dispatcher.set_tag("Sample");
        assert_eq!(dispatcher.tag(), "Sample");
        dispatcher.info("tagged");
        dispatcher.log_fmt(Level::Info, "fmt", format_args!("{} + {} = {}", 1, 2, 3));

        let items = store.items();
        assert_eq!(items[0].tag, "Sample");
        assert_eq!(items[1].message, "1 + 2 = 3");
    }

    #[test]
    fn test_fields_reach_stores() {
        let store = Arc::new(RecordingStore::default());
        let dispatcher = direct_with(&store);

        let mut fields = Fields::new();
        fields.insert("order".to_string(), json!(991));
        dispatcher.log_with_fields(Level::Info, "shop", "paid", fields);

        assert_eq!(store.items()[0].fields["order"], json!(991));
    }

    #[test]
    fn test_console_and_store_paths_are_independent() {
        let buf = SharedBuf::default();
        let store = Arc::new(RecordingStore::default());
        let dispatcher = Dispatcher::builder()
            .mode(DispatchMode::Direct)
            .tag("CONSOLE")
            .console(console_into(&buf))
            .store(Arc::clone(&store) as Arc<dyn Store>)
            .build()
            .unwrap();

        dispatcher.info_c("The console: 0");
        dispatcher.console_fmt(Level::Debug, "main", format_args!("Console output:{}", "Hello"));
        dispatcher.info("to stores only");

        assert_eq!(
            buf.contents(),
            "I [CONSOLE] The console: 0\nD [main] Console output:Hello\n"
        );
        let messages: Vec<String> = store.items().into_iter().map(|i| i.message).collect();
        assert_eq!(messages, vec!["to stores only"]);
    }

    #[test]
    fn test_console_without_sink_is_noop() {
        let store = Arc::new(RecordingStore::default());
        let dispatcher = direct_with(&store);
        assert_eq!(dispatcher.info_c("nowhere"), None);
        assert!(store.items().is_empty());
    }

    #[test]
    fn test_failing_store_does_not_block_others() {
        let store = Arc::new(RecordingStore::default());
        let dispatcher = Dispatcher::builder()
            .mode(DispatchMode::Direct)
            .store(Arc::new(FailingStore))
            .store(Arc::clone(&store) as Arc<dyn Store>)
            .build()
            .unwrap();

        dispatcher.info("a");
        dispatcher.info("b");

        assert_eq!(store.ids(), vec![1, 2]);
        assert_eq!(dispatcher.failures(), 2);
    }

    #[test]
    fn test_buffered_mode_requires_runtime() {
        let result = Dispatcher::builder().build();
        assert!(matches!(result, Err(StoreError::Runtime(_))));
    }

    #[tokio::test]
    async fn test_buffered_mode_drains_in_order_on_shutdown() {
        let store = Arc::new(RecordingStore::default());
        let dispatcher = Dispatcher::builder()
            .store(Arc::clone(&store) as Arc<dyn Store>)
            .build()
            .unwrap();

        for i in 0..100 {
            dispatcher.info(format!("item {}", i));
        }
        dispatcher.shutdown().await.unwrap();

        assert_eq!(store.ids(), (1..=100).collect::<Vec<u64>>());
        assert!(store.closed.load(Ordering::SeqCst));
        assert_eq!(dispatcher.pending(), 0);
    }

    #[tokio::test]
    async fn test_buffered_worker_writes_without_shutdown() {
        let store = Arc::new(RecordingStore::default());
        let dispatcher = Dispatcher::builder()
            .store(Arc::clone(&store) as Arc<dyn Store>)
            .poll_interval(Duration::from_millis(5))
            .build()
            .unwrap();

        dispatcher.info("hello");
        for _ in 0..200 {
            if !store.ids().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(store.ids(), vec![1]);

        dispatcher.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_flush_writes_synchronously() {
        let store = Arc::new(RecordingStore::default());
        let dispatcher = Dispatcher::builder()
            .store(Arc::clone(&store) as Arc<dyn Store>)
            .build()
            .unwrap();

        // The worker cannot run on this single-threaded runtime until we await
        dispatcher.info("a");
        dispatcher.info("b");
        dispatcher.info("c");
        assert_eq!(dispatcher.pending(), 3);

        assert_eq!(dispatcher.flush(), 3);
        assert_eq!(store.ids(), vec![1, 2, 3]);
        assert_eq!(dispatcher.pending(), 0);

        dispatcher.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_flush_waits_for_batch_in_progress() {
        let store = Arc::new(GatedStore::new());
        let dispatcher = Dispatcher::builder()
            .store(Arc::clone(&store) as Arc<dyn Store>)
            .build()
            .unwrap();

        dispatcher.info("one");
        // The worker is now blocked writing item 1
        wait_entered(&store).await;

        dispatcher.info("two");
        let flusher = dispatcher.clone();
        let flush = std::thread::spawn(move || flusher.flush());
        tokio::time::sleep(Duration::from_millis(50)).await;

        release(&store).await;
        flush.join().unwrap();
        dispatcher.shutdown().await.unwrap();

        assert_eq!(store.events(), vec!["store 1", "store 2", "close"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_waits_for_direct_write_in_progress() {
        let store = Arc::new(GatedStore::new());
        let dispatcher = Dispatcher::builder()
            .mode(DispatchMode::Direct)
            .store(Arc::clone(&store) as Arc<dyn Store>)
            .build()
            .unwrap();

        let producer = {
            let dispatcher = dispatcher.clone();
            std::thread::spawn(move || dispatcher.info("one"))
        };
        wait_entered(&store).await;

        let shutdown = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.shutdown().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!shutdown.is_finished());

        release(&store).await;
        assert_eq!(producer.join().unwrap(), Some(1));
        shutdown.await.unwrap().unwrap();

        assert_eq!(store.events(), vec!["store 1", "close"]);
        assert_eq!(dispatcher.info("late"), None);
    }

    #[tokio::test]
    async fn test_submit_direct_mode() {
        let store = Arc::new(RecordingStore::default());
        let dispatcher = direct_with(&store);

        let id = dispatcher
            .submit(Level::Warn, "http".to_string(), "slow".to_string(), Fields::new())
            .await;

        assert_eq!(id, Some(1));
        assert_eq!(store.items()[0].tag, "http");
        assert_eq!(dispatcher.mode(), DispatchMode::Direct);
    }

    #[tokio::test]
    async fn test_log_after_shutdown_is_ignored() {
        let store = Arc::new(RecordingStore::default());
        let dispatcher = Dispatcher::builder()
            .store(Arc::clone(&store) as Arc<dyn Store>)
            .build()
            .unwrap();

        dispatcher.shutdown().await.unwrap();
        assert!(dispatcher.is_closed());
        assert_eq!(dispatcher.info("late"), None);
        // Second shutdown is a no-op
        dispatcher.shutdown().await.unwrap();
        assert!(store.items().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_reports_close_error() {
        let store = Arc::new(RecordingStore::default());
        let dispatcher = Dispatcher::builder()
            .store(Arc::new(FailingStore))
            .store(Arc::clone(&store) as Arc<dyn Store>)
            .build()
            .unwrap();

        let result = dispatcher.shutdown().await;
        assert!(matches!(result, Err(StoreError::Connection(_))));
        // Remaining stores are still closed
        assert!(store.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_bounded_buffer_counts_drops() {
        let store = Arc::new(RecordingStore::default());
        let dispatcher = Dispatcher::builder()
            .buffer(Buffer::bounded(2))
            .store(Arc::clone(&store) as Arc<dyn Store>)
            .build()
            .unwrap();

        dispatcher.info("1");
        dispatcher.info("2");
        dispatcher.info("3");
        assert_eq!(dispatcher.dropped(), 1);

        dispatcher.shutdown().await.unwrap();
        assert_eq!(store.ids(), vec![2, 3]);
    }

    #[tokio::test]
    async fn test_from_config_writes_files_and_documents() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.console.enabled = false;
        config.file.path = temp_dir.path().to_path_buf();
        config.file.name_template = "{tag}.log".to_string();
        config.file.template = "{level} {message}".to_string();
        config.document.enabled = true;
        config.document.collection_template = "{level_lower}".to_string();

        let client = MemoryClient::new();
        let dispatcher =
            Dispatcher::from_config(&config, Some(Arc::new(client.clone()) as Arc<dyn DocumentClient>))
                .unwrap();

        dispatcher.log_tagged(Level::Info, "api", "started");
        dispatcher.log_tagged(Level::Error, "api", "crashed");
        dispatcher.shutdown().await.unwrap();

        let content = std::fs::read_to_string(temp_dir.path().join("api.log")).unwrap();
        assert_eq!(content, "INFO started\nERROR crashed\n");
        assert_eq!(client.documents("alog", "info").len(), 1);
        assert_eq!(client.documents("alog", "error").len(), 1);
    }

    #[test]
    fn test_from_config_rejects_bad_template() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.buffer.mode = DispatchMode::Direct;
        config.console.enabled = false;
        config.file.path = temp_dir.path().to_path_buf();
        config.file.name_template = "{unknown}".to_string();

        assert!(Dispatcher::from_config(&config, None).is_err());
    }
}
