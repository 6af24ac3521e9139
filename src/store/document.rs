//! Document store adapter
//!
//! Inserts one document per item into a database/collection chosen by
//! templates. The client protocol is behind [`DocumentClient`]; the store only
//! manages the connection lifecycle.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::config::{DEFAULT_COLLECTION_TEMPLATE, DEFAULT_DATABASE_TEMPLATE};
use crate::item::{Document, LogItem};
use crate::template::Template;

use super::{Store, StoreError};

/// Factory for document store connections
pub trait DocumentClient: Send + Sync {
    /// Open a new connection
    fn connect(&self, url: &str) -> Result<Box<dyn DocumentSession>, StoreError>;
}

/// A live connection to a document store
pub trait DocumentSession: Send {
    /// Insert one document
    fn insert(
        &mut self,
        database: &str,
        collection: &str,
        document: Document,
    ) -> Result<(), StoreError>;

    /// Release the connection
    fn close(&mut self) {}
}

/// Document store backend with lazy reconnection
pub struct DocumentStore {
    url: String,
    client: Arc<dyn DocumentClient>,
    database_template: Template,
    collection_template: Template,
    session: Mutex<Option<Box<dyn DocumentSession>>>,
}

impl DocumentStore {
    /// Connect to `url` and prepare the name templates
    ///
    /// Empty templates fall back to the defaults.
    pub fn connect(
        url: impl Into<String>,
        client: Arc<dyn DocumentClient>,
        database_template: &str,
        collection_template: &str,
    ) -> Result<Self, StoreError> {
        let url = url.into();
        let database_template = Template::parse(or_default(
            database_template,
            DEFAULT_DATABASE_TEMPLATE,
        ))?;
        let collection_template = Template::parse(or_default(
            collection_template,
            DEFAULT_COLLECTION_TEMPLATE,
        ))?;

        let session = client.connect(&url)?;
        debug!(url = %url, "Document store connected");

        Ok(Self {
            url,
            client,
            database_template,
            collection_template,
            session: Mutex::new(Some(session)),
        })
    }

    /// Whether a connection is currently held
    pub fn is_connected(&self) -> bool {
        self.lock_session().is_some()
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<Box<dyn DocumentSession>>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn or_default<'a>(value: &'a str, default: &'a str) -> &'a str {
    if value.is_empty() {
        default
    } else {
        value
    }
}

impl fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentStore")
            .field("url", &self.url)
            .field("database_template", &self.database_template.source())
            .field("collection_template", &self.collection_template.source())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Store for DocumentStore {
    fn name(&self) -> &str {
        "document"
    }

    fn store(&self, item: &LogItem) -> Result<(), StoreError> {
        let database = self.database_template.render(item);
        let collection = self.collection_template.render(item);

        let mut guard = self.lock_session();
        let session = match guard.take() {
            Some(session) => session,
            None => {
                debug!(url = %self.url, "Reconnecting document store");
                self.client.connect(&self.url)?
            }
        };
        let session = guard.insert(session);

        if let Err(e) = session.insert(&database, &collection, item.to_document()) {
            warn!(url = %self.url, error = %e, "Dropping document store connection after failed insert");
            if let Some(mut session) = guard.take() {
                session.close();
            }
            return Err(e);
        }
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        if let Some(mut session) = self.lock_session().take() {
            session.close();
        }
        Ok(())
    }
}

type Collections = BTreeMap<(String, String), Vec<Document>>;

/// In-process document client for `memory://` URLs
///
/// Documents survive reconnects as long as the client lives.
#[derive(Debug, Clone, Default)]
pub struct MemoryClient {
    collections: Arc<Mutex<Collections>>,
    connects: Arc<AtomicUsize>,
    offline: Arc<AtomicBool>,
}

impl MemoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Documents stored in a collection
    pub fn documents(&self, database: &str, collection: &str) -> Vec<Document> {
        self.lock()
            .get(&(database.to_string(), collection.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Names of every non-empty `(database, collection)` pair
    pub fn collections(&self) -> Vec<(String, String)> {
        self.lock().keys().cloned().collect()
    }

    /// Number of successful connects
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Simulate an unreachable server; connects and inserts fail while set
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, Collections> {
        self.collections.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl DocumentClient for MemoryClient {
    fn connect(&self, url: &str) -> Result<Box<dyn DocumentSession>, StoreError> {
        if !url.starts_with("memory://") {
            return Err(StoreError::Connection(format!(
                "unsupported document store url: {}",
                url
            )));
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Connection(format!("{} is unreachable", url)));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            client: self.clone(),
            open: true,
        }))
    }
}

struct MemorySession {
    client: MemoryClient,
    open: bool,
}

impl DocumentSession for MemorySession {
    fn insert(
        &mut self,
        database: &str,
        collection: &str,
        document: Document,
    ) -> Result<(), StoreError> {
        if !self.open || self.client.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Insert("connection lost".to_string()));
        }
        self.client
            .lock()
            .entry((database.to_string(), collection.to_string()))
            .or_default()
            .push(document);
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }
}
