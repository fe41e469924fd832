//! The connection: one driver, one dialect, and the per-instance state
//! every subsystem shares (configuration, codec registry, store registry,
//! dependency graph).
//!
//! There are no process-wide singletons; each [`Connection`] is an explicit
//! instance and clones share state through an `Arc`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use quarry_codec::CodecRegistry;
use quarry_core::config::Config;
use quarry_core::error::{Error, Result};
use quarry_core::value::{Row, Value};
use quarry_dialect::{Dialect, Driver, SqliteDialect, SqliteDriver};
use quarry_store::StoreRegistry;

use crate::graph::DependencyGraph;

/// Builds a replacement driver after a lost connection.
pub type Reconnector = dyn Fn() -> Result<Box<dyn Driver>> + Send + Sync;

pub(crate) struct ConnectionInner {
    pub(crate) driver: Mutex<Box<dyn Driver>>,
    pub(crate) dialect: Arc<dyn Dialect>,
    pub(crate) config: Config,
    pub(crate) codecs: CodecRegistry,
    pub(crate) stores: StoreRegistry,
    pub(crate) graph: Mutex<DependencyGraph>,
    pub(crate) schemas: Mutex<Vec<String>>,
    in_transaction: AtomicBool,
    reconnector: Option<Box<Reconnector>>,
}

/// A shared handle to one database connection and its instance state.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Wraps an open driver with a dialect and configuration.
    pub fn new(driver: Box<dyn Driver>, dialect: Arc<dyn Dialect>, config: Config) -> Connection {
        Self::with_reconnector(driver, dialect, config, None)
    }

    /// Like [`Connection::new`], with a factory used to re-establish the
    /// driver when the connection is lost outside a transaction.
    pub fn with_reconnector(
        driver: Box<dyn Driver>,
        dialect: Arc<dyn Dialect>,
        config: Config,
        reconnector: Option<Box<Reconnector>>,
    ) -> Connection {
        let stores = StoreRegistry::new(config.stores.clone());
        info!(backend = dialect.backend_name(), "opened connection");
        Connection {
            inner: Arc::new(ConnectionInner {
                driver: Mutex::new(driver),
                dialect,
                config,
                codecs: CodecRegistry::with_builtins(),
                stores,
                graph: Mutex::new(DependencyGraph::new()),
                schemas: Mutex::new(Vec::new()),
                in_transaction: AtomicBool::new(false),
                reconnector,
            }),
        }
    }

    /// An embedded SQLite connection with in-memory schemas. The workhorse
    /// for tests and throwaway pipelines.
    pub fn open_sqlite_in_memory(config: Config) -> Result<Connection> {
        Ok(Connection::new(
            Box::new(SqliteDriver::open_in_memory()?),
            Arc::new(SqliteDialect::in_memory()),
            config,
        ))
    }

    /// An embedded SQLite connection with one database file per schema
    /// under `base_dir`.
    pub fn open_sqlite(base_dir: impl Into<std::path::PathBuf>, config: Config) -> Result<Connection> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        let primary = base_dir.join("quarry.db");
        Ok(Connection::new(
            Box::new(SqliteDriver::open(primary)?),
            Arc::new(SqliteDialect::with_base_dir(base_dir)),
            config,
        ))
    }

    pub fn dialect(&self) -> &Arc<dyn Dialect> {
        &self.inner.dialect
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn codecs(&self) -> &CodecRegistry {
        &self.inner.codecs
    }

    pub fn stores(&self) -> &StoreRegistry {
        &self.inner.stores
    }

    /// Quotes an identifier in this connection's dialect.
    pub(crate) fn quote(&self, name: &str) -> String {
        self.inner.dialect.quote_ident(name)
    }

    pub(crate) fn driver(&self) -> MutexGuard<'_, Box<dyn Driver>> {
        self.inner.driver.lock().expect("connection driver poisoned")
    }

    /// The backend's id for this connection.
    pub fn connection_id(&self) -> u64 {
        self.driver().connection_id()
    }

    /// Checks connection liveness.
    pub fn ping(&self) -> Result<()> {
        let mut driver = self.driver();
        driver
            .ping()
            .map_err(|e| self.inner.dialect.translate_error(e, "ping"))
    }

    // -- Queries -------------------------------------------------------------

    /// Runs a query, translating errors and reconnecting once on a lost
    /// connection outside a transaction.
    pub fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        debug!(sql, "query");
        let result = {
            let mut driver = self.driver();
            driver.query(sql, params)
        };
        match result {
            Ok(rows) => Ok(rows),
            Err(e) => {
                let translated = self.inner.dialect.translate_error(e, sql);
                if self.try_reconnect(&translated)? {
                    let mut driver = self.driver();
                    return driver
                        .query(sql, params)
                        .map_err(|e| self.inner.dialect.translate_error(e, sql));
                }
                Err(translated)
            }
        }
    }

    /// Runs a statement, returning affected rows; same reconnect policy as
    /// [`Connection::query`].
    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        debug!(sql, "execute");
        let result = {
            let mut driver = self.driver();
            driver.execute(sql, params)
        };
        match result {
            Ok(n) => Ok(n),
            Err(e) => {
                let translated = self.inner.dialect.translate_error(e, sql);
                if self.try_reconnect(&translated)? {
                    let mut driver = self.driver();
                    return driver
                        .execute(sql, params)
                        .map_err(|e| self.inner.dialect.translate_error(e, sql));
                }
                Err(translated)
            }
        }
    }

    /// Executes a DDL script statement by statement.
    pub fn execute_script(&self, script: &[String]) -> Result<()> {
        for sql in script {
            self.execute(sql, &[])?;
        }
        Ok(())
    }

    /// Reconnects after a lost connection when allowed; inside a
    /// transaction the transaction is cancelled and the error surfaces.
    fn try_reconnect(&self, error: &Error) -> Result<bool> {
        if !error.is_lost_connection() {
            return Ok(false);
        }
        if self.in_transaction() {
            self.inner.in_transaction.store(false, Ordering::SeqCst);
            return Err(Error::LostConnection(
                "connection lost inside a transaction; transaction cancelled".to_string(),
            ));
        }
        match &self.inner.reconnector {
            Some(reconnect) => {
                warn!("connection lost; reconnecting");
                let fresh = reconnect()?;
                *self.driver() = fresh;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // -- Transactions --------------------------------------------------------

    pub fn in_transaction(&self) -> bool {
        self.inner.in_transaction.load(Ordering::SeqCst)
    }

    /// Opens a transaction; nesting is refused.
    pub fn start_transaction(&self) -> Result<()> {
        if self.inner.in_transaction.swap(true, Ordering::SeqCst) {
            return Err(Error::invalid("a transaction is already open"));
        }
        let sql = self.inner.dialect.start_transaction_sql();
        if let Err(e) = self.execute_raw(sql) {
            self.inner.in_transaction.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    pub fn commit_transaction(&self) -> Result<()> {
        if !self.inner.in_transaction.swap(false, Ordering::SeqCst) {
            return Err(Error::invalid("no transaction to commit"));
        }
        self.execute_raw(self.inner.dialect.commit_sql())
    }

    pub fn cancel_transaction(&self) -> Result<()> {
        if !self.inner.in_transaction.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.execute_raw(self.inner.dialect.rollback_sql())
    }

    fn execute_raw(&self, sql: &str) -> Result<()> {
        let mut driver = self.driver();
        driver
            .execute(sql, &[])
            .map(|_| ())
            .map_err(|e| self.inner.dialect.translate_error(e, sql))
    }

    // -- Schemas and dependencies -------------------------------------------

    /// Registers a schema with this connection (used by graph loading).
    pub(crate) fn register_schema(&self, name: &str) {
        let mut schemas = self.inner.schemas.lock().expect("schema list poisoned");
        if !schemas.iter().any(|s| s == name) {
            schemas.push(name.to_string());
        }
    }

    pub fn schemas(&self) -> Vec<String> {
        self.inner.schemas.lock().expect("schema list poisoned").clone()
    }

    /// Marks the dependency graph stale; it reloads on next use.
    pub(crate) fn invalidate_graph(&self) {
        self.inner.graph.lock().expect("graph poisoned").invalidate();
    }

    /// Loads the dependency graph (if stale or `force`) and hands it to
    /// `f`.
    pub(crate) fn with_graph<T>(
        &self,
        force: bool,
        f: impl FnOnce(&DependencyGraph) -> T,
    ) -> Result<T> {
        let mut graph = self.inner.graph.lock().expect("graph poisoned");
        if force || !graph.is_loaded() {
            let schemas = self.schemas();
            let mut nodes = Vec::new();
            let mut fks = Vec::new();
            {
                let mut driver = self.driver();
                let dialect = &self.inner.dialect;
                for schema in &schemas {
                    for table in dialect.list_tables(driver.as_mut(), schema)? {
                        if table.starts_with('~') {
                            continue;
                        }
                        let name = quarry_core::QualifiedName::new(schema.clone(), table);
                        let pk = dialect.primary_key(driver.as_mut(), &name)?;
                        nodes.push((name.to_string(), pk.into_iter().collect()));
                    }
                    for fk in dialect.foreign_keys(driver.as_mut(), schema)? {
                        if fk.child.is_hidden() || fk.parent.is_hidden() {
                            continue;
                        }
                        fks.push(fk);
                    }
                }
            }
            graph.rebuild(nodes, fks)?;
        }
        Ok(f(&graph))
    }
}
