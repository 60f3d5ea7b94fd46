use crate::error::{HdbError, Result};
use crate::json_state::JsonState;
use crate::log_store::{create_private_dir, write_private_file};
use crate::pubsub::Publisher;
use crate::replicator::{LocalReplicator, LogConfig};
use crate::schema::{Schema, SchemaRegistry};
use crate::state_machine::StateMachineController;
use crate::transition::Transition;
use crate::update::StateUpdate;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use ulid::Ulid;

pub const NAME_FILE: &str = "name";
pub const SCHEMA_TYPE_FILE: &str = "schema_type";

/// Handle to one open database.
pub struct Database {
    id: String,
    name: String,
    path: PathBuf,
    schema: Arc<dyn Schema>,
    controller: StateMachineController,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Database {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema(&self) -> Arc<dyn Schema> {
        self.schema.clone()
    }

    pub fn schema_name(&self) -> &str {
        self.schema.name()
    }

    pub async fn propose_transitions(
        &self,
        transitions: Vec<Box<dyn Transition>>,
    ) -> Result<JsonState> {
        self.controller.propose_transitions(transitions).await
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.controller.bytes()
    }

    pub fn state(&self) -> JsonState {
        self.controller.state()
    }

    pub fn unmarshal<T: DeserializeOwned>(&self) -> Result<T> {
        self.controller.state().unmarshal()
    }

    pub fn committed_index(&self) -> u64 {
        self.controller.committed_index()
    }

    pub async fn wait_applied(&self, index: u64) -> Result<()> {
        self.controller.wait_applied(index).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.controller.stop().await
    }
}

/// Creates, restores and routes databases under one HDB root.
pub struct DatabaseManager {
    root: PathBuf,
    schemas: SchemaRegistry,
    publisher: Arc<Publisher<StateUpdate>>,
    config: LogConfig,
    databases: RwLock<HashMap<String, Arc<Database>>>,
}

impl DatabaseManager {
    pub fn new(
        root: impl AsRef<Path>,
        schemas: SchemaRegistry,
        publisher: Arc<Publisher<StateUpdate>>,
        config: LogConfig,
    ) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        create_private_dir(&root)?;
        Ok(Self {
            root,
            schemas,
            publisher,
            config,
            databases: RwLock::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn publisher(&self) -> Arc<Publisher<StateUpdate>> {
        self.publisher.clone()
    }

    /// Creates a database and commits `initial_transitions`, which must start
    /// with the schema's initialization transition.
    pub async fn create_database(
        &self,
        name: &str,
        schema_type: &str,
        initial_transitions: Vec<Box<dyn Transition>>,
    ) -> Result<Arc<Database>> {
        let schema = self.schemas.get(schema_type)?;
        match initial_transitions.first() {
            Some(first) if first.transition_type() == schema.initialization_type() => {}
            _ => {
                return Err(HdbError::InvalidInput(format!(
                    "initial transitions for {} must start with {}",
                    name,
                    schema.initialization_type()
                )));
            }
        }

        let mut databases = self.databases.write().await;
        if databases.values().any(|database| database.name == name) {
            return Err(HdbError::AlreadyExists(format!("database {} already exists", name)));
        }

        let id = Ulid::new().to_string();
        let path = self.root.join(&id);
        create_private_dir(&path)?;
        write_private_file(&path.join(NAME_FILE), name.as_bytes())?;
        write_private_file(&path.join(SCHEMA_TYPE_FILE), schema_type.as_bytes())?;

        let database = match self.open_database(&id, name, &path, schema, false) {
            Ok(database) => database,
            Err(error) => {
                remove_database_dir(&path);
                return Err(error);
            }
        };

        if let Err(error) = database.propose_transitions(initial_transitions).await {
            if let Err(stop_error) = database.stop().await {
                tracing::warn!("Failed to stop database {}: {}", name, stop_error);
            }
            remove_database_dir(&path);
            return Err(error);
        }

        tracing::info!("Created database {} ({}) with schema {}", name, id, schema_type);
        let database = Arc::new(database);
        databases.insert(id, database.clone());
        Ok(database)
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Arc<Database>> {
        self.databases
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| HdbError::NotFound(format!("database with id {}", id)))
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Arc<Database>> {
        self.databases
            .read()
            .await
            .values()
            .find(|database| database.name == name)
            .cloned()
            .ok_or_else(|| HdbError::NotFound(format!("database with name {}", name)))
    }

    pub async fn list(&self) -> Vec<Arc<Database>> {
        let mut databases: Vec<Arc<Database>> =
            self.databases.read().await.values().cloned().collect();
        databases.sort_by(|a, b| a.id.cmp(&b.id));
        databases
    }

    /// Reopens every database found under the root. A database that fails to
    /// open is logged and skipped.
    pub async fn restart(&self) -> Result<Vec<Arc<Database>>> {
        let mut restored = Vec::new();
        let mut databases = self.databases.write().await;

        let mut dirs = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                dirs.push(entry.path());
            }
        }
        dirs.sort();

        for path in dirs {
            let Some(id) = path.file_name().and_then(|name| name.to_str()).map(str::to_string)
            else {
                continue;
            };
            if databases.contains_key(&id) {
                continue;
            }

            match self.restore_database(&id, &path) {
                Ok(database) => {
                    tracing::info!("Restored database {} ({})", database.name, id);
                    let database = Arc::new(database);
                    databases.insert(id, database.clone());
                    restored.push(database);
                }
                Err(error) => {
                    tracing::error!("Failed to restore database at {}: {}", path.display(), error);
                }
            }
        }

        Ok(restored)
    }

    pub async fn stop(&self) -> Result<()> {
        let mut databases = self.databases.write().await;
        for (id, database) in databases.drain() {
            if let Err(error) = database.stop().await {
                tracing::warn!("Failed to stop database {}: {}", id, error);
            }
        }
        Ok(())
    }

    fn restore_database(&self, id: &str, path: &Path) -> Result<Database> {
        let name = read_metadata(path, NAME_FILE)?;
        let schema_type = read_metadata(path, SCHEMA_TYPE_FILE)?;
        let schema = self
            .schemas
            .get(&schema_type)
            .map_err(|_| {
                HdbError::CorruptMetadata(format!("unknown schema type {}", schema_type))
            })?;
        self.open_database(id, &name, path, schema, true)
    }

    fn open_database(
        &self,
        id: &str,
        name: &str,
        path: &Path,
        schema: Arc<dyn Schema>,
        emit_restore: bool,
    ) -> Result<Database> {
        let replicator = LocalReplicator::open(path, id, schema.clone(), self.config.clone())?;
        let controller = StateMachineController::start(
            id,
            schema.clone(),
            Arc::new(replicator),
            self.publisher.clone(),
            emit_restore,
        )?;

        Ok(Database {
            id: id.to_string(),
            name: name.to_string(),
            path: path.to_path_buf(),
            schema,
            controller,
        })
    }
}

fn read_metadata(path: &Path, file: &str) -> Result<String> {
    let raw = std::fs::read(path.join(file)).map_err(|error| {
        HdbError::CorruptMetadata(format!(
            "failed to read {} in {}: {}",
            file,
            path.display(),
            error
        ))
    })?;
    let value = String::from_utf8(raw).map_err(|_| {
        HdbError::CorruptMetadata(format!("{} in {} is not UTF-8", file, path.display()))
    })?;
    let value = value.trim().to_string();
    if value.is_empty() {
        return Err(HdbError::CorruptMetadata(format!(
            "{} in {} is empty",
            file,
            path.display()
        )));
    }
    Ok(value)
}

fn remove_database_dir(path: &Path) {
    if let Err(error) = std::fs::remove_dir_all(path) {
        tracing::warn!("Failed to remove database directory {}: {}", path.display(), error);
    }
}
