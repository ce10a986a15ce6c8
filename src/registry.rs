//! Process-scoped catalog of tools, resources and prompts
//!
//! The registry is an explicit instance injected into a server's dispatcher and
//! used as a client session's local tool cache. Registration is insert-or-replace
//! by name. Every mutation of the tool map and its category index happens under a
//! single write lock, so a concurrent lookup never observes a half-applied change.

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::{
    collections::{BTreeSet, HashMap},
    future::Future,
    sync::{Arc, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};
use tracing::debug;

use crate::{
    error::{Error, ErrorCode},
    types::{PromptDefinition, ResourceContents, ResourceDefinition, ToolDefinition, ToolSchema},
};

/// The executable half of a tool
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn invoke(&self, arguments: Map<String, Value>) -> Result<Value, Error>;
}

/// Adapts an async closure into a [`ToolHandler`]
pub struct FnTool<F>(F);

/// Wraps `f` as a tool executable
pub fn tool_fn<F, Fut>(f: F) -> FnTool<F>
where
    F: Fn(Map<String, Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, Error>> + Send,
{
    FnTool(f)
}

#[async_trait]
impl<F, Fut> ToolHandler for FnTool<F>
where
    F: Fn(Map<String, Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, Error>> + Send,
{
    async fn invoke(&self, arguments: Map<String, Value>) -> Result<Value, Error> {
        (self.0)(arguments).await
    }
}

/// Produces the contents of a registered resource
#[async_trait]
pub trait ResourceReader: Send + Sync {
    async fn read(&self, uri: &str) -> Result<ResourceContents, Error>;
}

/// Fixed resource contents
#[derive(Debug, Clone)]
pub enum StaticContent {
    Text(String),
    Binary(Vec<u8>),
}

#[async_trait]
impl ResourceReader for StaticContent {
    async fn read(&self, uri: &str) -> Result<ResourceContents, Error> {
        Ok(match self {
            StaticContent::Text(text) => ResourceContents::text(uri, None, text.clone()),
            StaticContent::Binary(bytes) => ResourceContents::binary(uri, None, bytes),
        })
    }
}

/// A registry entry: a definition, optionally bound to an executable
#[derive(Clone)]
pub struct RegisteredTool {
    definition: Arc<ToolDefinition>,
    handler: Option<Arc<dyn ToolHandler>>,
}

impl RegisteredTool {
    pub fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    pub fn is_executable(&self) -> bool {
        self.handler.is_some()
    }

    pub async fn invoke(&self, arguments: Map<String, Value>) -> Result<Value, Error> {
        match &self.handler {
            Some(handler) => handler.invoke(arguments).await,
            None => Err(Error::Other(format!(
                "tool `{}` has no executable bound",
                self.definition.name
            ))),
        }
    }
}

#[derive(Clone)]
struct RegisteredResource {
    definition: ResourceDefinition,
    reader: Arc<dyn ResourceReader>,
}

#[derive(Default)]
struct ToolIndex {
    tools: IndexMap<String, RegisteredTool>,
    categories: HashMap<String, BTreeSet<String>>,
}

impl ToolIndex {
    fn insert(&mut self, entry: RegisteredTool) -> Option<RegisteredTool> {
        let name = entry.definition.name.clone();
        let category = entry.definition.category.clone();
        let replaced = self.tools.insert(name.clone(), entry);
        if let Some(old) = &replaced {
            self.unindex(&name, old.definition.category.as_deref());
        }
        if let Some(category) = category {
            self.categories.entry(category).or_default().insert(name);
        }
        replaced
    }

    fn remove(&mut self, name: &str) -> Option<RegisteredTool> {
        let removed = self.tools.shift_remove(name)?;
        self.unindex(name, removed.definition.category.as_deref());
        Some(removed)
    }

    fn unindex(&mut self, name: &str, category: Option<&str>) {
        let Some(category) = category else {
            return;
        };
        if let Some(names) = self.categories.get_mut(category) {
            names.remove(name);
            if names.is_empty() {
                self.categories.remove(category);
            }
        }
    }

    fn clear(&mut self) {
        self.tools.clear();
        self.categories.clear();
    }
}

/// Catalog of name → schema + executable
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<ToolIndex>,
    resources: RwLock<IndexMap<String, RegisteredResource>>,
    prompts: RwLock<IndexMap<String, PromptDefinition>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A convenience instance shared by everything in the process that asks for it
    pub fn shared() -> Arc<ToolRegistry> {
        static SHARED: OnceLock<Arc<ToolRegistry>> = OnceLock::new();
        SHARED.get_or_init(|| Arc::new(ToolRegistry::new())).clone()
    }

    /// Registers a tool, replacing any tool of the same name
    ///
    /// Returns the definition that was replaced, if any.
    pub fn register_tool<H: ToolHandler + 'static>(
        &self,
        definition: ToolDefinition,
        handler: H,
    ) -> Option<ToolDefinition> {
        self.insert(definition, Some(Arc::new(handler)))
    }

    /// Registers a definition with no executable bound
    pub fn register_definition(&self, definition: ToolDefinition) -> Option<ToolDefinition> {
        self.insert(definition, None)
    }

    fn insert(
        &self,
        definition: ToolDefinition,
        handler: Option<Arc<dyn ToolHandler>>,
    ) -> Option<ToolDefinition> {
        debug!(tool = %definition.name, executable = handler.is_some(), "registering tool");
        let entry = RegisteredTool {
            definition: Arc::new(definition),
            handler,
        };
        write(&self.tools)
            .insert(entry)
            .map(|old| (*old.definition).clone())
    }

    pub fn unregister_tool(&self, name: &str) -> bool {
        let removed = write(&self.tools).remove(name).is_some();
        if removed {
            debug!(tool = %name, "unregistered tool");
        }
        removed
    }

    pub fn tool(&self, name: &str) -> Option<RegisteredTool> {
        read(&self.tools).tools.get(name).cloned()
    }

    pub fn definition(&self, name: &str) -> Option<ToolDefinition> {
        read(&self.tools)
            .tools
            .get(name)
            .map(|t| (*t.definition).clone())
    }

    pub fn contains_tool(&self, name: &str) -> bool {
        read(&self.tools).tools.contains_key(name)
    }

    /// Tool definitions in registration order, optionally restricted to a category
    pub fn list_tools(&self, category: Option<&str>) -> Vec<ToolDefinition> {
        let index = read(&self.tools);
        match category {
            None => index
                .tools
                .values()
                .map(|t| (*t.definition).clone())
                .collect(),
            Some(category) => index
                .categories
                .get(category)
                .into_iter()
                .flatten()
                .filter_map(|name| index.tools.get(name))
                .map(|t| (*t.definition).clone())
                .collect(),
        }
    }

    pub fn categories(&self) -> Vec<String> {
        let mut categories: Vec<String> = read(&self.tools).categories.keys().cloned().collect();
        categories.sort();
        categories
    }

    /// Case-insensitive full-text search over tool names and descriptions
    ///
    /// Every whitespace-separated term of `query` must occur in the name or the
    /// description.
    pub fn search(&self, query: &str) -> Vec<ToolDefinition> {
        let terms: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();
        read(&self.tools)
            .tools
            .values()
            .filter(|t| {
                let haystack = format!(
                    "{} {}",
                    t.definition.name.to_lowercase(),
                    t.definition.description.to_lowercase()
                );
                terms.iter().all(|term| haystack.contains(term.as_str()))
            })
            .map(|t| (*t.definition).clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        read(&self.tools).tools.len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.tools).tools.is_empty()
    }

    /// Exports every tool's schema as a plain JSON array
    pub fn export(&self) -> Result<Value, Error> {
        let schemas: Vec<ToolSchema> = read(&self.tools)
            .tools
            .values()
            .map(|t| t.definition.to_schema())
            .collect();
        Ok(serde_json::to_value(schemas)?)
    }

    /// Imports exported schemas as definitions with no executable bound
    pub fn import(&self, exported: &Value) -> Result<usize, Error> {
        let schemas: Vec<ToolSchema> = serde_json::from_value(exported.clone()).map_err(|e| {
            Error::protocol(ErrorCode::InvalidParams, format!("invalid tool export: {e}"))
        })?;
        let count = schemas.len();
        let mut index = write(&self.tools);
        for schema in &schemas {
            index.insert(RegisteredTool {
                definition: Arc::new(ToolDefinition::from_schema(schema)),
                handler: None,
            });
        }
        Ok(count)
    }

    /// Swaps the whole tool set in one step
    pub fn replace_definitions<I>(&self, definitions: I)
    where
        I: IntoIterator<Item = ToolDefinition>,
    {
        let entries: Vec<RegisteredTool> = definitions
            .into_iter()
            .map(|definition| RegisteredTool {
                definition: Arc::new(definition),
                handler: None,
            })
            .collect();
        let mut index = write(&self.tools);
        index.clear();
        for entry in entries {
            index.insert(entry);
        }
    }

    pub fn register_resource<R: ResourceReader + 'static>(
        &self,
        definition: ResourceDefinition,
        reader: R,
    ) -> bool {
        debug!(uri = %definition.uri, "registering resource");
        let entry = RegisteredResource {
            definition: definition.clone(),
            reader: Arc::new(reader),
        };
        write(&self.resources)
            .insert(definition.uri, entry)
            .is_some()
    }

    pub fn unregister_resource(&self, uri: &str) -> bool {
        write(&self.resources).shift_remove(uri).is_some()
    }

    pub fn list_resources(&self) -> Vec<ResourceDefinition> {
        read(&self.resources)
            .values()
            .map(|r| r.definition.clone())
            .collect()
    }

    /// Reads a resource, tagging the contents with its declared MIME type
    pub async fn read_resource(&self, uri: &str) -> Result<ResourceContents, Error> {
        let entry = read(&self.resources).get(uri).cloned().ok_or_else(|| {
            Error::protocol_with_data(
                ErrorCode::InvalidParams,
                format!("resource not found: {uri}"),
                serde_json::json!({ "uri": uri }),
            )
        })?;
        let mut contents = entry.reader.read(uri).await?;
        if contents.mime_type.is_none() {
            contents.mime_type = entry.definition.mime_type.clone();
        }
        Ok(contents)
    }

    pub fn register_prompt(&self, definition: PromptDefinition) -> bool {
        debug!(prompt = %definition.name, "registering prompt");
        write(&self.prompts)
            .insert(definition.name.clone(), definition)
            .is_some()
    }

    pub fn unregister_prompt(&self, name: &str) -> bool {
        write(&self.prompts).shift_remove(name).is_some()
    }

    pub fn prompt(&self, name: &str) -> Option<PromptDefinition> {
        read(&self.prompts).get(name).cloned()
    }

    pub fn list_prompts(&self) -> Vec<PromptDefinition> {
        read(&self.prompts).values().cloned().collect()
    }
}
