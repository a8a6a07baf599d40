//! Relation registry
//!
//! Maps qualified relation names (case-insensitive) to a descriptor and the
//! component that backs them. A process normally has one global registry
//! ([`init`] / [`global`] / [`reload`] / [`teardown`]); everything that plans
//! or executes takes an `Arc<Registry>` so tests can use scoped instances.

use crate::ast::Query;
use crate::catalog::Catalog;
use crate::error::{Error, Result, SourceErrorKind};
use crate::inference::{InferenceTarget, TargetKind};
use crate::kb::KnowledgeBase;
use crate::retry::RetrySettings;
use crate::source::system::{JobHistorySource, SystemSource, SystemTable, JOBS_SCHEMA, SYSTEM_SCHEMA};
use crate::source::{Capabilities, FilterSupport, SourceHandle};
use crate::value::Schema;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    ExternalTable,
    KnowledgeBase,
    Model,
    Agent,
    View,
    JobOutput,
}

impl RelationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationKind::ExternalTable => "external_table",
            RelationKind::KnowledgeBase => "knowledge_base",
            RelationKind::Model => "model",
            RelationKind::Agent => "agent",
            RelationKind::View => "view",
            RelationKind::JobOutput => "job_output",
        }
    }
}

/// What the planner needs to know about a relation
#[derive(Debug, Clone, Serialize)]
pub struct RelationDescriptor {
    pub name: String,
    pub kind: RelationKind,
    pub capabilities: Capabilities,
    /// Unqualified; empty for views until planned
    pub schema: Schema,
}

/// The component a relation resolves to
#[derive(Clone)]
pub enum Backend {
    Source {
        handle: Arc<SourceHandle>,
        table: String,
    },
    KnowledgeBase(Arc<KnowledgeBase>),
    Inference(Arc<InferenceTarget>),
    View(Arc<Query>),
}

#[derive(Clone)]
pub struct Resolved {
    pub descriptor: RelationDescriptor,
    pub backend: Backend,
}

/// Single-part names share one namespace
#[derive(Clone)]
enum Entry {
    KnowledgeBase(Arc<KnowledgeBase>),
    Inference(Arc<InferenceTarget>),
    View(Arc<Query>),
}

impl Entry {
    fn kind(&self) -> RelationKind {
        match self {
            Entry::KnowledgeBase(_) => RelationKind::KnowledgeBase,
            Entry::Inference(t) if t.kind == TargetKind::Agent => RelationKind::Agent,
            Entry::Inference(_) => RelationKind::Model,
            Entry::View(_) => RelationKind::View,
        }
    }
}

/// Knowledge base search takes metadata filters and a `k`; the rest of a
/// query runs over its output
fn knowledge_base_capabilities() -> Capabilities {
    Capabilities {
        filter: FilterSupport::Simple,
        projection: false,
        order_by: false,
        limit: true,
        ..Capabilities::none()
    }
}

pub struct Registry {
    sources: RwLock<BTreeMap<String, Arc<SourceHandle>>>,
    entries: RwLock<BTreeMap<String, Entry>>,
    catalog: RwLock<Option<Catalog>>,
    system: Arc<SourceHandle>,
    job_history: Arc<SourceHandle>,
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|me| {
            let retry = RetrySettings::new(0, 0);
            Self {
                sources: RwLock::new(BTreeMap::new()),
                entries: RwLock::new(BTreeMap::new()),
                catalog: RwLock::new(None),
                system: Arc::new(SourceHandle::new(
                    Arc::new(SystemSource::new(me.clone())),
                    4,
                    retry,
                )),
                job_history: Arc::new(SourceHandle::new(
                    Arc::new(JobHistorySource::new(me.clone())),
                    4,
                    retry,
                )),
            }
        })
    }

    /// Backing store for `jobs.*` and `information_schema.jobs`
    pub fn attach_catalog(&self, catalog: Catalog) {
        *write(&self.catalog) = Some(catalog);
    }

    pub fn catalog(&self) -> Option<Catalog> {
        read(&self.catalog).clone()
    }

    pub fn register_source(&self, handle: SourceHandle) -> Result<()> {
        let name = handle.name().to_lowercase();
        if name == SYSTEM_SCHEMA || name == JOBS_SCHEMA {
            return Err(Error::Config(format!("source name '{}' is reserved", name)));
        }
        let mut sources = write(&self.sources);
        if sources.contains_key(&name) {
            return Err(Error::AlreadyExists(format!("source {}", name)));
        }
        info!("Registered source '{}'", name);
        sources.insert(name, Arc::new(handle));
        Ok(())
    }

    fn register_entry(&self, name: &str, entry: Entry) -> Result<()> {
        let name = name.to_lowercase();
        if name.contains('.') {
            return Err(Error::Config(format!(
                "'{}': knowledge base, model, agent and view names cannot contain '.'",
                name
            )));
        }
        let mut entries = write(&self.entries);
        if entries.contains_key(&name) {
            return Err(Error::AlreadyExists(name));
        }
        debug!("Registered {} '{}'", entry.kind().as_str(), name);
        entries.insert(name, entry);
        Ok(())
    }

    pub fn register_knowledge_base(&self, kb: Arc<KnowledgeBase>) -> Result<()> {
        self.register_entry(&kb.name().to_string(), Entry::KnowledgeBase(kb))
    }

    pub fn register_inference(&self, target: Arc<InferenceTarget>) -> Result<()> {
        self.register_entry(&target.name.clone(), Entry::Inference(target))
    }

    pub fn register_view(&self, name: &str, query: Query) -> Result<()> {
        self.register_entry(name, Entry::View(Arc::new(query)))
    }

    /// Remove a knowledge base, model, agent or view. Returns its kind.
    pub fn unregister(&self, name: &str) -> Option<RelationKind> {
        write(&self.entries)
            .remove(&name.to_lowercase())
            .map(|e| e.kind())
    }

    pub fn kind_of(&self, name: &str) -> Option<RelationKind> {
        read(&self.entries).get(&name.to_lowercase()).map(Entry::kind)
    }

    pub fn source(&self, name: &str) -> Option<Arc<SourceHandle>> {
        read(&self.sources).get(&name.to_lowercase()).cloned()
    }

    pub fn sources(&self) -> Vec<Arc<SourceHandle>> {
        read(&self.sources).values().cloned().collect()
    }

    pub fn knowledge_base(&self, name: &str) -> Option<Arc<KnowledgeBase>> {
        match read(&self.entries).get(&name.to_lowercase()) {
            Some(Entry::KnowledgeBase(kb)) => Some(kb.clone()),
            _ => None,
        }
    }

    pub fn knowledge_bases(&self) -> Vec<Arc<KnowledgeBase>> {
        read(&self.entries)
            .values()
            .filter_map(|e| match e {
                Entry::KnowledgeBase(kb) => Some(kb.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn inference_targets(&self) -> Vec<Arc<InferenceTarget>> {
        read(&self.entries)
            .values()
            .filter_map(|e| match e {
                Entry::Inference(t) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }

    /// Every addressable relation with its kind, sources first
    pub async fn relations(&self) -> Result<Vec<(String, RelationKind)>> {
        let mut out = Vec::new();
        for handle in self.sources() {
            for table in handle.tables().await? {
                out.push((
                    format!("{}.{}", handle.name(), table).to_lowercase(),
                    RelationKind::ExternalTable,
                ));
            }
        }
        for table in SystemTable::ALL {
            out.push((
                format!("{}.{}", SYSTEM_SCHEMA, table.name()),
                RelationKind::ExternalTable,
            ));
        }
        out.extend(
            read(&self.entries)
                .iter()
                .map(|(name, entry)| (name.clone(), entry.kind())),
        );
        if let Some(catalog) = self.catalog() {
            for job in catalog.list_jobs().await? {
                out.push((format!("{}.{}", JOBS_SCHEMA, job.name), RelationKind::JobOutput));
            }
        }
        Ok(out)
    }

    /// Look a relation up by qualified name
    pub async fn resolve(&self, qualified: &str) -> Result<Resolved> {
        let name = qualified.trim().to_lowercase();
        let unknown = || Error::UnknownRelation(qualified.to_string());

        let Some((schema, table)) = name
            .split_once('.')
            .map(|(s, t)| (s.to_string(), t.to_string()))
        else {
            let entry = read(&self.entries).get(&name).cloned().ok_or_else(unknown)?;
            return Ok(self.describe_entry(&name, entry));
        };
        let (schema, table) = (schema.as_str(), table.as_str());

        if schema == SYSTEM_SCHEMA {
            let system = SystemTable::from_name(table).ok_or_else(unknown)?;
            return Ok(Resolved {
                descriptor: RelationDescriptor {
                    name,
                    kind: RelationKind::ExternalTable,
                    capabilities: self.system.capabilities(),
                    schema: system.schema(),
                },
                backend: Backend::Source {
                    handle: self.system.clone(),
                    table: table.to_string(),
                },
            });
        }

        if schema == JOBS_SCHEMA {
            let catalog = self.catalog().ok_or_else(unknown)?;
            catalog.get_job(table).await?.ok_or_else(unknown)?;
            return Ok(Resolved {
                descriptor: RelationDescriptor {
                    name: name.clone(),
                    kind: RelationKind::JobOutput,
                    capabilities: self.job_history.capabilities(),
                    schema: JobHistorySource::history_schema(),
                },
                backend: Backend::Source {
                    handle: self.job_history.clone(),
                    table: table.to_string(),
                },
            });
        }

        let handle = self.source(schema).ok_or_else(unknown)?;
        let table_schema = match handle.schema(table).await {
            Ok(s) => s,
            Err(Error::Source {
                kind: SourceErrorKind::Schema,
                ..
            }) => return Err(unknown()),
            Err(e) => return Err(e),
        };
        Ok(Resolved {
            descriptor: RelationDescriptor {
                name,
                kind: RelationKind::ExternalTable,
                capabilities: handle.capabilities(),
                schema: table_schema,
            },
            backend: Backend::Source {
                handle,
                table: table.to_string(),
            },
        })
    }

    fn describe_entry(&self, name: &str, entry: Entry) -> Resolved {
        let kind = entry.kind();
        let (capabilities, schema, backend) = match entry {
            Entry::KnowledgeBase(kb) => (
                knowledge_base_capabilities(),
                kb.schema(),
                Backend::KnowledgeBase(kb),
            ),
            Entry::Inference(target) => {
                let mut names = target.input_columns.clone();
                names.extend(
                    target
                        .output_columns
                        .iter()
                        .filter(|c| !target.input_columns.iter().any(|i| i.eq_ignore_ascii_case(c)))
                        .cloned(),
                );
                (
                    Capabilities::none(),
                    Schema::from_names(&names),
                    Backend::Inference(target),
                )
            }
            Entry::View(query) => (Capabilities::none(), Schema::default(), Backend::View(query)),
        };
        Resolved {
            descriptor: RelationDescriptor {
                name: name.to_string(),
                kind,
                capabilities,
                schema,
            },
            backend,
        }
    }
}

static GLOBAL: RwLock<Option<Arc<Registry>>> = RwLock::new(None);

/// Install the process-wide registry. Fails if one is already installed.
pub fn init(registry: Arc<Registry>) -> Result<()> {
    let mut global = write(&GLOBAL);
    if global.is_some() {
        return Err(Error::AlreadyExists("global registry".into()));
    }
    *global = Some(registry);
    Ok(())
}

/// Swap in a new registry, returning the old one
pub fn reload(registry: Arc<Registry>) -> Option<Arc<Registry>> {
    write(&GLOBAL).replace(registry)
}

pub fn teardown() -> Option<Arc<Registry>> {
    write(&GLOBAL).take()
}

pub fn global() -> Result<Arc<Registry>> {
    read(&GLOBAL)
        .clone()
        .ok_or_else(|| Error::Config("registry not initialized".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Select, TableExpr};
    use crate::source::{FetchRequest, MemorySource};
    use crate::value::{Batch, Value};

    fn registry_with_crm() -> Arc<Registry> {
        let registry = Registry::new();
        let source = MemorySource::new("crm");
        source.create_table(
            "customers",
            Batch::new(
                Schema::from_names(&["id", "name"]),
                vec![vec![Value::Int(1), Value::from("Ada")]],
            ),
        );
        registry
            .register_source(SourceHandle::new(Arc::new(source), 2, RetrySettings::new(0, 1)))
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn test_resolve_is_case_insensitive() {
        let registry = registry_with_crm();
        let resolved = registry.resolve("CRM.Customers").await.unwrap();
        assert_eq!(resolved.descriptor.kind, RelationKind::ExternalTable);
        assert_eq!(resolved.descriptor.schema.names(), vec!["id", "name"]);
        assert!(matches!(
            registry.resolve("crm.orders").await,
            Err(Error::UnknownRelation(_))
        ));
        assert!(matches!(
            registry.resolve("nowhere").await,
            Err(Error::UnknownRelation(_))
        ));
    }

    #[tokio::test]
    async fn test_single_part_namespace_is_shared() {
        let registry = registry_with_crm();
        let view = Query::from(Select::star(TableExpr::relation("crm.customers")));
        registry.register_view("recent", view.clone()).unwrap();
        assert!(matches!(
            registry.register_view("Recent", view),
            Err(Error::AlreadyExists(_))
        ));
        assert_eq!(
            registry.resolve("recent").await.unwrap().descriptor.kind,
            RelationKind::View
        );
        assert_eq!(registry.unregister("RECENT"), Some(RelationKind::View));
        assert!(registry.resolve("recent").await.is_err());
    }

    #[tokio::test]
    async fn test_information_schema_reflects_registry() {
        let registry = registry_with_crm();
        let resolved = registry.resolve("information_schema.tables").await.unwrap();
        let Backend::Source { handle, table } = resolved.backend else {
            panic!("system tables are sources");
        };
        let batch = handle.fetch(&FetchRequest::table(&table)).await.unwrap();
        assert!(batch
            .rows
            .iter()
            .any(|r| r[0] == Value::from("crm") && r[1] == Value::from("customers")));

        let columns = registry.resolve("information_schema.columns").await.unwrap();
        let Backend::Source { handle, table } = columns.backend else {
            panic!("system tables are sources");
        };
        let batch = handle.fetch(&FetchRequest::table(&table)).await.unwrap();
        let names: Vec<&Value> = batch
            .rows
            .iter()
            .filter(|r| r[1] == Value::from("customers"))
            .map(|r| &r[2])
            .collect();
        assert_eq!(names, vec![&Value::from("id"), &Value::from("name")]);
    }

    #[test]
    fn test_reserved_source_names() {
        let registry = Registry::new();
        let source = MemorySource::new("information_schema");
        assert!(registry
            .register_source(SourceHandle::new(Arc::new(source), 1, RetrySettings::new(0, 1)))
            .is_err());
    }

    #[test]
    fn test_global_lifecycle() {
        teardown();
        assert!(global().is_err());
        let first = Registry::new();
        init(first.clone()).unwrap();
        assert!(init(Registry::new()).is_err());
        assert!(Arc::ptr_eq(&global().unwrap(), &first));

        let second = Registry::new();
        let old = reload(second.clone()).unwrap();
        assert!(Arc::ptr_eq(&old, &first));
        assert!(Arc::ptr_eq(&global().unwrap(), &second));
        assert!(teardown().is_some());
        assert!(global().is_err());
    }
}
