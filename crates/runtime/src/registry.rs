//! Process-wide tool catalog.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::supervisor::{Lifecycle, ProviderSupervisor};
use crate::{Error, Result};

/// A tool as advertised by a provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's arguments.
    pub schema: Value,
    pub provider: String,
}

impl ToolDescriptor {
    pub fn from_tool(provider: &str, tool: mcp::Tool) -> Self {
        Self {
            name: tool.name,
            description: tool.description.unwrap_or_default(),
            schema: tool.input_schema,
            provider: provider.to_string(),
        }
    }

    /// `name(arg: type, ...)` built from the schema's properties.
    pub fn signature(&self) -> String {
        let params = self
            .schema
            .get("properties")
            .and_then(Value::as_object)
            .map(|properties| {
                properties
                    .iter()
                    .map(|(name, spec)| match spec.get("type").and_then(Value::as_str) {
                        Some(ty) => format!("{name}: {ty}"),
                        None => name.clone(),
                    })
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_default();
        format!("{}({params})", self.name)
    }
}

/// A registration refused because another provider already owns the name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("tool {tool} from provider {rejected} conflicts with provider {existing}")]
pub struct RegistrationConflict {
    pub tool: String,
    pub existing: String,
    pub rejected: String,
}

#[derive(Default)]
struct Catalog {
    tools: BTreeMap<String, ToolDescriptor>,
    providers: HashMap<String, Vec<String>>,
    conflicts: Vec<RegistrationConflict>,
}

/// Maps tool names to descriptors and owning providers.
///
/// A provider's entries are always replaced as a unit, so readers never
/// observe a half-registered catalog. Tool names are unique across
/// providers; the first provider to claim a name keeps it.
#[derive(Default)]
pub struct ToolRegistry {
    catalog: RwLock<Catalog>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Catalog> {
        self.catalog.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Catalog> {
        self.catalog.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace `provider`'s entries with `descriptors`.
    ///
    /// If any name is already owned by a different provider, nothing is
    /// changed and the conflict is recorded once. A name repeated within
    /// `descriptors` keeps its first entry. Returns the number of distinct
    /// names registered.
    pub fn register(
        &self,
        provider: &str,
        descriptors: Vec<ToolDescriptor>,
    ) -> std::result::Result<usize, RegistrationConflict> {
        let mut catalog = self.write();

        let clash = descriptors.iter().find_map(|descriptor| {
            catalog
                .tools
                .get(&descriptor.name)
                .filter(|existing| existing.provider != provider)
                .map(|existing| RegistrationConflict {
                    tool: descriptor.name.clone(),
                    existing: existing.provider.clone(),
                    rejected: provider.to_string(),
                })
        });
        if let Some(conflict) = clash {
            warn!(
                tool = %conflict.tool,
                existing = %conflict.existing,
                rejected = %conflict.rejected,
                "tool name conflict; registration rejected"
            );
            if !catalog.conflicts.contains(&conflict) {
                catalog.conflicts.push(conflict.clone());
            }
            return Err(conflict);
        }

        if let Some(old) = catalog.providers.remove(provider) {
            for name in old {
                catalog.tools.remove(&name);
            }
        }
        let mut seen = HashSet::with_capacity(descriptors.len());
        let mut names = Vec::with_capacity(descriptors.len());
        for mut descriptor in descriptors {
            if !seen.insert(descriptor.name.clone()) {
                warn!(provider, tool = %descriptor.name, "duplicate tool name in listing; keeping first");
                continue;
            }
            descriptor.provider = provider.to_string();
            names.push(descriptor.name.clone());
            catalog.tools.insert(descriptor.name.clone(), descriptor);
        }
        let count = names.len();
        catalog.providers.insert(provider.to_string(), names);
        // Earlier refusals for this provider no longer hold.
        catalog.conflicts.retain(|conflict| conflict.rejected != provider);
        info!(provider, tools = count, "registered tools");
        Ok(count)
    }

    /// Drop every entry owned by `provider`. Returns how many were removed.
    pub fn unregister(&self, provider: &str) -> usize {
        let mut catalog = self.write();
        let Some(names) = catalog.providers.remove(provider) else {
            return 0;
        };
        for name in &names {
            catalog.tools.remove(name);
        }
        debug!(provider, tools = names.len(), "unregistered tools");
        names.len()
    }

    /// Look up a tool by name.
    pub fn resolve(&self, name: &str) -> Result<ToolDescriptor> {
        self.read()
            .tools
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ToolNotFound(name.to_string()))
    }

    /// All tools, sorted by name.
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.read().tools.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().tools.is_empty()
    }

    /// Rejected registrations, oldest first.
    pub fn conflicts(&self) -> Vec<RegistrationConflict> {
        self.read().conflicts.clone()
    }

    /// Numbered catalog text for prompts, one tool per line.
    pub fn describe_all(&self) -> String {
        let catalog = self.read();
        if catalog.tools.is_empty() {
            return "(no tools available)".to_string();
        }
        catalog
            .tools
            .values()
            .enumerate()
            .map(|(i, tool)| {
                let mut line = format!("{}. {}", i + 1, tool.signature());
                if !tool.description.is_empty() {
                    line.push_str(" - ");
                    line.push_str(&tool.description);
                }
                line
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Keep the registry in step with `supervisor`.
    ///
    /// Every new `Ready` generation re-registers the provider's catalog.
    /// Entries survive while the provider is `Degraded` and are removed once
    /// it is `Stopped`.
    pub fn attach(self: &Arc<Self>, supervisor: &ProviderSupervisor) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let provider = supervisor.name().to_string();
        let mut status = supervisor.subscribe();

        tokio::spawn(async move {
            let mut seen_generation = 0;
            loop {
                let (lifecycle, generation, tools) = {
                    let current = status.borrow_and_update();
                    (current.lifecycle, current.generation, current.tools.clone())
                };
                match lifecycle {
                    Lifecycle::Ready if generation != seen_generation => {
                        seen_generation = generation;
                        // Conflicts are logged and recorded by `register`.
                        let _ = registry.register(&provider, tools);
                    }
                    Lifecycle::Stopped => break,
                    _ => {}
                }
                if status.changed().await.is_err() {
                    break;
                }
            }
            registry.unregister(&provider);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(provider: &str, name: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_string(),
            description: format!("{name} two numbers"),
            schema: json!({
                "type": "object",
                "properties": {"a": {"type": "integer"}, "b": {"type": "integer"}}
            }),
            provider: provider.to_string(),
        }
    }

    #[test]
    fn signature_lists_typed_parameters() {
        assert_eq!(tool("calc", "add").signature(), "add(a: integer, b: integer)");
        let bare = ToolDescriptor {
            schema: json!({"type": "object"}),
            ..tool("calc", "now")
        };
        assert_eq!(bare.signature(), "now()");
    }

    #[test]
    fn register_and_resolve() {
        let registry = ToolRegistry::new();
        let count = registry
            .register("calc", vec![tool("calc", "add"), tool("calc", "subtract")])
            .unwrap();
        assert_eq!(count, 2);

        let add = registry.resolve("add").unwrap();
        assert_eq!(add.provider, "calc");
        assert!(matches!(
            registry.resolve("pow"),
            Err(Error::ToolNotFound(name)) if name == "pow"
        ));
    }

    #[test]
    fn conflicting_registration_is_rejected_whole() {
        let registry = ToolRegistry::new();
        registry.register("a", vec![tool("a", "x")]).unwrap();

        let conflict = registry
            .register("b", vec![tool("b", "y"), tool("b", "x")])
            .unwrap_err();
        assert_eq!(conflict.tool, "x");
        assert_eq!(conflict.existing, "a");
        assert_eq!(conflict.rejected, "b");

        assert_eq!(registry.resolve("x").unwrap().provider, "a");
        assert!(registry.resolve("y").is_err());
        assert_eq!(registry.conflicts(), vec![conflict]);
    }

    #[test]
    fn repeated_conflicts_are_recorded_once() {
        let registry = ToolRegistry::new();
        registry.register("a", vec![tool("a", "x")]).unwrap();

        for _ in 0..3 {
            registry.register("b", vec![tool("b", "x")]).unwrap_err();
        }
        assert_eq!(registry.conflicts().len(), 1);

        registry.unregister("a");
        assert_eq!(registry.register("b", vec![tool("b", "x")]).unwrap(), 1);
        assert!(registry.conflicts().is_empty());
    }

    #[test]
    fn duplicate_names_in_one_listing_keep_the_first() {
        let registry = ToolRegistry::new();
        let second = ToolDescriptor {
            description: "shadowed".to_string(),
            ..tool("calc", "add")
        };
        let count = registry
            .register("calc", vec![tool("calc", "add"), second, tool("calc", "pow")])
            .unwrap();

        assert_eq!(count, 2);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.resolve("add").unwrap().description, "add two numbers");
        assert!(registry.conflicts().is_empty());

        assert_eq!(registry.unregister("calc"), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn reregistration_replaces_provider_entries() {
        let registry = ToolRegistry::new();
        registry
            .register("calc", vec![tool("calc", "add"), tool("calc", "divide")])
            .unwrap();
        registry.register("calc", vec![tool("calc", "add")]).unwrap();

        assert_eq!(registry.len(), 1);
        assert!(registry.resolve("divide").is_err());
    }

    #[test]
    fn unregister_removes_only_that_provider() {
        let registry = ToolRegistry::new();
        registry.register("calc", vec![tool("calc", "add")]).unwrap();
        registry.register("text", vec![tool("text", "upper")]).unwrap();

        assert_eq!(registry.unregister("calc"), 1);
        assert_eq!(registry.unregister("calc"), 0);
        assert!(registry.resolve("add").is_err());
        assert!(registry.resolve("upper").is_ok());
    }

    #[test]
    fn describe_all_is_numbered_and_sorted() {
        let registry = ToolRegistry::new();
        assert_eq!(registry.describe_all(), "(no tools available)");
        registry
            .register("calc", vec![tool("calc", "subtract"), tool("calc", "add")])
            .unwrap();
        assert_eq!(
            registry.describe_all(),
            "1. add(a: integer, b: integer) - add two numbers\n\
             2. subtract(a: integer, b: integer) - subtract two numbers"
        );
    }
}
