//! C8 — the optional expansion engine: parse `expands=`/`selects=`-style
//! query strings into a tree, dispatch to class-keyed expanders to populate
//! sub-resources, and mask the result down to the selected fields (§4.7).

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// One node of a parsed expansion/selection tree: either a leaf switch or a
/// nested tree. Order of insertion is preserved — the expansion algorithm
/// walks enabled keys "in insertion order" (§4.7 step 2).
#[derive(Debug, Clone)]
pub enum ExpansionNode {
    Leaf(bool),
    Tree(ExpansionTree),
}

#[derive(Debug, Clone, Default)]
pub struct ExpansionTree(Vec<(String, ExpansionNode)>);

impl ExpansionTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&ExpansionNode> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, node)| node)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ExpansionNode)> {
        self.0.iter().map(|(k, node)| (k.as_str(), node))
    }

    /// Set the leaf at `segments`, creating intermediate trees as needed.
    /// A conflicting prior leaf at an intermediate position is overwritten
    /// with a tree (last write wins, §4.7 "Building rule").
    fn set_path(&mut self, segments: &[&str], enabled: bool) {
        match segments {
            [] => {}
            [leaf] => match self.0.iter().position(|(k, _)| k == leaf) {
                Some(pos) => self.0[pos].1 = ExpansionNode::Leaf(enabled),
                None => self.0.push((leaf.to_string(), ExpansionNode::Leaf(enabled))),
            },
            [head, rest @ ..] => {
                let idx = match self.0.iter().position(|(k, _)| k == head) {
                    Some(pos) => pos,
                    None => {
                        self.0.push((head.to_string(), ExpansionNode::Tree(ExpansionTree::default())));
                        self.0.len() - 1
                    }
                };
                if !matches!(self.0[idx].1, ExpansionNode::Tree(_)) {
                    self.0[idx].1 = ExpansionNode::Tree(ExpansionTree::default());
                }
                if let ExpansionNode::Tree(sub) = &mut self.0[idx].1 {
                    sub.set_path(rest, enabled);
                }
            }
        }
    }
}

/// Parse a comma-separated list of dotted paths (`expands=` or `selects=`
/// query strings) into a tree. `*` is a normal key meaning "all fields at
/// this level" to the consumer (expansion ignores it; selection honors
/// it). A leading `-` excludes the field (§3.6, §4.7).
pub fn parse_tree(spec: &str) -> ExpansionTree {
    let mut tree = ExpansionTree::default();
    for raw in spec.split(',') {
        let token = raw.trim();
        if token.is_empty() {
            continue;
        }
        let (enabled, path) = match token.strip_prefix('-') {
            Some(rest) => (false, rest),
            None => (true, token),
        };
        let segments: Vec<&str> = path.split('.').collect();
        tree.set_path(&segments, enabled);
    }
    tree
}

/// Recursively mask `value` down to the fields named in `tree` (§4.7 Field
/// selection, run after expansion). `*` keeps every key at that level not
/// otherwise excluded; an explicit `false` leaf always excludes, even under
/// a wildcard.
pub fn select_fields(value: &Value, tree: &ExpansionTree) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(|item| select_fields(item, tree)).collect()),
        Value::Object(obj) => {
            let keep_all = matches!(tree.get("*"), Some(ExpansionNode::Leaf(true)) | Some(ExpansionNode::Tree(_)));
            let mut out = serde_json::Map::with_capacity(obj.len());
            for (key, val) in obj {
                match tree.get(key) {
                    Some(ExpansionNode::Leaf(false)) => continue,
                    Some(ExpansionNode::Leaf(true)) => {
                        out.insert(key.clone(), val.clone());
                    }
                    Some(ExpansionNode::Tree(sub)) => {
                        out.insert(key.clone(), select_fields(val, sub));
                    }
                    None if keep_all => {
                        out.insert(key.clone(), val.clone());
                    }
                    None => {}
                }
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

/// A class-keyed or reusable expander method (§4.7 Discovery). `expand`
/// receives the already-resolved arguments and returns the value to place
/// under the requested key.
#[async_trait]
pub trait ExpanderMethod: Send + Sync {
    async fn expand(&self, args: ExpanderArgs<'_>) -> Result<Value, String>;
}

pub struct ExpanderArgs<'a> {
    pub parent: &'a Value,
    pub request: &'a Value,
    pub args: Value,
}

/// How a binding's arguments are computed: either a fixed list of property
/// paths read off the parent, or a function of `(parent, request)` (§4.7
/// step 2, "compute arguments either as a list of parent property paths or
/// by calling the configured function").
#[derive(Clone)]
pub enum ArgSource {
    ParentPaths(Vec<String>),
    Dynamic(Arc<dyn Fn(&Value, &Value) -> Value + Send + Sync>),
}

impl ArgSource {
    fn resolve(&self, parent: &Value, request: &Value) -> Value {
        match self {
            ArgSource::ParentPaths(paths) => {
                Value::Array(paths.iter().map(|path| parent.get(path).cloned().unwrap_or(Value::Null)).collect())
            }
            ArgSource::Dynamic(f) => f(parent, request),
        }
    }
}

#[derive(Clone)]
struct ExpanderBinding {
    method: Arc<dyn ExpanderMethod>,
    args: ArgSource,
    nested_target: Option<String>,
}

struct ReusableLink {
    method_name: String,
    args: ArgSource,
    nested_target: Option<String>,
}

/// Startup-collected discovery result (§4.7 Discovery): standard
/// expanders, reusable method containers, and the field links between
/// them. A reusable link takes precedence over a standard expander
/// registered for the same `(dto_class, field)` key.
#[derive(Default)]
pub struct ExpansionRegistry {
    standard: HashMap<(String, String), ExpanderBinding>,
    reusable_links: HashMap<(String, String), ReusableLink>,
    reusable_methods: HashMap<String, Arc<dyn ExpanderMethod>>,
}

impl ExpansionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_expander(
        &mut self,
        dto_class: impl Into<String>,
        field: impl Into<String>,
        method: Arc<dyn ExpanderMethod>,
        args: ArgSource,
        nested_target: Option<String>,
    ) {
        self.standard.insert(
            (dto_class.into(), field.into()),
            ExpanderBinding { method, args, nested_target },
        );
    }

    pub fn register_reusable_method(&mut self, name: impl Into<String>, method: Arc<dyn ExpanderMethod>) {
        self.reusable_methods.insert(name.into(), method);
    }

    pub fn link_reusable(
        &mut self,
        dto_class: impl Into<String>,
        field: impl Into<String>,
        method_name: impl Into<String>,
        args: ArgSource,
        nested_target: Option<String>,
    ) {
        self.reusable_links.insert(
            (dto_class.into(), field.into()),
            ReusableLink { method_name: method_name.into(), args, nested_target },
        );
    }

    /// Every expandable DTO must have at least one expander, and every
    /// reusable link must reference a registered method (§4.7 Discovery).
    pub fn validate(&self, expandable_dtos: &[&str]) -> Result<(), ExpansionError> {
        for dto in expandable_dtos {
            let has_any =
                self.standard.keys().any(|(d, _)| d == dto) || self.reusable_links.keys().any(|(d, _)| d == dto);
            if !has_any {
                return Err(ExpansionError {
                    path: (*dto).to_string(),
                    message: format!("no expander registered for DTO {dto:?}"),
                });
            }
        }
        for ((dto, field), link) in &self.reusable_links {
            if !self.reusable_methods.contains_key(&link.method_name) {
                return Err(ExpansionError {
                    path: format!("{dto}.{field}"),
                    message: format!("reusable link references unknown method {:?}", link.method_name),
                });
            }
        }
        Ok(())
    }

    fn resolve(&self, dto_class: &str, field: &str) -> Option<(&Arc<dyn ExpanderMethod>, &ArgSource, &Option<String>)> {
        let key = (dto_class.to_string(), field.to_string());
        if let Some(link) = self.reusable_links.get(&key) {
            let method = self.reusable_methods.get(&link.method_name)?;
            return Some((method, &link.args, &link.nested_target));
        }
        self.standard.get(&key).map(|b| (&b.method, &b.args, &b.nested_target))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    Ignore,
    Include,
    Throw,
}

#[derive(Debug, Clone)]
pub struct PathError {
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("expansion failed at {path}: {message}")]
pub struct ExpansionError {
    pub path: String,
    pub message: String,
}

/// Run the expansion algorithm over `resource` under `tree`, then attach
/// `_expansionErrors` if `policy` is `Include` and any path failed (§4.7
/// steps 1-4).
pub async fn expand_resource(
    registry: &ExpansionRegistry,
    dto_class: &str,
    resource: &Value,
    tree: &ExpansionTree,
    request: &Value,
    policy: ErrorPolicy,
) -> Result<Value, ExpansionError> {
    let mut errors = Vec::new();
    let expanded = expand_value(registry, dto_class, resource, tree, request, policy, "$", &mut errors).await?;
    if policy == ErrorPolicy::Include && !errors.is_empty() {
        if let Value::Object(mut obj) = expanded {
            obj.insert(
                "_expansionErrors".to_string(),
                Value::Array(
                    errors
                        .into_iter()
                        .map(|e| json!({"path": e.path, "message": e.message}))
                        .collect(),
                ),
            );
            return Ok(Value::Object(obj));
        }
    }
    Ok(expanded)
}

fn expand_value<'a>(
    registry: &'a ExpansionRegistry,
    dto_class: &'a str,
    resource: &'a Value,
    tree: &'a ExpansionTree,
    request: &'a Value,
    policy: ErrorPolicy,
    path: &'a str,
    errors: &'a mut Vec<PathError>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Value, ExpansionError>> + Send + 'a>> {
    Box::pin(async move {
        match resource {
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (index, item) in items.iter().enumerate() {
                    let item_path = format!("{path}[{index}]");
                    out.push(
                        expand_value(registry, dto_class, item, tree, request, policy, &item_path, errors).await?,
                    );
                }
                Ok(Value::Array(out))
            }
            Value::Object(_) => expand_object(registry, dto_class, resource, tree, request, policy, path, errors).await,
            other => Ok(other.clone()),
        }
    })
}

async fn expand_object(
    registry: &ExpansionRegistry,
    dto_class: &str,
    resource: &Value,
    tree: &ExpansionTree,
    request: &Value,
    policy: ErrorPolicy,
    path: &str,
    errors: &mut Vec<PathError>,
) -> Result<Value, ExpansionError> {
    let mut out = resource.clone();

    for (key, node) in tree.iter() {
        let enabled = match node {
            ExpansionNode::Leaf(enabled) => *enabled,
            ExpansionNode::Tree(_) => true,
        };
        if !enabled {
            continue;
        }

        let field_path = format!("{path}.{key}");
        let Some((method, args_source, nested_target)) = registry.resolve(dto_class, key) else {
            let error = PathError {
                path: field_path,
                message: format!("no expander registered for {dto_class}.{key}"),
            };
            match policy {
                ErrorPolicy::Throw => return Err(ExpansionError { path: error.path, message: error.message }),
                _ => {
                    errors.push(error);
                    continue;
                }
            }
        };

        let args = args_source.resolve(&out, request);
        match method.expand(ExpanderArgs { parent: &out, request, args }).await {
            Ok(value) => {
                let value = match (node, nested_target) {
                    (ExpansionNode::Tree(sub_tree), Some(target)) => {
                        expand_value(registry, target, &value, sub_tree, request, policy, &field_path, errors).await?
                    }
                    _ => value,
                };
                if let Value::Object(obj) = &mut out {
                    obj.insert(key.to_string(), value);
                }
            }
            Err(message) => {
                let error = PathError { path: field_path, message };
                match policy {
                    ErrorPolicy::Throw => return Err(ExpansionError { path: error.path, message: error.message }),
                    _ => errors.push(error),
                }
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tree_builds_nested_paths_with_wildcard_and_negation() {
        let tree = parse_tree("*,-description,instructor.*,-instructor.bio");
        assert!(matches!(tree.get("*"), Some(ExpansionNode::Leaf(true))));
        assert!(matches!(tree.get("description"), Some(ExpansionNode::Leaf(false))));
        let ExpansionNode::Tree(instructor) = tree.get("instructor").unwrap() else {
            panic!("expected instructor to be a tree");
        };
        assert!(matches!(instructor.get("*"), Some(ExpansionNode::Leaf(true))));
        assert!(matches!(instructor.get("bio"), Some(ExpansionNode::Leaf(false))));
    }

    #[test]
    fn parse_tree_conflicting_tokens_last_write_wins() {
        let tree = parse_tree("name,-name");
        assert!(matches!(tree.get("name"), Some(ExpansionNode::Leaf(false))));
    }

    #[test]
    fn select_fields_honors_wildcard_with_explicit_exclusion() {
        let tree = parse_tree("*,-description,instructor.*,-instructor.bio");
        let course = json!({
            "id": 1,
            "description": "hidden",
            "instructor": {"name": "Ada", "bio": "hidden"},
        });
        let masked = select_fields(&course, &tree);
        assert_eq!(masked["id"], json!(1));
        assert!(masked.get("description").is_none());
        assert_eq!(masked["instructor"]["name"], json!("Ada"));
        assert!(masked["instructor"].get("bio").is_none());
    }

    struct InstructorExpander;

    #[async_trait]
    impl ExpanderMethod for InstructorExpander {
        async fn expand(&self, args: ExpanderArgs<'_>) -> Result<Value, String> {
            let instructor_id = args.parent.get("instructorId").cloned().unwrap_or(Value::Null);
            Ok(json!({"id": instructor_id, "name": "Ada Lovelace"}))
        }
    }

    struct FailingExpander;

    #[async_trait]
    impl ExpanderMethod for FailingExpander {
        async fn expand(&self, _args: ExpanderArgs<'_>) -> Result<Value, String> {
            Err("upstream lookup failed".to_string())
        }
    }

    #[tokio::test]
    async fn expand_resource_populates_sub_resource_and_recurses() {
        let mut registry = ExpansionRegistry::new();
        registry.register_expander(
            "Course",
            "instructor",
            Arc::new(InstructorExpander),
            ArgSource::ParentPaths(vec!["instructorId".to_string()]),
            None,
        );

        let tree = parse_tree("instructor");
        let course = json!({"id": 1, "instructorId": 7});
        let result = expand_resource(&registry, "Course", &course, &tree, &json!({}), ErrorPolicy::Throw)
            .await
            .unwrap();
        assert_eq!(result["instructor"]["name"], json!("Ada Lovelace"));
    }

    #[tokio::test]
    async fn reusable_link_takes_precedence_over_standard_expander() {
        let mut registry = ExpansionRegistry::new();
        registry.register_expander(
            "Course",
            "instructor",
            Arc::new(FailingExpander),
            ArgSource::ParentPaths(vec![]),
            None,
        );
        registry.register_reusable_method("lookupInstructor", Arc::new(InstructorExpander));
        registry.link_reusable(
            "Course",
            "instructor",
            "lookupInstructor",
            ArgSource::ParentPaths(vec!["instructorId".to_string()]),
            None,
        );

        let tree = parse_tree("instructor");
        let course = json!({"id": 1, "instructorId": 7});
        let result = expand_resource(&registry, "Course", &course, &tree, &json!({}), ErrorPolicy::Throw)
            .await
            .unwrap();
        assert_eq!(result["instructor"]["name"], json!("Ada Lovelace"));
    }

    #[tokio::test]
    async fn ignore_policy_drops_failed_path_silently() {
        let mut registry = ExpansionRegistry::new();
        registry.register_expander("Course", "instructor", Arc::new(FailingExpander), ArgSource::ParentPaths(vec![]), None);

        let tree = parse_tree("instructor");
        let course = json!({"id": 1});
        let result = expand_resource(&registry, "Course", &course, &tree, &json!({}), ErrorPolicy::Ignore)
            .await
            .unwrap();
        assert!(result.get("instructor").is_none());
        assert!(result.get("_expansionErrors").is_none());
    }

    #[tokio::test]
    async fn include_policy_attaches_expansion_errors() {
        let mut registry = ExpansionRegistry::new();
        registry.register_expander("Course", "instructor", Arc::new(FailingExpander), ArgSource::ParentPaths(vec![]), None);

        let tree = parse_tree("instructor");
        let course = json!({"id": 1});
        let result = expand_resource(&registry, "Course", &course, &tree, &json!({}), ErrorPolicy::Include)
            .await
            .unwrap();
        let errors = result["_expansionErrors"].as_array().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["path"], json!("$.instructor"));
    }

    #[tokio::test]
    async fn throw_policy_propagates_the_error() {
        let mut registry = ExpansionRegistry::new();
        registry.register_expander("Course", "instructor", Arc::new(FailingExpander), ArgSource::ParentPaths(vec![]), None);

        let tree = parse_tree("instructor");
        let course = json!({"id": 1});
        let err = expand_resource(&registry, "Course", &course, &tree, &json!({}), ErrorPolicy::Throw)
            .await
            .unwrap_err();
        assert_eq!(err.path, "$.instructor");
    }

    #[tokio::test]
    async fn missing_expander_binding_is_reported_by_policy() {
        let registry = ExpansionRegistry::new();
        let tree = parse_tree("instructor");
        let course = json!({"id": 1});
        let err = expand_resource(&registry, "Course", &course, &tree, &json!({}), ErrorPolicy::Throw)
            .await
            .unwrap_err();
        assert!(err.message.contains("no expander registered"));
    }

    #[test]
    fn validate_requires_every_expandable_dto_to_have_an_expander() {
        let registry = ExpansionRegistry::new();
        let err = registry.validate(&["Course"]).unwrap_err();
        assert_eq!(err.path, "Course");
    }

    #[test]
    fn validate_requires_reusable_links_to_reference_known_methods() {
        let mut registry = ExpansionRegistry::new();
        registry.link_reusable("Course", "instructor", "missingMethod", ArgSource::ParentPaths(vec![]), None);
        let err = registry.validate(&[]).unwrap_err();
        assert!(err.message.contains("missingMethod"));
    }
}
